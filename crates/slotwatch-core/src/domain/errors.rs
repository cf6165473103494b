//! Errors - エラー型と分類
//!
//! `ErrorKind` は運用上の分類。ワーカー境界でこの分類を見て
//! 状態遷移 / Event / リトライを決める。

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Operational classification of a failure.
///
/// - TransientNetwork: 一時的（バックオフ付きでリトライ）
/// - RateExceeded: サイクルをスキップ（エラー扱いしない）
/// - AuthExpired / AuthInvalid: アカウント無効化、タスクは error
/// - MarketplaceRejected: タスクは error、リトライしない
/// - SlotTaken: 想定内の競合、warning
/// - BookingFailed: error Event だがタスクは active のまま
/// - ChannelUnavailable: 通知のみ。スクレイプ経路には伝播しない
/// - Persistence: 同じサイクルをやり直す
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    RateExceeded,
    AuthExpired,
    AuthInvalid,
    MarketplaceRejected,
    SlotTaken,
    BookingFailed,
    ChannelUnavailable,
    Persistence,
    Cancelled,
}

/// Failure of a marketplace interaction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MarketplaceError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("marketplace call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limit for {key} not available within {waited:?}")]
    RateExceeded { key: String, waited: Duration },

    #[error("session expired: {0}")]
    AuthExpired(String),

    #[error("invalid session credentials: {0}")]
    AuthInvalid(String),

    #[error("marketplace rejected the request: {0}")]
    Rejected(String),

    #[error("slot {0} was taken by someone else")]
    SlotTaken(String),

    /// The booking was confirmed on the portal but its result never came back.
    #[error("booking of {slot} sent, outcome unknown: {reason}")]
    OutcomeUnknown { slot: String, reason: String },

    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },

    #[error("cancelled")]
    Cancelled,
}

impl MarketplaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MarketplaceError::TransientNetwork(_)
            | MarketplaceError::Timeout(_)
            | MarketplaceError::RetryExhausted { .. } => ErrorKind::TransientNetwork,
            MarketplaceError::RateExceeded { .. } => ErrorKind::RateExceeded,
            MarketplaceError::AuthExpired(_) => ErrorKind::AuthExpired,
            MarketplaceError::AuthInvalid(_) => ErrorKind::AuthInvalid,
            MarketplaceError::Rejected(_) => ErrorKind::MarketplaceRejected,
            MarketplaceError::SlotTaken(_) => ErrorKind::SlotTaken,
            MarketplaceError::OutcomeUnknown { .. } => ErrorKind::BookingFailed,
            MarketplaceError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Worth another attempt inside the same call?
    ///
    /// RetryExhausted は既にリトライ済みなので false。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MarketplaceError::TransientNetwork(_) | MarketplaceError::Timeout(_)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            MarketplaceError::AuthExpired(_) | MarketplaceError::AuthInvalid(_)
        )
    }
}

/// Failure of the persistence collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },

    #[error("persistence unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Persistence
    }
}

/// Failure of a notification transport.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {channel} unavailable: {reason}")]
    Unavailable { channel: String, reason: String },
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ChannelUnavailable
    }
}
