//! Marketplace port - 検索 / 予約 / 認証の能力
//!
//! スケジューラとブッキングはこの trait だけを見る。
//! ブラウザ自動化の詳細は実装（`app::marketplace::MarketplaceClient`）側。

use async_trait::async_trait;
use serde::Serialize;

use crate::cancel::CancelSignal;
use crate::domain::{Account, BookingReceipt, MarketplaceError, SearchCriteria, Slot};

/// Rate-limiter usage of one key, for `worker_status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateSaturation {
    pub key: String,
    pub in_window: usize,
    pub max: usize,
}

#[async_trait]
pub trait Marketplace: Send + Sync + 'static {
    /// Authenticated browsing context, exclusive to one in-flight operation.
    type Session: Send + 'static;

    async fn authenticate(
        &self,
        account: &Account,
        cancel: &CancelSignal,
    ) -> Result<Self::Session, MarketplaceError>;

    async fn search(
        &self,
        session: &mut Self::Session,
        criteria: &SearchCriteria,
        cancel: &CancelSignal,
    ) -> Result<Vec<Slot>, MarketplaceError>;

    async fn book(
        &self,
        session: &mut Self::Session,
        slot: &Slot,
        cancel: &CancelSignal,
    ) -> Result<BookingReceipt, MarketplaceError>;

    /// End-of-cycle release. The session may stay cached.
    async fn release(&self, session: Self::Session);

    fn rate_saturation(&self) -> Vec<RateSaturation> {
        Vec::new()
    }
}
