//! Account - 連携済みマーケットプレイスアカウント

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AccountId, OwnerId};

/// Opaque session credential blob.
///
/// コアは中身を解釈しない。ブラウザ層（MarketplaceClient）だけが読む。
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCredentials(String);

impl SessionCredentials {
    pub fn new(blob: impl Into<String>) -> Self {
        Self(blob.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

// ログに cookie を出さない
impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionCredentials(<{} bytes>)", self.0.len())
    }
}

/// Snapshot of a linked marketplace account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: OwnerId,
    pub display_name: String,
    pub credentials: SessionCredentials,
    pub is_active: bool,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(owner: OwnerId, display_name: impl Into<String>, credentials: SessionCredentials) -> Self {
        Self {
            id: AccountId::generate(),
            owner,
            display_name: display_name.into(),
            credentials,
            is_active: true,
            last_login: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_not_leaked_by_debug() {
        let account = Account::new(
            OwnerId::generate(),
            "main",
            SessionCredentials::new(r#"[{"name":"WBToken","value":"secret"}]"#),
        );
        let shown = format!("{account:?}");
        assert!(!shown.contains("secret"));
        assert!(account.is_active);
    }
}
