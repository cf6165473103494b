//! Marketplace client (browser-driven) and its helpers.
//!
//! - client: `Marketplace` port の実装
//! - session: アカウント単位のセッションプール / cookie 復元
//! - parse: セルのテキスト -> Slot
//! - retry: バックオフ
//! - selectors: ポータルの DOM セレクタ

pub mod client;
pub mod parse;
pub mod retry;
pub mod selectors;
pub mod session;

pub use self::client::MarketplaceClient;
pub use self::retry::RetryPolicy;
pub use self::session::{Session, SessionPool};
