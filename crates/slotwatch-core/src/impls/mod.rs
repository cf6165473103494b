//! Impls - 実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: 開発・テスト用の永続化コラボレータ
//! - **SimulatedPortal**: シミュレーションのセラーポータル（BrowserDriver）
//! - **TracingChannel / MemoryChannel**: 外部サービス不要の通知チャネル
//! - **TelegramChannel**: Bot API (reqwest) 経由の通知チャネル
//!
//! # 本番用実装
//! 本番の永続化とブラウザは別クレートに置く想定。

pub mod channels;
pub mod inmem_store;
pub mod simulated_browser;
pub mod telegram;

// 主要な型を再エクスポート
pub use self::channels::{MemoryChannel, TracingChannel};
pub use self::inmem_store::InMemoryTaskStore;
pub use self::simulated_browser::{PortalSettings, SimulatedPortal};
pub use self::telegram::TelegramChannel;
