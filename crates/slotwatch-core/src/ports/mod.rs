//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。コアの外側にあるもの
//! （永続化、ブラウザ、通知トランスポート、時刻）への入口です。
//!
//! - TaskStore: Task / Account / Event の正本は外部コラボレータ
//! - BrowserDriver / BrowserPage: マーケットプレイスへの唯一の経路
//! - Marketplace: search / book / authenticate の能力（スケジューラが見る面）
//! - NotificationChannel: send(event) -> ok | ChannelUnavailable
//! - Clock: テストで差し替え可能な時刻

pub mod browser;
pub mod channel;
pub mod clock;
pub mod marketplace;
pub mod task_store;

pub use self::browser::{BrowserDriver, BrowserError, BrowserPage, Cookie, Element};
pub use self::channel::NotificationChannel;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::marketplace::{Marketplace, RateSaturation};
pub use self::task_store::{StatusUpdate, TaskStore};
