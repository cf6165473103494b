//! App - アプリケーション層
//!
//! ports を組み合わせてワーカーシステムを組み立てる。
//!
//! # 主要コンポーネント
//! - **RateLimiter**: アカウント単位 / グローバルのリクエスト制限
//! - **MarketplaceClient**: ブラウザ経由の authenticate / search / book
//! - **matcher**: スロットの絞り込みと並べ替え（純粋関数）
//! - **BookingCoordinator**: 二重予約しない予約
//! - **NotificationDispatcher**: Event をチャネルへ非同期配送
//! - **TaskScheduler**: タスクごとのワーカーと状態遷移
//! - **SchedulerBuilder**: 構築とワイヤリング

pub mod booking;
pub mod builder;
pub mod marketplace;
pub mod matcher;
pub mod notify;
pub mod rate_limiter;
pub mod scheduler;
pub mod status;
mod worker_loop;

// 主要な型を再エクスポート
pub use self::booking::{BookingCoordinator, BookingError, BookingOutcome, BookingRun, SkipReason};
pub use self::builder::{BuildError, SchedulerBuilder};
pub use self::marketplace::{MarketplaceClient, RetryPolicy, Session, SessionPool};
pub use self::notify::{NotificationDispatcher, NotificationMessage};
pub use self::rate_limiter::{RateKey, RateLimitError, RateLimiter, RatePermit, RatePolicy};
pub use self::scheduler::{Reconciled, SchedulerError, TaskScheduler};
pub use self::status::{TaskWorkerStatus, WorkerStatus};
