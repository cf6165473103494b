//! slotwatch-core
//!
//! Task worker system for warehouse slot search and booking.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, account, slot, state, errors, events, outcome）
//! - **ports**: 抽象化レイヤー（TaskStore, BrowserDriver, Marketplace, NotificationChannel, Clock）
//! - **app**: アプリケーションロジック（rate_limiter, marketplace, matcher, booking, notify, scheduler）
//! - **impls**: 実装（InMemoryTaskStore, SimulatedPortal など開発用）
//! - **config**: TOML 設定
//! - **cancel**: ワーカー単位のキャンセル信号

pub mod app;
pub mod cancel;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

#[cfg(test)]
pub(crate) mod testing;
