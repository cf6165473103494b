//! SchedulerBuilder - TaskScheduler の構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - 設定値の検証（`Config::validate` と同じ基準）
//! - 通知チャネル名の重複
//! - `expect_channels()` で指定したチャネルが全て登録されているか

use std::collections::HashSet;
use std::sync::Arc;

use super::notify::NotificationDispatcher;
use super::scheduler::TaskScheduler;
use crate::config::{NotificationsConfig, SchedulerConfig};
use crate::ports::{Clock, Marketplace, NotificationChannel, SystemClock, TaskStore};

/// # 使用例
/// ```ignore
/// let scheduler = TaskScheduler::builder(client, store)
///     .scheduler_config(config.scheduler.clone())
///     .notifications(config.notifications.clone())
///     .channel(Arc::new(TracingChannel::new("log")))
///     .expect_channels(&["log"])
///     .build()?;
/// ```
pub struct SchedulerBuilder<M: Marketplace> {
    marketplace: Arc<M>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    scheduler: SchedulerConfig,
    notifications: NotificationsConfig,
    channels: Vec<Arc<dyn NotificationChannel>>,
    expected_channels: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("Missing notification channels: {0:?}. These channels were expected but not registered.")]
    MissingChannels(Vec<String>),

    #[error("Notification channel registered twice: {0}")]
    DuplicateChannel(String),

    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}

impl<M: Marketplace> SchedulerBuilder<M> {
    pub fn new(marketplace: Arc<M>, store: Arc<dyn TaskStore>) -> Self {
        Self {
            marketplace,
            store,
            clock: Arc::new(SystemClock),
            scheduler: SchedulerConfig::default(),
            notifications: NotificationsConfig::default(),
            channels: Vec::new(),
            expected_channels: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn notifications(mut self, config: NotificationsConfig) -> Self {
        self.notifications = config;
        self
    }

    pub fn channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Channels that must be registered for `build()` to succeed.
    pub fn expect_channels(mut self, names: &[&str]) -> Self {
        self.expected_channels = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// Validate and wire. Must run inside a tokio runtime (delivery tasks are spawned here).
    pub fn build(self) -> Result<TaskScheduler<M>, BuildError> {
        if self.scheduler.default_interval_secs == 0 {
            return Err(BuildError::InvalidConfig("default_interval_secs must be > 0".into()));
        }
        if self.scheduler.max_booking_attempts_per_cycle == 0 {
            return Err(BuildError::InvalidConfig("max_booking_attempts_per_cycle must be > 0".into()));
        }

        let mut names = HashSet::new();
        for channel in &self.channels {
            if !names.insert(channel.name().to_string()) {
                return Err(BuildError::DuplicateChannel(channel.name().to_string()));
            }
        }
        if let Some(expected) = &self.expected_channels {
            let missing: Vec<String> = expected.iter().filter(|n| !names.contains(*n)).cloned().collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingChannels(missing));
            }
        }

        let dispatcher = NotificationDispatcher::new(
            self.channels,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            &self.notifications,
        );
        Ok(TaskScheduler::from_parts(
            self.store,
            self.marketplace,
            dispatcher,
            self.clock,
            self.scheduler,
        ))
    }
}
