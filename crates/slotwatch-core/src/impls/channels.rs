//! Notification channels that need no external service.
//!
//! - TracingChannel: レンダリングした通知をログに出す（CLI デモ用）
//! - MemoryChannel: 受け取った Event を保持する。障害注入つき

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::app::notify::NotificationMessage;
use crate::domain::{ChannelError, Event};
use crate::ports::NotificationChannel;

pub struct TracingChannel {
    name: String,
}

impl TracingChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NotificationChannel for TracingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &Event) -> Result<(), ChannelError> {
        let message = NotificationMessage::render(event);
        tracing::info!(
            channel = %self.name,
            severity = ?event.severity,
            subject = %message.subject,
            "{}",
            message.body
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryChannel {
    name: String,
    received: Mutex<Vec<Event>>,
    attempts: AtomicUsize,
    failing: AtomicBool,
    fail_next: AtomicUsize,
    delay: Duration,
}

impl MemoryChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Every send takes `delay` before completing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Successfully delivered events, in order.
    pub fn received(&self) -> Vec<Event> {
        self.received.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Send calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &Event) -> Result<(), ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::Unavailable {
                channel: self.name.clone(),
                reason: "transport down".into(),
            });
        }
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}
