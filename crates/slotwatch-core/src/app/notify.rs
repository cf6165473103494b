//! NotificationDispatcher - Event を各チャネルへ非同期に配送する
//!
//! - チャネルごとに専用キューと配送タスクを持つ（1 つが詰まっても他は止まらない）
//! - `publish()` はキューに積むだけで await しない（サイクルをブロックしない）
//! - リトライしても届かなかった場合は ChannelFailure Event を記録し、
//!   失敗したチャネル以外へ転送する
//! - ChannelFailure Event 自体の配送失敗からは何も生まれない（再帰しない）

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::NotificationsConfig;
use crate::domain::{Event, EventKind, Severity, TaskStatus};
use crate::ports::{Clock, NotificationChannel, TaskStore};

/// Human-facing rendering of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub subject: String,
    pub body: String,
}

impl NotificationMessage {
    pub fn render(event: &Event) -> Self {
        let subject = match &event.kind {
            EventKind::SlotsFound { .. } => "Слоты найдены",
            EventKind::SlotBooked { .. } => "Слот забронирован",
            EventKind::SlotTaken { .. } => "Слот занят",
            EventKind::BookingFailed { .. } => "Ошибка бронирования",
            EventKind::StatusChanged {
                to: Some(TaskStatus::Completed),
                ..
            } => "Задача завершена",
            EventKind::StatusChanged {
                to: Some(TaskStatus::Error),
                ..
            } => "Ошибка в задаче",
            EventKind::ChannelFailure { .. } => "Канал уведомлений недоступен",
            _ => match event.severity {
                Severity::Error => "Ошибка",
                Severity::Warning => "Предупреждение",
                Severity::Success | Severity::Info => "Уведомление",
            },
        };

        let mut body = event.message.clone();
        if let Some(task) = event.task_id {
            body.push_str(&format!("\nЗадача: {task}"));
        }
        body.push_str(&format!("\nВремя: {}", event.created_at.format("%d.%m.%Y %H:%M")));

        Self {
            subject: subject.to_string(),
            body,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DeliveryPolicy {
    max_attempts: u32,
    retry_delay: Duration,
}

struct Queue {
    channel: String,
    tx: UnboundedSender<Event>,
}

pub struct NotificationDispatcher {
    queues: Mutex<Vec<Queue>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    min_severity: Severity,
}

impl NotificationDispatcher {
    /// Spawns one delivery task per channel on the current runtime.
    pub fn new(
        channels: Vec<Arc<dyn NotificationChannel>>,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        config: &NotificationsConfig,
    ) -> Self {
        let channels = if config.enabled { channels } else { Vec::new() };
        let policy = DeliveryPolicy {
            max_attempts: config.max_delivery_attempts.max(1),
            retry_delay: config.retry_delay(),
        };

        let pairs: Vec<(Arc<dyn NotificationChannel>, UnboundedSender<Event>, UnboundedReceiver<Event>)> =
            channels
                .into_iter()
                .map(|channel| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    (channel, tx, rx)
                })
                .collect();

        let mut queues = Vec::with_capacity(pairs.len());
        let mut workers = Vec::with_capacity(pairs.len());
        let peers: Vec<(String, WeakUnboundedSender<Event>)> = pairs
            .iter()
            .map(|(channel, tx, _)| (channel.name().to_string(), tx.downgrade()))
            .collect();

        for (channel, tx, rx) in pairs {
            let name = channel.name().to_string();
            let others: Vec<WeakUnboundedSender<Event>> = peers
                .iter()
                .filter(|(peer, _)| *peer != name)
                .map(|(_, weak)| weak.clone())
                .collect();
            let delivery = Delivery {
                channel,
                others,
                store: store.clone(),
                clock: clock.clone(),
                policy,
            };
            workers.push(tokio::spawn(delivery.run(rx)));
            queues.push(Queue { channel: name, tx });
        }

        Self {
            queues: Mutex::new(queues),
            workers: Mutex::new(workers),
            min_severity: config.min_severity,
        }
    }

    /// A dispatcher with no channels.
    pub fn disabled() -> Self {
        Self {
            queues: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            min_severity: Severity::Error,
        }
    }

    pub fn channels(&self) -> Vec<String> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.iter().map(|q| q.channel.clone()).collect()
    }

    /// Enqueue `event` for every channel. Never waits.
    pub fn publish(&self, event: &Event) {
        if event.severity < self.min_severity {
            return;
        }
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        for queue in queues.iter() {
            if queue.tx.send(event.clone()).is_err() {
                warn!(channel = %queue.channel, "notification queue closed, event dropped");
            }
        }
    }

    /// Close the queues and wait until everything queued has been handled.
    pub async fn shutdown(&self) {
        let queues = std::mem::take(&mut *self.queues.lock().unwrap_or_else(|e| e.into_inner()));
        drop(queues);
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "notification worker panicked");
            }
        }
    }
}

struct Delivery {
    channel: Arc<dyn NotificationChannel>,
    others: Vec<WeakUnboundedSender<Event>>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    policy: DeliveryPolicy,
}

impl Delivery {
    async fn run(self, mut rx: UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.deliver(event).await;
        }
        debug!(channel = self.channel.name(), "notification queue drained");
    }

    async fn deliver(&self, event: Event) {
        let name = self.channel.name();
        let mut attempt = 0;
        let err = loop {
            attempt += 1;
            match self.channel.send(&event).await {
                Ok(()) => return,
                Err(e) if attempt < self.policy.max_attempts => {
                    debug!(channel = name, attempt, error = %e, "notification send failed, retrying");
                    tokio::time::sleep(self.policy.retry_delay).await;
                }
                Err(e) => break e,
            }
        };

        warn!(channel = name, attempts = attempt, error = %err, "notification delivery failed");
        if event.failed_channel().is_some() {
            return;
        }

        let mut failure = Event::new(
            Severity::Warning,
            EventKind::ChannelFailure {
                channel: name.to_string(),
            },
            format!("notification channel {name} unavailable: {err}"),
            self.clock.now(),
        );
        failure.task_id = event.task_id;
        failure.account_id = event.account_id;

        if let Err(e) = self.store.record_event(failure.clone()).await {
            error!(channel = name, error = %e, "failed to record channel failure");
        }
        for peer in &self.others {
            if let Some(tx) = peer.upgrade() {
                if tx.send(failure.clone()).is_err() {
                    debug!(channel = name, "peer queue closed, channel failure not forwarded");
                }
            }
        }
    }
}
