//! NotificationChannel port - 通知トランスポート（メール、チャットボットなど）

use async_trait::async_trait;

use crate::domain::{ChannelError, Event};

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Stable name, used to suppress a channel's own failure reports.
    fn name(&self) -> &str;

    async fn send(&self, event: &Event) -> Result<(), ChannelError>;
}
