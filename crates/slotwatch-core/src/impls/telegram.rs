//! TelegramChannel - Bot API の sendMessage で通知を送る
//!
//! 本文は `NotificationMessage::render` の subject + body。
//! トランスポートの失敗も API のエラー応答も `ChannelError::Unavailable` になり、
//! リトライ判断は NotificationDispatcher に任せる。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::notify::NotificationMessage;
use crate::config::TelegramConfig;
use crate::domain::{ChannelError, Event};
use crate::ports::NotificationChannel;

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    disable_web_page_preview: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ApiReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramChannel {
    name: String,
    http: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

// endpoint に bot token が入るので Debug には出さない
impl std::fmt::Debug for TelegramChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramChannel")
            .field("name", &self.name)
            .field("chat_id", &self.chat_id)
            .finish_non_exhaustive()
    }
}

impl TelegramChannel {
    pub const DEFAULT_NAME: &'static str = "telegram";

    pub fn new(config: &TelegramConfig) -> Result<Self, ChannelError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ChannelError::Unavailable {
                channel: Self::DEFAULT_NAME.to_string(),
                reason: format!("http client: {e}"),
            })?;
        Ok(Self {
            name: Self::DEFAULT_NAME.to_string(),
            http,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_base.trim_end_matches('/'),
                config.bot_token
            ),
            chat_id: config.chat_id.clone(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn message<'a>(&'a self, event: &Event) -> SendMessage<'a> {
        let rendered = NotificationMessage::render(event);
        SendMessage {
            chat_id: &self.chat_id,
            text: format!("{}\n\n{}", rendered.subject, rendered.body),
            disable_web_page_preview: true,
        }
    }

    fn unavailable(&self, reason: String) -> ChannelError {
        ChannelError::Unavailable {
            channel: self.name.clone(),
            reason,
        }
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &Event) -> Result<(), ChannelError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&self.message(event))
            .send()
            .await
            // without_url: URL には token が含まれる
            .map_err(|e| self.unavailable(format!("transport: {}", e.without_url())))?;

        let status = response.status();
        let reply: ApiReply = response.json().await.unwrap_or_default();
        if !status.is_success() || !reply.ok {
            let detail = reply.description.unwrap_or_else(|| "no description".into());
            return Err(self.unavailable(format!("HTTP {}: {detail}", status.as_u16())));
        }
        debug!(channel = %self.name, "telegram message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventKind, Severity, TaskId};
    use crate::testing::ts;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(api_base: String) -> TelegramConfig {
        TelegramConfig {
            bot_token: "123:secret".into(),
            chat_id: "42".into(),
            api_base,
            timeout_secs: 5,
        }
    }

    fn event() -> Event {
        Event::new(
            Severity::Success,
            EventKind::SlotsFound { count: 2 },
            "task \"koledino\": 2 new matching slot(s) at Koledino",
            ts(2025, 5, 10),
        )
        .for_task(TaskId::generate())
    }

    /// Answers a single request with `status` / `body`; yields the raw request.
    async fn one_shot_api(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| l.to_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });
        (base, server)
    }

    #[test]
    fn message_carries_subject_and_body() {
        let channel = TelegramChannel::new(&config("https://api.telegram.org/".into())).unwrap();
        let message = channel.message(&event());

        assert_eq!(message.chat_id, "42");
        assert!(message.text.starts_with("Слоты найдены\n\n"));
        assert!(message.text.contains("2 new matching slot(s)"));
        assert_eq!(channel.endpoint, "https://api.telegram.org/bot123:secret/sendMessage");
        assert!(!format!("{channel:?}").contains("secret"));
    }

    #[tokio::test]
    async fn posts_to_send_message() {
        let (base, server) = one_shot_api("200 OK", r#"{"ok":true,"result":{}}"#).await;
        let channel = TelegramChannel::new(&config(base)).unwrap();

        channel.send(&event()).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /bot123:secret/sendMessage"));
        assert!(request.contains(r#""chat_id":"42""#));
    }

    #[tokio::test]
    async fn api_error_maps_to_unavailable() {
        let (base, server) = one_shot_api(
            "400 Bad Request",
            r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#,
        )
        .await;
        let channel = TelegramChannel::new(&config(base)).unwrap().with_name("ops-chat");

        let err = channel.send(&event()).await.unwrap_err();
        server.await.unwrap();

        assert_eq!(
            err,
            ChannelError::Unavailable {
                channel: "ops-chat".into(),
                reason: "HTTP 400: Bad Request: chat not found".into(),
            }
        );
    }

    #[tokio::test]
    async fn transport_failure_maps_to_unavailable_without_token() {
        // bind して即 drop したポートには誰もいない
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let channel = TelegramChannel::new(&config(base)).unwrap();

        let err = channel.send(&event()).await.unwrap_err();

        let ChannelError::Unavailable { channel, reason } = err;
        assert_eq!(channel, "telegram");
        assert!(reason.starts_with("transport:"), "{reason}");
        assert!(!reason.contains("secret"));
    }
}
