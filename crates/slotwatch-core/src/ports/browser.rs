//! Browser port - ヘッドレスブラウザの操作面
//!
//! MarketplaceClient はこの trait だけに依存する。
//! 自動化エンジン（CDP, WebDriver, ...）の詳細はここより外側。

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Session cookie restored into a fresh page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// Snapshot of a DOM element.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub text: String,
    pub attributes: BTreeMap<String, String>,
}

impl Element {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrowserError {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("browser operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("element not found: {0}")]
    NotFound(String),

    #[error("page closed")]
    Closed,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_page(&self, cookies: &[Cookie]) -> Result<Box<dyn BrowserPage>, BrowserError>;
}

#[async_trait]
pub trait BrowserPage: Send {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError>;

    fn current_url(&self) -> String;

    /// `Ok(false)` when the selector did not appear within `timeout`.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool, BrowserError>;

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError>;

    async fn query_all(&mut self, selector: &str) -> Result<Vec<Element>, BrowserError>;

    async fn close(&mut self);
}
