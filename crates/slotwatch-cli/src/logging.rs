//! Logging initialization
//!
//! `SLOTWATCH_LOG` が設定されていればそれを優先し、無ければ `[logging].level` を使う。

use anyhow::Result;
use slotwatch_core::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "SLOTWATCH_LOG";

pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).or_else(|_| EnvFilter::try_new(&config.level))?;

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer().with_target(true).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
    };

    tracing_subscriber::registry().with(filter).with(layer).try_init()?;

    tracing::debug!(level = %config.level, format = ?config.format, "logging initialized");
    Ok(())
}
