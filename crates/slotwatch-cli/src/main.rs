//! slotwatch - シミュレーションポータルに対してスロット検索ワーカーを動かすデモ
//!
//! ```text
//! slotwatch [CONFIG.toml]
//! ```
//!
//! - 設定ファイルが無ければ組み込みのデフォルト
//! - `SLOTWATCH_SEED` でシミュレーションの乱数シードを固定できる
//! - Ctrl-C で全ワーカーを止めて終了

mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Days;
use slotwatch_core::app::{MarketplaceClient, RateLimiter, TaskScheduler};
use slotwatch_core::config::Config;
use slotwatch_core::domain::{Account, OwnerId, Packaging, SearchCriteria, SessionCredentials, Task, TaskId};
use slotwatch_core::impls::{InMemoryTaskStore, PortalSettings, SimulatedPortal, TelegramChannel, TracingChannel};
use slotwatch_core::ports::{Clock, SystemClock};
use tracing::{info, warn};

const SEED_ENV: &str = "SLOTWATCH_SEED";
const STATUS_EVERY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref()).context("failed to load configuration")?;
    logging::init(&config.logging)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryTaskStore::new());
    let tasks = seed_demo(&store, clock.as_ref())?;

    let seed = match std::env::var(SEED_ENV) {
        Ok(raw) => raw.parse().with_context(|| format!("{SEED_ENV} must be an integer"))?,
        Err(_) => rand::random::<u64>(),
    };
    let portal = SimulatedPortal::with_settings(
        seed,
        Arc::clone(&clock),
        PortalSettings {
            base_url: config.marketplace.base_url.clone(),
            ..PortalSettings::default()
        },
    );
    info!(seed, base_url = %config.marketplace.base_url, "using simulated portal");

    let client = MarketplaceClient::new(
        Arc::new(portal),
        store.clone(),
        Arc::new(RateLimiter::from_config(&config.rate_limit)),
        Arc::clone(&clock),
        config.marketplace.clone(),
        &config.rate_limit,
    );

    let mut builder = TaskScheduler::builder(Arc::new(client), store.clone())
        .clock(clock)
        .scheduler_config(config.scheduler.clone())
        .notifications(config.notifications.clone())
        .channel(Arc::new(TracingChannel::new("log")));
    let mut expected = vec!["log"];
    if let Some(telegram) = &config.notifications.telegram {
        let channel = TelegramChannel::new(telegram).context("failed to set up telegram channel")?;
        builder = builder.channel(Arc::new(channel));
        expected.push(TelegramChannel::DEFAULT_NAME);
        info!(chat_id = %telegram.chat_id, "telegram notifications enabled");
    }
    let scheduler = builder.expect_channels(&expected).build()?;

    for id in &tasks {
        let status = scheduler.start(*id).await?;
        info!(task_id = %id, %status, "task started");
    }
    let reconciled = scheduler.reconcile().await?;
    info!(started = reconciled.started.len(), "scheduler running, press Ctrl-C to stop");

    let mut ticker = tokio::time::interval(STATUS_EVERY);
    ticker.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                break;
            }
            _ = ticker.tick() => {
                let status = scheduler.worker_status();
                println!("{}", serde_json::to_string_pretty(&status)?);
                if status.running.is_empty() {
                    info!("no workers left");
                    break;
                }
            }
        }
    }

    scheduler.shutdown().await;
    for task in store.tasks() {
        info!(task_id = %task.id, status = %task.status, found = task.found_slots, "final state");
    }
    let events = store.events();
    info!(events = events.len(), "done");
    Ok(())
}

/// One account and two tasks: one watching, one booking automatically.
fn seed_demo(store: &InMemoryTaskStore, clock: &dyn Clock) -> Result<Vec<TaskId>> {
    let owner = OwnerId::generate();
    let account = Account::new(
        owner,
        "demo seller",
        SessionCredentials::new(r#"[{"name":"WBToken","value":"demo"}]"#),
    );
    store.insert_account(account.clone());

    let today = clock.today();
    let until = today
        .checked_add_days(Days::new(10))
        .context("date window out of range")?;

    let mut ids = Vec::new();
    for (name, warehouse, packaging, min, auto_book) in [
        ("watch Koledino boxes", "Koledino", Packaging::Boxes, 1.5, false),
        ("book Kazan pallets", "Kazan", Packaging::Pallets, 2.0, true),
    ] {
        let criteria = SearchCriteria::new(warehouse, today, until, min, packaging)?;
        let mut task = Task::new(owner, name, &criteria, Some(account.id), auto_book);
        task.interval_minutes = Some(1);
        ids.push(task.id);
        store.insert_task(task);
    }
    Ok(ids)
}
