// ABOUTME: Command implementations for each process mode
// ABOUTME: Exports capture, apply, run, status and replay commands

pub mod apply;
pub mod capture;
pub mod replay;
pub mod run;
pub mod status;

pub use apply::apply;
pub use capture::capture;
pub use replay::replay;
pub use run::run;
pub use status::status;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::apply::{ApplyEngine, HandlerRegistry, MySqlTarget};
use crate::capture::{CaptureEngine, MySqlBinlogConnector, SchemaFilter};
use crate::config::Config;
use crate::logdb::LogStore;
use crate::queue::SqliteWorkQueue;

async fn open_log_store(config: &Config, password: Option<&str>) -> Result<LogStore> {
    if password.is_none() {
        tracing::warn!("no log database password supplied, connecting without one");
    }
    LogStore::connect(&config.log_store, &config.project_name, password)
        .await
        .context("Failed to open log database")
}

fn open_queue(config: &Config) -> Result<Arc<SqliteWorkQueue>> {
    let queue = SqliteWorkQueue::open(
        &config.queue.path,
        Duration::from_millis(config.queue.poll_interval_ms),
    )
    .with_context(|| format!("Failed to open work queue {}", config.queue.path.display()))?;
    Ok(Arc::new(queue))
}

fn build_capture(
    config: &Config,
    log_store: &LogStore,
    queue: Arc<SqliteWorkQueue>,
) -> Result<CaptureEngine> {
    let connector = MySqlBinlogConnector::new(
        &config.source.url,
        Duration::from_secs(config.source.heartbeat_secs),
        SchemaFilter::new(config.source.schemas.clone()),
    )?;
    Ok(CaptureEngine::new(
        Arc::new(connector),
        Arc::new(log_store.clone()),
        queue,
        config.table_mappings()?,
        config.source.schemas.clone(),
        config.resume_override(),
    )
    .with_source_epoch(config.source.epoch))
}

fn build_apply(
    config: &Config,
    log_store: &LogStore,
    queue: Arc<SqliteWorkQueue>,
) -> Result<ApplyEngine> {
    let target = MySqlTarget::connect(&config.target.url)?;
    let handlers = HandlerRegistry::from_mappings(&config.table_mappings()?);
    if handlers.is_empty() {
        tracing::warn!("no [tables] configured, every event will be reported as unroutable");
    }
    Ok(ApplyEngine::new(
        queue,
        Arc::new(log_store.clone()),
        Arc::new(log_store.clone()),
        Arc::new(target),
        handlers,
        config.apply.clone(),
    ))
}
