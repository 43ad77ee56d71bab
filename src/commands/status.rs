// ABOUTME: Read-only status report - queue depth, latest checkpoint, unapplied events
// ABOUTME: Never writes to the queue or the log database

use anyhow::{Context, Result};

use crate::config::Config;
use crate::logdb::{EventLog, LogStore};
use crate::queue::observe_depth;

pub async fn status(config: &Config, log_db_password: Option<&str>) -> Result<()> {
    println!("Project: {}", config.project_name);

    if config.queue.path.exists() {
        let depth = observe_depth(&config.queue.path).with_context(|| {
            format!("Failed to read queue depth from {}", config.queue.path.display())
        })?;
        println!("Queue depth: {} ({})", depth, config.queue.path.display());
    } else {
        println!(
            "Queue depth: 0 (queue file {} not created yet)",
            config.queue.path.display()
        );
    }

    let log_store =
        LogStore::open_existing(&config.log_store, &config.project_name, log_db_password).await?;
    match log_store.latest_checkpoint(config.source.epoch).await {
        Ok(Some(checkpoint)) => println!(
            "Latest checkpoint: {} (epoch {})",
            checkpoint, config.source.epoch
        ),
        Ok(None) => println!("Latest checkpoint: none recorded"),
        Err(e) => println!("Latest checkpoint: unavailable ({})", e),
    }
    match log_store.pending_count().await {
        Ok(pending) => println!("Unapplied events: {}", pending),
        Err(e) => println!("Unapplied events: unavailable ({})", e),
    }
    if let Some(binlog) = &config.binlog {
        println!(
            "Configured resume override: {}:{}",
            binlog.file, binlog.position
        );
    }
    log_store.disconnect().await?;
    Ok(())
}
