// ABOUTME: Re-enqueue events the event log still marks unapplied
// ABOUTME: Manual recovery path after target outages or handler fixes

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::logdb::EventLog;
use crate::queue::WorkQueue;

/// Options for a replay run.
#[derive(Debug, Clone, Copy)]
pub struct ReplayOptions {
    /// Only events with ids above this one are replayed.
    pub after_event_id: i64,
    pub batch_size: usize,
    /// Report what would be replayed without enqueuing.
    pub dry_run: bool,
}

pub async fn replay(
    config: &Config,
    log_db_password: Option<&str>,
    options: ReplayOptions,
) -> Result<()> {
    let log_store = super::open_log_store(config, log_db_password).await?;
    let queue = super::open_queue(config)?;
    let replayed = replay_unapplied(&log_store, queue.as_ref(), options).await?;

    if options.dry_run {
        println!("{} unapplied events would be replayed", replayed);
    } else {
        println!("Re-enqueued {} unapplied events", replayed);
    }
    log_store.disconnect().await?;
    Ok(())
}

/// Page through unapplied events in id order and enqueue each one.
pub async fn replay_unapplied(
    events: &dyn EventLog,
    queue: &dyn WorkQueue,
    options: ReplayOptions,
) -> Result<u64> {
    if options.batch_size == 0 {
        bail!("batch size must be positive");
    }
    let mut after = options.after_event_id;
    let mut replayed = 0u64;
    loop {
        let batch = events
            .unapplied_events(after, options.batch_size)
            .await
            .context("Failed to list unapplied events")?;
        let Some(last) = batch.last().and_then(|event| event.event_id) else {
            break;
        };
        for event in &batch {
            if !options.dry_run {
                queue.enqueue(event).await?;
            }
            tracing::info!(
                event_id = ?event.event_id,
                table = %event.table,
                action = %event.action,
                dry_run = options.dry_run,
                "replaying event"
            );
            replayed += 1;
        }
        if batch.len() < options.batch_size {
            break;
        }
        after = last;
    }
    Ok(replayed)
}
