// ABOUTME: Capture engine - tails the source binlog and records each row change
// ABOUTME: Every event is written to the event log before it is handed to the work queue

pub mod binlog;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;

use crate::logdb::EventLog;
use crate::mapping::TableMappings;
use crate::model::{Action, CapturedEvent, Checkpoint, Payload};
use crate::queue::WorkQueue;
use crate::retry::{retry_fixed, Backoff, RetryFailure, RetryPolicy};

pub use binlog::MySqlBinlogConnector;

/// Page size when re-publishing events a failed cycle left unqueued.
const REPUBLISH_BATCH: usize = 500;

/// A binlog event the capture engine cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum BinlogEvent {
    /// Subsequent events come from `next_file`.
    Rotate { next_file: String, position: u64 },
    Rows(RowsEvent),
}

/// One insert/update/delete rows event with its rows in statement order.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub schema: String,
    pub table: String,
    /// End position of the event in the current binlog file.
    pub log_pos: u64,
    /// Commit time on the source, seconds since the epoch.
    pub timestamp: u32,
    pub action: Action,
    pub rows: Vec<RawRow>,
}

/// Positional column values of one affected row.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRow {
    Image(Vec<Value>),
    Change { before: Vec<Value>, after: Vec<Value> },
}

#[async_trait]
pub trait BinlogSource: Send {
    /// Next relevant event, or `None` when the server closed the stream.
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>>;
}

#[async_trait]
pub trait BinlogConnector: Send + Sync {
    /// Open a replication stream. `None` leaves the start position to the server.
    async fn connect(
        &self,
        server_id: u32,
        resume: Option<&Checkpoint>,
    ) -> Result<Box<dyn BinlogSource>>;
}

/// Schemas whose row events are captured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaFilter(HashSet<String>);

impl SchemaFilter {
    pub fn new(schemas: impl IntoIterator<Item = String>) -> Self {
        Self(schemas.into_iter().collect())
    }

    pub fn contains(&self, schema: &str) -> bool {
        self.0.contains(schema)
    }
}

/// Generate a replication client id unlikely to collide with real replicas.
pub fn random_server_id() -> u32 {
    rand::thread_rng().gen_range(100_000..=u32::MAX)
}

pub struct CaptureEngine {
    connector: Arc<dyn BinlogConnector>,
    events: Arc<dyn EventLog>,
    queue: Arc<dyn WorkQueue>,
    mappings: TableMappings,
    schemas: SchemaFilter,
    resume_override: Option<Checkpoint>,
    server_id: u32,
    source_epoch: u32,
    queue_retry: RetryPolicy,
    /// Lowest event id recorded in the event log but not yet on the queue.
    unpublished_from: Mutex<Option<i64>>,
}

impl CaptureEngine {
    pub fn new(
        connector: Arc<dyn BinlogConnector>,
        events: Arc<dyn EventLog>,
        queue: Arc<dyn WorkQueue>,
        mappings: TableMappings,
        schemas: impl IntoIterator<Item = String>,
        resume_override: Option<Checkpoint>,
    ) -> Self {
        Self {
            connector,
            events,
            queue,
            mappings,
            schemas: SchemaFilter::new(schemas),
            resume_override,
            server_id: random_server_id(),
            source_epoch: 0,
            queue_retry: RetryPolicy::QUEUE,
            unpublished_from: Mutex::new(None),
        }
    }

    /// Binlog generation stamped on captured events and used to scope the
    /// checkpoint lookup.
    pub fn with_source_epoch(mut self, source_epoch: u32) -> Self {
        self.source_epoch = source_epoch;
        self
    }

    pub fn with_queue_retry(mut self, policy: RetryPolicy) -> Self {
        self.queue_retry = policy;
        self
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    /// Where the next connection starts: the configured override if any,
    /// else the latest checkpoint in the event log.
    pub async fn resolve_resume(&self) -> Result<Option<Checkpoint>> {
        if let Some(checkpoint) = &self.resume_override {
            tracing::info!(checkpoint = %checkpoint, "resuming from configured binlog position");
            return Ok(Some(checkpoint.clone()));
        }
        let checkpoint = self
            .events
            .latest_checkpoint(self.source_epoch)
            .await
            .context("Failed to read latest checkpoint")?;
        match &checkpoint {
            Some(cp) => tracing::info!(checkpoint = %cp, "resuming from event log checkpoint"),
            None => tracing::info!("no checkpoint recorded, starting at server default position"),
        }
        Ok(checkpoint)
    }

    /// Connect and consume until the stream ends or fails, retrying forever
    /// with exponential backoff. The resume position is recomputed for every
    /// connection attempt.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(server_id = self.server_id, schemas = ?self.schemas, "capture engine started");
        let mut backoff = Backoff::default();
        loop {
            match self.run_once().await {
                Ok(captured) => {
                    tracing::warn!(captured, "binlog stream closed by server, reconnecting");
                    if captured > 0 {
                        backoff.reset();
                    }
                }
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "capture cycle failed");
                }
            }
            let delay = backoff.next_delay();
            tracing::info!("reconnecting to binlog in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// One connect-and-consume cycle. Returns the number of events captured
    /// before the server closed the stream.
    pub async fn run_once(&self) -> Result<u64> {
        self.republish_unpublished().await?;
        let resume = self.resolve_resume().await?;
        let mut source = self
            .connector
            .connect(self.server_id, resume.as_ref())
            .await
            .context("Failed to open binlog stream")?;
        let mut current_file = resume.map(|cp| cp.file).unwrap_or_default();
        let mut captured = 0u64;

        while let Some(event) = source.next_event().await? {
            match event {
                BinlogEvent::Rotate {
                    next_file,
                    position,
                } => {
                    if next_file != current_file {
                        tracing::info!(file = %next_file, position, "binlog rotated");
                    }
                    current_file = next_file;
                }
                BinlogEvent::Rows(rows) => {
                    if !self.schemas.contains(&rows.schema) {
                        continue;
                    }
                    captured += self.capture_rows(&current_file, rows).await?;
                }
            }
        }
        Ok(captured)
    }

    /// Record and publish one event per row, in row order.
    async fn capture_rows(&self, file: &str, rows: RowsEvent) -> Result<u64> {
        let captured_at = Utc::now();
        let source_time =
            DateTime::<Utc>::from_timestamp(i64::from(rows.timestamp), 0).unwrap_or(captured_at);
        let mut count = 0;

        for (row_index, raw) in rows.rows.into_iter().enumerate() {
            let payload = match raw {
                RawRow::Image(values) => Payload::Row(self.mappings.name_row(&rows.table, values)),
                RawRow::Change { before, after } => Payload::Change {
                    before: self.mappings.name_row(&rows.table, before),
                    after: self.mappings.name_row(&rows.table, after),
                },
            };
            let mut event = CapturedEvent {
                event_id: None,
                captured_at,
                source_epoch: self.source_epoch,
                source_file: file.to_string(),
                source_offset: rows.log_pos,
                row_index: row_index as u32,
                source_time,
                schema: rows.schema.clone(),
                table: rows.table.clone(),
                action: rows.action,
                payload,
                applied: false,
            };

            match self.events.insert_event(&event).await {
                Ok(event_id) => event.event_id = Some(event_id),
                Err(err) => tracing::error!(
                    file = %event.source_file,
                    offset = event.source_offset,
                    row_index,
                    table = %event.table,
                    error = %err,
                    "event not durably recorded, publishing without event id"
                ),
            }

            if let Err(err) = self.publish(&event).await {
                if let Some(event_id) = event.event_id {
                    self.note_unpublished(event_id);
                }
                return Err(err);
            }
            tracing::info!(
                event_id = ?event.event_id,
                file = %event.source_file,
                offset = event.source_offset,
                table = %event.table,
                action = %event.action,
                "event captured"
            );
            count += 1;
        }
        Ok(count)
    }

    /// Enqueue one event under the queue retry policy.
    async fn publish(&self, event: &CapturedEvent) -> Result<()> {
        retry_fixed(self.queue_retry, "enqueue", |_| self.queue.enqueue(event))
            .await
            .map_err(|failure| {
                let err = match failure {
                    RetryFailure::Exhausted { last, .. } | RetryFailure::Permanent(last) => last,
                };
                err.context(format!(
                    "Failed to enqueue event {:?} at {}",
                    event.event_id,
                    event.checkpoint()
                ))
            })
    }

    fn unpublished_from(&self) -> Option<i64> {
        *self
            .unpublished_from
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_unpublished_from(&self, event_id: Option<i64>) {
        *self
            .unpublished_from
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = event_id;
    }

    fn note_unpublished(&self, event_id: i64) {
        let lowest = self
            .unpublished_from()
            .map_or(event_id, |current| current.min(event_id));
        self.set_unpublished_from(Some(lowest));
    }

    /// Put events that were logged but never enqueued back on the queue.
    ///
    /// A failed cycle leaves them behind its checkpoint, so reconnecting alone
    /// would skip them.
    async fn republish_unpublished(&self) -> Result<u64> {
        let Some(first) = self.unpublished_from() else {
            return Ok(0);
        };

        let mut after = first - 1;
        let mut republished = 0u64;
        loop {
            let batch = self
                .events
                .unapplied_events(after, REPUBLISH_BATCH)
                .await
                .context("Failed to list events left unqueued")?;
            for event in &batch {
                self.publish(event).await?;
                if let Some(event_id) = event.event_id {
                    after = event_id;
                    self.set_unpublished_from(Some(event_id + 1));
                }
                republished += 1;
            }
            if batch.len() < REPUBLISH_BATCH {
                break;
            }
        }

        self.set_unpublished_from(None);
        tracing::info!(
            first_event_id = first,
            republished,
            "re-published events left unqueued by a failed cycle"
        );
        Ok(republished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_filter_matches_exact_names() {
        let filter = SchemaFilter::new(vec!["shop".to_string()]);
        assert!(filter.contains("shop"));
        assert!(!filter.contains("Shop"));
        assert!(!filter.contains("mysql"));
    }

    #[test]
    fn server_ids_stay_above_reserved_range() {
        for _ in 0..100 {
            assert!(random_server_id() >= 100_000);
        }
    }
}
