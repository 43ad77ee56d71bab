// ABOUTME: Durable event log - records every captured change and its apply status
// ABOUTME: Source of the last-processed binlog checkpoint used to resume capture

use async_trait::async_trait;
use chrono::Utc;
use mysql_async::prelude::Queryable;

use super::{parse_sql_datetime, sql_datetime, LogStore};
use crate::error::StoreError;
use crate::model::{Action, ApplyRecord, CapturedEvent, Checkpoint, Payload};

/// Append-only record of captured events and their downstream status.
///
/// Write operations retry on connectivity failure; an `Err` means durability
/// could not be confirmed and the caller decides whether to carry on.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Persist one event and return its identifier. Identifiers increase in
    /// call order. Recording the same binlog coordinate twice within one
    /// source epoch returns the identifier of the first row.
    async fn insert_event(&self, event: &CapturedEvent) -> Result<i64, StoreError>;

    /// Coordinate of the most recently recorded event of `source_epoch`, if any.
    async fn latest_checkpoint(
        &self,
        source_epoch: u32,
    ) -> Result<Option<Checkpoint>, StoreError>;

    async fn record_apply(&self, record: &ApplyRecord) -> Result<i64, StoreError>;

    async fn mark_event_applied(&self, event_id: i64) -> Result<(), StoreError>;

    async fn mark_apply_executed(&self, apply_id: i64) -> Result<(), StoreError>;

    /// Events still waiting to be applied, oldest first, with ids above
    /// `after_event_id`.
    async fn unapplied_events(
        &self,
        after_event_id: i64,
        limit: usize,
    ) -> Result<Vec<CapturedEvent>, StoreError>;
}

const INSERT_EVENT_SQL: &str = "INSERT INTO captured_events
    (captured_at, source_epoch, source_file, source_offset, row_index, source_time,
     `schema`, `table`, action, payload)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON DUPLICATE KEY UPDATE event_id = LAST_INSERT_ID(event_id)";

const LATEST_CHECKPOINT_SQL: &str = "SELECT source_file, source_offset
    FROM captured_events
    WHERE source_epoch = ?
    ORDER BY event_id DESC
    LIMIT 1";

const INSERT_APPLY_SQL: &str = "INSERT INTO apply_records
    (event_id, recorded_at, `table`, action, statement)
    VALUES (?, ?, ?, ?, ?)";

const UNAPPLIED_EVENTS_SQL: &str = "SELECT event_id, CAST(captured_at AS CHAR), source_epoch,
        source_file, source_offset, row_index, CAST(source_time AS CHAR), `schema`, `table`,
        action, payload
    FROM captured_events
    WHERE applied = 0 AND event_id > ?
    ORDER BY event_id ASC
    LIMIT ?";

type EventRow = (
    i64,
    String,
    u32,
    String,
    u64,
    u32,
    String,
    String,
    String,
    String,
    Vec<u8>,
);

#[async_trait]
impl EventLog for LogStore {
    async fn insert_event(&self, event: &CapturedEvent) -> Result<i64, StoreError> {
        let payload = serde_json::to_vec(&event.payload)?;
        let captured_at = sql_datetime(&event.captured_at);
        let source_time = sql_datetime(&event.source_time);
        let pool = &self.pool;

        let event_id = self
            .with_retry("insert_event", |_| {
                let params = (
                    captured_at.clone(),
                    event.source_epoch,
                    event.source_file.clone(),
                    event.source_offset,
                    event.row_index,
                    source_time.clone(),
                    event.schema.clone(),
                    event.table.clone(),
                    event.action.as_str(),
                    payload.clone(),
                );
                async move {
                    let mut conn = pool.get_conn().await?;
                    conn.exec_drop(INSERT_EVENT_SQL, params).await?;
                    Ok(conn.last_insert_id())
                }
            })
            .await?;

        let event_id = event_id.ok_or(StoreError::Rejected {
            operation: "insert_event",
            reason: "server returned no event id".to_string(),
        })? as i64;

        tracing::debug!(
            event_id,
            file = %event.source_file,
            offset = event.source_offset,
            table = %event.table,
            action = %event.action,
            "event recorded"
        );
        Ok(event_id)
    }

    async fn latest_checkpoint(
        &self,
        source_epoch: u32,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let pool = &self.pool;
        let row: Option<(String, u64)> = self
            .with_retry("latest_checkpoint", |_| async move {
                let mut conn = pool.get_conn().await?;
                conn.exec_first(LATEST_CHECKPOINT_SQL, (source_epoch,)).await
            })
            .await?;
        Ok(row.map(|(file, offset)| Checkpoint::new(file, offset)))
    }

    async fn record_apply(&self, record: &ApplyRecord) -> Result<i64, StoreError> {
        let recorded_at = sql_datetime(&Utc::now());
        let pool = &self.pool;

        let apply_id = self
            .with_retry("record_apply", |_| {
                let params = (
                    record.event_id,
                    recorded_at.clone(),
                    record.table.clone(),
                    record.action.as_str(),
                    record.statement.clone(),
                );
                async move {
                    let mut conn = pool.get_conn().await?;
                    conn.exec_drop(INSERT_APPLY_SQL, params).await?;
                    Ok(conn.last_insert_id())
                }
            })
            .await?;

        let apply_id = apply_id.ok_or(StoreError::Rejected {
            operation: "record_apply",
            reason: "server returned no apply id".to_string(),
        })? as i64;

        tracing::info!(
            apply_id,
            event_id = ?record.event_id,
            table = %record.table,
            action = %record.action,
            "apply record written"
        );
        Ok(apply_id)
    }

    async fn mark_event_applied(&self, event_id: i64) -> Result<(), StoreError> {
        let pool = &self.pool;
        self.with_retry("mark_event_applied", |_| async move {
            let mut conn = pool.get_conn().await?;
            conn.exec_drop(
                "UPDATE captured_events SET applied = 1 WHERE event_id = ?",
                (event_id,),
            )
            .await
        })
        .await
    }

    async fn mark_apply_executed(&self, apply_id: i64) -> Result<(), StoreError> {
        let pool = &self.pool;
        self.with_retry("mark_apply_executed", |_| async move {
            let mut conn = pool.get_conn().await?;
            conn.exec_drop(
                "UPDATE apply_records SET executed = 1 WHERE apply_id = ?",
                (apply_id,),
            )
            .await
        })
        .await?;
        tracing::info!(apply_id, executed = true, "apply record executed");
        Ok(())
    }

    async fn unapplied_events(
        &self,
        after_event_id: i64,
        limit: usize,
    ) -> Result<Vec<CapturedEvent>, StoreError> {
        let pool = &self.pool;
        let limit = limit as u64;
        let rows: Vec<EventRow> = self
            .with_retry("unapplied_events", |_| async move {
                let mut conn = pool.get_conn().await?;
                conn.exec(UNAPPLIED_EVENTS_SQL, (after_event_id, limit)).await
            })
            .await?;

        rows.into_iter().map(decode_event_row).collect()
    }
}

fn decode_event_row(row: EventRow) -> Result<CapturedEvent, StoreError> {
    let (
        event_id,
        captured_at,
        source_epoch,
        source_file,
        source_offset,
        row_index,
        source_time,
        schema,
        table,
        action,
        payload,
    ) = row;

    let decode_err = |reason: String| StoreError::Decode { event_id, reason };
    let captured_at = parse_sql_datetime(&captured_at)
        .ok_or_else(|| decode_err(format!("bad captured_at {captured_at:?}")))?;
    let source_time = parse_sql_datetime(&source_time)
        .ok_or_else(|| decode_err(format!("bad source_time {source_time:?}")))?;
    let action = Action::parse(&action).map_err(|e| decode_err(e.to_string()))?;
    let payload: Payload =
        serde_json::from_slice(&payload).map_err(|e| decode_err(e.to_string()))?;

    Ok(CapturedEvent {
        event_id: Some(event_id),
        captured_at,
        source_epoch,
        source_file,
        source_offset,
        row_index,
        source_time,
        schema,
        table,
        action,
        payload,
        applied: false,
    })
}
