// ABOUTME: In-memory doubles for the log store, relationship store, target and binlog
// ABOUTME: Shared by the pipeline integration tests
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use dataflow_replicator::apply::dml::Statement;
use dataflow_replicator::apply::{ExecOutcome, TargetDatabase};
use dataflow_replicator::capture::{BinlogConnector, BinlogEvent, BinlogSource, RawRow, RowsEvent};
use dataflow_replicator::config::TableConfig;
use dataflow_replicator::error::{StoreError, TargetError};
use dataflow_replicator::logdb::{EventLog, RelationshipStore};
use dataflow_replicator::mapping::TableMappings;
use dataflow_replicator::model::{
    Action, ApplyRecord, CapturedEvent, Checkpoint, IdentityMapping, Payload, RowImage,
};
use dataflow_replicator::queue::WorkQueue;
use serde_json::Value;

fn unavailable(operation: &'static str) -> StoreError {
    StoreError::RetriesExhausted {
        operation,
        attempts: 15,
        last_error: "Can't connect to MySQL server".to_string(),
    }
}

#[derive(Default)]
pub struct MemoryEventLog {
    pub events: Mutex<Vec<CapturedEvent>>,
    pub apply_records: Mutex<Vec<ApplyRecord>>,
    pub unavailable: AtomicBool,
}

impl MemoryEventLog {
    pub fn with_events(events: Vec<CapturedEvent>) -> Self {
        let log = Self::default();
        for (idx, mut event) in events.into_iter().enumerate() {
            event.event_id = Some(idx as i64 + 1);
            log.events.lock().unwrap().push(event);
        }
        log
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self, operation: &'static str) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(unavailable(operation))
        } else {
            Ok(())
        }
    }

    pub fn is_applied(&self, event_id: i64) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.event_id == Some(event_id) && e.applied)
    }

    pub fn event_ids(&self) -> Vec<i64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.event_id)
            .collect()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn insert_event(&self, event: &CapturedEvent) -> Result<i64, StoreError> {
        self.check("insert_event")?;
        let mut events = self.events.lock().unwrap();
        if let Some(existing) = events.iter().find(|e| {
            e.source_epoch == event.source_epoch
                && e.source_file == event.source_file
                && e.source_offset == event.source_offset
                && e.row_index == event.row_index
        }) {
            return Ok(existing.event_id.unwrap_or_default());
        }
        let event_id = events.len() as i64 + 1;
        let mut stored = event.clone();
        stored.event_id = Some(event_id);
        events.push(stored);
        Ok(event_id)
    }

    async fn latest_checkpoint(
        &self,
        source_epoch: u32,
    ) -> Result<Option<Checkpoint>, StoreError> {
        self.check("latest_checkpoint")?;
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.source_epoch == source_epoch)
            .last()
            .map(CapturedEvent::checkpoint))
    }

    async fn record_apply(&self, record: &ApplyRecord) -> Result<i64, StoreError> {
        self.check("record_apply")?;
        let mut records = self.apply_records.lock().unwrap();
        let apply_id = records.len() as i64 + 1;
        let mut stored = record.clone();
        stored.apply_id = Some(apply_id);
        records.push(stored);
        Ok(apply_id)
    }

    async fn mark_event_applied(&self, event_id: i64) -> Result<(), StoreError> {
        self.check("mark_event_applied")?;
        for event in self.events.lock().unwrap().iter_mut() {
            if event.event_id == Some(event_id) {
                event.applied = true;
            }
        }
        Ok(())
    }

    async fn mark_apply_executed(&self, apply_id: i64) -> Result<(), StoreError> {
        self.check("mark_apply_executed")?;
        for record in self.apply_records.lock().unwrap().iter_mut() {
            if record.apply_id == Some(apply_id) {
                record.executed = true;
            }
        }
        Ok(())
    }

    async fn unapplied_events(
        &self,
        after_event_id: i64,
        limit: usize,
    ) -> Result<Vec<CapturedEvent>, StoreError> {
        self.check("unapplied_events")?;
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| !e.applied && e.event_id.is_some_and(|id| id > after_event_id))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryRelationships {
    pub mappings: Mutex<Vec<IdentityMapping>>,
}

impl MemoryRelationships {
    pub fn snapshot(&self) -> Vec<IdentityMapping> {
        self.mappings.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelationshipStore for MemoryRelationships {
    async fn lookup(&self, domain: &str, source_id: i64) -> Result<Option<i64>, StoreError> {
        Ok(self
            .mappings
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|m| m.domain == domain && m.source_id == source_id)
            .map(|m| m.target_id))
    }

    async fn insert_mapping(
        &self,
        domain: &str,
        source_id: i64,
        target_id: i64,
    ) -> Result<i64, StoreError> {
        let mut mappings = self.mappings.lock().unwrap();
        let mapping_id = mappings.len() as i64 + 1;
        mappings.push(IdentityMapping {
            mapping_id: Some(mapping_id),
            domain: domain.to_string(),
            source_id,
            target_id,
        });
        Ok(mapping_id)
    }
}

/// Queue double that never blocks: `dequeue` on an empty queue is an error.
#[derive(Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<CapturedEvent>>,
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, event: &CapturedEvent) -> Result<()> {
        self.items.lock().unwrap().push_back(event.clone());
        Ok(())
    }

    async fn dequeue(&self) -> Result<CapturedEvent> {
        self.items
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("queue is empty"))
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.items.lock().unwrap().len() as u64)
    }
}

impl MemoryQueue {
    pub fn snapshot(&self) -> Vec<CapturedEvent> {
        self.items.lock().unwrap().iter().cloned().collect()
    }
}

/// Queue double whose first `failures` enqueues fail, as a locked SQLite file
/// would.
pub struct FlakyQueue {
    pub inner: MemoryQueue,
    failures: AtomicU32,
    pub attempts: AtomicU32,
}

impl FlakyQueue {
    pub fn failing(failures: u32) -> Self {
        Self {
            inner: MemoryQueue::default(),
            failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl WorkQueue for FlakyQueue {
    async fn enqueue(&self, event: &CapturedEvent) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("database is locked"));
        }
        self.inner.enqueue(event).await
    }

    async fn dequeue(&self) -> Result<CapturedEvent> {
        self.inner.dequeue().await
    }

    async fn size(&self) -> Result<u64> {
        self.inner.size().await
    }
}

/// Queue double handing out scripted dequeue results, then blocking forever
/// like an idle queue.
#[derive(Default)]
pub struct ScriptedQueue {
    results: Mutex<VecDeque<Result<CapturedEvent>>>,
    pub dequeues: AtomicU32,
}

impl ScriptedQueue {
    pub fn with_results(results: Vec<Result<CapturedEvent>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            dequeues: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl WorkQueue for ScriptedQueue {
    async fn enqueue(&self, event: &CapturedEvent) -> Result<()> {
        self.results.lock().unwrap().push_back(Ok(event.clone()));
        Ok(())
    }

    async fn dequeue(&self) -> Result<CapturedEvent> {
        self.dequeues.fetch_add(1, Ordering::SeqCst);
        let next = self.results.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.results.lock().unwrap().len() as u64)
    }
}

/// Target double: inserts get ids from a counter, updates/deletes report a
/// configurable row count.
pub struct FakeTarget {
    pub executed: Mutex<Vec<Statement>>,
    next_insert_id: AtomicU64,
    pub rows_affected: AtomicU64,
    pub unreachable: AtomicBool,
}

impl FakeTarget {
    pub fn starting_at(first_insert_id: u64) -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            next_insert_id: AtomicU64::new(first_insert_id),
            rows_affected: AtomicU64::new(1),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl TargetDatabase for FakeTarget {
    async fn execute(&self, statement: &Statement) -> Result<ExecOutcome, TargetError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TargetError::RetriesExhausted {
                attempts: 60,
                last_error: "Can't connect to MySQL server".to_string(),
            });
        }
        self.executed.lock().unwrap().push(statement.clone());
        if statement.sql.starts_with("INSERT") {
            Ok(ExecOutcome {
                affected_rows: 1,
                last_insert_id: Some(self.next_insert_id.fetch_add(1, Ordering::SeqCst)),
            })
        } else {
            Ok(ExecOutcome {
                affected_rows: self.rows_affected.load(Ordering::SeqCst),
                last_insert_id: None,
            })
        }
    }
}

/// Binlog double replaying one scripted session per connection.
#[derive(Default)]
pub struct ScriptedBinlog {
    sessions: Mutex<VecDeque<Vec<BinlogEvent>>>,
    pub resumes: Mutex<Vec<Option<Checkpoint>>>,
}

impl ScriptedBinlog {
    pub fn with_sessions(sessions: Vec<Vec<BinlogEvent>>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            resumes: Mutex::new(Vec::new()),
        }
    }

    pub fn resumes(&self) -> Vec<Option<Checkpoint>> {
        self.resumes.lock().unwrap().clone()
    }
}

struct ScriptedSource(VecDeque<BinlogEvent>);

#[async_trait]
impl BinlogSource for ScriptedSource {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        Ok(self.0.pop_front())
    }
}

#[async_trait]
impl BinlogConnector for ScriptedBinlog {
    async fn connect(
        &self,
        _server_id: u32,
        resume: Option<&Checkpoint>,
    ) -> Result<Box<dyn BinlogSource>> {
        self.resumes.lock().unwrap().push(resume.cloned());
        let session = self
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("source unreachable"))?;
        Ok(Box::new(ScriptedSource(session.into())))
    }
}

pub fn rotate(file: &str) -> BinlogEvent {
    BinlogEvent::Rotate {
        next_file: file.to_string(),
        position: 4,
    }
}

pub fn rows(table: &str, log_pos: u64, action: Action, rows: Vec<RawRow>) -> BinlogEvent {
    BinlogEvent::Rows(RowsEvent {
        schema: "shop".to_string(),
        table: table.to_string(),
        log_pos,
        timestamp: 1_727_771_415,
        action,
        rows,
    })
}

/// `example_table(id, foreign_id, some_fields_change)` with `foreign_id`
/// referencing `foreign_table`, whose own ids live in domain `foreign_id`.
pub fn example_mappings() -> TableMappings {
    let example = TableConfig {
        source_columns: strings(&["id", "foreign_id", "some_fields_change"]),
        target_columns: strings(&["id", "foreign_id", "some_fields"]),
        primary_key: "id".to_string(),
        identity_domain: "primary_id".to_string(),
        foreign_keys: BTreeMap::from([("foreign_id".to_string(), "foreign_id".to_string())]),
        ..TableConfig::default()
    };
    let foreign = TableConfig {
        source_columns: strings(&["id", "name"]),
        target_columns: strings(&["id", "label"]),
        primary_key: "id".to_string(),
        identity_domain: "foreign_id".to_string(),
        ..TableConfig::default()
    };
    let audit = TableConfig {
        skip: true,
        primary_key: "id".to_string(),
        ..TableConfig::default()
    };
    TableMappings::from_config(&BTreeMap::from([
        ("example_table".to_string(), example),
        ("foreign_table".to_string(), foreign),
        ("audit_log".to_string(), audit),
    ]))
    .unwrap()
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub fn row(value: Value) -> RowImage {
    value.as_object().cloned().unwrap_or_default()
}

pub fn captured(table: &str, action: Action, payload: Payload, event_id: i64) -> CapturedEvent {
    CapturedEvent {
        event_id: Some(event_id),
        captured_at: Utc::now(),
        source_epoch: 0,
        source_file: "mysql-bin.000001".to_string(),
        source_offset: 100 + event_id as u64,
        row_index: 0,
        source_time: Utc::now(),
        schema: "shop".to_string(),
        table: table.to_string(),
        action,
        payload,
        applied: false,
    }
}
