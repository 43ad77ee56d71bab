// ABOUTME: Data model shared by the capture and apply engines
// ABOUTME: Captured row changes, apply attempts, identity mappings and checkpoints

use std::fmt;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Column name to value image of one row.
pub type RowImage = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "insert" => Ok(Action::Insert),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(anyhow!("unknown row action: {other}")),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row data carried by an event: a single image for insert/delete, a
/// before/after pair for update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Change { before: RowImage, after: RowImage },
    Row(RowImage),
}

impl Payload {
    /// The image that identifies the row: the only image for insert/delete,
    /// the after image for update.
    pub fn current(&self) -> &RowImage {
        match self {
            Payload::Row(row) => row,
            Payload::Change { after, .. } => after,
        }
    }
}

/// Binlog coordinate used to resume capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub file: String,
    pub offset: u64,
}

impl Checkpoint {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

/// One row-level change read from the source binlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvent {
    /// Assigned by the event log; `None` when durability could not be confirmed.
    pub event_id: Option<i64>,
    pub captured_at: DateTime<Utc>,
    /// Operator-assigned generation of the source binlog. Bumped after
    /// `RESET MASTER` or a failover, when file names start repeating.
    #[serde(default)]
    pub source_epoch: u32,
    pub source_file: String,
    pub source_offset: u64,
    /// Position of the row inside its binlog rows event.
    pub row_index: u32,
    pub source_time: DateTime<Utc>,
    pub schema: String,
    pub table: String,
    pub action: Action,
    pub payload: Payload,
    #[serde(default)]
    pub applied: bool,
}

impl CapturedEvent {
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.source_file.clone(), self.source_offset)
    }
}

/// One DML attempt derived from a captured event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRecord {
    pub apply_id: Option<i64>,
    pub event_id: Option<i64>,
    pub table: String,
    pub action: Action,
    /// Statement as stored in the log (rendered text or serialized form).
    pub statement: Option<Vec<u8>>,
    pub executed: bool,
}

/// Translation of a source-assigned identifier to the target-assigned one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMapping {
    pub mapping_id: Option<i64>,
    pub domain: String,
    pub source_id: i64,
    pub target_id: i64,
}
