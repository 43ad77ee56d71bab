//! Error types for the durable stores, the target database and the apply path.

/// Failure of an event-log or relationship-store operation.
///
/// `RetriesExhausted` means durability could not be confirmed; callers decide
/// whether to continue.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{operation} gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },

    #[error("{operation} rejected by log store: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    #[error("failed to encode stored value: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to decode stored event {event_id}: {reason}")]
    Decode { event_id: i64, reason: String },
}

/// Failure executing DML against the target database.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("target unreachable after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("target rejected statement: {reason}")]
    Rejected { reason: String },
}

/// Failure applying one captured event.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("no handler registered for table `{0}`")]
    HandlerNotFound(String),

    #[error("column `{column}` missing from `{table}` row image")]
    MissingColumn { table: String, column: String },

    #[error("`{table}` {action} event carries the wrong payload shape")]
    UnsupportedPayload { table: String, action: &'static str },

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
