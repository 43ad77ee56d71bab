// ABOUTME: Apply engine - consumes the work queue and replays events against the target
// ABOUTME: Records each attempt in the event log and new identities in the relationship store

pub mod dml;
pub mod handler;
pub mod target;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::ApplyConfig;
use crate::error::ApplyError;
use crate::logdb::{EventLog, RelationshipStore};
use crate::model::{Action, ApplyRecord, CapturedEvent};
use crate::queue::WorkQueue;

pub use handler::{DmlPlan, HandlerRegistry, IdentityKey, MappedTableHandler, SkipHandler, TableHandler};
pub use target::{ExecOutcome, MySqlTarget, TargetDatabase};

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Target DML succeeded and the event was marked applied.
    Applied { apply_id: Option<i64> },
    /// No target change was needed; the event was marked applied.
    NoOp,
    /// The table is configured as skipped.
    Skipped,
    /// The statement ran but did not count as success; the event stays unapplied.
    NotApplied { affected_rows: u64 },
}

/// Pause after a failed dequeue before asking the queue again.
const DEQUEUE_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct ApplyEngine {
    queue: Arc<dyn WorkQueue>,
    events: Arc<dyn EventLog>,
    relationships: Arc<dyn RelationshipStore>,
    target: Arc<dyn TargetDatabase>,
    handlers: HandlerRegistry,
    config: ApplyConfig,
    dequeue_retry_delay: Duration,
}

impl ApplyEngine {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        events: Arc<dyn EventLog>,
        relationships: Arc<dyn RelationshipStore>,
        target: Arc<dyn TargetDatabase>,
        handlers: HandlerRegistry,
        config: ApplyConfig,
    ) -> Self {
        Self {
            queue,
            events,
            relationships,
            target,
            handlers,
            config,
            dequeue_retry_delay: DEQUEUE_RETRY_DELAY,
        }
    }

    pub fn with_dequeue_retry_delay(mut self, delay: Duration) -> Self {
        self.dequeue_retry_delay = delay;
        self
    }

    /// Dequeue and apply events until the process stops. Neither a failed
    /// event nor an unreadable queue item ends the loop.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(handlers = self.handlers.len(), "apply engine started");
        loop {
            let event = match self.queue.dequeue().await {
                Ok(event) => event,
                Err(err) => {
                    tracing::error!(
                        error = %format!("{err:#}"),
                        "failed to dequeue event, retrying in {:?}",
                        self.dequeue_retry_delay
                    );
                    tokio::time::sleep(self.dequeue_retry_delay).await;
                    continue;
                }
            };
            if let Err(err) = self.process_one(&event).await {
                tracing::error!(
                    event_id = ?event.event_id,
                    table = %event.table,
                    action = %event.action,
                    error = %err,
                    "failed to apply event"
                );
            }
        }
    }

    /// Apply one event: plan, record the attempt, execute, then update the
    /// relationship store and applied flags.
    pub async fn process_one(&self, event: &CapturedEvent) -> Result<ApplyOutcome, ApplyError> {
        let handler = self.handlers.get(&event.table)?;
        let (statement, identity) =
            match handler.plan(event, self.relationships.as_ref()).await? {
                DmlPlan::Skip => {
                    tracing::debug!(table = %event.table, event_id = ?event.event_id, "table skipped");
                    return Ok(ApplyOutcome::Skipped);
                }
                DmlPlan::NoOp => {
                    tracing::info!(
                        table = %event.table,
                        event_id = ?event.event_id,
                        "no changed columns, nothing to apply"
                    );
                    self.mark_applied(event).await;
                    return Ok(ApplyOutcome::NoOp);
                }
                DmlPlan::Execute {
                    statement,
                    identity,
                } => (statement, identity),
            };

        let record = ApplyRecord {
            apply_id: None,
            event_id: event.event_id,
            table: event.table.clone(),
            action: event.action,
            statement: Some(statement.audit_bytes(self.config.dml_serialization)),
            executed: false,
        };
        let apply_id = match self.events.record_apply(&record).await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::error!(
                    event_id = ?event.event_id,
                    table = %event.table,
                    error = %err,
                    "apply record not durable, executing anyway"
                );
                None
            }
        };

        tracing::info!(
            event_id = ?event.event_id,
            table = %event.table,
            action = %event.action,
            sql = %statement.render(),
            "executing"
        );
        let outcome = self.target.execute(&statement).await?;

        if !self.succeeded(event.action, &outcome) {
            tracing::warn!(
                event_id = ?event.event_id,
                table = %event.table,
                action = %event.action,
                affected_rows = outcome.affected_rows,
                "statement affected no rows, event left unapplied"
            );
            return Ok(ApplyOutcome::NotApplied {
                affected_rows: outcome.affected_rows,
            });
        }

        if let Some(apply_id) = apply_id {
            if let Err(err) = self.events.mark_apply_executed(apply_id).await {
                tracing::error!(apply_id, error = %err, "failed to mark apply record executed");
            }
        }

        if let (Some(IdentityKey { domain, source_id }), Some(target_id)) =
            (identity, outcome.last_insert_id)
        {
            let target_id = target_id as i64;
            if let Err(err) = self
                .relationships
                .record_mapping(&domain, source_id, target_id)
                .await
            {
                tracing::error!(
                    domain = %domain,
                    source_id,
                    target_id,
                    error = %err,
                    "identity mapping not recorded"
                );
            }
        }

        self.mark_applied(event).await;
        Ok(ApplyOutcome::Applied { apply_id })
    }

    fn succeeded(&self, action: Action, outcome: &ExecOutcome) -> bool {
        match action {
            Action::Insert => outcome.last_insert_id.is_some() || outcome.affected_rows > 0,
            Action::Update | Action::Delete => {
                outcome.affected_rows > 0 || self.config.treat_zero_rows_as_applied
            }
        }
    }

    async fn mark_applied(&self, event: &CapturedEvent) {
        let Some(event_id) = event.event_id else {
            tracing::warn!(
                table = %event.table,
                file = %event.source_file,
                offset = event.source_offset,
                "event has no event id, applied flag not recorded"
            );
            return;
        };
        if let Err(err) = self.events.mark_event_applied(event_id).await {
            tracing::error!(event_id, error = %err, "failed to mark event applied");
        }
    }
}
