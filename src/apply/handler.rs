// ABOUTME: Per-table apply handlers and the registry that routes events to them
// ABOUTME: Handlers turn a captured event into target DML with translated identifiers

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::dml::{build_delete, build_insert, build_update, Statement};
use crate::error::ApplyError;
use crate::logdb::RelationshipStore;
use crate::mapping::{TableMapping, TableMappings};
use crate::model::{Action, CapturedEvent, Payload, RowImage};

/// Source identity to map to the id the target assigns on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKey {
    pub domain: String,
    pub source_id: i64,
}

/// What a handler decided to do with one event.
#[derive(Debug, Clone, PartialEq)]
pub enum DmlPlan {
    /// The table is not replicated; the event stays unapplied.
    Skip,
    /// Nothing to write on the target; the event counts as applied.
    NoOp,
    Execute {
        statement: Statement,
        identity: Option<IdentityKey>,
    },
}

#[async_trait]
pub trait TableHandler: Send + Sync {
    async fn plan(
        &self,
        event: &CapturedEvent,
        relationships: &dyn RelationshipStore,
    ) -> Result<DmlPlan, ApplyError>;
}

/// Handler for tables that are deliberately not replicated.
pub struct SkipHandler;

#[async_trait]
impl TableHandler for SkipHandler {
    async fn plan(
        &self,
        _event: &CapturedEvent,
        _relationships: &dyn RelationshipStore,
    ) -> Result<DmlPlan, ApplyError> {
        Ok(DmlPlan::Skip)
    }
}

/// Handler driven by a configured column map.
pub struct MappedTableHandler {
    mapping: TableMapping,
}

impl MappedTableHandler {
    pub fn new(mapping: TableMapping) -> Self {
        Self { mapping }
    }

    fn column<'a>(&self, row: &'a RowImage, column: &str) -> Result<&'a Value, ApplyError> {
        row.get(column).ok_or_else(|| ApplyError::MissingColumn {
            table: self.mapping.table.clone(),
            column: column.to_string(),
        })
    }

    fn wrong_payload(&self, action: Action) -> ApplyError {
        ApplyError::UnsupportedPayload {
            table: self.mapping.table.clone(),
            action: action.as_str(),
        }
    }

    /// Translate a foreign-key column value; other columns pass through.
    async fn translate(
        &self,
        source_column: &str,
        value: &Value,
        relationships: &dyn RelationshipStore,
    ) -> Value {
        match self.mapping.foreign_key_domain(source_column) {
            Some(domain) => resolve_value(relationships, domain, value).await,
            None => value.clone(),
        }
    }

    /// Target-side id of the row identified by `row`.
    async fn target_key(
        &self,
        row: &RowImage,
        relationships: &dyn RelationshipStore,
    ) -> Result<Value, ApplyError> {
        let source_key = self.column(row, &self.mapping.primary_key)?;
        Ok(resolve_value(relationships, &self.mapping.identity_domain, source_key).await)
    }

    async fn plan_insert(
        &self,
        row: &RowImage,
        relationships: &dyn RelationshipStore,
    ) -> Result<DmlPlan, ApplyError> {
        let source_key = self.column(row, &self.mapping.primary_key)?;
        let mut columns = Vec::with_capacity(self.mapping.source_columns.len());
        for (source, target) in self.mapping.insert_columns() {
            let value = self.column(row, source)?;
            let value = self.translate(source, value, relationships).await;
            columns.push((target.to_string(), value));
        }
        let identity = source_key.as_i64().map(|source_id| IdentityKey {
            domain: self.mapping.identity_domain.clone(),
            source_id,
        });
        Ok(DmlPlan::Execute {
            statement: build_insert(&self.mapping.target_table, &columns),
            identity,
        })
    }

    async fn plan_update(
        &self,
        before: &RowImage,
        after: &RowImage,
        relationships: &dyn RelationshipStore,
    ) -> Result<DmlPlan, ApplyError> {
        let mut changed: Vec<&String> = after
            .iter()
            .filter(|(column, value)| before.get(*column).is_some_and(|old| old != *value))
            .map(|(column, _)| column)
            .collect();
        changed.sort_by_key(|column| self.mapping.ordinal(column));

        let mut assignments = Vec::with_capacity(changed.len());
        for column in changed {
            if *column == self.mapping.primary_key {
                continue;
            }
            let Some(target) = self.mapping.target_column(column) else {
                continue;
            };
            let value = self.translate(column, &after[column.as_str()], relationships).await;
            assignments.push((target.to_string(), value));
        }
        if assignments.is_empty() {
            return Ok(DmlPlan::NoOp);
        }

        let key = self.target_key(before, relationships).await?;
        Ok(DmlPlan::Execute {
            statement: build_update(
                &self.mapping.target_table,
                &assignments,
                self.mapping.target_primary_key(),
                key,
            ),
            identity: None,
        })
    }

    async fn plan_delete(
        &self,
        row: &RowImage,
        relationships: &dyn RelationshipStore,
    ) -> Result<DmlPlan, ApplyError> {
        let key = self.target_key(row, relationships).await?;
        let statement = match &self.mapping.delete_statement {
            Some(template) => Statement::new(template.clone(), vec![key]),
            None => build_delete(
                &self.mapping.target_table,
                self.mapping.target_primary_key(),
                key,
            ),
        };
        Ok(DmlPlan::Execute {
            statement,
            identity: None,
        })
    }
}

#[async_trait]
impl TableHandler for MappedTableHandler {
    async fn plan(
        &self,
        event: &CapturedEvent,
        relationships: &dyn RelationshipStore,
    ) -> Result<DmlPlan, ApplyError> {
        match (event.action, &event.payload) {
            (Action::Insert, Payload::Row(row)) => self.plan_insert(row, relationships).await,
            (Action::Update, Payload::Change { before, after }) => {
                self.plan_update(before, after, relationships).await
            }
            (Action::Delete, Payload::Row(row)) => self.plan_delete(row, relationships).await,
            (action, _) => Err(self.wrong_payload(action)),
        }
    }
}

/// Integer ids go through the relationship store; anything else is kept.
async fn resolve_value(relationships: &dyn RelationshipStore, domain: &str, value: &Value) -> Value {
    match value.as_i64() {
        Some(source_id) => Value::from(relationships.resolve(domain, source_id).await),
        None => value.clone(),
    }
}

/// Handlers keyed by source table name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TableHandler>>,
}

impl HandlerRegistry {
    /// One handler per configured table: skip tables get a [`SkipHandler`],
    /// the rest a [`MappedTableHandler`].
    pub fn from_mappings(mappings: &TableMappings) -> Self {
        let mut registry = Self::default();
        for mapping in mappings.iter() {
            let handler: Arc<dyn TableHandler> = if mapping.skip {
                Arc::new(SkipHandler)
            } else {
                Arc::new(MappedTableHandler::new(mapping.clone()))
            };
            registry.register(mapping.table.clone(), handler);
        }
        registry
    }

    pub fn register(&mut self, table: impl Into<String>, handler: Arc<dyn TableHandler>) {
        self.handlers.insert(table.into(), handler);
    }

    pub fn get(&self, table: &str) -> Result<Arc<dyn TableHandler>, ApplyError> {
        self.handlers
            .get(table)
            .cloned()
            .ok_or_else(|| ApplyError::HandlerNotFound(table.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
