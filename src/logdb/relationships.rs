// ABOUTME: Identity relationship store - source-assigned ids to target-assigned ids per key domain
// ABOUTME: Lookups fall back to the source id when no mapping is known

use async_trait::async_trait;
use mysql_async::prelude::Queryable;

use super::LogStore;
use crate::error::StoreError;

/// What `record_mapping` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingOutcome {
    Recorded { mapping_id: i64 },
    /// Source and target ids were equal; nothing was stored.
    Identity,
}

#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// Most recently recorded target id for `(domain, source_id)`.
    async fn lookup(&self, domain: &str, source_id: i64) -> Result<Option<i64>, StoreError>;

    /// Store a mapping unconditionally and return its id.
    async fn insert_mapping(
        &self,
        domain: &str,
        source_id: i64,
        target_id: i64,
    ) -> Result<i64, StoreError>;

    /// Target id to use for `source_id`.
    ///
    /// Unknown ids map to themselves. A failed lookup is logged and also
    /// falls back to the source id.
    async fn resolve(&self, domain: &str, source_id: i64) -> i64 {
        match self.lookup(domain, source_id).await {
            Ok(Some(target_id)) => target_id,
            Ok(None) => source_id,
            Err(err) => {
                tracing::error!(
                    domain,
                    source_id,
                    error = %err,
                    "identity lookup failed, using source id"
                );
                source_id
            }
        }
    }

    /// Record that `source_id` became `target_id`. Identical ids are not stored.
    async fn record_mapping(
        &self,
        domain: &str,
        source_id: i64,
        target_id: i64,
    ) -> Result<MappingOutcome, StoreError> {
        if source_id == target_id {
            return Ok(MappingOutcome::Identity);
        }
        let mapping_id = self.insert_mapping(domain, source_id, target_id).await?;
        tracing::info!(
            domain,
            source_id,
            target_id,
            mapping_id,
            "identity mapping recorded"
        );
        Ok(MappingOutcome::Recorded { mapping_id })
    }
}

#[async_trait]
impl RelationshipStore for LogStore {
    async fn lookup(&self, domain: &str, source_id: i64) -> Result<Option<i64>, StoreError> {
        let pool = &self.pool;
        self.with_retry("identity_lookup", |_| async move {
            let mut conn = pool.get_conn().await?;
            conn.exec_first(
                "SELECT target_id FROM identity_mappings
                 WHERE domain = ? AND source_id = ?
                 ORDER BY mapping_id DESC
                 LIMIT 1",
                (domain, source_id),
            )
            .await
        })
        .await
    }

    async fn insert_mapping(
        &self,
        domain: &str,
        source_id: i64,
        target_id: i64,
    ) -> Result<i64, StoreError> {
        let pool = &self.pool;
        let mapping_id = self
            .with_retry("identity_insert", |_| async move {
                let mut conn = pool.get_conn().await?;
                conn.exec_drop(
                    "INSERT INTO identity_mappings (domain, source_id, target_id) VALUES (?, ?, ?)",
                    (domain, source_id, target_id),
                )
                .await?;
                Ok(conn.last_insert_id())
            })
            .await?;

        mapping_id
            .map(|id| id as i64)
            .ok_or(StoreError::Rejected {
                operation: "identity_insert",
                reason: "server returned no mapping id".to_string(),
            })
    }
}
