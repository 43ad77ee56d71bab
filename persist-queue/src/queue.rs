use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    item_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    payload       BLOB NOT NULL,
    enqueued_at   TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One queued record as handed back by [`PersistQueue::pop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub item_id: i64,
    pub payload: Vec<u8>,
}

/// FIFO of opaque byte records stored in a single SQLite file.
///
/// Producers and consumers may live in different processes; each opens its own
/// handle on the same path. Items are removed by `pop` with no separate
/// acknowledgement, so an item is delivered as soon as `pop` returns it.
pub struct PersistQueue {
    path: PathBuf,
    conn: Connection,
}

impl PersistQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create queue directory {}", parent.display())
                })?;
                #[cfg(unix)]
                set_owner_perms(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open queue database {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to set queue busy timeout")?;
        conn.pragma_update(None, "journal_mode", &"wal")
            .context("failed to enable WAL for persist queue")?;
        conn.pragma_update(None, "synchronous", &"normal").ok();
        conn.execute_batch(SCHEMA)
            .context("failed to initialize queue schema")?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    /// Open an existing queue without write access, for observers that only
    /// report depth.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open queue database {} read-only", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to set queue busy timeout")?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    pub fn push(&self, payload: &[u8]) -> Result<i64> {
        self.conn
            .execute("INSERT INTO items(payload) VALUES (?1)", params![payload])
            .context("failed to push queue item")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Remove and return the oldest item, or `None` when the queue is empty.
    ///
    /// The select and delete run in one IMMEDIATE transaction so two consumers
    /// never receive the same item.
    pub fn pop(&mut self) -> Result<Option<QueueItem>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin queue transaction")?;
        let item = tx
            .query_row(
                "SELECT item_id, payload FROM items ORDER BY item_id ASC LIMIT 1",
                [],
                |row| {
                    Ok(QueueItem {
                        item_id: row.get(0)?,
                        payload: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("failed to read queue head")?;
        if let Some(item) = &item {
            tx.execute("DELETE FROM items WHERE item_id = ?1", [item.item_id])
                .context("failed to remove queue head")?;
        }
        tx.commit().context("failed to commit queue pop")?;
        Ok(item)
    }

    pub fn len(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .context("failed to count queue items")?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn set_owner_perms(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pop_on_empty_queue_returns_none() {
        let dir = tempdir().unwrap();
        let mut queue = PersistQueue::open(dir.path().join("q.db")).unwrap();
        assert!(queue.pop().unwrap().is_none());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn creates_missing_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deeper/q.db");
        let queue = PersistQueue::open(&path).unwrap();
        assert_eq!(queue.path(), path.as_path());
        assert!(path.exists());
    }
}
