// ABOUTME: Work queue handing captured events from the capture engine to the apply engine
// ABOUTME: Backed by the SQLite persist-queue so items survive restarts of either side

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use persist_queue::PersistQueue;

use crate::model::CapturedEvent;

/// Durable FIFO of captured events. `dequeue` waits while the queue is empty
/// and removes the item it returns.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, event: &CapturedEvent) -> Result<()>;

    async fn dequeue(&self) -> Result<CapturedEvent>;

    async fn size(&self) -> Result<u64>;
}

pub struct SqliteWorkQueue {
    inner: Arc<Mutex<PersistQueue>>,
    poll_interval: Duration,
}

impl SqliteWorkQueue {
    pub fn open(path: &Path, poll_interval: Duration) -> Result<Self> {
        let queue = PersistQueue::open(path)?;
        tracing::info!(path = %path.display(), "work queue opened");
        Ok(Self {
            inner: Arc::new(Mutex::new(queue)),
            poll_interval,
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PersistQueue) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut queue = inner
                .lock()
                .map_err(|_| anyhow!("work queue lock poisoned"))?;
            op(&mut *queue)
        })
        .await
        .context("work queue task panicked")?
    }
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    async fn enqueue(&self, event: &CapturedEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("failed to encode captured event")?;
        let item_id = self.blocking(move |queue| queue.push(&payload)).await?;
        tracing::debug!(item_id, event_id = ?event.event_id, "event enqueued");
        Ok(())
    }

    async fn dequeue(&self) -> Result<CapturedEvent> {
        loop {
            if let Some(item) = self.blocking(|queue| queue.pop()).await? {
                return serde_json::from_slice(&item.payload).with_context(|| {
                    format!("failed to decode queue item {}", item.item_id)
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn size(&self) -> Result<u64> {
        self.blocking(|queue| queue.len()).await
    }
}

/// Current depth of the queue file at `path`, opened read-only.
pub fn observe_depth(path: &Path) -> Result<u64> {
    PersistQueue::open_read_only(path)?.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, Payload};
    use chrono::Utc;
    use serde_json::json;

    fn event(offset: u64) -> CapturedEvent {
        CapturedEvent {
            event_id: Some(offset as i64),
            captured_at: Utc::now(),
            source_epoch: 0,
            source_file: "mysql-bin.000001".to_string(),
            source_offset: offset,
            row_index: 0,
            source_time: Utc::now(),
            schema: "shop".to_string(),
            table: "example_table".to_string(),
            action: Action::Insert,
            payload: Payload::Row(json!({"id": offset}).as_object().unwrap().clone()),
            applied: false,
        }
    }

    #[tokio::test]
    async fn dequeue_returns_events_in_enqueue_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue =
            SqliteWorkQueue::open(&dir.path().join("queue.db"), Duration::from_millis(10)).unwrap();
        for offset in [100, 200, 300] {
            queue.enqueue(&event(offset)).await.unwrap();
        }
        assert_eq!(queue.size().await.unwrap(), 3);
        for offset in [100, 200, 300] {
            assert_eq!(queue.dequeue().await.unwrap().source_offset, offset);
        }
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dequeue_waits_for_a_producer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let consumer = SqliteWorkQueue::open(&path, Duration::from_millis(10)).unwrap();
        let producer = SqliteWorkQueue::open(&path, Duration::from_millis(10)).unwrap();

        let waiter = tokio::spawn(async move { consumer.dequeue().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        producer.enqueue(&event(42)).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received.source_offset, 42);
    }

    #[tokio::test]
    async fn observer_reports_depth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let queue = SqliteWorkQueue::open(&path, Duration::from_millis(10)).unwrap();
        queue.enqueue(&event(1)).await.unwrap();
        queue.enqueue(&event(2)).await.unwrap();
        assert_eq!(observe_depth(&path).unwrap(), 2);
    }
}
