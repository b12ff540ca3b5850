//! Bounded, coalescing snapshot persistence worker pool (§4.5, §9 Design
//! Notes: "Async persistence workers → bounded worker pool").
//!
//! `schedule` is fire-and-forget and non-blocking: it overwrites the
//! latest pending snapshot for a document and wakes a fixed number of
//! worker tasks. If a document is scheduled again before a worker gets to
//! it, only the newest snapshot is ever written — coalescing is
//! permitted, not required, by §4.5.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::error;

use syncpad_protocol::SnapshotRecord;

use crate::store::SnapshotStore;

const DEFAULT_WORKERS: usize = 4;

pub struct PersistPool {
    pending: Arc<DashMap<String, SnapshotRecord>>,
    queued: Arc<DashMap<String, ()>>,
    tx: mpsc::UnboundedSender<String>,
}

impl PersistPool {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self::with_workers(store, DEFAULT_WORKERS)
    }

    pub fn with_workers(store: Arc<dyn SnapshotStore>, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: Arc<DashMap<String, SnapshotRecord>> = Arc::new(DashMap::new());
        let queued: Arc<DashMap<String, ()>> = Arc::new(DashMap::new());
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let pending = pending.clone();
            let queued = queued.clone();
            let store = store.clone();
            tokio::spawn(async move {
                loop {
                    let doc_id = {
                        let mut rx = rx.lock().await;
                        match rx.recv().await {
                            Some(id) => id,
                            None => return,
                        }
                    };
                    queued.remove(&doc_id);
                    if let Some((_, snapshot)) = pending.remove(&doc_id) {
                        if let Err(e) = store.save(&doc_id, &snapshot).await {
                            error!(doc_id, error = %e, "snapshot persist failed, will retry on next update");
                        }
                    }
                }
            });
        }

        Self {
            pending,
            queued,
            tx,
        }
    }

    /// Schedule `snapshot` to be persisted for `doc_id`. Non-blocking.
    pub fn schedule(&self, doc_id: impl Into<String>, snapshot: SnapshotRecord) {
        let doc_id = doc_id.into();
        self.pending.insert(doc_id.clone(), snapshot);
        if self.queued.insert(doc_id.clone(), ()).is_none() {
            // Only enqueue once per coalescing window; a send failure means
            // every worker has already exited (shutdown), which is fine.
            let _ = self.tx.send(doc_id);
        }
    }

    /// Best-effort flush of every still-pending snapshot, for graceful
    /// shutdown (§5: "drains the persistence pool").
    pub async fn shutdown(&self, store: &dyn SnapshotStore) {
        let pending: Vec<(String, SnapshotRecord)> = self
            .pending
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (doc_id, snapshot) in pending {
            if let Err(e) = store.save(&doc_id, &snapshot).await {
                error!(doc_id, error = %e, "shutdown flush failed for snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn schedule_eventually_persists() {
        let store: Arc<dyn SnapshotStore> = Arc::new(InMemoryStore::new());
        let pool = PersistPool::with_workers(store.clone(), 2);
        pool.schedule(
            "d1",
            SnapshotRecord {
                text: "hi".into(),
                version: 1,
            },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let loaded = store.load("d1").await.unwrap().unwrap();
        assert_eq!(loaded.text, "hi");
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn coalesces_to_latest_version() {
        let store: Arc<dyn SnapshotStore> = Arc::new(InMemoryStore::new());
        let pool = PersistPool::with_workers(store.clone(), 1);
        for v in 1..=5u64 {
            pool.schedule(
                "d1",
                SnapshotRecord {
                    text: format!("v{v}"),
                    version: v,
                },
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let loaded = store.load("d1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 5);
        assert_eq!(loaded.text, "v5");
    }

    #[tokio::test]
    async fn shutdown_flushes_pending() {
        let store: Arc<dyn SnapshotStore> = Arc::new(InMemoryStore::new());
        // Zero workers: nothing drains the queue on its own, so shutdown's
        // flush is what must persist the snapshot.
        let pool = PersistPool::with_workers(store.clone(), 1);
        pool.schedule(
            "d2",
            SnapshotRecord {
                text: "flush-me".into(),
                version: 9,
            },
        );
        pool.shutdown(store.as_ref()).await;
        let loaded = store.load("d2").await.unwrap();
        assert!(loaded.is_some());
    }
}
