//! Snapshot Store Client: a thin wrapper over the external key-value
//! store used for snapshot persistence (`doc:<docId>:snapshot`).

use async_trait::async_trait;
use dashmap::DashMap;
use syncpad_protocol::{SnapshotRecord, snapshot_key};
use tracing::warn;

/// Port for reading and writing a document's persisted snapshot.
///
/// Kept as a trait (rather than a concrete Redis type threaded
/// everywhere) so the test suite can run against an in-memory double
/// without a live store.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, doc_id: &str) -> anyhow::Result<Option<SnapshotRecord>>;
    async fn save(&self, doc_id: &str, snapshot: &SnapshotRecord) -> anyhow::Result<()>;
}

/// Redis-backed snapshot store: `GET`/`SET` of `doc:<docId>:snapshot`
/// holding the JSON form of [`SnapshotRecord`].
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SnapshotStore for RedisStore {
    async fn load(&self, doc_id: &str) -> anyhow::Result<Option<SnapshotRecord>> {
        use redis::AsyncCommands;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(snapshot_key(doc_id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, doc_id: &str, snapshot: &SnapshotRecord) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw = serde_json::to_string(snapshot)?;
        let _: () = conn.set(snapshot_key(doc_id), raw).await?;
        Ok(())
    }
}

/// In-memory test double for [`SnapshotStore`]. Lets the integration
/// tests exercise cold-load reseeding (§8 P6, scenario 5) and
/// write-failure degradation without a live Redis.
#[derive(Default)]
pub struct InMemoryStore {
    data: DashMap<String, SnapshotRecord>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a snapshot as if a prior replica had already persisted it.
    pub fn seed(&self, doc_id: impl Into<String>, snapshot: SnapshotRecord) {
        self.data.insert(doc_id.into(), snapshot);
    }
}

#[async_trait]
impl SnapshotStore for InMemoryStore {
    async fn load(&self, doc_id: &str) -> anyhow::Result<Option<SnapshotRecord>> {
        Ok(self.data.get(doc_id).map(|r| r.clone()))
    }

    async fn save(&self, doc_id: &str, snapshot: &SnapshotRecord) -> anyhow::Result<()> {
        self.data.insert(doc_id.to_string(), snapshot.clone());
        Ok(())
    }
}

/// Load a snapshot, degrading to `("", 0)` with a warning on store
/// failure (§4.1, §4.8: "correctness preserved because the next edit
/// re-persists").
pub async fn load_or_default(store: &dyn SnapshotStore, doc_id: &str) -> SnapshotRecord {
    match store.load(doc_id).await {
        Ok(Some(record)) => record,
        Ok(None) => SnapshotRecord::default(),
        Err(e) => {
            warn!(doc_id, error = %e, "snapshot store read failed, seeding empty document");
            SnapshotRecord::default()
        }
    }
}
