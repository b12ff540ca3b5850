//! Document Room: authoritative per-replica state and local fanout for
//! one document (§4.1).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use syncpad_protocol::{Envelope, ServerMessage, SnapshotRecord};

use crate::persist::PersistPool;
use crate::replica::ReplicaId;
use crate::store::{SnapshotStore, load_or_default};

/// Something a room can hand to a session's writer task: either a typed
/// server message, or a raw frame forwarded verbatim (P4 opaque
/// rebroadcast).
#[derive(Clone, Debug)]
pub enum Outbound {
    Typed(ServerMessage),
    Raw(String),
}

impl Outbound {
    pub fn into_text(self) -> String {
        match self {
            Outbound::Typed(msg) => msg.to_json(),
            Outbound::Raw(raw) => raw,
        }
    }
}

/// Locally-attached session, as seen from the room: an outbound channel
/// plus enough identity to exclude it from a "fan out to others" send.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: u64,
    sender: tokio::sync::mpsc::UnboundedSender<Outbound>,
}

impl SessionHandle {
    pub fn new(id: u64, sender: tokio::sync::mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, sender }
    }

    /// Best-effort send; a closed channel means the session is already
    /// tearing down, which the session handler's own read loop will
    /// observe and use to detach.
    fn send(&self, msg: ServerMessage) {
        let _ = self.sender.send(Outbound::Typed(msg));
    }

    fn send_raw(&self, raw: String) {
        let _ = self.sender.send(Outbound::Raw(raw));
    }
}

struct RoomState {
    text: String,
    version: u64,
}

/// Per-document in-memory state: current text, current version, and the
/// set of locally-attached live sessions.
pub struct Room {
    doc_id: String,
    state: Mutex<RoomState>,
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    replica_id: ReplicaId,
    next_session_id: AtomicU64,
    pub last_accessed: std::sync::Mutex<Instant>,
}

impl Room {
    fn new(doc_id: String, snapshot: SnapshotRecord, replica_id: ReplicaId) -> Self {
        Self {
            doc_id,
            state: Mutex::new(RoomState {
                text: snapshot.text,
                version: snapshot.version,
            }),
            sessions: Mutex::new(HashMap::new()),
            replica_id,
            next_session_id: AtomicU64::new(0),
            last_accessed: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn touch(&self) {
        *self.last_accessed.lock().unwrap() = Instant::now();
    }

    /// Current `(text, version)`, used by the snapshot frame and the
    /// out-of-band read API.
    pub async fn snapshot(&self) -> SnapshotRecord {
        let state = self.state.lock().await;
        SnapshotRecord {
            text: state.text.clone(),
            version: state.version,
        }
    }

    /// Add a session to the room and immediately push it a `snapshot`
    /// frame (§4.1 Attach).
    pub async fn attach(&self, handle: SessionHandle) {
        let snapshot = self.snapshot().await;
        self.sessions.lock().await.insert(handle.id, handle.clone());
        handle.send(ServerMessage::Snapshot {
            doc_id: self.doc_id.clone(),
            text: snapshot.text,
            version: snapshot.version,
            server_id: self.replica_id.to_string(),
        });
    }

    /// Remove a session from the room (§4.1 Detach).
    pub async fn detach(&self, session_id: u64) {
        self.sessions.lock().await.remove(&session_id);
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Send a `snapshot` frame to one specific session, for
    /// `snapshot_request` (§4.2, §9 Open Question: explicit reply
    /// required).
    pub async fn send_snapshot_to(&self, session_id: u64) {
        let snapshot = self.snapshot().await;
        let sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(&session_id) {
            handle.send(ServerMessage::Snapshot {
                doc_id: self.doc_id.clone(),
                text: snapshot.text,
                version: snapshot.version,
                server_id: self.replica_id.to_string(),
            });
        }
    }

    pub async fn send_to(&self, session_id: u64, msg: ServerMessage) {
        let sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(&session_id) {
            handle.send(msg);
        }
    }

    /// Fan out `msg` to every attached session, optionally skipping one.
    /// Copies the session set under the room lock, then sends outside of
    /// it — the room lock is never held across a socket write (§5, §9
    /// Design Notes).
    pub async fn fan_out(&self, msg: ServerMessage, skip: Option<u64>) {
        let targets: Vec<SessionHandle> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .filter(|h| Some(h.id) != skip)
                .cloned()
                .collect()
        };
        for handle in targets {
            handle.send(msg.clone());
        }
    }

    /// Fan out a raw, unrecognized message verbatim (P4: opaque
    /// rebroadcast). Delivered to every other local session and no one
    /// else — never echoed back to the sender.
    pub async fn fan_out_raw(&self, raw: &str, sender: u64) {
        let targets: Vec<SessionHandle> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .filter(|h| h.id != sender)
                .cloned()
                .collect()
        };
        for handle in targets {
            handle.send_raw(raw.to_string());
        }
    }

    /// Apply a local edit: last-write-wins version bump (§4.1
    /// Apply-local). Returns the assigned version.
    pub async fn apply_local(&self, text: String, incoming_version: Option<i64>) -> u64 {
        let mut state = self.state.lock().await;
        let incoming = incoming_version.unwrap_or(-1);
        let new_version = (state.version as i64 + 1).max(incoming + 1) as u64;
        state.text = text;
        state.version = new_version;
        new_version
    }

    /// Apply a remote envelope if its version is strictly newer than our
    /// current one; stale remotes are silently dropped (§4.1, §4.8, P6).
    /// Returns `Some(snapshot)` on acceptance, for the caller to persist
    /// and fan out.
    pub async fn apply_remote_state(&self, envelope: &Envelope) -> Option<SnapshotRecord> {
        let mut state = self.state.lock().await;
        if envelope.server_version <= state.version {
            warn!(
                doc_id = %self.doc_id,
                current_version = state.version,
                remote_version = envelope.server_version,
                "stale remote update dropped"
            );
            return None;
        }
        state.text = envelope.payload.text.clone();
        state.version = envelope.server_version;
        Some(SnapshotRecord {
            text: state.text.clone(),
            version: state.version,
        })
    }

    pub async fn apply_remote(self: &Arc<Self>, envelope: Envelope) {
        if let Some(snapshot) = self.apply_remote_state(&envelope).await {
            info!(doc_id = %self.doc_id, version = snapshot.version, "applied remote update");
            self.fan_out(
                ServerMessage::Op {
                    op_id: envelope.payload.op_id.clone(),
                    doc_id: self.doc_id.clone(),
                    text: envelope.payload.text.clone(),
                    sequence: envelope.payload.sequence,
                    timestamp: envelope.payload.timestamp,
                    server_id: envelope.server_id.clone(),
                    server_version: envelope.server_version,
                },
                None,
            )
            .await;
        }
    }
}

/// The docId -> Room registry, a single concurrent map owned by the
/// server.
pub struct Registry {
    rooms: DashMap<String, Arc<Room>>,
    store: Arc<dyn SnapshotStore>,
    persist: Arc<PersistPool>,
    replica_id: ReplicaId,
}

impl Registry {
    pub fn new(store: Arc<dyn SnapshotStore>, persist: Arc<PersistPool>, replica_id: ReplicaId) -> Self {
        Self {
            rooms: DashMap::new(),
            store,
            persist,
            replica_id,
        }
    }

    /// Get the resident room for `doc_id` without loading from the
    /// store. Used by the relay broker, which only needs to update rooms
    /// already resident on this replica (§4.4).
    pub fn get_resident(&self, doc_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(doc_id).map(|r| r.clone())
    }

    /// Atomic get-or-load (§4.1, §9 Design Notes "single-flight"): two
    /// concurrent first-accessors for the same `doc_id` must agree on one
    /// `Room` instance. `DashMap::entry` gives us this for free — the
    /// shard lock is held across the snapshot-store read in the vacant
    /// branch, exactly as the teacher's `socket_handler` does for its
    /// document map, so a second accessor simply blocks on the same
    /// shard until the first has finished constructing the room.
    pub async fn get_or_load(&self, doc_id: &str) -> Arc<Room> {
        match self.rooms.entry(doc_id.to_string()) {
            Entry::Occupied(e) => {
                let room = e.get().clone();
                room.touch();
                room
            }
            Entry::Vacant(e) => {
                let snapshot = load_or_default(self.store.as_ref(), doc_id).await;
                let room = Arc::new(Room::new(doc_id.to_string(), snapshot, self.replica_id.clone()));
                e.insert(room.clone());
                room
            }
        }
    }

    pub fn persist_pool(&self) -> &PersistPool {
        &self.persist
    }

    pub fn store(&self) -> &dyn SnapshotStore {
        self.store.as_ref()
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Evict resident rooms with no attached sessions whose
    /// `last_accessed` exceeds `idle_for`. Eviction has no correctness
    /// cost: the next attach reloads from the snapshot store (§4.1).
    pub async fn evict_idle(&self, idle_for: std::time::Duration) {
        let mut candidates = Vec::new();
        for entry in self.rooms.iter() {
            let idle = entry.value().last_accessed.lock().unwrap().elapsed() > idle_for;
            if idle && entry.value().is_empty().await {
                candidates.push(entry.key().clone());
            }
        }
        for doc_id in candidates {
            info!(doc_id, "evicting idle document room");
            self.rooms.remove(&doc_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn replica() -> ReplicaId {
        ReplicaId::new("R1")
    }

    #[tokio::test]
    async fn apply_local_bumps_version_monotonically() {
        let room = Room::new(
            "d1".into(),
            SnapshotRecord::default(),
            replica(),
        );
        let v1 = room.apply_local("a".into(), None).await;
        assert_eq!(v1, 1);
        let v2 = room.apply_local("ab".into(), None).await;
        assert_eq!(v2, 2);
        assert_eq!(room.snapshot().await.text, "ab");
    }

    #[tokio::test]
    async fn apply_local_respects_client_claimed_version() {
        let room = Room::new("d1".into(), SnapshotRecord::default(), replica());
        // Client claims it's sending version 5 though we're at 0: never
        // silently drop an accepted client edit (§9 Design Notes).
        let v = room.apply_local("x".into(), Some(5)).await;
        assert_eq!(v, 6);
    }

    #[tokio::test]
    async fn apply_remote_accepts_strictly_newer_version() {
        let room = Arc::new(Room::new(
            "d1".into(),
            SnapshotRecord {
                text: "old".into(),
                version: 1,
            },
            replica(),
        ));
        let envelope = Envelope::new(
            "R2",
            "d1",
            2,
            syncpad_protocol::EditMessage {
                op_id: "o1".into(),
                doc_id: "d1".into(),
                text: "new".into(),
                version: None,
                sequence: None,
                timestamp: None,
            },
        );
        room.apply_remote(envelope).await;
        let snap = room.snapshot().await;
        assert_eq!(snap.text, "new");
        assert_eq!(snap.version, 2);
    }

    #[tokio::test]
    async fn apply_remote_drops_stale_version() {
        let room = Arc::new(Room::new(
            "d1".into(),
            SnapshotRecord {
                text: "final".into(),
                version: 7,
            },
            replica(),
        ));
        let envelope = Envelope::new(
            "R2",
            "d1",
            5,
            syncpad_protocol::EditMessage {
                op_id: "o1".into(),
                doc_id: "d1".into(),
                text: "older".into(),
                version: None,
                sequence: None,
                timestamp: None,
            },
        );
        room.apply_remote(envelope).await;
        let snap = room.snapshot().await;
        assert_eq!(snap.text, "final");
        assert_eq!(snap.version, 7);
    }

    #[tokio::test]
    async fn registry_get_or_load_seeds_from_store() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(
            "d1",
            SnapshotRecord {
                text: "restored".into(),
                version: 42,
            },
        );
        let pool = Arc::new(PersistPool::new(store.clone()));
        let registry = Registry::new(store, pool, replica());
        let room = registry.get_or_load("d1").await;
        let snap = room.snapshot().await;
        assert_eq!(snap.text, "restored");
        assert_eq!(snap.version, 42);
    }

    #[tokio::test]
    async fn registry_get_or_load_is_single_flight() {
        let store = Arc::new(InMemoryStore::new());
        let pool = Arc::new(PersistPool::new(store.clone()));
        let registry = Arc::new(Registry::new(store, pool, replica()));
        let r1 = registry.get_or_load("d1").await;
        let r2 = registry.get_or_load("d1").await;
        assert!(Arc::ptr_eq(&r1, &r2));
    }
}
