//! Server backend for the syncpad collaborative document edit relay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tracing::{info, warn};

pub mod broker;
pub mod error;
pub mod identifier;
pub mod persist;
pub mod replica;
pub mod room;
pub mod session;
pub mod store;

pub use broker::{Bus, InMemoryBus, RedisBus, RelayBroker};
pub use error::AppError;
pub use identifier::DocId;
pub use persist::PersistPool;
pub use replica::ReplicaId;
pub use room::Registry;
pub use store::{InMemoryStore, RedisStore, SnapshotStore};

/// Server configuration, parsed from environment variables / CLI flags.
#[derive(Clone)]
pub struct ServerConfig {
    pub replica_id: ReplicaId,
    pub idle_eviction: Duration,
}

impl ServerConfig {
    pub fn from_env(idle_minutes: u64) -> Self {
        Self {
            replica_id: ReplicaId::from_env(),
            idle_eviction: Duration::from_secs(idle_minutes * 60),
        }
    }
}

/// The shared state of the server, accessible from within request
/// handlers.
#[derive(Clone)]
pub struct ServerState {
    pub registry: Arc<Registry>,
    pub broker: Arc<RelayBroker>,
}

impl ServerState {
    pub fn new(store: Arc<dyn SnapshotStore>, bus: Arc<dyn Bus>, replica_id: ReplicaId) -> Self {
        let persist = Arc::new(PersistPool::new(store.clone()));
        let registry = Arc::new(Registry::new(store, persist, replica_id.clone()));
        let broker = Arc::new(RelayBroker::new(bus, replica_id));
        broker.clone().run(registry.clone());
        Self { registry, broker }
    }

    /// Construct a server state with in-memory store/bus test doubles —
    /// no live Redis required.
    pub fn temporary() -> Self {
        Self::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryBus::new()),
            ReplicaId::new("test"),
        )
    }

    /// Construct a server state wired to a shared in-memory bus, for
    /// simulating a second replica within one test process.
    pub fn temporary_with_bus(bus: Arc<InMemoryBus>, replica_id: &str) -> Self {
        Self::new(
            Arc::new(InMemoryStore::new()),
            bus,
            ReplicaId::new(replica_id),
        )
    }

    /// Best-effort shutdown: flush every pending snapshot.
    pub async fn shutdown(&self) {
        self.registry
            .persist_pool()
            .shutdown(self.registry.store())
            .await;
    }

    /// Spawn the idle-room eviction sweep (§4.1).
    pub fn spawn_cleaner(&self, idle_for: Duration) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let sweep_interval = idle_for.max(Duration::from_secs(60));
            loop {
                tokio::time::sleep(sweep_interval).await;
                registry.evict_idle(idle_for).await;
            }
        });
    }
}

/// Build the axum router: the live `/ws` channel and the out-of-band
/// snapshot read API.
pub fn server(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/{doc_id}", get(snapshot_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<ServerState>,
) -> Response {
    let doc_id = match params.get("docId").filter(|s| !s.is_empty()) {
        Some(id) => id.clone(),
        None => {
            warn!("rejecting connection: missing docId");
            return (StatusCode::BAD_REQUEST, "missing docId").into_response();
        }
    };
    if doc_id.parse::<DocId>().is_err() {
        warn!(doc_id, "rejecting connection: invalid docId");
        return (StatusCode::BAD_REQUEST, "invalid docId").into_response();
    }

    info!(doc_id, "socket connection opening");
    ws.on_upgrade(move |socket| async move {
        session::handle_socket(socket, doc_id, state.registry, state.broker).await;
    })
}

async fn snapshot_handler(
    Path(doc_id): Path<String>,
    State(state): State<ServerState>,
) -> Result<Response, AppError> {
    if let Some(room) = state.registry.get_resident(&doc_id) {
        let snapshot = room.snapshot().await;
        return Ok(axum::Json(snapshot).into_response());
    }
    match state.registry.store().load(&doc_id).await? {
        Some(snapshot) => Ok(axum::Json(snapshot).into_response()),
        None => Ok((StatusCode::NOT_FOUND, "document not found").into_response()),
    }
}
