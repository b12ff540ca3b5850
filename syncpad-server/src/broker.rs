//! Relay Broker: bridges local rooms with the external pub/sub bus.
//!
//! Publishes locally-accepted edits on `doc:<docId>:ops`; subscribes once,
//! at process start, to the pattern `doc:*:ops`; filters out this
//! replica's own publishes (self-echo suppression, P3); and hands
//! everything else to the room registry's `apply_remote`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, warn};

use syncpad_protocol::{Envelope, OPS_CHANNEL_PATTERN, ops_channel};

use crate::replica::ReplicaId;
use crate::room::Registry;

/// Port over the cross-replica pub/sub bus.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, doc_id: &str, payload: Vec<u8>) -> anyhow::Result<()>;

    /// Start a single subscription to every document's ops channel and
    /// return a stream of `(channel, payload)` pairs. Called once, at
    /// process start.
    fn subscribe(self: Arc<Self>) -> UnboundedReceiverStream<(String, Vec<u8>)>;
}

/// Redis pub/sub implementation: `PUBLISH` on `doc:<docId>:ops`,
/// `PSUBSCRIBE doc:*:ops`.
pub struct RedisBus {
    client: redis::Client,
}

impl RedisBus {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, doc_id: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.publish(ops_channel(doc_id), payload).await?;
        Ok(())
    }

    fn subscribe(self: Arc<Self>) -> UnboundedReceiverStream<(String, Vec<u8>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                match client.get_async_connection().await {
                    Ok(conn) => {
                        let mut pubsub = conn.into_pubsub();
                        if let Err(e) = pubsub.psubscribe(OPS_CHANNEL_PATTERN).await {
                            error!(error = %e, "redis psubscribe failed, retrying");
                            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                            continue;
                        }
                        let mut stream = pubsub.on_message();
                        while let Some(msg) = stream.next().await {
                            let channel = msg.get_channel_name().to_string();
                            let payload: Vec<u8> = match msg.get_payload() {
                                Ok(p) => p,
                                Err(e) => {
                                    warn!(error = %e, "failed to read pub/sub payload, dropping");
                                    continue;
                                }
                            };
                            if tx.send((channel, payload)).is_err() {
                                return;
                            }
                        }
                        warn!("redis pub/sub stream ended, reconnecting");
                    }
                    Err(e) => {
                        error!(error = %e, "redis connection for subscriber failed, retrying");
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        });
        UnboundedReceiverStream::new(rx)
    }
}

/// `tokio::broadcast`-backed test double. Clone it to simulate multiple
/// replicas sharing one bus within a single test process.
#[derive(Clone)]
pub struct InMemoryBus {
    tx: broadcast::Sender<(String, Vec<u8>)>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, doc_id: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        // No subscribers is not an error: the bus tolerates nobody listening yet.
        let _ = self.tx.send((ops_channel(doc_id), payload));
        Ok(())
    }

    fn subscribe(self: Arc<Self>) -> UnboundedReceiverStream<(String, Vec<u8>)> {
        let mut rx = self.tx.subscribe();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(item) => {
                        if out_tx.send(item).is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "in-memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        UnboundedReceiverStream::new(out_rx)
    }
}

/// Drives one replica's side of the bridge: publishing local ops and
/// applying remote ones.
pub struct RelayBroker {
    bus: Arc<dyn Bus>,
    replica_id: ReplicaId,
}

impl RelayBroker {
    pub fn new(bus: Arc<dyn Bus>, replica_id: ReplicaId) -> Self {
        Self { bus, replica_id }
    }

    /// Publish a locally-accepted edit. Failure is logged, never fatal:
    /// the local fanout already happened and the snapshot is still being
    /// persisted (§4.4, §4.8).
    pub async fn publish(&self, envelope: &Envelope) {
        let payload = match serde_json::to_vec(envelope) {
            Ok(p) => p,
            Err(e) => {
                error!(doc_id = %envelope.doc_id, error = %e, "failed to encode envelope");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&envelope.doc_id, payload).await {
            warn!(doc_id = %envelope.doc_id, error = %e, "pub/sub publish failed");
        }
    }

    /// Spawn the single process-lifetime subscription and apply every
    /// non-self-originated, non-stale envelope to the local registry.
    pub fn run(self: Arc<Self>, registry: Arc<Registry>) {
        let mut incoming = self.bus.clone().subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            while let Some((channel, payload)) = incoming.next().await {
                let envelope: Envelope = match serde_json::from_slice(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "failed to parse envelope, dropping");
                        continue;
                    }
                };
                if envelope.server_id == this.replica_id.as_str() {
                    continue; // P3: never apply our own publish.
                }
                let doc_id = doc_id_from_channel(&channel).unwrap_or(&envelope.doc_id);
                let registry = registry.clone();
                let doc_id = doc_id.to_string();
                tokio::spawn(async move {
                    let room = registry.get_resident(&doc_id);
                    if let Some(room) = room {
                        room.apply_remote(envelope).await;
                    }
                    // A document with no resident room on this replica has no
                    // local sessions to fan out to; there is nothing to apply.
                });
            }
        });
    }
}

fn doc_id_from_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix("doc:")?.strip_suffix(":ops")
}
