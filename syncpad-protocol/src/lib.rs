//! Wire protocol shared between the syncpad server and client.
//!
//! Every type here round-trips through the UTF-8 JSON text frames
//! exchanged over the `/ws` socket, and the JSON envelope published on
//! the cross-replica pub/sub bus. Keeping them in one crate means the
//! server and client can never drift on field names or casing.

use serde::{Deserialize, Serialize};

/// A persisted or wire-shared document snapshot: `{text, version}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub text: String,
    pub version: u64,
}

/// The inner, client-originated edit payload. Carried verbatim inside
/// [`Envelope`] and echoed back to clients, enriched with `serverId` and
/// `serverVersion`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub op_id: String,
    pub doc_id: String,
    pub text: String,
    /// The client's belief of the next version; may be omitted.
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

fn ping_kind() -> String {
    "ping".to_string()
}

/// A client `ping` frame: `{"type":"ping","ts":...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingMessage {
    #[serde(rename = "type", default = "ping_kind")]
    pub kind: String,
    pub ts: i64,
}

impl PingMessage {
    pub fn new(ts: i64) -> Self {
        Self {
            kind: ping_kind(),
            ts,
        }
    }
}

fn snapshot_request_kind() -> String {
    "snapshot_request".to_string()
}

/// A client `snapshot_request` frame: `{"type":"snapshot_request"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequestMessage {
    #[serde(rename = "type", default = "snapshot_request_kind")]
    pub kind: String,
    #[serde(default)]
    pub req_id: Option<String>,
}

impl Default for SnapshotRequestMessage {
    fn default() -> Self {
        Self {
            kind: snapshot_request_kind(),
            req_id: None,
        }
    }
}

/// A parsed inbound client message, dispatched on its `type` field
/// (defaulting to `"op"` when the field is absent).
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Edit(EditMessage),
    Ping(PingMessage),
    SnapshotRequest(SnapshotRequestMessage),
    /// Any other `type`. Kept as the original raw text so it can be
    /// rebroadcast verbatim to other local sessions without us
    /// re-deriving a JSON encoding of fields we don't understand.
    Other { kind: String, raw: String },
}

impl ClientMessage {
    /// Parse a UTF-8 JSON text frame into a dispatched client message.
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let kind = value
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("op")
            .to_string();
        Ok(match kind.as_str() {
            "edit" | "op" => ClientMessage::Edit(serde_json::from_value(value)?),
            "ping" => ClientMessage::Ping(serde_json::from_value(value)?),
            "snapshot_request" => ClientMessage::SnapshotRequest(serde_json::from_value(value)?),
            other => ClientMessage::Other {
                kind: other.to_string(),
                raw: raw.to_string(),
            },
        })
    }
}

/// A message sent from the server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// The full current state of a document: sent unconditionally on
    /// attach, and again in reply to `snapshot_request`.
    Snapshot {
        doc_id: String,
        text: String,
        version: u64,
        server_id: String,
    },
    /// An edit: either the echo of the sender's own op, or the fan-out
    /// of another session's or replica's accepted op.
    Op {
        op_id: String,
        doc_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
        server_id: String,
        server_version: u64,
    },
    /// Reply to a client `ping`.
    Pong { server_id: String, timestamp: i64 },
}

impl ServerMessage {
    /// Serialize to the JSON text this type is sent as over the wire.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage always serializes")
    }
}

/// The envelope published on `doc:<docId>:ops` and consumed by every
/// other replica's relay broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub server_id: String,
    pub doc_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub server_version: u64,
    pub payload: EditMessage,
}

impl Envelope {
    pub fn new(
        server_id: impl Into<String>,
        doc_id: impl Into<String>,
        server_version: u64,
        payload: EditMessage,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            doc_id: doc_id.into(),
            kind: "op".to_string(),
            server_version,
            payload,
        }
    }
}

/// The pub/sub channel name for a single document's ops stream.
pub fn ops_channel(doc_id: &str) -> String {
    format!("doc:{doc_id}:ops")
}

/// The pattern every replica subscribes to at process start.
pub const OPS_CHANNEL_PATTERN: &str = "doc:*:ops";

/// The key a document's snapshot is persisted under.
pub fn snapshot_key(doc_id: &str) -> String {
    format!("doc:{doc_id}:snapshot")
}
