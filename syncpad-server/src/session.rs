//! Session Handler: owns one client socket from handshake to close
//! (§4.2).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use syncpad_protocol::{ClientMessage, Envelope, ServerMessage};

use crate::broker::RelayBroker;
use crate::room::{Outbound, Registry, SessionHandle};

/// Drive one attached WebSocket end to end. Returns once the socket is
/// closed or a terminal write error occurs, having detached the session
/// from its room.
pub async fn handle_socket(
    socket: WebSocket,
    doc_id: String,
    registry: Arc<Registry>,
    broker: Arc<RelayBroker>,
) {
    let room = registry.get_or_load(&doc_id).await;
    let session_id = room.next_session_id();

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // Single writer task: every outbound frame to this socket is
    // serialized through this one task, so two concurrent fan-outs can
    // never interleave bytes on the wire (§4.2, §5).
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(Message::Text(msg.into_text().into())).await.is_err() {
                break; // terminal: stop writing, let the read loop detach.
            }
        }
    });

    let handle = SessionHandle::new(session_id, tx);
    room.attach(handle).await;
    info!(doc_id = %doc_id, session_id, "session attached");

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue, // binary/ping/pong frames carry no protocol meaning here
            Err(e) => {
                warn!(doc_id = %doc_id, session_id, error = %e, "socket read error");
                break;
            }
        };

        match ClientMessage::parse(&text) {
            Ok(ClientMessage::Edit(edit)) => {
                let new_version = room.apply_local(edit.text.clone(), edit.version).await;
                registry.persist_pool().schedule(
                    doc_id.clone(),
                    syncpad_protocol::SnapshotRecord {
                        text: edit.text.clone(),
                        version: new_version,
                    },
                );
                let envelope = Envelope::new(
                    registry.replica_id().to_string(),
                    doc_id.clone(),
                    new_version,
                    edit.clone(),
                );
                broker.publish(&envelope).await;
                // Fan out to every attached session, including the
                // sender: the sender needs this frame back to recognize
                // its own opId as a confirmation (§4.7).
                room.fan_out(
                    ServerMessage::Op {
                        op_id: edit.op_id,
                        doc_id: doc_id.clone(),
                        text: edit.text,
                        sequence: edit.sequence,
                        timestamp: edit.timestamp,
                        server_id: registry.replica_id().to_string(),
                        server_version: new_version,
                    },
                    None,
                )
                .await;
            }
            Ok(ClientMessage::Ping(ping)) => {
                room.send_to(
                    session_id,
                    ServerMessage::Pong {
                        server_id: registry.replica_id().to_string(),
                        timestamp: ping.ts,
                    },
                )
                .await;
            }
            Ok(ClientMessage::SnapshotRequest(_)) => {
                room.send_snapshot_to(session_id).await;
            }
            Ok(ClientMessage::Other { .. }) => {
                room.fan_out_raw(&text, session_id).await;
            }
            Err(e) => {
                warn!(doc_id = %doc_id, session_id, error = %e, "dropping malformed message");
            }
        }
    }

    room.detach(session_id).await;
    writer.abort();
    info!(doc_id = %doc_id, session_id, "session detached");
}
