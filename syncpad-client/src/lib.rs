//! Client Sync Loop: a native async client for the syncpad relay.
//!
//! Connects, replays its snapshot, debounces local edits, and reconnects
//! with backoff on drop — the same state machine a browser client runs,
//! but scriptable from Rust for smoke-testing a deployed relay and for
//! exercising the convergence properties end to end in tests.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tracing::{info, warn};
use uuid::Uuid;

use syncpad_protocol::{EditMessage, PingMessage, ServerMessage};

/// Events the embedding code (a test, a CLI demo, a future UI) observes
/// without polling internal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    SnapshotLoaded(String),
    BufferChanged(String),
}

enum Command {
    Edit(String),
    Shutdown,
}

/// A handle to a running sync client. Dropping it does not stop the
/// client; call [`SyncClientHandle::shutdown`] explicitly.
#[derive(Clone)]
pub struct SyncClientHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SyncClientHandle {
    /// Record a local edit. Debounced: the actual send happens after the
    /// debounce window elapses with no further edits (§4.7).
    pub fn edit(&self, text: impl Into<String>) {
        let _ = self.tx.send(Command::Edit(text.into()));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

const DEBOUNCE: Duration = Duration::from_millis(300);
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// `min(30s, 500ms * 2^attempt)`, as a pure function so it is
/// unit-testable without a socket.
pub fn backoff_delay(attempt: u32) -> Duration {
    let capped_attempt = attempt.min(6); // 500ms * 2^6 = 32s, already past the 30s cap
    let millis = 500u64.saturating_mul(1u64 << capped_attempt);
    Duration::from_millis(millis.min(30_000))
}

/// Spawn a sync client against `url` for `doc_id`. Runs until
/// [`SyncClientHandle::shutdown`] is called.
pub struct SyncClient;

impl SyncClient {
    pub fn spawn(url: String, doc_id: String) -> (SyncClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(url, doc_id, cmd_rx, event_tx));
        (SyncClientHandle { tx: cmd_tx }, event_rx)
    }
}

struct PendingOp {
    op_id: String,
    text: String,
}

async fn run(
    url: String,
    doc_id: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut attempt = 0u32;
    // Edits accepted while disconnected, or whose server confirmation
    // hasn't arrived yet; replayed in FIFO order once the post-reconnect
    // snapshot is applied (§4.7, P5).
    let mut pending: std::collections::VecDeque<PendingOp> = std::collections::VecDeque::new();
    // Outlive a single connection: an edit still mid-debounce when the
    // socket drops must not be lost, only delayed.
    let mut debounce_deadline: Option<tokio::time::Instant> = None;
    let mut latest_text: Option<String> = None;

    'reconnect: loop {
        let ws_url = format!("{url}?docId={doc_id}");
        let socket = match tokio_tungstenite::connect_async(&ws_url).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                let delay = backoff_delay(attempt);
                warn!(doc_id = %doc_id, error = %e, attempt, delay_ms = %delay.as_millis(), "connect failed, backing off");
                attempt += 1;
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        cmd = commands.recv() => match cmd {
                            Some(Command::Edit(text)) => queue_offline_edit(&mut pending, text),
                            Some(Command::Shutdown) | None => return,
                        },
                    }
                }
                continue 'reconnect;
            }
        };
        attempt = 0;
        info!(doc_id = %doc_id, "connected");
        let _ = events.send(ClientEvent::Connected);

        let (mut sink, mut stream) = socket.split();
        // Explicitly request a snapshot on connect (§4.7 "Connect"), rather
        // than relying solely on the server's unconditional attach push —
        // the reply is what releases `awaiting_replay` below.
        let request = serde_json::to_string(&syncpad_protocol::SnapshotRequestMessage::default())
            .unwrap_or_default();
        let _ = sink.send(Message::Text(request.into())).await;
        // The replay only happens once the post-reconnect snapshot frame
        // arrives, so the client doesn't race the server's own attach
        // snapshot with its own resend.
        let mut awaiting_replay = true;
        let mut last_ping = tokio::time::Instant::now();

        loop {
            let debounce_sleep = match debounce_deadline {
                Some(deadline) => Box::pin(tokio::time::sleep_until(deadline)) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
                None => Box::pin(std::future::pending()),
            };

            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Edit(text)) => {
                            latest_text = Some(text);
                            debounce_deadline = Some(tokio::time::Instant::now() + DEBOUNCE);
                        }
                        Some(Command::Shutdown) | None => {
                            let _ = sink.close().await;
                            return;
                        }
                    }
                }
                _ = debounce_sleep => {
                    debounce_deadline = None;
                    if let Some(text) = latest_text.take() {
                        let op_id = Uuid::new_v4().to_string();
                        pending.push_back(PendingOp { op_id: op_id.clone(), text: text.clone() });
                        send_edit(&mut sink, &doc_id, &text, op_id).await;
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            let was_snapshot = handle_server_message(&text, &mut pending, &events).is_some();
                            if was_snapshot && awaiting_replay {
                                awaiting_replay = false;
                                replay_pending(&mut sink, &doc_id, &pending).await;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(doc_id = %doc_id, error = %e, "socket read error");
                            break;
                        }
                    }
                }
            }

            if last_ping.elapsed() >= PING_INTERVAL {
                let ping = PingMessage::new(now_millis());
                let _ = sink
                    .send(Message::Text(serde_json::to_string(&ping).unwrap_or_default().into()))
                    .await;
                last_ping = tokio::time::Instant::now();
            }
        }

        info!(doc_id = %doc_id, "disconnected");
        let _ = events.send(ClientEvent::Disconnected);

        // An edit that hadn't finished debouncing yet when the socket
        // dropped must still reach `pending` so the post-reconnect replay
        // picks it up; it was never sent, so there's nothing to wait for.
        debounce_deadline = None;
        if let Some(text) = latest_text.take() {
            queue_offline_edit(&mut pending, text);
        }
    }
}

fn queue_offline_edit(pending: &mut std::collections::VecDeque<PendingOp>, text: String) {
    pending.push_back(PendingOp {
        op_id: Uuid::new_v4().to_string(),
        text,
    });
}

async fn replay_pending(
    sink: &mut futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    doc_id: &str,
    pending: &std::collections::VecDeque<PendingOp>,
) {
    for op in pending {
        send_edit(sink, doc_id, &op.text, op.op_id.clone()).await;
    }
}

/// Apply one server frame to local client state. Returns `Some(())` when
/// the frame was a fresh snapshot, so the caller can trigger the
/// pending-ops replay exactly once per reconnect.
fn handle_server_message(
    text: &str,
    pending: &mut std::collections::VecDeque<PendingOp>,
    events: &mpsc::UnboundedSender<ClientEvent>,
) -> Option<()> {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "dropping malformed server frame");
            return None;
        }
    };
    match msg {
        ServerMessage::Snapshot { text, .. } => {
            let _ = events.send(ClientEvent::SnapshotLoaded(text));
            Some(())
        }
        ServerMessage::Op { op_id, text, .. } => {
            pending.retain(|p| p.op_id != op_id);
            let _ = events.send(ClientEvent::BufferChanged(text));
            None
        }
        ServerMessage::Pong { .. } => None,
    }
}

async fn send_edit(
    sink: &mut futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    doc_id: &str,
    text: &str,
    op_id: String,
) {
    let edit = EditMessage {
        op_id,
        doc_id: doc_id.to_string(),
        text: text.to_string(),
        version: None,
        sequence: None,
        timestamp: Some(now_millis()),
    };
    let text = serde_json::to_string(&edit).unwrap_or_default();
    let _ = sink.send(Message::Text(text.into())).await;
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
