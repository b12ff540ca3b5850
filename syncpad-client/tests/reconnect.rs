//! End-to-end reconnect test: drives a real [`syncpad_client::SyncClient`]
//! against a real `syncpad-server` router, killing the server mid-session
//! to exercise P5 (reconnect replay equivalence) from the client's side,
//! not just the server's.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use syncpad_client::{ClientEvent, SyncClient};
use syncpad_server::{InMemoryBus, InMemoryStore, ReplicaId, ServerState, server};
use tokio::sync::{mpsc, oneshot};

/// One running server instance, each on its own dedicated OS thread and
/// `Runtime` so that killing it tears down every task it owns — the
/// established websocket connection included — the way a real process
/// restart would, rather than merely stopping new accepts.
struct ServerProcess {
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl ServerProcess {
    fn start(addr: SocketAddr, store: Arc<InMemoryStore>, bus: Arc<InMemoryBus>) -> Self {
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let thread = std::thread::spawn(move || {
            // A runtime of its own: dropping it at the end of this thread
            // tears down every task spawned on it, including the ones
            // `axum::serve` spawns per accepted connection.
            let rt = tokio::runtime::Runtime::new().expect("build server runtime");
            rt.block_on(async move {
                let state = ServerState::new(store, bus, ReplicaId::new("R1"));
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .expect("bind listener");
                let bound = listener.local_addr().expect("local addr");
                let _ = addr_tx.send(bound);
                let router = server(state);
                tokio::select! {
                    _ = axum::serve(listener, router) => {}
                    _ = shutdown_rx => {}
                }
            });
        });

        let addr = addr_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("server reported its bound address");
        Self {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
            addr,
        }
    }

    /// Tear down this server process and everything running on it, and
    /// wait until its port is released before returning.
    async fn kill(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<ClientEvent>, pred: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            panic!("timed out waiting for expected client event");
        }
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(ev)) if pred(&ev) => return ev,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("client event channel closed unexpectedly"),
            Err(_) => panic!("timed out waiting for expected client event"),
        }
    }
}

#[tokio::test]
async fn queued_edits_survive_a_server_restart_and_replay_in_order() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());

    let any_port: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut server1 = ServerProcess::start(any_port, store.clone(), bus.clone());
    let addr = server1.addr;

    let (handle, mut events) =
        SyncClient::spawn(format!("ws://{addr}/ws"), "reconnect-doc".to_string());

    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;
    wait_for(&mut events, |e| matches!(e, ClientEvent::SnapshotLoaded(_))).await;

    handle.edit("first");
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::BufferChanged(t) if t == "first")
    })
    .await;

    // Kill the whole server process: the established connection, the
    // relay broker, everything on that runtime disappears at once.
    server1.kill().await;

    // Queue an edit while genuinely disconnected from any server.
    handle.edit("second");
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Bring a fresh server back up on the exact same port, sharing the
    // same backing store/bus — state that survives a real restart.
    let mut server2 = ServerProcess::start(addr, store.clone(), bus.clone());
    assert_eq!(server2.addr, addr);

    // The client's own reconnect/backoff loop finds it; the pending
    // "second" edit replays once the post-reconnect snapshot lands.
    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::BufferChanged(t) if t == "second")
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let persisted = store
        .load("reconnect-doc")
        .await?
        .expect("snapshot persisted");
    assert_eq!(persisted.text, "second");
    assert_eq!(persisted.version, 2);

    handle.shutdown();
    server2.kill().await;
    Ok(())
}
