use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use syncpad_server::{RedisBus, RedisStore, ServerConfig, ServerState, server};

#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "0.0.0.0:3030")]
    host: SocketAddr,
    /// Redis connection string for the snapshot store and the
    /// cross-replica pub/sub bus (§4.4, §6).
    #[clap(long, default_value = "redis://127.0.0.1:6379")]
    redis_url: String,
    /// Evict a document's in-memory room after this many minutes with no
    /// attached sessions (§4.1).
    #[clap(long, default_value_t = 60)]
    idle_minutes: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = ServerConfig::from_env(args.idle_minutes);

    info!(replica_id = %config.replica_id, redis_url = %args.redis_url, "connecting to redis");
    let store = Arc::new(RedisStore::new(&args.redis_url).expect("connect snapshot store"));
    let bus = Arc::new(RedisBus::new(&args.redis_url).expect("connect pub/sub bus"));
    let state = ServerState::new(store, bus, config.replica_id.clone());
    state.spawn_cleaner(config.idle_eviction);

    info!("starting server on http://{}", args.host);

    let listener = tokio::net::TcpListener::bind(args.host)
        .await
        .expect("unable to bind to host");
    axum::serve(
        listener,
        server(state.clone()).layer(TraceLayer::new_for_http()),
    )
    // Persist every pending snapshot before the process exits.
    .with_graceful_shutdown(async { tokio::signal::ctrl_c().await.expect("listen to ctrlc") })
    .await
    .unwrap();

    info!("server has shut down, flushing pending snapshots");
    state.shutdown().await;
}
