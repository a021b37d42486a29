//! peer-conn-cache demo driver.
//!
//! Requests every address of the configured range in order while a remote
//! feed pushes the same range in reverse, then reports how long it took to
//! hold a connection for every address.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use peer_conn_cache::config::CacheConfig;
use peer_conn_cache::domain::{Address, SharedConnection, SimulatedConnection, SimulatedFactory};
use peer_conn_cache::store::{ConnectionStore, build_store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = CacheConfig::from_env()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    tracing::info!(
        store = %config.store_kind,
        capacity = config.capacity,
        first = config.first_address,
        last = config.last_address,
        "starting demo"
    );

    let factory = Arc::new(SimulatedFactory::untracked(config.latency));
    let store = build_store(config.store_kind, config.capacity, factory);

    let runner = Arc::clone(&store);
    let store_loop = tokio::spawn(async move { runner.run().await });

    let feed_stop = CancellationToken::new();
    let feed = tokio::spawn(remote_feed(
        Arc::clone(&store),
        config.clone(),
        feed_stop.clone(),
    ));

    let started = Instant::now();
    let mut held: Vec<SharedConnection> = Vec::new();
    for raw in config.first_address..=config.last_address {
        held.push(store.get_connection(Address::new(raw)).await?);
    }
    tracing::info!(
        count = held.len(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "all connections are held"
    );

    tokio::time::sleep(config.linger).await;

    feed_stop.cancel();
    let _ = feed.await;
    store.shutdown().await;
    let _ = store_loop.await;

    tracing::info!("bye");
    Ok(())
}

/// Pushes a remote connection for every address of the range, last to first,
/// over and over until `stop` fires or the store shuts down.
async fn remote_feed(store: Arc<dyn ConnectionStore>, config: CacheConfig, stop: CancellationToken) {
    if config.first_address > config.last_address {
        return;
    }
    loop {
        for raw in (config.first_address..=config.last_address).rev() {
            tokio::select! {
                () = stop.cancelled() => return,
                () = tokio::time::sleep(config.remote_feed_interval) => {}
            }

            let address = Address::new(raw);
            let conn: SharedConnection =
                Arc::new(SimulatedConnection::new_opened(address, config.latency));
            if let Err(err) = store.on_new_remote_connection(address, conn).await {
                tracing::warn!(%address, %err, "remote feed stopped");
                return;
            }
        }
    }
}
