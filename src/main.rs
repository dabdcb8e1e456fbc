use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratemesh::api;
use ratemesh::cli;
use ratemesh::cluster::StaticMembership;
use ratemesh::hashring::{self, HashRing};
use ratemesh::metrics::AtomicMetrics;
use ratemesh::rpc::{PeerServer, TcpPeerClient};
use ratemesh::service::RatelimitService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ratemesh=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse args and env vars
    let settings = cli::Cli::parse().into_settings()?;
    let http_addr = settings.http_listen_addr()?;
    let rpc_addr = settings.rpc_listen_addr()?;
    let cancel = CancellationToken::new();

    let metrics = Arc::new(AtomicMetrics::default());
    let membership = Arc::new(StaticMembership::new(
        settings.local_node(),
        settings.topology.clone(),
    ));
    let ring = Arc::new(HashRing::new(settings.tokens_per_node));
    let ring_sync = hashring::spawn_ring_sync(
        ring.clone(),
        membership.clone(),
        metrics.clone(),
        cancel.clone(),
    );

    let service = Arc::new(RatelimitService::new(
        &settings,
        ring,
        Arc::new(TcpPeerClient::new()),
        metrics.clone(),
    ));
    let mut background = service.spawn_background(cancel.clone());
    background.push(ring_sync);

    let peer_server = PeerServer::bind(rpc_addr).await?;
    let peer_stats = peer_server.stats();
    background.push(peer_server.spawn(service.clone(), cancel.clone()));

    let router = api::api(api::AppState {
        service: service.clone(),
        membership,
        metrics,
        peer_stats,
    });

    info!(
        "[Node<{}>] Starting Ratemesh on {} (peer RPC on {})",
        settings.node_name, http_addr, rpc_addr
    );
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    for handle in background {
        let _ = handle.await;
    }
    Ok(())
}
