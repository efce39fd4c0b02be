//! tesserad: Tessera peer node daemon.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use tessera_core::config::TesseraConfig;
use tessera_core::{Nonce, SystemHeaders};
use tessera_peers::{PoolService, TcpTransport};

mod dialer;
mod procedures;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TesseraConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TesseraConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TesseraConfig::default()
    });

    let nonce = if config.identity.nonce.is_empty() {
        Nonce::generate()
    } else {
        Nonce::from(config.identity.nonce.clone())
    };
    let headers = SystemHeaders::new(nonce.clone(), config.network.ws_port);
    tracing::info!(
        %nonce,
        version = %headers.version,
        protocol = %headers.protocol_version,
        "tesserad starting"
    );

    // Local procedures and events
    let pool_slot = Arc::new(OnceLock::new());
    let endpoints = Arc::new(procedures::endpoints(headers.clone(), pool_slot.clone()));
    let transport = Arc::new(TcpTransport::new(
        headers.clone(),
        endpoints.clone(),
        config.pool.ack_timeout(),
    ));

    let listener = TcpListener::bind((config.network.bind_address.as_str(), config.network.ws_port))
        .await
        .with_context(|| {
            format!(
                "failed to bind peer listener on {}:{}",
                config.network.bind_address, config.network.ws_port
            )
        })?;
    tracing::info!(addr = %listener.local_addr()?, "peer listener bound");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let (service, pool) = PoolService::new(
        headers,
        transport.clone(),
        endpoints,
        config.pool.clone(),
        shutdown_tx.subscribe(),
    );
    let _ = pool_slot.set(pool.clone());
    let mut pool_task = tokio::spawn(service.run());

    let server_task = tokio::spawn(
        server::PeerListener::new(listener, transport, pool.clone(), shutdown_tx.subscribe()).run(),
    );

    let dialer_task = tokio::spawn(
        dialer::SeedDialer::new(
            config.peers.seeds.clone(),
            Duration::from_secs(config.peers.reconnect_interval_secs),
            pool,
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = &mut pool_task     => tracing::error!("peer pool exited: {:?}", r),
        r = server_task        => tracing::error!("peer listener exited: {:?}", r),
        r = dialer_task        => tracing::error!("seed dialer exited: {:?}", r),
    }

    // Let the pool tear its sockets down before the runtime goes away.
    if !pool_task.is_finished() {
        let _ = shutdown_tx.send(());
        let _ = tokio::time::timeout(Duration::from_secs(2), pool_task).await;
    }

    Ok(())
}
