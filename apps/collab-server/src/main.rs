//! Collaborative document editing WebSocket server

mod config;
mod connection;
mod snapshots;

use collab_engine::{spawn_lifecycle, CollaborationEngine};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::snapshots::SnapshotStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("collab_server=debug,collab_engine=debug")),
        )
        .init();

    let config = ServerConfig::load()?;
    let engine = Arc::new(CollaborationEngine::new(config.engine.clone()));
    let shutdown = CancellationToken::new();

    let store = config.snapshot_dir.as_ref().map(SnapshotStore::new);
    if let Some(store) = &store {
        let restored = store.load_all(&engine).await?;
        info!("Restored {} session snapshot(s)", restored);
    }

    let mut tasks = vec![spawn_lifecycle(engine.clone(), shutdown.clone())];
    if let Some(store) = &store {
        tasks.push(snapshots::spawn_writer(
            engine.clone(),
            store.clone(),
            shutdown.clone(),
        ));
    }

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Collaboration server listening on: {}", config.bind_addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("New connection from: {}", addr);
                    tokio::spawn(connection::handle_connection(stream, addr, engine.clone()));
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    if let Some(store) = &store {
        store.save_all(&engine).await;
    }

    Ok(())
}
