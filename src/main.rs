//! vecmem node binary

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vecmem::cluster::ClusterState;
use vecmem::config::{AppConfig, LogFormat};
use vecmem::engine::HeapEngine;
use vecmem::model::FileModelStore;
use vecmem::vectors::InMemoryVectorSource;
use vecmem::watcher::PollingFileWatcher;
use vecmem::{Collaborators, Node};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;

    init_tracing(&config)?;

    let watcher = Arc::new(
        PollingFileWatcher::start(Duration::from_millis(config.watcher.poll_interval_ms))
            .context("failed to start file watcher")?,
    );
    let models = Arc::new(
        FileModelStore::new(&config.model_store.root_path).with_context(|| {
            format!(
                "failed to open model store at {}",
                config.model_store.root_path
            )
        })?,
    );

    let node = Node::new(
        &config,
        Collaborators {
            native: Arc::new(HeapEngine::new()),
            watcher: watcher.clone(),
            vectors: Arc::new(InMemoryVectorSource::new()),
            models,
        },
    )
    .context("failed to initialise node")?;

    tracing::info!(
        node_id = %node.node_id(),
        max_weight_kb = config.cache.max_weight_kb,
        weight_limited = config.cache.weight_limit_enabled,
        expiry_enabled = config.cache.expiry_enabled,
        "Starting vecmem node"
    );

    // A node that has never seen a cluster forms a fresh one, so no training
    // recorded before the restart can still be running
    let report = node.cluster_changed(ClusterState::single_node(node.node_id()));
    if !report.failed.is_empty() {
        tracing::warn!(models = ?report.failed, "Failed training models left over from a previous run");
    }

    node.start_background().await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    node.shutdown().await;
    watcher.shutdown();

    Ok(())
}

fn init_tracing(config: &AppConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.logging.level.clone()))
        .unwrap_or_else(|_| EnvFilter::new("vecmem=info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.logging.format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }

    Ok(())
}
