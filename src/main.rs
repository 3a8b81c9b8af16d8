//! Dealflow - storage deal flow runner
//!
//! Imports a payload, makes a storage deal with the dev provider, keeps
//! blocks coming until the deal is active, then retrieves and verifies it.

use dealflow_core::{
    run_deal_flow_scenario_with_metrics, BlockStore, Config, ContentStore, DevNet,
    MemoryBlockStore, Metrics, StoreBackend,
};
use std::error::Error;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let config = Config::from_cli()?;

    // Initialize logging
    init_logging(&config.log_level);

    tracing::info!("Starting dealflow run...");

    let store: Arc<dyn ContentStore> = match config.store {
        StoreBackend::Memory => Arc::new(MemoryBlockStore::new()),
        StoreBackend::Rocksdb => Arc::new(BlockStore::open(config.block_dir())?),
    };

    let net = DevNet::new(config.devnet(), store.clone());
    let metrics = Metrics::new();
    let result = run_deal_flow_scenario_with_metrics(
        &net.client_node(),
        &net.provider_node(),
        &config.scenario(),
        &metrics,
    )
    .await;

    if config.metrics {
        let stats = store.stats().await?;
        println!("{}", metrics.to_prometheus(stats.block_count, stats.total_size));
    }

    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

fn init_logging(level: &str) {
    // stdout carries the report
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
