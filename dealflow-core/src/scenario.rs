//! End-to-end storage deal flow
//!
//! Links the provider to the client, imports a payload, keeps blocks coming
//! while a deal is proposed and tracked to completion, then retrieves the
//! data and checks it byte for byte. The block producer is stopped on every
//! exit path once it has been started.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{error, info};

use crate::api::{ApiError, ClientNode, ProviderNode};
use crate::block_producer::BlockProducerLoop;
use crate::chunker::DEFAULT_CHUNK_SIZE;
use crate::deal::{DealProposal, TokenAmount};
use crate::importer::{ContentImporter, ImportError, DEFAULT_FANOUT};
use crate::initiator::{DealInitiator, InitiateError};
use crate::metrics::Metrics;
use crate::monitor::{DealStateMonitor, MonitorError};
use crate::retrieval::{RetrievalVerifier, VerifyError};

/// Parameters of one scenario run
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioConfig {
    pub block_interval: Duration,
    pub poll_interval: Duration,
    /// Retrieve a CAR of the DAG instead of the flat file
    pub archive: bool,
    pub payload_size: usize,
    pub payload_seed: u64,
    pub price_per_epoch: TokenAmount,
    pub min_duration: u64,
    pub chunk_size: usize,
    pub fanout: usize,
    /// Give up on the deal after this long; unbounded when `None`
    pub deal_deadline: Option<Duration>,
}

impl ScenarioConfig {
    pub fn new(block_interval: Duration, archive: bool) -> Self {
        Self {
            block_interval,
            archive,
            ..Self::default()
        }
    }
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            block_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            archive: false,
            payload_size: 600,
            payload_seed: 5,
            price_per_epoch: TokenAmount(1_000_000),
            min_duration: 100,
            chunk_size: DEFAULT_CHUNK_SIZE,
            fanout: DEFAULT_FANOUT,
            deal_deadline: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Failed to {step}: {source}")]
    Setup {
        step: &'static str,
        #[source]
        source: ApiError,
    },

    #[error("Failed to create scratch directory: {0}")]
    Scratch(#[source] std::io::Error),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Initiate(#[from] InitiateError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("Deal did not settle within {0:?}")]
    DealTimeout(Duration),

    #[error(transparent)]
    Verify(#[from] VerifyError),
}

impl ScenarioError {
    /// Name of the stage that failed
    pub fn stage(&self) -> &'static str {
        match self {
            ScenarioError::Setup { .. } | ScenarioError::Scratch(_) => "setup",
            ScenarioError::Import(_) => "import",
            ScenarioError::Initiate(_) => "initiate",
            ScenarioError::Monitor(_) | ScenarioError::DealTimeout(_) => "monitor",
            ScenarioError::Verify(_) => "verify",
        }
    }
}

fn setup(step: &'static str) -> impl FnOnce(ApiError) -> ScenarioError {
    move |source| ScenarioError::Setup { step, source }
}

/// Outcome of a verified run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub data_root: String,
    pub deal: String,
    pub final_state: String,
    pub provider: String,
    pub payload_bytes: u64,
    pub archive: bool,
    pub archive_blocks: Option<usize>,
    pub deal_polls: u64,
    pub blocks_produced: u64,
    pub block_failures: u64,
    pub final_epoch: Option<u64>,
    pub elapsed_ms: u64,
}

/// `size` pseudo-random bytes, identical for identical seeds
pub fn deterministic_payload(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill_bytes(&mut data);
    data
}

/// Run the full deal flow between `client` and `provider`
pub async fn run_deal_flow_scenario(
    client: &ClientNode,
    provider: &ProviderNode,
    config: &ScenarioConfig,
) -> Result<ScenarioReport, ScenarioError> {
    run_deal_flow_scenario_with_metrics(client, provider, config, &Metrics::new()).await
}

/// [`run_deal_flow_scenario`], counting into `metrics`
pub async fn run_deal_flow_scenario_with_metrics(
    client: &ClientNode,
    provider: &ProviderNode,
    config: &ScenarioConfig,
    metrics: &Metrics,
) -> Result<ScenarioReport, ScenarioError> {
    let result = run(client, provider, config, metrics).await;

    match &result {
        Ok(report) => {
            metrics.scenario_passed();
            info!(
                "Deal flow verified: {} bytes under {} ({} polls, {} blocks)",
                report.payload_bytes, report.data_root, report.deal_polls, report.blocks_produced
            );
        }
        Err(e) => {
            metrics.scenario_failed();
            error!("Deal flow failed during {}: {}", e.stage(), e);
        }
    }

    result
}

async fn run(
    client: &ClientNode,
    provider: &ProviderNode,
    config: &ScenarioConfig,
    metrics: &Metrics,
) -> Result<ScenarioReport, ScenarioError> {
    let started = Instant::now();

    let client_addrs = client
        .net
        .listen_addresses()
        .await
        .map_err(setup("list client addresses"))?;
    provider
        .net
        .connect(&client_addrs)
        .await
        .map_err(setup("connect provider to client"))?;
    info!("Provider linked to client {}", client_addrs.peer_id);

    let payload = deterministic_payload(config.payload_size, config.payload_seed);
    let file = ContentImporter::with_layout(client.store.clone(), config.chunk_size, config.fanout)
        .import(&payload[..])
        .await?;
    metrics.imported(file.size);

    let wallet = client
        .wallet
        .default_address()
        .await
        .map_err(setup("read wallet default address"))?;
    let provider_addr = provider
        .provider
        .actor_address()
        .await
        .map_err(setup("read provider actor address"))?;

    let proposal = DealProposal {
        data_root: file.root,
        wallet: wallet.clone(),
        provider: provider_addr,
        price_per_epoch: config.price_per_epoch,
        min_duration: config.min_duration,
    };

    let scratch = TempDir::new().map_err(ScenarioError::Scratch)?;

    let produced = metrics.clone();
    let producer = BlockProducerLoop::start_with_observer(
        provider.chain.clone(),
        config.block_interval,
        move |_| produced.block_produced(),
    );

    let outcome = async {
        let handle = DealInitiator::new(client.store.clone(), client.deals.clone())
            .start_deal(&proposal)
            .await?;

        let monitor = DealStateMonitor::new(client.deals.clone()).with_metrics(metrics.clone());
        let settled = match config.deal_deadline {
            Some(deadline) => {
                tokio::time::timeout(deadline, monitor.await_terminal(&handle, config.poll_interval))
                    .await
                    .map_err(|_| ScenarioError::DealTimeout(deadline))??
            }
            None => monitor.await_terminal(&handle, config.poll_interval).await?,
        };

        let verified = RetrievalVerifier::new(client.retrieval.clone(), scratch.path())
            .with_metrics(metrics.clone())
            .verify(&file.root, &wallet, &payload, config.archive)
            .await?;

        Ok::<_, ScenarioError>((handle, settled, verified))
    }
    .await;

    let summary = producer.stop().await;
    metrics.record_block_failures(summary.failed);

    let (handle, settled, verified) = outcome?;

    Ok(ScenarioReport {
        data_root: file.root.to_string(),
        deal: handle.to_string(),
        final_state: settled.info.state.to_string(),
        provider: verified.offer.provider.to_string(),
        payload_bytes: verified.bytes,
        archive: config.archive,
        archive_blocks: verified.archive_blocks,
        deal_polls: settled.polls,
        blocks_produced: summary.produced,
        block_failures: summary.failed,
        final_epoch: summary.last_epoch,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}
