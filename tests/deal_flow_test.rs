//! End-to-end deal flow tests against the in-process dev network
//!
//! Each test imports the 600-byte seed-5 payload, makes a deal, keeps
//! blocks coming until the deal settles, and checks what comes back.

use dealflow_core::{
    deterministic_payload, run_deal_flow_scenario, run_deal_flow_scenario_with_metrics,
    BlockStore, ContentStore, DevNet, DevNetConfig, InitiateError, Metrics, MonitorError,
    ProviderBehavior, ScenarioConfig, ScenarioError, VerifyError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing for tests
fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

fn scenario(archive: bool) -> ScenarioConfig {
    ScenarioConfig {
        poll_interval: Duration::from_millis(10),
        deal_deadline: Some(Duration::from_secs(30)),
        ..ScenarioConfig::new(Duration::from_millis(10), archive)
    }
}

fn devnet(behavior: ProviderBehavior) -> DevNet {
    DevNet::in_memory(DevNetConfig {
        behavior,
        ..DevNetConfig::default()
    })
}

#[tokio::test]
async fn test_deal_flow_raw_retrieval() {
    init_tracing();

    let net = devnet(ProviderBehavior::Accept);
    let report = run_deal_flow_scenario(&net.client_node(), &net.provider_node(), &scenario(false))
        .await
        .expect("deal flow failed");

    info!("Report: {:?}", report);
    assert_eq!(report.final_state, "StorageDealActive");
    assert_eq!(report.payload_bytes, 600);
    assert!(!report.archive);
    assert_eq!(report.archive_blocks, None);
    assert_eq!(report.provider, "t01000");

    // Six blocks take the deal to Active; polling runs at the block rate
    assert!(report.deal_polls >= 1);
    assert!(report.deal_polls <= 200, "settled after {} polls", report.deal_polls);
}

#[tokio::test]
async fn test_deal_flow_archive_retrieval() {
    init_tracing();

    let net = devnet(ProviderBehavior::Accept);
    let report = run_deal_flow_scenario(&net.client_node(), &net.provider_node(), &scenario(true))
        .await
        .expect("deal flow failed");

    assert_eq!(report.final_state, "StorageDealActive");
    assert_eq!(report.payload_bytes, 600);
    assert!(report.archive);
    // 600 bytes fit one chunk, so the archive holds the single raw leaf
    assert_eq!(report.archive_blocks, Some(1));
}

#[tokio::test]
async fn test_deal_flow_archive_multi_level_dag() {
    init_tracing();

    let net = devnet(ProviderBehavior::Accept);
    let config = ScenarioConfig {
        payload_size: 10_000,
        chunk_size: 256,
        fanout: 4,
        ..scenario(true)
    };

    let report = run_deal_flow_scenario(&net.client_node(), &net.provider_node(), &config)
        .await
        .expect("deal flow failed");

    // 40 leaves -> 10 -> 3 -> 1
    assert_eq!(report.archive_blocks, Some(54));
    assert_eq!(report.payload_bytes, 10_000);
}

#[tokio::test]
async fn test_payload_lands_in_both_stores() {
    let net = devnet(ProviderBehavior::Accept);
    let client = net.client_node();

    let report = run_deal_flow_scenario(&client, &net.provider_node(), &scenario(false))
        .await
        .unwrap();

    let root: dealflow_core::Cid = report.data_root.parse().unwrap();
    let block = client.store.get(&root).await.unwrap();
    assert_eq!(block.data, deterministic_payload(600, 5));
    assert!(net.provider_store().has(&root).await.unwrap());
}

#[tokio::test]
async fn test_deal_flow_persistent_store() {
    init_tracing();

    let store = Arc::new(BlockStore::temporary().unwrap());
    let net = DevNet::new(DevNetConfig::default(), store.clone());

    let report = run_deal_flow_scenario(&net.client_node(), &net.provider_node(), &scenario(true))
        .await
        .expect("deal flow failed");

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.block_count, 1);
    assert_eq!(stats.total_size, 600);
    assert_eq!(report.payload_bytes, 600);
}

#[tokio::test]
async fn test_rejected_at_submission() {
    let net = devnet(ProviderBehavior::RejectOnSubmit);

    let err = run_deal_flow_scenario(&net.client_node(), &net.provider_node(), &scenario(false))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), "initiate");
    assert!(matches!(
        err,
        ScenarioError::Initiate(InitiateError::ProposalRejectedImmediately(_))
    ));
}

#[tokio::test]
async fn test_terminal_failures() {
    let cases = [ProviderBehavior::Reject, ProviderBehavior::Fail, ProviderBehavior::Error];

    for behavior in cases {
        let net = devnet(behavior);
        let err = run_deal_flow_scenario(&net.client_node(), &net.provider_node(), &scenario(false))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), "monitor", "{:?}", behavior);
        let matched = match (behavior, &err) {
            (
                ProviderBehavior::Reject,
                ScenarioError::Monitor(MonitorError::DealRejected { message, .. }),
            ) => message == "deal rejected: provider is not accepting deals",
            (
                ProviderBehavior::Fail,
                ScenarioError::Monitor(MonitorError::DealFailed { message, .. }),
            ) => message.contains("sealing failed"),
            (ProviderBehavior::Error, ScenarioError::Monitor(MonitorError::DealErrored(msg))) => {
                msg.contains("proving failed")
            }
            _ => false,
        };
        assert!(matched, "{:?} ended with {:?}", behavior, err);

        // The provider's explanation reaches the top-level error text
        let text = err.to_string();
        assert!(
            text.contains("rejected: provider")
                || text.contains("sealing failed")
                || text.contains("proving failed"),
            "{}",
            text
        );
    }
}

#[tokio::test]
async fn test_corrupted_retrieval_is_a_mismatch() {
    for archive in [false, true] {
        let net = devnet(ProviderBehavior::CorruptRetrieval);
        let err = run_deal_flow_scenario(&net.client_node(), &net.provider_node(), &scenario(archive))
            .await
            .unwrap_err();

        match err {
            ScenarioError::Verify(VerifyError::Mismatch(m)) => {
                assert_eq!(m.expected_len, 600);
                assert_eq!(m.actual_len, 600);
                assert_eq!(m.first_difference, 599);
            }
            other => panic!("archive={} ended with {:?}", archive, other),
        }
    }
}

#[tokio::test]
async fn test_producer_keeps_going_through_failed_blocks() {
    let net = DevNet::in_memory(DevNetConfig {
        fail_every_nth_block: 3,
        ..DevNetConfig::default()
    });
    let metrics = Metrics::new();

    let report = run_deal_flow_scenario_with_metrics(
        &net.client_node(),
        &net.provider_node(),
        &scenario(false),
        &metrics,
    )
    .await
    .expect("deal flow failed");

    assert!(report.block_failures > 0);
    assert_eq!(metrics.block_failures(), report.block_failures);
    assert_eq!(metrics.blocks_produced(), report.blocks_produced);
    assert_eq!(report.final_epoch, Some(report.blocks_produced));
}

#[tokio::test]
async fn test_no_blocks_after_scenario_returns() {
    let net = devnet(ProviderBehavior::Accept);

    run_deal_flow_scenario(&net.client_node(), &net.provider_node(), &scenario(false))
        .await
        .unwrap();

    let epoch = net.epoch().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(net.epoch().await, epoch);
}
