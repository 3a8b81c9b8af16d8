//! Prometheus metrics for deal flow runs
//!
//! Thread-safe metrics collection using atomic types

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared metrics collector; clones count into the same set
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Chain progress
    blocks_produced: AtomicU64,
    block_failures: AtomicU64,

    // Deal tracking
    deal_polls: AtomicU64,

    // Payload bytes
    bytes_imported: AtomicU64,
    bytes_retrieved: AtomicU64,

    // Scenario outcomes
    scenarios_passed: AtomicU64,
    scenarios_failed: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                blocks_produced: AtomicU64::new(0),
                block_failures: AtomicU64::new(0),
                deal_polls: AtomicU64::new(0),
                bytes_imported: AtomicU64::new(0),
                bytes_retrieved: AtomicU64::new(0),
                scenarios_passed: AtomicU64::new(0),
                scenarios_failed: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // Chain progress

    pub fn block_produced(&self) {
        self.inner.blocks_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_failures(&self, count: u64) {
        self.inner.block_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn blocks_produced(&self) -> u64 {
        self.inner.blocks_produced.load(Ordering::Relaxed)
    }

    pub fn block_failures(&self) -> u64 {
        self.inner.block_failures.load(Ordering::Relaxed)
    }

    // Deal tracking

    pub fn deal_polled(&self) {
        self.inner.deal_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deal_polls(&self) -> u64 {
        self.inner.deal_polls.load(Ordering::Relaxed)
    }

    // Payload bytes

    pub fn imported(&self, bytes: u64) {
        self.inner.bytes_imported.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn retrieved(&self, bytes: u64) {
        self.inner.bytes_retrieved.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_imported(&self) -> u64 {
        self.inner.bytes_imported.load(Ordering::Relaxed)
    }

    pub fn bytes_retrieved(&self) -> u64 {
        self.inner.bytes_retrieved.load(Ordering::Relaxed)
    }

    // Scenario outcomes

    pub fn scenario_passed(&self) {
        self.inner.scenarios_passed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scenario_failed(&self) {
        self.inner.scenarios_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scenarios_passed(&self) -> u64 {
        self.inner.scenarios_passed.load(Ordering::Relaxed)
    }

    pub fn scenarios_failed(&self) -> u64 {
        self.inner.scenarios_failed.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-formatted metrics text
    pub fn to_prometheus(&self, block_count: usize, total_bytes: usize) -> String {
        format!(
            "# HELP dealflow_block_count Number of blocks in the client store\n\
             # TYPE dealflow_block_count gauge\n\
             dealflow_block_count {}\n\
             \n\
             # HELP dealflow_block_bytes Bytes of block data in the client store\n\
             # TYPE dealflow_block_bytes gauge\n\
             dealflow_block_bytes {}\n\
             \n\
             # HELP dealflow_uptime_seconds Time since the collector was created\n\
             # TYPE dealflow_uptime_seconds counter\n\
             dealflow_uptime_seconds {}\n\
             \n\
             # HELP dealflow_blocks_produced_total Chain blocks produced by the producer loop\n\
             # TYPE dealflow_blocks_produced_total counter\n\
             dealflow_blocks_produced_total {}\n\
             \n\
             # HELP dealflow_block_failures_total Failed block production steps\n\
             # TYPE dealflow_block_failures_total counter\n\
             dealflow_block_failures_total {}\n\
             \n\
             # HELP dealflow_deal_polls_total Deal status queries issued\n\
             # TYPE dealflow_deal_polls_total counter\n\
             dealflow_deal_polls_total {}\n\
             \n\
             # HELP dealflow_bytes_imported_total Payload bytes imported\n\
             # TYPE dealflow_bytes_imported_total counter\n\
             dealflow_bytes_imported_total {}\n\
             \n\
             # HELP dealflow_bytes_retrieved_total Payload bytes retrieved and verified\n\
             # TYPE dealflow_bytes_retrieved_total counter\n\
             dealflow_bytes_retrieved_total {}\n\
             \n\
             # HELP dealflow_scenarios_passed_total Scenario runs that verified\n\
             # TYPE dealflow_scenarios_passed_total counter\n\
             dealflow_scenarios_passed_total {}\n\
             \n\
             # HELP dealflow_scenarios_failed_total Scenario runs that failed\n\
             # TYPE dealflow_scenarios_failed_total counter\n\
             dealflow_scenarios_failed_total {}\n",
            block_count,
            total_bytes,
            self.uptime_seconds(),
            self.blocks_produced(),
            self.block_failures(),
            self.deal_polls(),
            self.bytes_imported(),
            self.bytes_retrieved(),
            self.scenarios_passed(),
            self.scenarios_failed(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
