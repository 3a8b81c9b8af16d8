//! Polling a deal until it settles

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{ApiError, DealApi};
use crate::deal::{classify, Classification, DealHandle, DealInfo};
use crate::metrics::Metrics;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Deal {handle} was rejected by the provider: {message}")]
    DealRejected { handle: DealHandle, message: String },

    #[error("Deal {handle} failed: {message}")]
    DealFailed { handle: DealHandle, message: String },

    #[error("Deal errored: {0}")]
    DealErrored(String),

    #[error("Deal status query failed: {0}")]
    Query(#[from] ApiError),
}

/// A deal that reached the success state
#[derive(Debug, Clone)]
pub struct SettledDeal {
    pub info: DealInfo,
    pub polls: u64,
}

pub struct DealStateMonitor {
    deals: Arc<dyn DealApi>,
    metrics: Option<Metrics>,
}

impl DealStateMonitor {
    pub fn new(deals: Arc<dyn DealApi>) -> Self {
        Self {
            deals,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Poll `handle` every `poll_interval` until its state is terminal.
    ///
    /// A deal the provider does not know about yet is polled again. There is
    /// no internal deadline; callers bound the wait themselves.
    pub async fn await_terminal(
        &self,
        handle: &DealHandle,
        poll_interval: Duration,
    ) -> Result<SettledDeal, MonitorError> {
        let mut polls = 0u64;

        loop {
            let status = self.deals.deal_info(handle).await?;
            polls += 1;
            if let Some(metrics) = &self.metrics {
                metrics.deal_polled();
            }

            match status {
                None => {
                    debug!("Deal {} not visible yet (poll {})", handle, polls);
                }
                Some(info) => {
                    info!(
                        "Deal {} state: {} (epoch {}, poll {})",
                        handle, info.state, info.epoch, polls
                    );

                    match classify(info.state) {
                        Classification::Continue => {}
                        Classification::Success => {
                            info!("Deal {} is active after {} polls", handle, polls);
                            return Ok(SettledDeal { info, polls });
                        }
                        Classification::Rejected => {
                            warn!("Deal {} rejected: {}", handle, info.message);
                            return Err(MonitorError::DealRejected {
                                handle: *handle,
                                message: info.message,
                            });
                        }
                        Classification::Failing => {
                            warn!("Deal {} failing: {}", handle, info.message);
                            return Err(MonitorError::DealFailed {
                                handle: *handle,
                                message: info.message,
                            });
                        }
                        Classification::Errored => {
                            warn!("Deal {} errored: {}", handle, info.message);
                            return Err(MonitorError::DealErrored(info.message));
                        }
                    }
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}
