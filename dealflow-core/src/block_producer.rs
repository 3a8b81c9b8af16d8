//! Background block production
//!
//! Advances the chain by asking the provider's node for one block per
//! interval while a deal is being processed. The loop runs as a single tokio
//! task that is told to stop through a watch channel and joined by
//! [`BlockProducerLoop::stop`].
//!
//! The stop signal is checked while waiting for the next interval and again
//! right before each step, so a step that has already started always runs to
//! completion and no step starts once `stop` has been requested.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, ChainApi, ProducedBlock};

/// Failed steps buffered for the owner before new ones are dropped
const ERROR_BUFFER: usize = 64;

/// Called with every block the loop produces
pub type BlockObserver = Box<dyn Fn(ProducedBlock) + Send + Sync>;

/// What the loop did over its lifetime
#[derive(Debug, Default)]
pub struct ProducerSummary {
    pub produced: u64,
    pub failed: u64,
    pub last_epoch: Option<u64>,
    /// Step errors not yet taken through [`BlockProducerLoop::try_next_error`]
    pub errors: Vec<ApiError>,
}

#[derive(Debug, Default)]
struct Progress {
    produced: u64,
    failed: u64,
    last_epoch: Option<u64>,
}

pub struct BlockProducerLoop {
    stop_tx: watch::Sender<bool>,
    errors: mpsc::Receiver<ApiError>,
    handle: Option<JoinHandle<Progress>>,
}

impl BlockProducerLoop {
    /// Start producing one block every `interval`
    pub fn start(chain: Arc<dyn ChainApi>, interval: Duration) -> Self {
        Self::spawn(chain, interval, None)
    }

    /// Like [`start`](Self::start), calling `observer` after each produced block
    pub fn start_with_observer<F>(chain: Arc<dyn ChainApi>, interval: Duration, observer: F) -> Self
    where
        F: Fn(ProducedBlock) + Send + Sync + 'static,
    {
        Self::spawn(chain, interval, Some(Box::new(observer)))
    }

    fn spawn(chain: Arc<dyn ChainApi>, interval: Duration, observer: Option<BlockObserver>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (error_tx, errors) = mpsc::channel(ERROR_BUFFER);

        info!("Starting block producer (interval={:?})", interval);
        let handle = tokio::spawn(run(chain, interval, stop_rx, error_tx, observer));

        Self {
            stop_tx,
            errors,
            handle: Some(handle),
        }
    }

    /// Take the oldest step error reported so far, if any
    pub fn try_next_error(&mut self) -> Option<ApiError> {
        self.errors.try_recv().ok()
    }

    /// Signal the loop and wait for it to finish.
    ///
    /// An in-flight step completes first; no step begins after this returns.
    pub async fn stop(mut self) -> ProducerSummary {
        let _ = self.stop_tx.send(true);

        let progress = match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(progress) => progress,
                Err(e) => {
                    error!("Block producer task ended abnormally: {}", e);
                    Progress::default()
                }
            },
            None => Progress::default(),
        };

        let mut errors = Vec::new();
        while let Ok(e) = self.errors.try_recv() {
            errors.push(e);
        }

        info!(
            "Block producer stopped ({} produced, {} failed)",
            progress.produced, progress.failed
        );

        ProducerSummary {
            produced: progress.produced,
            failed: progress.failed,
            last_epoch: progress.last_epoch,
            errors,
        }
    }
}

impl Drop for BlockProducerLoop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            warn!("Block producer dropped without stop, aborting");
            handle.abort();
        }
    }
}

async fn run(
    chain: Arc<dyn ChainApi>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    errors: mpsc::Sender<ApiError>,
    observer: Option<BlockObserver>,
) -> Progress {
    let mut progress = Progress::default();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        if *stop.borrow() {
            break;
        }

        match chain.produce_block().await {
            Ok(block) => {
                progress.produced += 1;
                progress.last_epoch = Some(block.epoch);
                debug!("Produced block at epoch {}", block.epoch);
                if let Some(observer) = &observer {
                    observer(block);
                }
            }
            Err(e) => {
                progress.failed += 1;
                warn!("Block production failed: {}", e);
                if errors.try_send(e).is_err() {
                    debug!("Producer error buffer full, dropping error");
                }
            }
        }
    }

    progress
}
