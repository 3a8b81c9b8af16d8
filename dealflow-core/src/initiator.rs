//! Submitting storage deal proposals

use cid::Cid;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{DealApi, SubmitError};
use crate::deal::{DealHandle, DealProposal};
use crate::storage::{ContentStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum InitiateError {
    #[error("Proposal rejected immediately: {0}")]
    ProposalRejectedImmediately(String),

    #[error("Deal submission failed: {0}")]
    Submission(String),

    #[error("Data root {0} is not in the local store")]
    MissingDataRoot(Cid),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

type Result<T> = std::result::Result<T, InitiateError>;

/// Hands proposals to the deal subsystem after checking the data is local
pub struct DealInitiator {
    store: Arc<dyn ContentStore>,
    deals: Arc<dyn DealApi>,
}

impl DealInitiator {
    pub fn new(store: Arc<dyn ContentStore>, deals: Arc<dyn DealApi>) -> Self {
        Self { store, deals }
    }

    /// Submit `proposal` and return the handle for later status queries.
    ///
    /// Returns once the deal subsystem has taken the proposal; nothing here
    /// waits for the deal to progress.
    pub async fn start_deal(&self, proposal: &DealProposal) -> Result<DealHandle> {
        if !self.store.has(&proposal.data_root).await? {
            return Err(InitiateError::MissingDataRoot(proposal.data_root));
        }

        info!(
            "Proposing deal for {} to {} (price={}/epoch, min_duration={})",
            proposal.data_root, proposal.provider, proposal.price_per_epoch, proposal.min_duration
        );

        match self.deals.submit_deal(proposal).await {
            Ok(handle) => {
                info!("Deal {} submitted", handle);
                Ok(handle)
            }
            Err(SubmitError::Rejected(reason)) => {
                warn!("Provider refused proposal for {}: {}", proposal.data_root, reason);
                Err(InitiateError::ProposalRejectedImmediately(reason))
            }
            Err(SubmitError::Transport(reason)) => {
                warn!("Failed to submit proposal for {}: {}", proposal.data_root, reason);
                Err(InitiateError::Submission(reason))
            }
        }
    }
}
