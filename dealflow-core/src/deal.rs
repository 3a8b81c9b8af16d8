//! Storage deal data model and terminal-state classification

use cid::Cid;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api::Address;
use crate::content_id::{cid_for, CidError, JSON_CODEC};

/// Token amount in the chain's smallest unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenAmount(pub u128);

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A storage deal proposal. Built once per run and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealProposal {
    pub data_root: Cid,
    pub wallet: Address,
    pub provider: Address,
    pub price_per_epoch: TokenAmount,
    pub min_duration: u64,
}

#[derive(Serialize)]
struct ProposalDocument<'a> {
    data_root: String,
    wallet: &'a str,
    provider: &'a str,
    price_per_epoch: String,
    min_duration: u64,
}

impl DealProposal {
    /// Canonical JSON form, used to derive the proposal's CID
    pub fn to_json(&self) -> Result<Vec<u8>, ProposalError> {
        let doc = ProposalDocument {
            data_root: self.data_root.to_string(),
            wallet: self.wallet.as_str(),
            provider: self.provider.as_str(),
            price_per_epoch: self.price_per_epoch.to_string(),
            min_duration: self.min_duration,
        };
        Ok(serde_json::to_vec(&doc)?)
    }

    /// Content identifier of the proposal; providers hand it back as the
    /// deal handle.
    pub fn cid(&self) -> Result<Cid, ProposalError> {
        Ok(cid_for(JSON_CODEC, &self.to_json()?)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    #[error("Failed to encode proposal: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("CID error: {0}")]
    Cid(#[from] CidError),
}

/// Key for every status query about one deal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DealHandle(pub Cid);

impl fmt::Display for DealHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deal lifecycle as reported by the deal subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DealState {
    Unknown,
    ProposalNotFound,
    ProposalRejected,
    ProposalAccepted,
    Staged,
    Sealing,
    Active,
    Failing,
    NotFound,
    FundsEnsured,
    Validating,
    Transferring,
    WaitingForData,
    VerifyData,
    Publishing,
    Error,
    Completed,
}

impl DealState {
    pub fn name(&self) -> &'static str {
        match self {
            DealState::Unknown => "StorageDealUnknown",
            DealState::ProposalNotFound => "StorageDealProposalNotFound",
            DealState::ProposalRejected => "StorageDealProposalRejected",
            DealState::ProposalAccepted => "StorageDealProposalAccepted",
            DealState::Staged => "StorageDealStaged",
            DealState::Sealing => "StorageDealSealing",
            DealState::Active => "StorageDealActive",
            DealState::Failing => "StorageDealFailing",
            DealState::NotFound => "StorageDealNotFound",
            DealState::FundsEnsured => "StorageDealFundsEnsured",
            DealState::Validating => "StorageDealValidating",
            DealState::Transferring => "StorageDealTransferring",
            DealState::WaitingForData => "StorageDealWaitingForData",
            DealState::VerifyData => "StorageDealVerifyData",
            DealState::Publishing => "StorageDealPublishing",
            DealState::Error => "StorageDealError",
            DealState::Completed => "StorageDealCompleted",
        }
    }
}

impl fmt::Display for DealState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the client should do after observing a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Continue,
    Success,
    Rejected,
    Failing,
    Errored,
}

impl Classification {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Classification::Continue)
    }
}

/// Map a deal state onto the client's view of it.
///
/// `Unknown`, `ProposalNotFound` and `NotFound` are what a provider reports
/// before a fresh proposal is visible in its deal store, so they keep the
/// client polling.
pub fn classify(state: DealState) -> Classification {
    match state {
        DealState::ProposalRejected => Classification::Rejected,
        DealState::Failing => Classification::Failing,
        DealState::Error => Classification::Errored,
        DealState::Active => Classification::Success,
        DealState::Unknown
        | DealState::ProposalNotFound
        | DealState::NotFound
        | DealState::ProposalAccepted
        | DealState::Staged
        | DealState::Sealing
        | DealState::FundsEnsured
        | DealState::Validating
        | DealState::Transferring
        | DealState::WaitingForData
        | DealState::VerifyData
        | DealState::Publishing
        | DealState::Completed => Classification::Continue,
    }
}

/// One status snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealInfo {
    pub handle: DealHandle,
    pub state: DealState,
    pub message: String,
    pub provider: Address,
    pub data_root: Cid,
    pub size: u64,
    pub price_per_epoch: TokenAmount,
    pub duration: u64,
    /// Chain epoch at which the snapshot was taken
    pub epoch: u64,
}
