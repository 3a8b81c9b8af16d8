//! Node interfaces consumed by the deal flow
//!
//! The deal flow never builds nodes itself. It is handed a [`ClientNode`] and
//! a [`ProviderNode`], each a bundle of the narrow capabilities it uses:
//! content storage, deal submission and status, retrieval, block production,
//! peering and the wallet.

use async_trait::async_trait;
use cid::Cid;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::deal::{DealHandle, DealInfo, DealProposal, TokenAmount};
use crate::storage::ContentStore;

/// Failure of a node call that carries no richer structure
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not available: {0}")]
    Unavailable(String),
}

/// Deal submission failures
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The counterparty refused the proposal on the spot
    #[error("Proposal rejected: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Retrieval failures reported by the retrieval subsystem
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A wallet or actor address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a peer can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddrInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// A provider's offer to serve a root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalOffer {
    pub root: Cid,
    pub size: u64,
    pub min_price: TokenAmount,
    pub payment_interval: u64,
    pub provider: Address,
    pub provider_peer: PeerId,
}

impl RetrievalOffer {
    /// Turn the offer into an order paid for by `client`
    pub fn order(&self, client: &Address) -> RetrievalOrder {
        RetrievalOrder {
            root: self.root,
            size: self.size,
            total: self.min_price,
            payment_interval: self.payment_interval,
            client: client.clone(),
            provider: self.provider.clone(),
            provider_peer: self.provider_peer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalOrder {
    pub root: Cid,
    pub size: u64,
    pub total: TokenAmount,
    pub payment_interval: u64,
    pub client: Address,
    pub provider: Address,
    pub provider_peer: PeerId,
}

/// Destination of a retrieval. With `is_archive` the provider writes a CAR
/// of the DAG instead of the flat file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub path: PathBuf,
    pub is_archive: bool,
}

/// Result of one block production step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducedBlock {
    pub epoch: u64,
}

#[async_trait]
pub trait DealApi: Send + Sync {
    /// Submit a proposal; returns once it is accepted for processing
    async fn submit_deal(&self, proposal: &DealProposal) -> Result<DealHandle, SubmitError>;

    /// Current status, or `None` if the deal is not visible yet
    async fn deal_info(&self, handle: &DealHandle) -> Result<Option<DealInfo>, ApiError>;
}

#[async_trait]
pub trait RetrievalApi: Send + Sync {
    async fn find_offers(&self, root: &Cid) -> Result<Vec<RetrievalOffer>, RetrievalError>;

    async fn retrieve(&self, order: &RetrievalOrder, dest: &FileRef) -> Result<(), RetrievalError>;
}

#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn produce_block(&self) -> Result<ProducedBlock, ApiError>;
}

#[async_trait]
pub trait PeeringApi: Send + Sync {
    async fn listen_addresses(&self) -> Result<PeerAddrInfo, ApiError>;

    async fn connect(&self, peer: &PeerAddrInfo) -> Result<(), ApiError>;
}

#[async_trait]
pub trait WalletApi: Send + Sync {
    async fn default_address(&self) -> Result<Address, ApiError>;
}

#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn actor_address(&self) -> Result<Address, ApiError>;
}

/// The client-side node as the deal flow sees it
#[derive(Clone)]
pub struct ClientNode {
    pub store: Arc<dyn ContentStore>,
    pub deals: Arc<dyn DealApi>,
    pub retrieval: Arc<dyn RetrievalApi>,
    pub wallet: Arc<dyn WalletApi>,
    pub net: Arc<dyn PeeringApi>,
}

/// The storage provider as the deal flow sees it
#[derive(Clone)]
pub struct ProviderNode {
    pub chain: Arc<dyn ChainApi>,
    pub provider: Arc<dyn ProviderApi>,
    pub net: Arc<dyn PeeringApi>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::raw_cid;
    use libp2p::identity::Keypair;

    #[test]
    fn test_offer_to_order() {
        let peer = PeerId::from(Keypair::generate_secp256k1().public());
        let offer = RetrievalOffer {
            root: raw_cid(b"data").unwrap(),
            size: 600,
            min_price: TokenAmount(1200),
            payment_interval: 1 << 20,
            provider: Address::new("t01000"),
            provider_peer: peer,
        };

        let order = offer.order(&Address::new("t3payer"));

        assert_eq!(order.root, offer.root);
        assert_eq!(order.size, 600);
        assert_eq!(order.total, TokenAmount(1200));
        assert_eq!(order.client.as_str(), "t3payer");
        assert_eq!(order.provider, offer.provider);
        assert_eq!(order.provider_peer, peer);
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::new("t01000").to_string(), "t01000");
    }
}
