//! In-process development network
//!
//! One client node and one storage provider sharing a simulated chain. Every
//! produced block advances each known deal by one step:
//!
//! ```text
//! (submitted) -> Validating -> ProposalAccepted -> Transferring -> Staged
//!             -> Sealing -> Active
//! ```
//!
//! A submitted deal is not visible until the next block. The DAG is copied
//! from the client store into the provider store on entering
//! `Transferring`, and retrieval offers exist only for roots with an active
//! deal. Sealing completes after one epoch with insecure proof validation
//! and after `sealing_epochs` otherwise.

use async_trait::async_trait;
use cid::Cid;
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::{
    Address, ApiError, ChainApi, ClientNode, DealApi, FileRef, PeerAddrInfo, PeeringApi,
    ProducedBlock, ProviderApi, ProviderNode, RetrievalApi, RetrievalError, RetrievalOffer,
    RetrievalOrder, SubmitError, WalletApi,
};
use crate::archive::encode_archive;
use crate::deal::{DealHandle, DealInfo, DealProposal, DealState, TokenAmount};
use crate::storage::{ContentStore, MemoryBlockStore};
use crate::unixfs::{self, UnixFsError};

/// Bytes paid for per retrieval payment voucher
pub const PAYMENT_INTERVAL: u64 = 1 << 20;

/// How the dev provider treats deals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderBehavior {
    /// Seal and serve every deal
    Accept,
    /// Refuse proposals at submission
    RejectOnSubmit,
    /// Reject proposals during validation
    Reject,
    /// Fail deals while sealing
    Fail,
    /// Error deals when proving
    Error,
    /// Seal deals, then serve altered bytes
    CorruptRetrieval,
}

#[derive(Debug, Clone)]
pub struct DevNetConfig {
    pub behavior: ProviderBehavior,
    pub insecure_proof_validation: bool,
    /// Epochs spent sealing when proofs are validated
    pub sealing_epochs: u64,
    /// Every n-th block production attempt fails; 0 disables
    pub fail_every_nth_block: u64,
    pub client_address: Address,
    pub provider_address: Address,
    pub retrieval_price_per_byte: TokenAmount,
}

impl Default for DevNetConfig {
    fn default() -> Self {
        Self {
            behavior: ProviderBehavior::Accept,
            insecure_proof_validation: true,
            sealing_epochs: 4,
            fail_every_nth_block: 0,
            client_address: Address::new("t3client"),
            provider_address: Address::new("t01000"),
            retrieval_price_per_byte: TokenAmount(0),
        }
    }
}

struct DealRecord {
    proposal: DealProposal,
    state: DealState,
    message: String,
    size: u64,
    /// Epoch at which the current state was entered
    since: u64,
}

#[derive(Default)]
struct ChainState {
    epoch: u64,
    attempts: u64,
    /// Submitted deals the provider has not picked up yet
    incoming: Vec<DealHandle>,
    deals: HashMap<DealHandle, DealRecord>,
}

struct Shared {
    config: DevNetConfig,
    chain: Mutex<ChainState>,
    client_store: Arc<dyn ContentStore>,
    provider_store: Arc<MemoryBlockStore>,
    client_peer: PeerAddrInfo,
    provider_peer: PeerAddrInfo,
    /// Peers the provider has connected to
    links: Mutex<HashSet<PeerId>>,
}

/// A client and a provider wired to one simulated chain
#[derive(Clone)]
pub struct DevNet {
    shared: Arc<Shared>,
}

fn local_peer(port: u16) -> PeerAddrInfo {
    let peer_id = PeerId::from(Keypair::generate_secp256k1().public());
    let addr = Multiaddr::empty()
        .with(Protocol::Ip4(Ipv4Addr::LOCALHOST))
        .with(Protocol::Tcp(port));
    PeerAddrInfo {
        peer_id,
        addrs: vec![addr],
    }
}

impl DevNet {
    pub fn new(config: DevNetConfig, client_store: Arc<dyn ContentStore>) -> Self {
        let client_peer = local_peer(4002);
        let provider_peer = local_peer(4001);
        info!(
            "Dev network up: client {} provider {} ({:?}, insecure proofs: {})",
            client_peer.peer_id,
            provider_peer.peer_id,
            config.behavior,
            config.insecure_proof_validation
        );

        Self {
            shared: Arc::new(Shared {
                config,
                chain: Mutex::new(ChainState::default()),
                client_store,
                provider_store: Arc::new(MemoryBlockStore::new()),
                client_peer,
                provider_peer,
                links: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Dev network with a fresh in-memory client store
    pub fn in_memory(config: DevNetConfig) -> Self {
        Self::new(config, Arc::new(MemoryBlockStore::new()))
    }

    pub fn client_node(&self) -> ClientNode {
        let client = Arc::new(DevClient {
            shared: self.shared.clone(),
        });
        ClientNode {
            store: self.shared.client_store.clone(),
            deals: client.clone(),
            retrieval: client.clone(),
            wallet: client.clone(),
            net: client,
        }
    }

    pub fn provider_node(&self) -> ProviderNode {
        let provider = Arc::new(DevProvider {
            shared: self.shared.clone(),
        });
        ProviderNode {
            chain: provider.clone(),
            provider: provider.clone(),
            net: provider,
        }
    }

    pub async fn epoch(&self) -> u64 {
        self.shared.chain.lock().await.epoch
    }

    /// Blocks the provider holds after deal transfers
    pub fn provider_store(&self) -> Arc<MemoryBlockStore> {
        self.shared.provider_store.clone()
    }
}

impl Shared {
    fn sealing_epochs(&self) -> u64 {
        if self.config.insecure_proof_validation {
            1
        } else {
            self.config.sealing_epochs.max(1)
        }
    }

    /// Copy the DAG under `root` from the client store to the provider
    async fn transfer(&self, root: &Cid) -> Result<u64, UnixFsError> {
        let blocks = unixfs::collect_blocks(self.client_store.as_ref(), root).await?;
        let mut size = 0;
        for block in blocks {
            size += block.size() as u64;
            self.provider_store.put(block).await?;
        }
        Ok(size)
    }

    /// Move one deal a single step forward at `epoch`
    async fn advance(&self, handle: &DealHandle, deal: &mut DealRecord, epoch: u64) {
        let behavior = self.config.behavior;
        let current = deal.state;
        let (next, message) = match current {
            DealState::Validating => match behavior {
                ProviderBehavior::Reject => (
                    DealState::ProposalRejected,
                    "deal rejected: provider is not accepting deals".to_string(),
                ),
                _ => (DealState::ProposalAccepted, String::new()),
            },
            DealState::ProposalAccepted => match self.transfer(&deal.proposal.data_root).await {
                Ok(size) => {
                    deal.size = size;
                    (DealState::Transferring, String::new())
                }
                Err(e) => (DealState::Error, format!("data transfer failed: {}", e)),
            },
            DealState::Transferring => (DealState::Staged, String::new()),
            DealState::Staged => match behavior {
                ProviderBehavior::Fail => (
                    DealState::Failing,
                    "sealing failed: sector commit aborted".to_string(),
                ),
                _ => (DealState::Sealing, String::new()),
            },
            DealState::Sealing if epoch - deal.since >= self.sealing_epochs() => match behavior {
                ProviderBehavior::Error => (
                    DealState::Error,
                    "proving failed: window post missed".to_string(),
                ),
                _ => (DealState::Active, String::new()),
            },
            _ => return,
        };

        debug!("Deal {}: {} -> {} at epoch {}", handle, current, next, epoch);
        deal.state = next;
        deal.message = message;
        deal.since = epoch;
    }

    async fn active_deal_for(&self, root: &Cid) -> Option<DealProposal> {
        self.chain
            .lock()
            .await
            .deals
            .values()
            .find(|d| d.state == DealState::Active && d.proposal.data_root == *root)
            .map(|d| d.proposal.clone())
    }
}

/// Client side of the dev network
pub struct DevClient {
    shared: Arc<Shared>,
}

#[async_trait]
impl DealApi for DevClient {
    async fn submit_deal(&self, proposal: &DealProposal) -> Result<DealHandle, SubmitError> {
        let shared = &self.shared;

        if proposal.provider != shared.config.provider_address {
            return Err(SubmitError::Transport(format!(
                "no provider with address {}",
                proposal.provider
            )));
        }
        if !shared
            .links
            .lock()
            .await
            .contains(&shared.client_peer.peer_id)
        {
            return Err(SubmitError::Transport(format!(
                "not connected to provider {}",
                shared.provider_peer.peer_id
            )));
        }
        if shared.config.behavior == ProviderBehavior::RejectOnSubmit {
            return Err(SubmitError::Rejected(
                "provider is not accepting deals".to_string(),
            ));
        }

        let handle = DealHandle(
            proposal
                .cid()
                .map_err(|e| SubmitError::Transport(e.to_string()))?,
        );

        let mut guard = shared.chain.lock().await;
        let chain = &mut *guard;
        if chain.deals.contains_key(&handle) || chain.incoming.contains(&handle) {
            return Ok(handle);
        }
        chain.incoming.push(handle);
        chain.deals.insert(
            handle,
            DealRecord {
                proposal: proposal.clone(),
                state: DealState::Validating,
                message: String::new(),
                size: 0,
                since: chain.epoch,
            },
        );
        debug!("Deal {} queued for provider at epoch {}", handle, chain.epoch);

        Ok(handle)
    }

    async fn deal_info(&self, handle: &DealHandle) -> Result<Option<DealInfo>, ApiError> {
        let chain = self.shared.chain.lock().await;
        if chain.incoming.contains(handle) {
            return Ok(None);
        }

        Ok(chain.deals.get(handle).map(|deal| DealInfo {
            handle: *handle,
            state: deal.state,
            message: deal.message.clone(),
            provider: deal.proposal.provider.clone(),
            data_root: deal.proposal.data_root,
            size: deal.size,
            price_per_epoch: deal.proposal.price_per_epoch,
            duration: deal.proposal.min_duration,
            epoch: chain.epoch,
        }))
    }
}

#[async_trait]
impl RetrievalApi for DevClient {
    async fn find_offers(&self, root: &Cid) -> Result<Vec<RetrievalOffer>, RetrievalError> {
        let shared = &self.shared;
        if shared.active_deal_for(root).await.is_none() {
            return Ok(Vec::new());
        }

        let data = unixfs::read_file(shared.provider_store.as_ref(), root)
            .await
            .map_err(|e| RetrievalError::Provider(e.to_string()))?;
        let size = data.len() as u64;

        Ok(vec![RetrievalOffer {
            root: *root,
            size,
            min_price: TokenAmount(shared.config.retrieval_price_per_byte.0 * u128::from(size)),
            payment_interval: PAYMENT_INTERVAL,
            provider: shared.config.provider_address.clone(),
            provider_peer: shared.provider_peer.peer_id,
        }])
    }

    async fn retrieve(&self, order: &RetrievalOrder, dest: &FileRef) -> Result<(), RetrievalError> {
        let shared = &self.shared;
        if order.provider != shared.config.provider_address {
            return Err(RetrievalError::Provider(format!(
                "unknown provider {}",
                order.provider
            )));
        }
        if shared.active_deal_for(&order.root).await.is_none() {
            return Err(RetrievalError::Provider(format!(
                "no active deal for {}",
                order.root
            )));
        }

        let store = shared.provider_store.as_ref();
        let mut body = if dest.is_archive {
            let blocks = unixfs::collect_blocks(store, &order.root)
                .await
                .map_err(|e| RetrievalError::Provider(e.to_string()))?;
            encode_archive(&[order.root], &blocks)
                .map_err(|e| RetrievalError::Provider(e.to_string()))?
        } else {
            unixfs::read_file(store, &order.root)
                .await
                .map_err(|e| RetrievalError::Provider(e.to_string()))?
        };

        if shared.config.behavior == ProviderBehavior::CorruptRetrieval {
            if let Some(last) = body.last_mut() {
                warn!("Corrupting retrieval of {}", order.root);
                *last ^= 0xff;
            }
        }

        tokio::fs::write(&dest.path, &body).await?;
        info!(
            "Served {} ({} bytes, archive={}) to {}",
            order.root,
            body.len(),
            dest.is_archive,
            order.client
        );
        Ok(())
    }
}

#[async_trait]
impl WalletApi for DevClient {
    async fn default_address(&self) -> Result<Address, ApiError> {
        Ok(self.shared.config.client_address.clone())
    }
}

#[async_trait]
impl PeeringApi for DevClient {
    async fn listen_addresses(&self) -> Result<PeerAddrInfo, ApiError> {
        Ok(self.shared.client_peer.clone())
    }

    async fn connect(&self, peer: &PeerAddrInfo) -> Result<(), ApiError> {
        if peer.peer_id == self.shared.provider_peer.peer_id {
            Ok(())
        } else {
            Err(ApiError::Unavailable(format!("unknown peer {}", peer.peer_id)))
        }
    }
}

/// Provider side of the dev network
pub struct DevProvider {
    shared: Arc<Shared>,
}

#[async_trait]
impl ChainApi for DevProvider {
    async fn produce_block(&self) -> Result<ProducedBlock, ApiError> {
        let shared = &self.shared;
        let mut chain = shared.chain.lock().await;

        chain.attempts += 1;
        let nth = shared.config.fail_every_nth_block;
        if nth != 0 && chain.attempts % nth == 0 {
            return Err(ApiError::Transport(format!(
                "block at epoch {} lost its election",
                chain.epoch + 1
            )));
        }

        chain.epoch += 1;
        let epoch = chain.epoch;
        let incoming: HashSet<DealHandle> = chain.incoming.drain(..).collect();

        for (handle, deal) in chain.deals.iter_mut() {
            if incoming.contains(handle) {
                debug!("Provider picked up deal {} at epoch {}", handle, epoch);
                deal.since = epoch;
                continue;
            }
            shared.advance(handle, deal, epoch).await;
        }

        Ok(ProducedBlock { epoch })
    }
}

#[async_trait]
impl ProviderApi for DevProvider {
    async fn actor_address(&self) -> Result<Address, ApiError> {
        Ok(self.shared.config.provider_address.clone())
    }
}

#[async_trait]
impl PeeringApi for DevProvider {
    async fn listen_addresses(&self) -> Result<PeerAddrInfo, ApiError> {
        Ok(self.shared.provider_peer.clone())
    }

    async fn connect(&self, peer: &PeerAddrInfo) -> Result<(), ApiError> {
        if peer.peer_id != self.shared.client_peer.peer_id {
            return Err(ApiError::Unavailable(format!("unknown peer {}", peer.peer_id)));
        }
        self.shared.links.lock().await.insert(peer.peer_id);
        debug!("Provider connected to {}", peer.peer_id);
        Ok(())
    }
}
