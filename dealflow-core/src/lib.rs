//! Dealflow Core
//!
//! Client-side orchestration of a storage deal: import data into a
//! content-addressed store, propose a deal, keep the chain moving while the
//! deal is sealed, then retrieve the data and verify it byte for byte.

pub mod api;
pub mod archive;
pub mod block_producer;
pub mod chunker;
pub mod config;
pub mod content_id;
pub mod deal;
pub mod devnet;
pub mod importer;
pub mod initiator;
pub mod metrics;
pub mod monitor;
pub mod retrieval;
pub mod scenario;
pub mod storage;
pub mod unixfs;

pub use api::{Address, ClientNode, FileRef, PeerAddrInfo, ProviderNode, RetrievalOffer};
pub use archive::{
    decode_archive, decode_archive_limited, encode_archive, parse_archive, ArchiveError,
    DecodedArchive,
};
pub use block_producer::{BlockProducerLoop, ProducerSummary};
pub use chunker::{Chunker, DEFAULT_CHUNK_SIZE};
pub use config::{Config, ConfigError, StoreBackend};
pub use content_id::{cid_for, raw_cid, verify_cid, CidError};
pub use deal::{classify, Classification, DealHandle, DealInfo, DealProposal, DealState, TokenAmount};
pub use devnet::{DevNet, DevNetConfig, ProviderBehavior};
pub use importer::{ContentImporter, ImportError, ImportedFile, DEFAULT_FANOUT};
pub use initiator::{DealInitiator, InitiateError};
pub use metrics::Metrics;
pub use monitor::{DealStateMonitor, MonitorError, SettledDeal};
pub use retrieval::{Mismatch, RetrievalVerifier, VerifyError};
pub use scenario::{
    deterministic_payload, run_deal_flow_scenario, run_deal_flow_scenario_with_metrics,
    ScenarioConfig, ScenarioError, ScenarioReport,
};
pub use storage::{Block, BlockStore, ContentStore, MemoryBlockStore, StorageError};

// Re-export Cid for external use
pub use cid::Cid;
