//! Content-addressed block storage
//!
//! Two backends implement [`ContentStore`]: a RocksDB-backed persistent
//! store for node data directories, and an in-memory store used for scratch
//! work such as decoding a retrieved archive.

use async_trait::async_trait;
use cid::Cid;
use rocksdb::{Options, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::content_id::{cid_for, verify_cid, CidError};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Block not found: {0}")]
    BlockNotFound(Cid),

    #[error("CID verification failed: {0}")]
    VerificationFailed(#[from] CidError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[error("Stored key is not a CID: {0}")]
    CorruptKey(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A block with its CID and data
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Block {
    /// Hash `data` under `codec` and wrap it as a block
    pub fn new(codec: u64, data: Vec<u8>) -> std::result::Result<Self, CidError> {
        let cid = cid_for(codec, &data)?;
        Ok(Self { cid, data })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Block count and byte total of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub block_count: usize,
    pub total_size: usize,
}

/// The content-addressed store a node exposes to this client.
///
/// `put` verifies the block's CID and is idempotent.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, block: Block) -> Result<()>;

    async fn get(&self, cid: &Cid) -> Result<Block>;

    async fn has(&self, cid: &Cid) -> Result<bool>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// RocksDB-backed persistent block store keyed by binary CID
pub struct BlockStore {
    db: Arc<DB>,
    // Keeps a scratch directory alive for stores created by `temporary`
    _scratch: Option<TempDir>,
}

impl BlockStore {
    /// Open (or create) a store under `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        std::fs::create_dir_all(path.as_ref())?;
        let db = Self::open_db(path.as_ref())?;
        info!("Opened RocksDB block store at {:?}", path.as_ref());
        Ok(Self {
            db: Arc::new(db),
            _scratch: None,
        })
    }

    /// Open a store in a fresh temporary directory, removed on drop
    pub fn temporary() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("dealflow-store-").tempdir()?;
        let db = Self::open_db(dir.path())?;
        debug!("Opened scratch block store at {:?}", dir.path());
        Ok(Self {
            db: Arc::new(db),
            _scratch: Some(dir),
        })
    }

    fn open_db(path: &Path) -> Result<DB> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        // CID -> block lookups are point reads
        opts.optimize_for_point_lookup(64);

        // Leaf blocks are opaque payload bytes
        opts.set_compression_type(rocksdb::DBCompressionType::None);

        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(2);
        opts.set_write_buffer_size(16 * 1024 * 1024);

        Ok(DB::open(&opts, path)?)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&DB) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(db.as_ref()))
            .await
            .map_err(|e| StorageError::IoError(std::io::Error::other(e.to_string())))?
    }
}

#[async_trait]
impl ContentStore for BlockStore {
    async fn put(&self, block: Block) -> Result<()> {
        verify_cid(&block.data, &block.cid)?;

        let cid = block.cid;
        let size = block.data.len();
        let stored = self
            .blocking(move |db| {
                let key = block.cid.to_bytes();
                if db.get_pinned(&key)?.is_some() {
                    return Ok(false);
                }
                db.put(&key, &block.data)?;
                Ok(true)
            })
            .await?;

        if stored {
            debug!("Stored block {}, size: {} bytes", cid, size);
        } else {
            debug!("Block already present: {}", cid);
        }
        Ok(())
    }

    async fn get(&self, cid: &Cid) -> Result<Block> {
        let cid = *cid;
        let data = self
            .blocking(move |db| Ok(db.get(cid.to_bytes())?))
            .await?
            .ok_or(StorageError::BlockNotFound(cid))?;

        Ok(Block { cid, data })
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        let key = cid.to_bytes();
        self.blocking(move |db| Ok(db.get_pinned(&key)?.is_some()))
            .await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.blocking(|db| {
            let mut stats = StoreStats::default();
            for entry in db.iterator(rocksdb::IteratorMode::Start) {
                let (key, value) = entry?;
                Cid::try_from(&key[..])
                    .map_err(|e| StorageError::CorruptKey(e.to_string()))?;
                stats.block_count += 1;
                stats.total_size += value.len();
            }
            Ok(stats)
        })
        .await
    }
}

/// In-memory block store
#[derive(Clone, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<HashMap<Cid, Vec<u8>>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a block without re-hashing it.
    ///
    /// Used when loading an archive, whose blocks are taken at their word and
    /// only judged by the bytes they reconstruct.
    pub async fn insert_unverified(&self, cid: Cid, data: Vec<u8>) {
        self.blocks.write().await.insert(cid, data);
    }

    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blocks.read().await.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryBlockStore {
    async fn put(&self, block: Block) -> Result<()> {
        verify_cid(&block.data, &block.cid)?;
        self.blocks
            .write()
            .await
            .entry(block.cid)
            .or_insert(block.data);
        Ok(())
    }

    async fn get(&self, cid: &Cid) -> Result<Block> {
        self.blocks
            .read()
            .await
            .get(cid)
            .map(|data| Block {
                cid: *cid,
                data: data.clone(),
            })
            .ok_or(StorageError::BlockNotFound(*cid))
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.blocks.read().await.contains_key(cid))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let blocks = self.blocks.read().await;
        Ok(StoreStats {
            block_count: blocks.len(),
            total_size: blocks.values().map(Vec::len).sum(),
        })
    }
}
