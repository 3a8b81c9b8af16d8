//! Importing a byte stream into a content store as a file DAG
//!
//! The stream is cut into fixed-size raw leaves, then file nodes are built
//! layer by layer, each holding up to `fanout` links, until one root is
//! left. The layout is a pure function of the bytes, the chunk size and the
//! fan-out, so re-importing the same data yields the same root CID.

use cid::Cid;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::chunker::{Chunker, DEFAULT_CHUNK_SIZE};
use crate::content_id::{CidError, RAW_CODEC};
use crate::storage::{Block, ContentStore, StorageError};
use crate::unixfs::{FileLink, FileNode, UnixFsError};

/// Links per file node
pub const DEFAULT_FANOUT: usize = 174;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Failed to read input: {0}")]
    Read(#[from] std::io::Error),

    #[error("Content store rejected block: {0}")]
    Store(#[from] StorageError),

    #[error("CID error: {0}")]
    Cid(#[from] CidError),

    #[error("Failed to build file node: {0}")]
    Node(#[from] UnixFsError),
}

/// Outcome of a successful import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportedFile {
    pub root: Cid,
    pub size: u64,
    pub blocks: usize,
}

pub struct ContentImporter<S: ContentStore + ?Sized> {
    store: Arc<S>,
    chunk_size: usize,
    fanout: usize,
}

impl<S: ContentStore + ?Sized> ContentImporter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_layout(store, DEFAULT_CHUNK_SIZE, DEFAULT_FANOUT)
    }

    pub fn with_layout(store: Arc<S>, chunk_size: usize, fanout: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be greater than 0");
        assert!(fanout >= 2, "fanout must be at least 2");
        Self {
            store,
            chunk_size,
            fanout,
        }
    }

    /// Read `reader` to the end and store it as a file DAG.
    ///
    /// Blocks stored before a failure stay in the store, but no root is
    /// reported for an incomplete import.
    pub async fn import<R: AsyncRead + Unpin + Send>(
        &self,
        reader: R,
    ) -> Result<ImportedFile, ImportError> {
        let mut chunker = Chunker::with_chunk_size(reader, self.chunk_size);
        let mut layer = Vec::new();
        let mut blocks = 0;

        while let Some(chunk) = chunker.next_chunk().await? {
            let size = chunk.len() as u64;
            let block = Block::new(RAW_CODEC, chunk)?;
            let cid = block.cid;
            self.store.put(block).await?;
            layer.push(FileLink { cid, size });
            blocks += 1;
        }

        let size = chunker.bytes_read();
        debug!("Chunked {} bytes into {} leaves", size, layer.len());

        let root = match layer.len() {
            0 => {
                blocks += 1;
                self.store_node(FileNode::default()).await?.cid
            }
            1 => layer[0].cid,
            _ => {
                while layer.len() > 1 {
                    let mut parents = Vec::with_capacity(layer.len().div_ceil(self.fanout));
                    for group in layer.chunks(self.fanout) {
                        parents.push(self.store_node(FileNode::branch(group.to_vec())).await?);
                        blocks += 1;
                    }
                    layer = parents;
                }
                layer[0].cid
            }
        };

        info!("Imported {} bytes as {} ({} blocks)", size, root, blocks);
        Ok(ImportedFile { root, size, blocks })
    }

    async fn store_node(&self, node: FileNode) -> Result<FileLink, ImportError> {
        let size = node.file_size();
        let block = node.to_block()?;
        let cid = block.cid;
        self.store.put(block).await?;
        Ok(FileLink { cid, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::DAG_PB_CODEC;
    use crate::storage::{MemoryBlockStore, StoreStats};
    use crate::unixfs::read_file;
    use async_trait::async_trait;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_single_chunk_root_is_the_leaf() {
        let store = Arc::new(MemoryBlockStore::new());
        let importer = ContentImporter::new(store.clone());
        let data = payload(600);

        let file = importer.import(&data[..]).await.unwrap();

        assert_eq!(file.root.codec(), RAW_CODEC);
        assert_eq!(file.size, 600);
        assert_eq!(file.blocks, 1);
        assert_eq!(read_file(store.as_ref(), &file.root).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_multi_level_layout() {
        let store = Arc::new(MemoryBlockStore::new());
        let importer = ContentImporter::with_layout(store.clone(), 10, 3);
        let data = payload(95);

        let file = importer.import(&data[..]).await.unwrap();

        // 10 leaves -> 4 nodes -> 2 nodes -> 1 root
        assert_eq!(file.root.codec(), DAG_PB_CODEC);
        assert_eq!(file.blocks, 10 + 4 + 2 + 1);
        assert_eq!(store.len().await, 17);
        assert_eq!(read_file(store.as_ref(), &file.root).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_import_is_deterministic() {
        let data = payload(4096);

        let a = ContentImporter::with_layout(Arc::new(MemoryBlockStore::new()), 256, 4)
            .import(&data[..])
            .await
            .unwrap();
        let b = ContentImporter::with_layout(Arc::new(MemoryBlockStore::new()), 256, 4)
            .import(&data[..])
            .await
            .unwrap();
        let other_layout = ContentImporter::with_layout(Arc::new(MemoryBlockStore::new()), 512, 4)
            .import(&data[..])
            .await
            .unwrap();

        assert_eq!(a.root, b.root);
        assert_ne!(a.root, other_layout.root);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let store = Arc::new(MemoryBlockStore::new());
        let file = ContentImporter::new(store.clone())
            .import(&b""[..])
            .await
            .unwrap();

        assert_eq!(file.size, 0);
        assert_eq!(file.root.codec(), DAG_PB_CODEC);
        assert!(read_file(store.as_ref(), &file.root).await.unwrap().is_empty());
    }

    struct FailingReader {
        served: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.served {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream cut")))
            } else {
                self.served = true;
                let n = buf.remaining().min(7);
                buf.put_slice(&b"partial"[..n]);
                Poll::Ready(Ok(()))
            }
        }
    }

    #[tokio::test]
    async fn test_read_failure_yields_no_root() {
        let importer = ContentImporter::with_layout(Arc::new(MemoryBlockStore::new()), 4, 2);

        let result = importer.import(FailingReader { served: false }).await;
        assert!(matches!(result, Err(ImportError::Read(_))));
    }

    struct UnreachableStore;

    #[async_trait]
    impl ContentStore for UnreachableStore {
        async fn put(&self, _block: Block) -> crate::storage::Result<()> {
            Err(StorageError::IoError(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "store offline",
            )))
        }

        async fn get(&self, cid: &Cid) -> crate::storage::Result<Block> {
            Err(StorageError::BlockNotFound(*cid))
        }

        async fn has(&self, _cid: &Cid) -> crate::storage::Result<bool> {
            Ok(false)
        }

        async fn stats(&self) -> crate::storage::Result<StoreStats> {
            Ok(StoreStats::default())
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let importer = ContentImporter::new(Arc::new(UnreachableStore));

        let result = importer.import(&b"data"[..]).await;
        assert!(matches!(result, Err(ImportError::Store(_))));
    }
}
