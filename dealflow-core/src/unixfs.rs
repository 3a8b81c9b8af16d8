//! File DAG nodes and the reader that flattens them
//!
//! A file is a DAG whose leaves are raw blocks (codec 0x55) and whose inner
//! nodes are protobuf file nodes (codec 0x70). The wire layout follows the
//! usual dag-pb + unixfs pairing:
//!
//! ```protobuf
//! message PBLink { bytes Hash = 1; string Name = 2; uint64 Tsize = 3; }
//! message PBNode { bytes Data = 1; repeated PBLink Links = 2; }
//! message Data {
//!   uint32 Type = 1;          // 2 = file
//!   bytes Data = 2;           // inline bytes, emitted before children
//!   uint64 filesize = 3;
//!   repeated uint64 blocksizes = 4;  // file bytes under each link
//! }
//! ```
//!
//! The reader walks links in order, concatenates leaf bytes, checks every
//! declared size against what the subtree actually produced, and rejects a
//! block that links back into its own ancestry.

use cid::Cid;
use prost::Message as ProstMessage;
use std::collections::HashSet;
use thiserror::Error;
use tracing::trace;

use crate::content_id::{CidError, DAG_PB_CODEC, RAW_CODEC};
use crate::storage::{Block, ContentStore, StorageError};

/// unixfs `Type` value for file nodes
const FILE_KIND: u32 = 2;

#[derive(Debug, Error)]
pub enum UnixFsError {
    #[error("Block {0} is referenced but not available")]
    MissingBlock(Cid),

    #[error("Cycle detected: {0} links back to one of its ancestors")]
    Cycle(Cid),

    #[error("Malformed node: {0}")]
    Malformed(String),

    #[error("Block {cid} has unsupported codec 0x{codec:x}")]
    UnsupportedCodec { cid: Cid, codec: u64 },

    #[error("Size mismatch under {cid}: declared {declared} bytes, found {actual}")]
    SizeMismatch { cid: Cid, declared: u64, actual: u64 },

    #[error("File under {root} exceeds {limit} bytes")]
    TooLarge { root: Cid, limit: usize },

    #[error("CID error: {0}")]
    Cid(#[from] CidError),

    #[error("Storage error: {0}")]
    Store(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, UnixFsError>;

/// A child reference and the number of file bytes it contributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLink {
    pub cid: Cid,
    pub size: u64,
}

/// An inner file node: optional inline bytes followed by ordered children
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileNode {
    pub data: Vec<u8>,
    pub links: Vec<FileLink>,
}

impl FileNode {
    pub fn branch(links: Vec<FileLink>) -> Self {
        Self {
            data: Vec::new(),
            links,
        }
    }

    /// Total file bytes this node stands for, saturating at `u64::MAX`
    pub fn file_size(&self) -> u64 {
        self.checked_file_size().unwrap_or(u64::MAX)
    }

    /// Total file bytes, or `None` if the declared sizes overflow
    pub fn checked_file_size(&self) -> Option<u64> {
        self.links
            .iter()
            .try_fold(self.data.len() as u64, |total, l| total.checked_add(l.size))
    }

    pub fn encode(&self) -> Vec<u8> {
        let file = proto::FileData {
            kind: FILE_KIND,
            data: self.data.clone(),
            filesize: self.file_size(),
            blocksizes: self.links.iter().map(|l| l.size).collect(),
        };

        let node = proto::PbNode {
            data: file.encode_to_vec(),
            links: self
                .links
                .iter()
                .map(|l| proto::PbLink {
                    hash: l.cid.to_bytes(),
                    name: String::new(),
                    tsize: l.size,
                })
                .collect(),
        };

        node.encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let node = proto::PbNode::decode(bytes)
            .map_err(|e| UnixFsError::Malformed(format!("not a PBNode: {}", e)))?;
        let file = proto::FileData::decode(node.data.as_slice())
            .map_err(|e| UnixFsError::Malformed(format!("bad file data: {}", e)))?;

        if file.kind != FILE_KIND {
            return Err(UnixFsError::Malformed(format!(
                "node type {} is not a file",
                file.kind
            )));
        }
        if file.blocksizes.len() != node.links.len() {
            return Err(UnixFsError::Malformed(format!(
                "{} links but {} block sizes",
                node.links.len(),
                file.blocksizes.len()
            )));
        }

        let links = node
            .links
            .iter()
            .zip(&file.blocksizes)
            .map(|(link, &size)| {
                let cid = Cid::try_from(link.hash.as_slice())
                    .map_err(|e| UnixFsError::Malformed(format!("bad link hash: {}", e)))?;
                Ok(FileLink { cid, size })
            })
            .collect::<Result<Vec<_>>>()?;

        let decoded = Self {
            data: file.data,
            links,
        };
        let size = decoded.checked_file_size().ok_or_else(|| {
            UnixFsError::Malformed("block sizes overflow a 64-bit file size".into())
        })?;
        if size != file.filesize {
            return Err(UnixFsError::Malformed(format!(
                "filesize {} does not match contents {}",
                file.filesize, size
            )));
        }

        Ok(decoded)
    }

    pub fn to_block(&self) -> Result<Block> {
        Ok(Block::new(DAG_PB_CODEC, self.encode())?)
    }
}

enum Loaded {
    Leaf(Vec<u8>),
    Node(FileNode),
}

async fn load<S: ContentStore + ?Sized>(store: &S, cid: &Cid) -> Result<Loaded> {
    let block = store.get(cid).await.map_err(|e| match e {
        StorageError::BlockNotFound(missing) => UnixFsError::MissingBlock(missing),
        other => UnixFsError::Store(other),
    })?;

    match cid.codec() {
        RAW_CODEC => Ok(Loaded::Leaf(block.data)),
        DAG_PB_CODEC => FileNode::decode(&block.data)
            .map(Loaded::Node)
            .map_err(|e| match e {
                UnixFsError::Malformed(reason) => {
                    UnixFsError::Malformed(format!("{}: {}", cid, reason))
                }
                other => other,
            }),
        codec => Err(UnixFsError::UnsupportedCodec { cid: *cid, codec }),
    }
}

struct Frame {
    cid: Cid,
    links: Vec<FileLink>,
    next: usize,
    start: usize,
    declared: Option<u64>,
}

fn check_size(cid: Cid, declared: Option<u64>, actual: usize) -> Result<()> {
    match declared {
        Some(declared) if declared != actual as u64 => Err(UnixFsError::SizeMismatch {
            cid,
            declared,
            actual: actual as u64,
        }),
        _ => Ok(()),
    }
}

fn ensure_room(root: Cid, limit: usize, have: usize, more: usize) -> Result<()> {
    match have.checked_add(more) {
        Some(total) if total <= limit => Ok(()),
        _ => Err(UnixFsError::TooLarge { root, limit }),
    }
}

/// Reassemble the file rooted at `root`
pub async fn read_file<S: ContentStore + ?Sized>(store: &S, root: &Cid) -> Result<Vec<u8>> {
    read_file_limited(store, root, usize::MAX).await
}

/// Reassemble the file rooted at `root`, failing with
/// [`UnixFsError::TooLarge`] once it would grow past `limit` bytes.
///
/// Shared subtrees are read once per reference, so a small DAG can describe
/// a very large file.
pub async fn read_file_limited<S: ContentStore + ?Sized>(
    store: &S,
    root: &Cid,
    limit: usize,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut ancestry: HashSet<Cid> = HashSet::new();
    let mut pending = Some((*root, None));

    loop {
        if let Some((cid, declared)) = pending.take() {
            if ancestry.contains(&cid) {
                return Err(UnixFsError::Cycle(cid));
            }

            let start = out.len();
            match load(store, &cid).await? {
                Loaded::Leaf(bytes) => {
                    ensure_room(*root, limit, out.len(), bytes.len())?;
                    out.extend_from_slice(&bytes);
                    check_size(cid, declared, out.len() - start)?;
                }
                Loaded::Node(node) => {
                    trace!("Entering {} ({} links)", cid, node.links.len());
                    let remaining = usize::try_from(node.file_size()).unwrap_or(usize::MAX);
                    ensure_room(*root, limit, out.len(), remaining)?;
                    out.extend_from_slice(&node.data);
                    ancestry.insert(cid);
                    stack.push(Frame {
                        cid,
                        links: node.links,
                        next: 0,
                        start,
                        declared,
                    });
                }
            }
        }

        let Some(frame) = stack.last_mut() else {
            break;
        };

        match frame.links.get(frame.next).copied() {
            Some(link) => {
                frame.next += 1;
                pending = Some((link.cid, Some(link.size)));
            }
            None => {
                if let Some(done) = stack.pop() {
                    ancestry.remove(&done.cid);
                    check_size(done.cid, done.declared, out.len() - done.start)?;
                }
            }
        }
    }

    Ok(out)
}

/// Every block reachable from `root`, parents before children, each once
pub async fn collect_blocks<S: ContentStore + ?Sized>(store: &S, root: &Cid) -> Result<Vec<Block>> {
    let mut blocks = Vec::new();
    let mut seen = HashSet::new();
    let mut todo = vec![*root];

    while let Some(cid) = todo.pop() {
        if !seen.insert(cid) {
            continue;
        }

        let block = store.get(&cid).await.map_err(|e| match e {
            StorageError::BlockNotFound(missing) => UnixFsError::MissingBlock(missing),
            other => UnixFsError::Store(other),
        })?;

        if cid.codec() == DAG_PB_CODEC {
            let node = FileNode::decode(&block.data)?;
            // Reverse so the first link is popped first
            todo.extend(node.links.iter().rev().map(|l| l.cid));
        }
        blocks.push(block);
    }

    Ok(blocks)
}

/// Protobuf message definitions
pub(crate) mod proto {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct PbLink {
        #[prost(bytes, tag = "1")]
        pub hash: Vec<u8>,
        #[prost(string, tag = "2")]
        pub name: String,
        #[prost(uint64, tag = "3")]
        pub tsize: u64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct PbNode {
        #[prost(bytes, tag = "1")]
        pub data: Vec<u8>,
        #[prost(message, repeated, tag = "2")]
        pub links: Vec<PbLink>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct FileData {
        #[prost(uint32, tag = "1")]
        pub kind: u32,
        #[prost(bytes, tag = "2")]
        pub data: Vec<u8>,
        #[prost(uint64, tag = "3")]
        pub filesize: u64,
        #[prost(uint64, repeated, tag = "4")]
        pub blocksizes: Vec<u64>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlockStore;

    async fn leaf(store: &MemoryBlockStore, bytes: &[u8]) -> FileLink {
        let block = Block::new(RAW_CODEC, bytes.to_vec()).unwrap();
        let link = FileLink {
            cid: block.cid,
            size: bytes.len() as u64,
        };
        store.put(block).await.unwrap();
        link
    }

    async fn branch(store: &MemoryBlockStore, links: Vec<FileLink>) -> FileLink {
        let node = FileNode::branch(links);
        let size = node.file_size();
        let block = node.to_block().unwrap();
        let link = FileLink {
            cid: block.cid,
            size,
        };
        store.put(block).await.unwrap();
        link
    }

    #[test]
    fn test_node_encode_decode() {
        let a = crate::content_id::raw_cid(b"a").unwrap();
        let b = crate::content_id::raw_cid(b"bb").unwrap();
        let node = FileNode {
            data: b"inline".to_vec(),
            links: vec![FileLink { cid: a, size: 1 }, FileLink { cid: b, size: 2 }],
        };

        let decoded = FileNode::decode(&node.encode()).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.file_size(), 9);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            FileNode::decode(&[0xff, 0xff, 0xff]),
            Err(UnixFsError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_inconsistent_sizes() {
        let a = crate::content_id::raw_cid(b"a").unwrap();
        let file = proto::FileData {
            kind: FILE_KIND,
            data: Vec::new(),
            filesize: 1,
            blocksizes: vec![],
        };
        let node = proto::PbNode {
            data: file.encode_to_vec(),
            links: vec![proto::PbLink {
                hash: a.to_bytes(),
                name: String::new(),
                tsize: 1,
            }],
        };

        let err = FileNode::decode(&node.encode_to_vec()).unwrap_err();
        assert!(err.to_string().contains("1 links but 0 block sizes"));
    }

    #[tokio::test]
    async fn test_read_nested_file_in_link_order() {
        let store = MemoryBlockStore::new();
        let l1 = leaf(&store, b"alpha-").await;
        let l2 = leaf(&store, b"beta-").await;
        let l3 = leaf(&store, b"gamma").await;
        let inner = branch(&store, vec![l1, l2]).await;
        let root = branch(&store, vec![inner, l3]).await;

        let bytes = read_file(&store, &root.cid).await.unwrap();
        assert_eq!(bytes, b"alpha-beta-gamma".to_vec());
    }

    #[tokio::test]
    async fn test_read_raw_root() {
        let store = MemoryBlockStore::new();
        let l = leaf(&store, b"just a leaf").await;

        assert_eq!(
            read_file(&store, &l.cid).await.unwrap(),
            b"just a leaf".to_vec()
        );
    }

    #[tokio::test]
    async fn test_shared_subtree_is_not_a_cycle() {
        let store = MemoryBlockStore::new();
        let l = leaf(&store, b"xy").await;
        let root = branch(&store, vec![l, l, l]).await;

        assert_eq!(read_file(&store, &root.cid).await.unwrap(), b"xyxyxy".to_vec());
    }

    #[test]
    fn test_decode_rejects_overflowing_sizes() {
        let a = crate::content_id::raw_cid(b"a").unwrap();
        let b = crate::content_id::raw_cid(b"b").unwrap();
        let node = FileNode {
            data: Vec::new(),
            links: vec![
                FileLink { cid: a, size: u64::MAX },
                FileLink { cid: b, size: 2 },
            ],
        };

        assert_eq!(node.checked_file_size(), None);
        assert_eq!(node.file_size(), u64::MAX);
        match FileNode::decode(&node.encode()) {
            Err(UnixFsError::Malformed(reason)) => assert!(reason.contains("overflow")),
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_limit_stops_shared_subtree_blowup() {
        // Each level references the one below twice, doubling the file
        let store = MemoryBlockStore::new();
        let mut link = leaf(&store, &[7u8; 64]).await;
        for _ in 0..20 {
            link = branch(&store, vec![link, link]).await;
        }
        assert_eq!(link.size, 64 << 20);

        match read_file_limited(&store, &link.cid, 4096).await {
            Err(UnixFsError::TooLarge { root, limit }) => {
                assert_eq!(root, link.cid);
                assert_eq!(limit, 4096);
            }
            other => panic!("Expected TooLarge, got {:?}", other.map(|v| v.len())),
        }
    }

    #[tokio::test]
    async fn test_limit_allows_exact_size() {
        let store = MemoryBlockStore::new();
        let l = leaf(&store, b"12345").await;
        let root = branch(&store, vec![l, l]).await;

        assert_eq!(
            read_file_limited(&store, &root.cid, 10).await.unwrap(),
            b"1234512345".to_vec()
        );
        assert!(matches!(
            read_file_limited(&store, &root.cid, 9).await,
            Err(UnixFsError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_child() {
        let store = MemoryBlockStore::new();
        let absent = crate::content_id::raw_cid(b"nowhere").unwrap();
        let root = branch(&store, vec![FileLink { cid: absent, size: 7 }]).await;

        match read_file(&store, &root.cid).await {
            Err(UnixFsError::MissingBlock(cid)) => assert_eq!(cid, absent),
            other => panic!("Expected MissingBlock, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_declared_size_must_match() {
        let store = MemoryBlockStore::new();
        let mut l = leaf(&store, b"four").await;
        l.size = 5;
        let root = branch(&store, vec![l]).await;

        assert!(matches!(
            read_file(&store, &root.cid).await,
            Err(UnixFsError::SizeMismatch {
                declared: 5,
                actual: 4,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cycle_is_rejected() {
        // Two nodes claiming each other as children. Content addressing makes
        // this impossible for honest blocks, so they are inserted unverified.
        let store = MemoryBlockStore::new();
        let a_cid = crate::content_id::cid_for(DAG_PB_CODEC, b"claimed a").unwrap();
        let b_cid = crate::content_id::cid_for(DAG_PB_CODEC, b"claimed b").unwrap();

        let a = FileNode::branch(vec![FileLink { cid: b_cid, size: 1 }]);
        let b = FileNode::branch(vec![FileLink { cid: a_cid, size: 1 }]);
        store.insert_unverified(a_cid, a.encode()).await;
        store.insert_unverified(b_cid, b.encode()).await;

        match read_file(&store, &a_cid).await {
            Err(UnixFsError::Cycle(cid)) => assert_eq!(cid, a_cid),
            other => panic!("Expected Cycle, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_self_link_is_rejected() {
        let store = MemoryBlockStore::new();
        let cid = crate::content_id::cid_for(DAG_PB_CODEC, b"self").unwrap();
        let node = FileNode::branch(vec![FileLink { cid, size: 0 }]);
        store.insert_unverified(cid, node.encode()).await;

        assert!(matches!(
            read_file(&store, &cid).await,
            Err(UnixFsError::Cycle(_))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_codec() {
        let store = MemoryBlockStore::new();
        let block = Block::new(crate::content_id::JSON_CODEC, b"{}".to_vec()).unwrap();
        let cid = block.cid;
        store.put(block).await.unwrap();

        assert!(matches!(
            read_file(&store, &cid).await,
            Err(UnixFsError::UnsupportedCodec { codec: 0x0200, .. })
        ));
    }

    #[tokio::test]
    async fn test_collect_blocks_parents_first_deduplicated() {
        let store = MemoryBlockStore::new();
        let l1 = leaf(&store, b"one").await;
        let l2 = leaf(&store, b"two").await;
        let inner = branch(&store, vec![l1, l2]).await;
        let root = branch(&store, vec![inner, l1]).await;

        let cids: Vec<Cid> = collect_blocks(&store, &root.cid)
            .await
            .unwrap()
            .iter()
            .map(|b| b.cid)
            .collect();

        assert_eq!(cids, vec![root.cid, inner.cid, l1.cid, l2.cid]);
    }
}
