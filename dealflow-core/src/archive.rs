//! CARv1 archives of a file DAG
//!
//! Layout:
//!
//! ```text
//! varint(len) || dag-cbor { "roots": [CID, ...], "version": 1 }
//! varint(len) || CID bytes || block data      (repeated)
//! ```
//!
//! Decoding loads every section into a scratch in-memory store, takes the
//! first root, and flattens the DAG under it with [`crate::unixfs::read_file`].
//! Section CIDs are not re-hashed; the reconstructed bytes are checked
//! against the original by the caller instead.

use cid::Cid;
use ipld_core::ipld::Ipld;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage::{Block, ContentStore, MemoryBlockStore};
use crate::unixfs::{self, UnixFsError};

pub const CAR_VERSION: u64 = 1;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive truncated: {0}")]
    Truncated(String),

    #[error("Invalid archive header: {0}")]
    InvalidHeader(String),

    #[error("Unsupported archive version {0}")]
    UnsupportedVersion(i128),

    #[error("Archive declares no root")]
    NoRoots,

    #[error("Root {0} is not contained in the archive")]
    RootMissing(Cid),

    #[error("Invalid section at offset {offset}: {reason}")]
    InvalidSection { offset: usize, reason: String },

    #[error("Failed to encode archive header: {0}")]
    Encode(String),

    #[error("Failed to rebuild file from archive: {0}")]
    Dag(#[from] UnixFsError),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// A parsed archive: declared roots plus blocks in section order
#[derive(Debug, Clone, PartialEq)]
pub struct Archive {
    pub roots: Vec<Cid>,
    pub blocks: Vec<Block>,
}

/// The flat file recovered from an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedArchive {
    pub root: Cid,
    pub data: Vec<u8>,
    pub block_count: usize,
}

fn put_varint(out: &mut Vec<u8>, value: u64) {
    let mut buf = unsigned_varint::encode::u64_buffer();
    out.extend_from_slice(unsigned_varint::encode::u64(value, &mut buf));
}

/// Read one varint-framed frame starting at `offset`, returning the frame
/// body and the offset just past it.
fn take_frame(bytes: &[u8], offset: usize) -> Result<(&[u8], usize)> {
    let input = &bytes[offset..];
    let (len, rest) = unsigned_varint::decode::u64(input).map_err(|e| {
        ArchiveError::Truncated(format!("bad length prefix at offset {}: {}", offset, e))
    })?;
    let header_len = input.len() - rest.len();
    let len = usize::try_from(len)
        .map_err(|_| ArchiveError::Truncated(format!("frame too large at offset {}", offset)))?;

    if rest.len() < len {
        return Err(ArchiveError::Truncated(format!(
            "frame at offset {} wants {} bytes, {} left",
            offset,
            len,
            rest.len()
        )));
    }

    Ok((&rest[..len], offset + header_len + len))
}

fn encode_header(roots: &[Cid]) -> Result<Vec<u8>> {
    let header = Ipld::Map(BTreeMap::from([
        (
            "roots".to_string(),
            Ipld::List(roots.iter().map(|cid| Ipld::Link(*cid)).collect()),
        ),
        ("version".to_string(), Ipld::Integer(CAR_VERSION as i128)),
    ]));

    serde_ipld_dagcbor::to_vec(&header).map_err(|e| ArchiveError::Encode(e.to_string()))
}

fn decode_header(bytes: &[u8]) -> Result<Vec<Cid>> {
    let header: Ipld = serde_ipld_dagcbor::from_slice(bytes)
        .map_err(|e| ArchiveError::InvalidHeader(e.to_string()))?;

    let Ipld::Map(fields) = header else {
        return Err(ArchiveError::InvalidHeader("header is not a map".into()));
    };

    match fields.get("version") {
        Some(Ipld::Integer(v)) if *v == CAR_VERSION as i128 => {}
        Some(Ipld::Integer(v)) => return Err(ArchiveError::UnsupportedVersion(*v)),
        _ => return Err(ArchiveError::InvalidHeader("missing version".into())),
    }

    let Some(Ipld::List(roots)) = fields.get("roots") else {
        return Err(ArchiveError::InvalidHeader("missing roots".into()));
    };

    roots
        .iter()
        .map(|root| match root {
            Ipld::Link(cid) => Ok(*cid),
            other => Err(ArchiveError::InvalidHeader(format!(
                "root is not a link: {:?}",
                other
            ))),
        })
        .collect()
}

/// Serialize `blocks` under `roots`
pub fn encode_archive(roots: &[Cid], blocks: &[Block]) -> Result<Vec<u8>> {
    let header = encode_header(roots)?;
    let body: usize = blocks.iter().map(|b| b.data.len() + 48).sum();

    let mut out = Vec::with_capacity(header.len() + body + 10);
    put_varint(&mut out, header.len() as u64);
    out.extend_from_slice(&header);

    for block in blocks {
        let cid = block.cid.to_bytes();
        put_varint(&mut out, (cid.len() + block.data.len()) as u64);
        out.extend_from_slice(&cid);
        out.extend_from_slice(&block.data);
    }

    Ok(out)
}

/// Parse the header and every section
pub fn parse_archive(bytes: &[u8]) -> Result<Archive> {
    if bytes.is_empty() {
        return Err(ArchiveError::Truncated("empty input".into()));
    }

    let (header, mut offset) = take_frame(bytes, 0)?;
    let roots = decode_header(header)?;

    let mut blocks = Vec::new();
    while offset < bytes.len() {
        let section_start = offset;
        let (section, next) = take_frame(bytes, offset)?;

        let mut rest = section;
        let cid = Cid::read_bytes(&mut rest).map_err(|e| ArchiveError::InvalidSection {
            offset: section_start,
            reason: e.to_string(),
        })?;

        blocks.push(Block {
            cid,
            data: rest.to_vec(),
        });
        offset = next;
    }

    debug!(
        "Parsed archive: {} roots, {} sections",
        roots.len(),
        blocks.len()
    );
    Ok(Archive { roots, blocks })
}

/// Rebuild the flat file held in an archive
pub async fn decode_archive(bytes: &[u8]) -> Result<DecodedArchive> {
    decode_archive_limited(bytes, usize::MAX).await
}

/// Rebuild the flat file held in an archive, refusing files longer than
/// `limit` bytes
pub async fn decode_archive_limited(bytes: &[u8], limit: usize) -> Result<DecodedArchive> {
    let archive = parse_archive(bytes)?;
    let root = *archive.roots.first().ok_or(ArchiveError::NoRoots)?;
    if archive.roots.len() > 1 {
        warn!(
            "Archive declares {} roots, using the first ({})",
            archive.roots.len(),
            root
        );
    }

    let store = MemoryBlockStore::new();
    for block in archive.blocks {
        store.insert_unverified(block.cid, block.data).await;
    }
    let block_count = store.len().await;

    if !store.has(&root).await.map_err(UnixFsError::from)? {
        return Err(ArchiveError::RootMissing(root));
    }

    let data = unixfs::read_file_limited(&store, &root, limit).await?;
    debug!(
        "Decoded {} bytes from archive root {} ({} blocks)",
        data.len(),
        root,
        block_count
    );

    Ok(DecodedArchive {
        root,
        data,
        block_count,
    })
}
