//! Content identifiers for blocks, file nodes and deal proposals
//!
//! Every identifier is a CIDv1 over a SHA-256 multihash. The codec says how
//! the addressed bytes are interpreted: raw leaf bytes, a file node, or a
//! JSON-encoded deal proposal.

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// sha2-256 multihash code
pub const SHA256_CODE: u64 = 0x12;

/// Raw leaf bytes
pub const RAW_CODEC: u64 = 0x55;

/// Protobuf file node (links + file metadata)
pub const DAG_PB_CODEC: u64 = 0x70;

/// JSON document (used for deal proposals)
pub const JSON_CODEC: u64 = 0x0200;

#[derive(Debug, Error)]
pub enum CidError {
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Unsupported multihash code 0x{0:x}")]
    UnsupportedHash(u64),

    #[error("Multihash error: {0}")]
    Multihash(String),
}

/// SHA-256 digest of `data`
pub fn sha256_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// CIDv1 of `data` under the given codec
pub fn cid_for(codec: u64, data: &[u8]) -> Result<Cid, CidError> {
    let digest = sha256_digest(data);
    let mh = Multihash::wrap(SHA256_CODE, &digest)
        .map_err(|e| CidError::Multihash(format!("Failed to wrap digest: {}", e)))?;
    Ok(Cid::new_v1(codec, mh))
}

/// CID of a raw leaf block
pub fn raw_cid(data: &[u8]) -> Result<Cid, CidError> {
    cid_for(RAW_CODEC, data)
}

/// Check that `data` hashes to the digest carried by `expected`.
///
/// The codec is taken from `expected`, so a file node and a raw leaf with the
/// same bytes verify against their own CIDs.
pub fn verify_cid(data: &[u8], expected: &Cid) -> Result<(), CidError> {
    let code = expected.hash().code();
    if code != SHA256_CODE {
        return Err(CidError::UnsupportedHash(code));
    }

    let computed = cid_for(expected.codec(), data)?;
    if &computed != expected {
        return Err(CidError::HashMismatch {
            expected: expected.to_string(),
            actual: computed.to_string(),
        });
    }

    Ok(())
}
