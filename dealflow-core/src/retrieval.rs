//! Retrieving stored data and checking it against the original

use cid::Cid;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{Address, FileRef, RetrievalApi, RetrievalError, RetrievalOffer};
use crate::archive::{self, ArchiveError};
use crate::metrics::Metrics;

const RAW_FILE: &str = "retrieved";
const ARCHIVE_FILE: &str = "retrieved.car";
const DECODED_FILE: &str = "retrieved-from-car";

/// Where retrieved bytes first diverge from the original
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected_len} bytes, got {actual_len}, first difference at byte {first_difference}")]
pub struct Mismatch {
    pub expected_len: usize,
    pub actual_len: usize,
    pub first_difference: usize,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("No retrieval offers found for {0}")]
    NoOffersFound(Cid),

    #[error("Retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode retrieved archive: {0}")]
    ArchiveDecode(#[from] ArchiveError),

    #[error("Retrieved data does not match: {0}")]
    Mismatch(#[from] Mismatch),
}

type Result<T> = std::result::Result<T, VerifyError>;

/// Exact byte comparison
pub fn compare(expected: &[u8], actual: &[u8]) -> std::result::Result<(), Mismatch> {
    if expected == actual {
        return Ok(());
    }

    let first_difference = expected
        .iter()
        .zip(actual)
        .position(|(a, b)| a != b)
        .unwrap_or_else(|| expected.len().min(actual.len()));

    Err(Mismatch {
        expected_len: expected.len(),
        actual_len: actual.len(),
        first_difference,
    })
}

/// A retrieval whose bytes matched
#[derive(Debug, Clone)]
pub struct VerifiedRetrieval {
    pub offer: RetrievalOffer,
    pub bytes: u64,
    /// File holding the flat bytes that were compared
    pub path: PathBuf,
    /// Blocks loaded from the archive, in archive mode
    pub archive_blocks: Option<usize>,
}

pub struct RetrievalVerifier {
    retrieval: Arc<dyn RetrievalApi>,
    scratch: PathBuf,
    metrics: Option<Metrics>,
}

impl RetrievalVerifier {
    /// Retrieved files are written under `scratch`, which must exist
    pub fn new(retrieval: Arc<dyn RetrievalApi>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            retrieval,
            scratch: scratch.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn discover_offers(&self, root: &Cid) -> Result<Vec<RetrievalOffer>> {
        let offers = self.retrieval.find_offers(root).await?;
        if offers.is_empty() {
            warn!("No retrieval offers for {}", root);
            return Err(VerifyError::NoOffersFound(*root));
        }
        debug!("Found {} retrieval offers for {}", offers.len(), root);
        Ok(offers)
    }

    /// Retrieve `root` as `payer` and compare the result with `expected`.
    ///
    /// With `archive` set the provider sends a CAR of the DAG, which is
    /// flattened back into a file before the comparison. The flattened file
    /// may not grow past `expected.len()` bytes.
    pub async fn verify(
        &self,
        root: &Cid,
        payer: &Address,
        expected: &[u8],
        archive: bool,
    ) -> Result<VerifiedRetrieval> {
        let offers = self.discover_offers(root).await?;
        let offer = offers[0].clone();
        let order = offer.order(payer);

        let dest = FileRef {
            path: self.scratch_path(if archive { ARCHIVE_FILE } else { RAW_FILE }),
            is_archive: archive,
        };
        info!(
            "Retrieving {} from {} ({} bytes, archive={})",
            root, offer.provider, offer.size, archive
        );
        self.retrieval.retrieve(&order, &dest).await?;

        let (path, archive_blocks) = if archive {
            let decoded = decode_to_file(
                &dest.path,
                &self.scratch_path(DECODED_FILE),
                expected.len(),
            )
            .await?;
            (self.scratch_path(DECODED_FILE), Some(decoded))
        } else {
            (dest.path.clone(), None)
        };

        let actual = tokio::fs::read(&path).await?;
        if let Err(mismatch) = compare(expected, &actual) {
            warn!("Retrieved data for {} differs: {}", root, mismatch);
            return Err(mismatch.into());
        }

        if let Some(metrics) = &self.metrics {
            metrics.retrieved(actual.len() as u64);
        }
        info!("Verified {} bytes retrieved for {}", actual.len(), root);

        Ok(VerifiedRetrieval {
            offer,
            bytes: actual.len() as u64,
            path,
            archive_blocks,
        })
    }

    fn scratch_path(&self, name: &str) -> PathBuf {
        self.scratch.join(name)
    }
}

/// Flatten the archive at `archive_path` into `out`, returning the number
/// of blocks it held
async fn decode_to_file(archive_path: &Path, out: &Path, limit: usize) -> Result<usize> {
    let bytes = tokio::fs::read(archive_path).await?;
    let decoded = archive::decode_archive_limited(&bytes, limit).await?;
    tokio::fs::write(out, &decoded.data).await?;
    debug!(
        "Decoded archive root {} into {} ({} bytes)",
        decoded.root,
        out.display(),
        decoded.data.len()
    );
    Ok(decoded.block_count)
}
