//! Transport adapter seam
//!
//! The scheduler never sees bytes. An adapter takes a [`ChunkRequest`],
//! moves the data over whatever session the peer connection uses, checks it
//! against the manifest digest and returns a [`TransferOutcome`], which the
//! driver feeds back into the scheduler.

use crate::ledger::ChunkRequest;
use crate::manifest::{chunk_digest, ChunkDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of one chunk transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferOutcome {
    /// Bytes arrived and matched the manifest digest
    Verified { response_time_ms: u64 },
    /// Bytes arrived but did not match
    ChecksumMismatch { expected: String, actual: String },
    /// The peer could not deliver (refused, reset, protocol error)
    ConnectionFailed { reason: String },
}

impl TransferOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, TransferOutcome::Verified { .. })
    }
}

#[async_trait]
pub trait ChunkTransport: Send + Sync + 'static {
    /// Fetch and verify one chunk. Implementations need not enforce
    /// `request.timeout_ms`; the driver bounds every call.
    async fn fetch(&self, request: &ChunkRequest, descriptor: &ChunkDescriptor)
        -> TransferOutcome;
}

/// Compare `bytes` against the descriptor's digest.
/// Returns `(expected, actual)` on mismatch.
pub fn verify_chunk_digest(
    descriptor: &ChunkDescriptor,
    bytes: &[u8],
) -> Result<(), (String, String)> {
    let actual = chunk_digest(bytes);
    if actual.eq_ignore_ascii_case(descriptor.digest.trim()) {
        Ok(())
    } else {
        Err((descriptor.digest.clone(), actual))
    }
}

/// Verify received bytes and build the matching outcome
pub fn outcome_for_bytes(
    descriptor: &ChunkDescriptor,
    bytes: &[u8],
    response_time_ms: u64,
) -> TransferOutcome {
    match verify_chunk_digest(descriptor, bytes) {
        Ok(()) => TransferOutcome::Verified { response_time_ms },
        Err((expected, actual)) => TransferOutcome::ChecksumMismatch { expected, actual },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    #[test]
    fn test_verify_chunk_digest() {
        let manifest = Manifest::from_bytes(b"hello world", 6).unwrap();
        let chunk = manifest.get(1).unwrap();

        assert!(verify_chunk_digest(chunk, b"world").is_ok());

        let (expected, actual) = verify_chunk_digest(chunk, b"w0rld").unwrap_err();
        assert_eq!(expected, chunk.digest);
        assert_eq!(actual, chunk_digest(b"w0rld"));
    }

    #[test]
    fn test_digest_comparison_ignores_case() {
        let mut chunk = Manifest::from_bytes(b"abc", 3).unwrap().chunks()[0].clone();
        chunk.digest = chunk.digest.to_uppercase();
        assert!(verify_chunk_digest(&chunk, b"abc").is_ok());
    }

    #[test]
    fn test_outcome_for_bytes() {
        let manifest = Manifest::from_bytes(b"abc", 3).unwrap();
        let chunk = manifest.get(0).unwrap();

        assert_eq!(
            outcome_for_bytes(chunk, b"abc", 12),
            TransferOutcome::Verified {
                response_time_ms: 12
            }
        );
        assert!(!outcome_for_bytes(chunk, b"abd", 12).is_verified());
    }
}
