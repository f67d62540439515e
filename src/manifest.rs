// manifest.rs
// Immutable chunk layout of the file being downloaded.

use crate::error::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One chunk of the file: position, length and expected content digest.
///
/// The digest is opaque to the scheduler; transport adapters compare it
/// against the bytes they receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub index: u32,
    pub size: u32,
    pub digest: String,
}

/// Ordered chunk descriptors, indexed 0..len with no gaps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    chunks: Vec<ChunkDescriptor>,
}

/// Lowercase hex SHA-256 of `bytes`, the digest format `from_bytes` produces
pub fn chunk_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl Manifest {
    /// Validate and wrap a list of descriptors.
    ///
    /// Indices must be 0-based and contiguous in order, and every chunk must
    /// carry at least one byte.
    pub fn new(chunks: Vec<ChunkDescriptor>) -> SchedulerResult<Self> {
        if chunks.len() > u32::MAX as usize {
            return Err(SchedulerError::InvalidManifest(format!(
                "{} chunks exceed the u32 index space",
                chunks.len()
            )));
        }
        for (position, chunk) in chunks.iter().enumerate() {
            if chunk.index as usize != position {
                return Err(SchedulerError::InvalidManifest(format!(
                    "chunk at position {} has index {}",
                    position, chunk.index
                )));
            }
            if chunk.size == 0 {
                return Err(SchedulerError::InvalidManifest(format!(
                    "chunk {} is empty",
                    chunk.index
                )));
            }
        }
        Ok(Self { chunks })
    }

    /// Split `data` into `chunk_size` pieces and digest each one
    pub fn from_bytes(data: &[u8], chunk_size: u32) -> SchedulerResult<Self> {
        if chunk_size == 0 {
            return Err(SchedulerError::InvalidManifest(
                "chunk size must be non-zero".to_string(),
            ));
        }
        let chunks = data
            .chunks(chunk_size as usize)
            .enumerate()
            .map(|(index, piece)| ChunkDescriptor {
                index: index as u32,
                size: piece.len() as u32,
                digest: chunk_digest(piece),
            })
            .collect();
        Self::new(chunks)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&ChunkDescriptor> {
        self.chunks.get(index as usize)
    }

    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    pub fn total_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.size as u64).sum()
    }

    /// Byte offset of chunk `index` within the file
    pub fn chunk_offset(&self, index: u32) -> Option<u64> {
        if index as usize >= self.chunks.len() {
            return None;
        }
        Some(
            self.chunks[..index as usize]
                .iter()
                .map(|c| c.size as u64)
                .sum(),
        )
    }
}
