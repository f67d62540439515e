// ledger.rs
// Requests currently in flight, keyed by chunk index.

use crate::clock::Millis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One assignment of a chunk to a peer, handed to the transport layer
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    pub chunk_index: u32,
    pub peer_id: String,
    pub requested_at: Millis,
    pub timeout_ms: u64,
}

impl ChunkRequest {
    pub fn deadline(&self) -> Millis {
        self.requested_at.saturating_add(self.timeout_ms)
    }

    /// Expired once strictly more than `timeout_ms` has elapsed
    pub fn is_expired(&self, now: Millis) -> bool {
        now.saturating_sub(self.requested_at) > self.timeout_ms
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestLedger {
    in_flight: BTreeMap<u32, ChunkRequest>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request, replacing any earlier one for the same chunk
    pub fn insert(&mut self, request: ChunkRequest) -> Option<ChunkRequest> {
        self.in_flight.insert(request.chunk_index, request)
    }

    pub fn remove(&mut self, chunk_index: u32) -> Option<ChunkRequest> {
        self.in_flight.remove(&chunk_index)
    }

    pub fn get(&self, chunk_index: u32) -> Option<&ChunkRequest> {
        self.in_flight.get(&chunk_index)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Requests in ascending chunk order
    pub fn iter(&self) -> impl Iterator<Item = &ChunkRequest> {
        self.in_flight.values()
    }

    /// Chunk indices whose requests have expired at `now`, ascending
    pub fn expired(&self, now: Millis) -> Vec<u32> {
        self.in_flight
            .values()
            .filter(|req| req.is_expired(now))
            .map(|req| req.chunk_index)
            .collect()
    }

    /// Chunk indices currently held by `peer_id`, ascending
    pub fn held_by(&self, peer_id: &str) -> Vec<u32> {
        self.in_flight
            .values()
            .filter(|req| req.peer_id == peer_id)
            .map(|req| req.chunk_index)
            .collect()
    }

    /// Earliest deadline among in-flight requests
    pub fn next_deadline(&self) -> Option<Millis> {
        self.in_flight.values().map(ChunkRequest::deadline).min()
    }
}
