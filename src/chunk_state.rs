// chunk_state.rs
// Per-chunk download state. One entry per manifest index, always.

use crate::clock::Millis;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChunkState {
    /// Eligible for assignment
    Unrequested,
    /// In flight to `peer_id` since `requested_at`
    #[serde(rename_all = "camelCase")]
    Requested {
        peer_id: String,
        requested_at: Millis,
        timeout_ms: u64,
    },
    /// Verified and stored; terminal
    Received,
    /// Failed verification. `last_peer_id` is None when the failure was
    /// reported for a chunk that had no owner at the time.
    #[serde(rename_all = "camelCase")]
    Corrupted { last_peer_id: Option<String> },
}

impl ChunkState {
    pub fn is_received(&self) -> bool {
        matches!(self, ChunkState::Received)
    }

    pub fn is_requested(&self) -> bool {
        matches!(self, ChunkState::Requested { .. })
    }

    /// Unrequested and corrupted chunks can both be handed out
    pub fn is_assignable(&self) -> bool {
        matches!(self, ChunkState::Unrequested | ChunkState::Corrupted { .. })
    }

    /// Whether this chunk should be held back from `peer_id`
    pub fn was_corrupted_by(&self, peer_id: &str) -> bool {
        matches!(self, ChunkState::Corrupted { last_peer_id: Some(p) } if p == peer_id)
    }
}

#[derive(Debug, Clone)]
pub struct ChunkStateTable {
    states: Vec<ChunkState>,
    attempts: Vec<u32>,
    received: usize,
}

impl ChunkStateTable {
    pub fn new(len: usize) -> Self {
        Self {
            states: vec![ChunkState::Unrequested; len],
            attempts: vec![0; len],
            received: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&ChunkState> {
        self.states.get(index as usize)
    }

    /// Replace the state of `index`, returning the previous one.
    /// Panics on an out-of-range index; callers check bounds first.
    pub fn set(&mut self, index: u32, state: ChunkState) -> ChunkState {
        let now_received = state.is_received();
        let previous = std::mem::replace(&mut self.states[index as usize], state);
        match (previous.is_received(), now_received) {
            (false, true) => self.received += 1,
            (true, false) => self.received -= 1,
            _ => {}
        }
        previous
    }

    pub fn record_attempt(&mut self, index: u32) {
        if let Some(count) = self.attempts.get_mut(index as usize) {
            *count = count.saturating_add(1);
        }
    }

    pub fn states(&self) -> &[ChunkState] {
        &self.states
    }

    pub fn attempts(&self) -> &[u32] {
        &self.attempts
    }

    /// Indices of assignable chunks, ascending
    pub fn assignable(&self) -> Vec<u32> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_assignable())
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn received_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_received())
            .map(|(i, _)| i as u32)
    }

    pub fn count_received(&self) -> usize {
        self.received
    }

    pub fn count_requested(&self) -> usize {
        self.states.iter().filter(|s| s.is_requested()).count()
    }

    pub fn count_corrupted(&self) -> usize {
        self.states
            .iter()
            .filter(|s| matches!(s, ChunkState::Corrupted { .. }))
            .count()
    }

    pub fn count_requested_by(&self, peer_id: &str) -> usize {
        self.states
            .iter()
            .filter(|s| matches!(s, ChunkState::Requested { peer_id: p, .. } if p == peer_id))
            .count()
    }

    pub fn all_received(&self) -> bool {
        self.received == self.states.len()
    }
}
