//! Peers enrolled for the current download.
//!
//! The registry remembers enrollment order, which is the order the scheduler
//! walks when handing out chunks. Load (`pending_count`) is only changed
//! through [`PeerRegistry::acquire`] and [`PeerRegistry::release`] so that it
//! stays in step with the chunk table.

use crate::clock::Millis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub peer_id: String,
    pub available: bool,
    pub max_concurrent: u32,
    pub pending_count: u32,
    /// Exponential moving average; 0.0 until the first sample
    pub avg_response_time_ms: f64,
    pub failure_count: u32,
    pub last_seen: Millis,
    pub response_samples: u32,
}

impl PeerRecord {
    fn new(peer_id: String, max_concurrent: u32, now: Millis) -> Self {
        Self {
            peer_id,
            available: true,
            max_concurrent,
            pending_count: 0,
            avg_response_time_ms: 0.0,
            failure_count: 0,
            last_seen: now,
            response_samples: 0,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.pending_count < self.max_concurrent
    }

    /// Available with room for at least one more request
    pub fn is_eligible(&self) -> bool {
        self.available && self.has_capacity()
    }

    fn fold_response_time(&mut self, sample_ms: u64, weight: f64) {
        let sample = sample_ms as f64;
        if !sample.is_finite() {
            return;
        }
        if self.response_samples == 0 {
            self.avg_response_time_ms = sample;
        } else {
            self.avg_response_time_ms =
                self.avg_response_time_ms * (1.0 - weight) + sample * weight;
        }
        self.response_samples = self.response_samples.saturating_add(1);
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    order: Vec<String>,
    peers: HashMap<String, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer, or update the concurrency budget of a known one.
    /// Returns true when the peer is new.
    pub fn enroll(&mut self, peer_id: String, max_concurrent: u32, now: Millis) -> bool {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.max_concurrent = max_concurrent;
            peer.last_seen = now;
            return false;
        }
        self.order.push(peer_id.clone());
        self.peers
            .insert(peer_id.clone(), PeerRecord::new(peer_id, max_concurrent, now));
        true
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<PeerRecord> {
        let removed = self.peers.remove(peer_id)?;
        self.order.retain(|id| id != peer_id);
        Some(removed)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Set availability and fold an optional response-time sample.
    /// Returns false for unknown peers.
    pub fn update_health(
        &mut self,
        peer_id: &str,
        available: bool,
        response_time_ms: Option<u64>,
        weight: f64,
        now: Millis,
    ) -> bool {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return false;
        };
        peer.available = available;
        peer.last_seen = now;
        if let Some(rt) = response_time_ms {
            peer.fold_response_time(rt, weight);
        }
        true
    }

    /// Take one unit of the peer's concurrency budget
    pub fn acquire(&mut self, peer_id: &str) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.pending_count = peer.pending_count.saturating_add(1);
        }
    }

    /// Give back one unit of budget. A failed request also counts against
    /// the peer's reliability.
    pub fn release(&mut self, peer_id: &str, failed: bool) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.pending_count = peer.pending_count.saturating_sub(1);
            if failed {
                peer.failure_count = peer.failure_count.saturating_add(1);
            }
        }
    }

    /// Release one unit of budget after a success that took `sample_ms`
    pub fn release_success(&mut self, peer_id: &str, sample_ms: u64, weight: f64, now: Millis) {
        self.release(peer_id, false);
        self.record_response(peer_id, sample_ms, weight, now);
    }

    /// Fold a response-time sample without touching load
    pub fn record_response(&mut self, peer_id: &str, sample_ms: u64, weight: f64, now: Millis) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.last_seen = now;
            peer.fold_response_time(sample_ms, weight);
        }
    }

    /// Drop every peer's load, keeping the peers and their statistics
    pub fn reset_load(&mut self) {
        for peer in self.peers.values_mut() {
            peer.pending_count = 0;
        }
    }

    /// Ids of eligible peers, in enrollment order
    pub fn eligible(&self) -> Vec<String> {
        self.iter()
            .filter(|p| p.is_eligible())
            .map(|p| p.peer_id.clone())
            .collect()
    }

    /// Records in enrollment order
    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.order.iter().filter_map(|id| self.peers.get(id))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.peers.values().filter(|p| p.available).count()
    }
}
