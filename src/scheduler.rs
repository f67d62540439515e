//! Multi-seeder chunk download scheduler
//!
//! The scheduler decides which chunk to request from which peer. It owns the
//! manifest, the chunk state table, the in-flight request ledger and the peer
//! registry for one download, and it never performs I/O: the host polls
//! [`Scheduler::next_requests`], hands each [`ChunkRequest`] to a transport,
//! and reports the outcome back through [`Scheduler::report_success`] or
//! [`Scheduler::report_failure`].
//!
//! Two invariants hold after every operation:
//! - every manifest index has exactly one [`ChunkState`];
//! - each peer's `pending_count` equals the number of chunks `Requested`
//!   from it (and the number of ledger entries naming it).

use crate::chunk_state::{ChunkState, ChunkStateTable};
use crate::clock::{Clock, Millis, MonotonicClock};
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::ledger::{ChunkRequest, RequestLedger};
use crate::manifest::Manifest;
use crate::peer_registry::{PeerRecord, PeerRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Read-only view of a session's progress
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSnapshot {
    pub session_active: bool,
    pub chunk_states: Vec<ChunkState>,
    /// How many times each chunk has been handed to a peer
    pub chunk_attempts: Vec<u32>,
    pub completed_chunks: usize,
    pub total_chunks: usize,
    pub active_request_count: usize,
    pub corrupted_chunks: usize,
    pub available_peer_count: usize,
    pub total_peer_count: usize,
    pub bytes_received: u64,
    pub total_bytes: u64,
}

impl SchedulerSnapshot {
    pub fn is_complete(&self) -> bool {
        self.session_active && self.completed_chunks == self.total_chunks
    }

    /// No peer can be asked and nothing is outstanding: polling alone will
    /// never make progress.
    pub fn is_stalled(&self) -> bool {
        self.session_active
            && !self.is_complete()
            && self.available_peer_count == 0
            && self.active_request_count == 0
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.is_complete() { 100.0 } else { 0.0 };
        }
        (self.bytes_received as f64 / self.total_bytes as f64) * 100.0
    }
}

struct Session {
    manifest: Manifest,
    table: ChunkStateTable,
    ledger: RequestLedger,
    /// Peer whose request for the chunk last expired
    timed_out_by: HashMap<u32, String>,
}

impl Session {
    fn new(manifest: Manifest) -> Self {
        let table = ChunkStateTable::new(manifest.len());
        Self {
            manifest,
            table,
            ledger: RequestLedger::new(),
            timed_out_by: HashMap::new(),
        }
    }

    /// Whether `index` should go to some other peer than `peer_id`: the
    /// peer served it corrupted, or its last request for it expired.
    fn held_back_from(&self, index: u32, peer_id: &str) -> bool {
        let corrupted = self
            .table
            .get(index)
            .is_some_and(|state| state.was_corrupted_by(peer_id));
        corrupted || self.timed_out_by.get(&index).is_some_and(|p| p == peer_id)
    }

    fn assign(&mut self, request: &ChunkRequest) {
        self.table.set(
            request.chunk_index,
            ChunkState::Requested {
                peer_id: request.peer_id.clone(),
                requested_at: request.requested_at,
                timeout_ms: request.timeout_ms,
            },
        );
        self.table.record_attempt(request.chunk_index);
        self.timed_out_by.remove(&request.chunk_index);
        self.ledger.insert(request.clone());
    }

    fn bytes_received(&self) -> u64 {
        self.table
            .received_indices()
            .filter_map(|i| self.manifest.get(i))
            .map(|c| c.size as u64)
            .sum()
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    session: Option<Session>,
    peers: PeerRegistry,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: config.normalized(),
            clock,
            session: None,
            peers: PeerRegistry::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn now_ms(&self) -> Millis {
        self.clock.now_ms()
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Begin downloading `manifest`. Every chunk starts out unrequested.
    pub fn start_session(&mut self, manifest: Manifest) -> SchedulerResult<()> {
        if self.session.is_some() {
            return Err(SchedulerError::AlreadyActive);
        }
        info!(
            total_chunks = manifest.len(),
            total_bytes = manifest.total_bytes(),
            peers = self.peers.len(),
            "Starting download session"
        );
        self.session = Some(Session::new(manifest));
        Ok(())
    }

    /// Discard the current session. Enrolled peers stay, with their load
    /// cleared. Returns false when no session was active.
    pub fn end_session(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };
        self.peers.reset_load();
        info!(
            completed_chunks = session.table.count_received(),
            total_chunks = session.table.len(),
            abandoned_requests = session.ledger.len(),
            "Download session ended"
        );
        true
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.session.as_ref().map(|s| &s.manifest)
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    /// Enroll a peer, or update the concurrency budget of a known one
    /// without touching its load or statistics.
    pub fn enroll_peer(&mut self, peer_id: impl Into<String>, max_concurrent: Option<u32>) {
        let peer_id = peer_id.into();
        let max_concurrent = max_concurrent.unwrap_or(self.config.default_max_concurrent);
        let now = self.clock.now_ms();
        if self.peers.enroll(peer_id.clone(), max_concurrent, now) {
            info!(peer_id = %peer_id, max_concurrent, "Enrolled peer");
        } else {
            debug!(peer_id = %peer_id, max_concurrent, "Updated peer concurrency budget");
        }
    }

    /// Remove a peer and release every chunk it was holding. Unknown peers
    /// are ignored. Returns the released chunk indices.
    pub fn evict_peer(&mut self, peer_id: &str) -> Vec<u32> {
        if self.peers.remove(peer_id).is_none() {
            debug!(peer_id = %peer_id, "Eviction of unknown peer ignored");
            return Vec::new();
        }
        let mut released = Vec::new();
        if let Some(session) = self.session.as_mut() {
            released = session.ledger.held_by(peer_id);
            for &index in &released {
                session.ledger.remove(index);
                session.table.set(index, ChunkState::Unrequested);
            }
        }
        info!(peer_id = %peer_id, released = released.len(), "Evicted peer");
        released
    }

    pub fn update_peer_health(
        &mut self,
        peer_id: &str,
        available: bool,
        response_time_ms: Option<u64>,
    ) {
        let now = self.clock.now_ms();
        self.update_peer_health_at(now, peer_id, available, response_time_ms);
    }

    pub fn update_peer_health_at(
        &mut self,
        now: Millis,
        peer_id: &str,
        available: bool,
        response_time_ms: Option<u64>,
    ) {
        let weight = self.config.response_time_weight;
        if !self
            .peers
            .update_health(peer_id, available, response_time_ms, weight, now)
        {
            debug!(peer_id = %peer_id, "Health update for unknown peer ignored");
            return;
        }
        debug!(peer_id = %peer_id, available, ?response_time_ms, "Peer health updated");
    }

    // ------------------------------------------------------------------
    // Assignment
    // ------------------------------------------------------------------

    pub fn next_requests(&mut self, max_count: usize) -> Vec<ChunkRequest> {
        let now = self.clock.now_ms();
        self.next_requests_at(now, max_count)
    }

    /// Reclaim expired requests, then hand out up to `max_count` chunks.
    ///
    /// Eligible peers are walked round-robin in enrollment order, one chunk
    /// per step, lowest index first. A chunk that failed verification with a
    /// peer, or whose request to that peer expired, is not offered back to
    /// that peer while another eligible peer has room for it.
    pub fn next_requests_at(&mut self, now: Millis, max_count: usize) -> Vec<ChunkRequest> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        Self::reclaim_expired(session, &mut self.peers, now);

        let timeout_ms = self.config.chunk_timeout_ms;
        let mut candidates = session.table.assignable();
        let mut rotation = self.peers.eligible();
        let mut requests = Vec::new();

        while requests.len() < max_count && !rotation.is_empty() && !candidates.is_empty() {
            let mut assigned_this_pass = false;
            let mut slot = 0;
            while slot < rotation.len() {
                if requests.len() >= max_count || candidates.is_empty() {
                    break;
                }
                let peer_id = rotation[slot].clone();
                let only_peer = rotation.len() == 1;
                let pick = candidates
                    .iter()
                    .position(|&index| only_peer || !session.held_back_from(index, &peer_id));
                let Some(position) = pick else {
                    slot += 1;
                    continue;
                };

                let chunk_index = candidates.remove(position);
                let request = ChunkRequest {
                    chunk_index,
                    peer_id: peer_id.clone(),
                    requested_at: now,
                    timeout_ms,
                };
                session.assign(&request);
                self.peers.acquire(&peer_id);
                debug!(chunk_index, peer_id = %peer_id, "Assigned chunk");
                requests.push(request);
                assigned_this_pass = true;

                let saturated = self
                    .peers
                    .get(&peer_id)
                    .map_or(true, |peer| !peer.has_capacity());
                if saturated {
                    rotation.remove(slot);
                } else {
                    slot += 1;
                }
            }
            if !assigned_this_pass {
                break;
            }
        }

        if !requests.is_empty() {
            debug!(
                assigned = requests.len(),
                remaining = candidates.len(),
                "Produced chunk requests"
            );
        }
        requests
    }

    fn reclaim_expired(session: &mut Session, peers: &mut PeerRegistry, now: Millis) -> usize {
        let expired = session.ledger.expired(now);
        for &index in &expired {
            if let Some(request) = session.ledger.remove(index) {
                session.table.set(index, ChunkState::Unrequested);
                peers.release(&request.peer_id, true);
                session
                    .timed_out_by
                    .insert(index, request.peer_id.clone());
                warn!(
                    chunk_index = index,
                    peer_id = %request.peer_id,
                    timeout_ms = request.timeout_ms,
                    "Chunk request timed out, reclaiming"
                );
            }
        }
        expired.len()
    }

    // ------------------------------------------------------------------
    // Outcomes
    // ------------------------------------------------------------------

    pub fn report_success(&mut self, chunk_index: u32) -> SchedulerResult<()> {
        let now = self.clock.now_ms();
        self.report_success_at(now, chunk_index)
    }

    /// Mark a chunk as received and verified. When the chunk was in flight,
    /// its peer's load is released and the elapsed time is folded into the
    /// peer's response-time average.
    pub fn report_success_at(&mut self, now: Millis, chunk_index: u32) -> SchedulerResult<()> {
        self.complete_chunk(now, chunk_index, None)
    }

    pub fn report_success_from(
        &mut self,
        chunk_index: u32,
        peer_id: &str,
        response_time_ms: Option<u64>,
    ) -> SchedulerResult<()> {
        let now = self.clock.now_ms();
        self.report_success_from_at(now, chunk_index, peer_id, response_time_ms)
    }

    /// Mark a chunk delivered by `peer_id` as received.
    ///
    /// A measured `response_time_ms` is folded in place of the elapsed
    /// request time. If the chunk has meanwhile been reassigned, the current
    /// holder only gets its budget back and the sample is credited to
    /// `peer_id`.
    pub fn report_success_from_at(
        &mut self,
        now: Millis,
        chunk_index: u32,
        peer_id: &str,
        response_time_ms: Option<u64>,
    ) -> SchedulerResult<()> {
        self.complete_chunk(now, chunk_index, Some((peer_id, response_time_ms)))
    }

    fn complete_chunk(
        &mut self,
        now: Millis,
        chunk_index: u32,
        reporter: Option<(&str, Option<u64>)>,
    ) -> SchedulerResult<()> {
        let strict = self.config.strict_outcomes;
        let weight = self.config.response_time_weight;
        let session = Self::session_for(&mut self.session, chunk_index)?;

        if session.table.get(chunk_index).is_some_and(ChunkState::is_received) {
            if strict {
                return Err(SchedulerError::DuplicateOutcome { index: chunk_index });
            }
            debug!(chunk_index, "Duplicate success report ignored");
            return Ok(());
        }

        match (session.ledger.remove(chunk_index), reporter) {
            (Some(request), Some((peer_id, sample))) if request.peer_id != peer_id => {
                self.peers.release(&request.peer_id, false);
                if let Some(sample) = sample {
                    self.peers.record_response(peer_id, sample, weight, now);
                }
                debug!(
                    chunk_index,
                    peer_id = %peer_id,
                    superseded = %request.peer_id,
                    "Chunk received from an earlier holder"
                );
            }
            (Some(request), reporter) => {
                let elapsed = now.saturating_sub(request.requested_at);
                let sample = reporter.and_then(|(_, sample)| sample).unwrap_or(elapsed);
                self.peers
                    .release_success(&request.peer_id, sample, weight, now);
                debug!(
                    chunk_index,
                    peer_id = %request.peer_id,
                    response_time_ms = sample,
                    "Chunk received"
                );
            }
            (None, Some((peer_id, Some(sample)))) => {
                self.peers.record_response(peer_id, sample, weight, now);
                debug!(chunk_index, peer_id = %peer_id, "Chunk received without an active request");
            }
            (None, _) => {
                debug!(chunk_index, "Chunk received without an active request");
            }
        }
        session.timed_out_by.remove(&chunk_index);
        session.table.set(chunk_index, ChunkState::Received);

        if session.table.all_received() {
            info!(total_chunks = session.table.len(), "All chunks received");
        }
        Ok(())
    }

    /// Record a failed transfer. With `mark_corrupted` the chunk remembers the
    /// peer that served it so it is steered elsewhere; otherwise it simply
    /// becomes unrequested again.
    pub fn report_failure(&mut self, chunk_index: u32, mark_corrupted: bool) -> SchedulerResult<()> {
        let strict = self.config.strict_outcomes;
        let session = Self::session_for(&mut self.session, chunk_index)?;

        let previous = session.table.get(chunk_index).cloned();
        if previous.as_ref().is_some_and(ChunkState::is_received) {
            if strict {
                return Err(SchedulerError::DuplicateOutcome { index: chunk_index });
            }
            debug!(chunk_index, "Failure report for received chunk ignored");
            return Ok(());
        }

        let owner = session.ledger.remove(chunk_index).map(|request| {
            self.peers.release(&request.peer_id, true);
            request.peer_id
        });

        let next = if mark_corrupted {
            let last_peer_id = owner.or_else(|| match previous {
                Some(ChunkState::Corrupted { last_peer_id }) => last_peer_id,
                _ => None,
            });
            warn!(chunk_index, peer_id = ?last_peer_id, "Chunk failed verification");
            ChunkState::Corrupted { last_peer_id }
        } else {
            debug!(chunk_index, peer_id = ?owner, "Chunk transfer failed, requeueing");
            ChunkState::Unrequested
        };
        session.table.set(chunk_index, next);
        Ok(())
    }

    fn session_for(session: &mut Option<Session>, chunk_index: u32) -> SchedulerResult<&mut Session> {
        let Some(s) = session.as_mut() else {
            return Err(SchedulerError::UnknownChunk {
                index: chunk_index,
                total: 0,
            });
        };
        let total = s.table.len();
        if chunk_index as usize >= total {
            return Err(SchedulerError::UnknownChunk {
                index: chunk_index,
                total: total as u32,
            });
        }
        Ok(s)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Current state. Never reclaims expired requests.
    pub fn snapshot_state(&self) -> SchedulerSnapshot {
        let available_peer_count = self.peers.available_count();
        let total_peer_count = self.peers.len();
        match &self.session {
            Some(session) => SchedulerSnapshot {
                session_active: true,
                chunk_states: session.table.states().to_vec(),
                chunk_attempts: session.table.attempts().to_vec(),
                completed_chunks: session.table.count_received(),
                total_chunks: session.table.len(),
                active_request_count: session.table.count_requested(),
                corrupted_chunks: session.table.count_corrupted(),
                available_peer_count,
                total_peer_count,
                bytes_received: session.bytes_received(),
                total_bytes: session.manifest.total_bytes(),
            },
            None => SchedulerSnapshot {
                session_active: false,
                chunk_states: Vec::new(),
                chunk_attempts: Vec::new(),
                completed_chunks: 0,
                total_chunks: 0,
                active_request_count: 0,
                corrupted_chunks: 0,
                available_peer_count,
                total_peer_count,
                bytes_received: 0,
                total_bytes: 0,
            },
        }
    }

    /// True once every chunk of the active session is received
    pub fn is_complete(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.table.all_received())
    }

    pub fn chunk_state(&self, chunk_index: u32) -> Option<&ChunkState> {
        self.session.as_ref()?.table.get(chunk_index)
    }

    /// The in-flight request for `chunk_index`, if any
    pub fn active_request(&self, chunk_index: u32) -> Option<&ChunkRequest> {
        self.session.as_ref()?.ledger.get(chunk_index)
    }

    /// Peer currently holding `chunk_index`, if it is in flight
    pub fn assigned_peer(&self, chunk_index: u32) -> Option<&str> {
        self.active_request(chunk_index)
            .map(|req| req.peer_id.as_str())
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// Peers in enrollment order
    pub fn list_peers(&self) -> Vec<PeerRecord> {
        self.peers.iter().cloned().collect()
    }

    /// In-flight requests in ascending chunk order
    pub fn list_active_requests(&self) -> Vec<ChunkRequest> {
        self.session
            .as_ref()
            .map(|s| s.ledger.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Earliest moment an in-flight request can expire
    pub fn next_deadline(&self) -> Option<Millis> {
        self.session.as_ref()?.ledger.next_deadline()
    }

    /// Cross-check the chunk table, the ledger and peer load counters
    pub fn check_invariants(&self) -> Result<(), String> {
        let Some(session) = &self.session else {
            return match self.peers.iter().find(|p| p.pending_count != 0) {
                Some(p) => Err(format!(
                    "peer {} has {} pending requests without a session",
                    p.peer_id, p.pending_count
                )),
                None => Ok(()),
            };
        };

        if session.table.len() != session.manifest.len() {
            return Err("chunk table does not match manifest length".to_string());
        }
        if session.ledger.len() != session.table.count_requested() {
            return Err(format!(
                "ledger holds {} requests but {} chunks are requested",
                session.ledger.len(),
                session.table.count_requested()
            ));
        }
        for request in session.ledger.iter() {
            match session.table.get(request.chunk_index) {
                Some(ChunkState::Requested { peer_id, .. }) if *peer_id == request.peer_id => {}
                other => {
                    return Err(format!(
                        "ledger entry for chunk {} disagrees with table state {:?}",
                        request.chunk_index, other
                    ))
                }
            }
            if !self.peers.contains(&request.peer_id) {
                return Err(format!(
                    "chunk {} is held by unknown peer {}",
                    request.chunk_index, request.peer_id
                ));
            }
        }
        for peer in self.peers.iter() {
            let held = session.table.count_requested_by(&peer.peer_id);
            if held != peer.pending_count as usize {
                return Err(format!(
                    "peer {} has pending_count {} but holds {} chunks",
                    peer.peer_id, peer.pending_count, held
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn scheduler_with_chunks(chunks: usize) -> (Scheduler, ManualClock) {
        let clock = ManualClock::new(0);
        let mut scheduler = Scheduler::with_clock(
            SchedulerConfig {
                chunk_timeout_ms: 1000,
                ..Default::default()
            },
            Arc::new(clock.clone()),
        );
        let data = vec![0u8; chunks * 16];
        scheduler
            .start_session(Manifest::from_bytes(&data, 16).unwrap())
            .unwrap();
        (scheduler, clock)
    }

    fn assignments_for(requests: &[ChunkRequest], peer_id: &str) -> Vec<u32> {
        requests
            .iter()
            .filter(|r| r.peer_id == peer_id)
            .map(|r| r.chunk_index)
            .collect()
    }

    #[test]
    fn test_start_session_twice_fails() {
        let (mut scheduler, _) = scheduler_with_chunks(2);
        let manifest = Manifest::from_bytes(b"abcd", 2).unwrap();
        assert_eq!(
            scheduler.start_session(manifest.clone()),
            Err(SchedulerError::AlreadyActive)
        );

        assert!(scheduler.end_session());
        assert!(!scheduler.end_session());
        assert!(scheduler.start_session(manifest).is_ok());
    }

    #[test]
    fn test_no_peers_returns_empty() {
        let (mut scheduler, _) = scheduler_with_chunks(4);
        assert!(scheduler.next_requests(10).is_empty());
    }

    #[test]
    fn test_no_session_returns_empty_and_reports_fail() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.enroll_peer("a", None);
        assert!(scheduler.next_requests(4).is_empty());
        assert!(!scheduler.is_complete());
        assert_eq!(
            scheduler.report_success(0),
            Err(SchedulerError::UnknownChunk { index: 0, total: 0 })
        );
    }

    #[test]
    fn test_round_robin_even_split() {
        let (mut scheduler, _) = scheduler_with_chunks(6);
        for id in ["a", "b", "c"] {
            scheduler.enroll_peer(id, Some(3));
        }

        let requests = scheduler.next_requests(6);
        assert_eq!(requests.len(), 6);
        assert_eq!(assignments_for(&requests, "a"), vec![0, 3]);
        assert_eq!(assignments_for(&requests, "b"), vec![1, 4]);
        assert_eq!(assignments_for(&requests, "c"), vec![2, 5]);
        scheduler.check_invariants().unwrap();
    }

    #[test]
    fn test_respects_max_concurrent() {
        let (mut scheduler, _) = scheduler_with_chunks(10);
        scheduler.enroll_peer("a", Some(1));
        scheduler.enroll_peer("b", Some(2));

        let requests = scheduler.next_requests(10);
        assert_eq!(requests.len(), 3);
        assert_eq!(assignments_for(&requests, "a"), vec![0]);
        assert_eq!(assignments_for(&requests, "b"), vec![1, 2]);

        // Saturated: nothing more until something completes
        assert!(scheduler.next_requests(10).is_empty());
        scheduler.report_success(1).unwrap();
        let more = scheduler.next_requests(10);
        assert_eq!(more.len(), 1);
        assert_eq!(more[0].peer_id, "b");
        assert_eq!(more[0].chunk_index, 3);
    }

    #[test]
    fn test_unavailable_peer_is_skipped() {
        let (mut scheduler, _) = scheduler_with_chunks(4);
        scheduler.enroll_peer("a", None);
        scheduler.enroll_peer("b", None);
        scheduler.update_peer_health("a", false, None);

        let requests = scheduler.next_requests(4);
        assert!(requests.iter().all(|r| r.peer_id == "b"));
        assert_eq!(requests.len(), 3);
    }

    #[test]
    fn test_timeout_reclaims_and_reassigns_in_same_call() {
        let (mut scheduler, clock) = scheduler_with_chunks(1);
        scheduler.enroll_peer("a", None);

        clock.set(5_000);
        let first = scheduler.next_requests(1);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].requested_at, 5_000);

        clock.set(6_000);
        assert!(scheduler.next_requests(1).is_empty());

        clock.set(6_001);
        let second = scheduler.next_requests(1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].chunk_index, 0);
        assert_eq!(second[0].requested_at, 6_001);

        let peer = scheduler.peer("a").unwrap();
        assert_eq!(peer.failure_count, 1);
        assert_eq!(peer.pending_count, 1);
        assert_eq!(scheduler.snapshot_state().chunk_attempts, vec![2]);
        scheduler.check_invariants().unwrap();
    }

    #[test]
    fn test_timed_out_chunk_goes_to_another_peer() {
        let (mut scheduler, clock) = scheduler_with_chunks(1);
        scheduler.enroll_peer("silent", None);
        scheduler.enroll_peer("honest", None);

        let first = scheduler.next_requests(1);
        assert_eq!(first[0].peer_id, "silent");

        clock.advance(1_001);
        let second = scheduler.next_requests(1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].peer_id, "honest");

        // The honest peer times out too; the chunk may go back to silent
        clock.advance(1_001);
        let third = scheduler.next_requests(1);
        assert_eq!(third[0].peer_id, "silent");
        scheduler.check_invariants().unwrap();
    }

    #[test]
    fn test_snapshot_does_not_reclaim() {
        let (mut scheduler, clock) = scheduler_with_chunks(1);
        scheduler.enroll_peer("a", None);
        scheduler.next_requests(1);

        clock.set(10_000);
        let snapshot = scheduler.snapshot_state();
        assert_eq!(snapshot.active_request_count, 1);
        assert!(scheduler.chunk_state(0).unwrap().is_requested());
    }

    #[test]
    fn test_evict_releases_chunks_immediately() {
        let (mut scheduler, _) = scheduler_with_chunks(2);
        scheduler.enroll_peer("bad", Some(2));
        let requests = scheduler.next_requests(2);
        assert_eq!(assignments_for(&requests, "bad"), vec![0, 1]);

        scheduler.enroll_peer("good", Some(2));
        assert_eq!(scheduler.evict_peer("bad"), vec![0, 1]);
        assert!(scheduler.evict_peer("bad").is_empty());

        let requests = scheduler.next_requests(2);
        assert_eq!(assignments_for(&requests, "good"), vec![0, 1]);
        scheduler.check_invariants().unwrap();
    }

    #[test]
    fn test_corrupted_chunk_steered_to_other_peer() {
        let (mut scheduler, _) = scheduler_with_chunks(3);
        scheduler.enroll_peer("a", Some(1));
        let first = scheduler.next_requests(1);
        assert_eq!(first[0].chunk_index, 0);
        scheduler.report_failure(0, true).unwrap();
        assert_eq!(
            scheduler.chunk_state(0),
            Some(&ChunkState::Corrupted {
                last_peer_id: Some("a".to_string())
            })
        );

        scheduler.enroll_peer("b", Some(1));
        let requests = scheduler.next_requests(2);
        assert_eq!(assignments_for(&requests, "a"), vec![1]);
        assert_eq!(assignments_for(&requests, "b"), vec![0]);
        assert_eq!(scheduler.peer("a").unwrap().failure_count, 1);
    }

    #[test]
    fn test_corrupted_chunk_returns_to_sole_peer() {
        let (mut scheduler, _) = scheduler_with_chunks(1);
        scheduler.enroll_peer("a", None);
        scheduler.next_requests(1);
        scheduler.report_failure(0, true).unwrap();

        let retry = scheduler.next_requests(1);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].peer_id, "a");
    }

    #[test]
    fn test_plain_failure_requeues_without_stigma() {
        let (mut scheduler, _) = scheduler_with_chunks(1);
        scheduler.enroll_peer("a", None);
        scheduler.next_requests(1);
        scheduler.report_failure(0, false).unwrap();

        assert_eq!(scheduler.chunk_state(0), Some(&ChunkState::Unrequested));
        let peer = scheduler.peer("a").unwrap();
        assert_eq!(peer.pending_count, 0);
        assert_eq!(peer.failure_count, 1);
    }

    #[test]
    fn test_failure_on_unowned_chunk_keeps_previous_culprit() {
        let (mut scheduler, _) = scheduler_with_chunks(1);
        scheduler.enroll_peer("a", None);
        scheduler.next_requests(1);
        scheduler.report_failure(0, true).unwrap();
        scheduler.report_failure(0, true).unwrap();

        assert!(scheduler.chunk_state(0).unwrap().was_corrupted_by("a"));
        assert_eq!(scheduler.peer("a").unwrap().failure_count, 1);
    }

    #[test]
    fn test_success_is_idempotent_and_received_is_terminal() {
        let (mut scheduler, _) = scheduler_with_chunks(2);
        scheduler.report_success(0).unwrap();
        scheduler.report_success(0).unwrap();
        scheduler.report_failure(0, true).unwrap();

        assert_eq!(scheduler.chunk_state(0), Some(&ChunkState::Received));
        assert_eq!(scheduler.snapshot_state().completed_chunks, 1);
    }

    #[test]
    fn test_strict_mode_rejects_second_report() {
        let mut scheduler = Scheduler::new(SchedulerConfig {
            strict_outcomes: true,
            ..Default::default()
        });
        scheduler
            .start_session(Manifest::from_bytes(b"abcdef", 3).unwrap())
            .unwrap();

        scheduler.report_success(1).unwrap();
        assert_eq!(
            scheduler.report_success(1),
            Err(SchedulerError::DuplicateOutcome { index: 1 })
        );
        assert_eq!(
            scheduler.report_failure(1, false),
            Err(SchedulerError::DuplicateOutcome { index: 1 })
        );
    }

    #[test]
    fn test_unknown_chunk_rejected() {
        let (mut scheduler, _) = scheduler_with_chunks(3);
        assert_eq!(
            scheduler.report_success(3),
            Err(SchedulerError::UnknownChunk { index: 3, total: 3 })
        );
        assert_eq!(
            scheduler.report_failure(7, true),
            Err(SchedulerError::UnknownChunk { index: 7, total: 3 })
        );
    }

    #[test]
    fn test_success_updates_response_time() {
        let (mut scheduler, clock) = scheduler_with_chunks(1);
        scheduler.enroll_peer("a", None);
        clock.set(100);
        scheduler.next_requests(1);
        clock.set(350);
        scheduler.report_success(0).unwrap();

        let peer = scheduler.peer("a").unwrap();
        assert_eq!(peer.avg_response_time_ms, 250.0);
        assert_eq!(peer.pending_count, 0);
        assert_eq!(peer.last_seen, 350);
    }

    #[test]
    fn test_measured_sample_replaces_elapsed_time() {
        let (mut scheduler, clock) = scheduler_with_chunks(1);
        scheduler.enroll_peer("a", None);
        scheduler.next_requests(1);
        clock.set(400);
        scheduler.report_success_from(0, "a", Some(12)).unwrap();

        let peer = scheduler.peer("a").unwrap();
        assert_eq!(peer.avg_response_time_ms, 12.0);
        assert_eq!(peer.pending_count, 0);
        assert_eq!(peer.last_seen, 400);
    }

    #[test]
    fn test_late_success_from_earlier_holder() {
        let (mut scheduler, clock) = scheduler_with_chunks(1);
        scheduler.enroll_peer("a", None);
        scheduler.enroll_peer("b", None);
        scheduler.next_requests(1);

        clock.advance(1_001);
        let reassigned = scheduler.next_requests(1);
        assert_eq!(reassigned[0].peer_id, "b");

        scheduler.report_success_from(0, "a", Some(1_050)).unwrap();
        assert_eq!(scheduler.chunk_state(0), Some(&ChunkState::Received));

        let a = scheduler.peer("a").unwrap();
        assert_eq!(a.response_samples, 1);
        assert_eq!(a.avg_response_time_ms, 1_050.0);
        let b = scheduler.peer("b").unwrap();
        assert_eq!(b.pending_count, 0);
        assert_eq!(b.response_samples, 0);
        assert_eq!(b.failure_count, 0);
        scheduler.check_invariants().unwrap();
    }

    #[test]
    fn test_reenroll_keeps_load() {
        let (mut scheduler, _) = scheduler_with_chunks(4);
        scheduler.enroll_peer("a", Some(2));
        scheduler.next_requests(4);
        scheduler.enroll_peer("a", Some(4));

        let peer = scheduler.peer("a").unwrap();
        assert_eq!(peer.pending_count, 2);
        assert_eq!(peer.max_concurrent, 4);
        assert_eq!(scheduler.next_requests(4).len(), 2);
        scheduler.check_invariants().unwrap();
    }

    #[test]
    fn test_end_session_clears_peer_load() {
        let (mut scheduler, _) = scheduler_with_chunks(4);
        scheduler.enroll_peer("a", None);
        scheduler.next_requests(4);
        scheduler.end_session();

        assert_eq!(scheduler.peer("a").unwrap().pending_count, 0);
        assert!(scheduler.list_active_requests().is_empty());
        scheduler.check_invariants().unwrap();
    }

    #[test]
    fn test_snapshot_progress_and_stall() {
        let (mut scheduler, _) = scheduler_with_chunks(4);
        let snapshot = scheduler.snapshot_state();
        assert!(snapshot.is_stalled());
        assert_eq!(snapshot.progress_percent(), 0.0);

        scheduler.enroll_peer("a", None);
        assert!(!scheduler.snapshot_state().is_stalled());

        scheduler.report_success(0).unwrap();
        let snapshot = scheduler.snapshot_state();
        assert_eq!(snapshot.bytes_received, 16);
        assert_eq!(snapshot.total_bytes, 64);
        assert_eq!(snapshot.progress_percent(), 25.0);
    }

    #[test]
    fn test_empty_manifest_is_complete() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler
            .start_session(Manifest::from_bytes(&[], 16).unwrap())
            .unwrap();
        assert!(scheduler.is_complete());
        assert_eq!(scheduler.snapshot_state().progress_percent(), 100.0);
    }

    #[test]
    fn test_max_count_zero_still_reclaims() {
        let (mut scheduler, clock) = scheduler_with_chunks(1);
        scheduler.enroll_peer("a", None);
        scheduler.next_requests(1);
        clock.set(2_000);

        assert!(scheduler.next_requests(0).is_empty());
        assert_eq!(scheduler.chunk_state(0), Some(&ChunkState::Unrequested));
        assert_eq!(scheduler.peer("a").unwrap().pending_count, 0);
    }
}
