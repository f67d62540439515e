// sim.rs
// In-memory swarm used by the swarm-sim binary and the integration tests.
//
// Every simulated peer serves the same file bytes with a fixed latency and a
// behaviour that decides whether the chunk arrives intact, corrupted, not at
// all, or only some of the time.

use crate::error::SchedulerResult;
use crate::ledger::ChunkRequest;
use crate::manifest::{ChunkDescriptor, Manifest};
use crate::transport::{outcome_for_bytes, ChunkTransport, TransferOutcome};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerBehavior {
    /// Always serves correct bytes
    Honest,
    /// Always serves bytes that fail verification
    Corrupting,
    /// Drops the connection with probability `failure_rate`
    Flaky { failure_rate: f64 },
    /// Never answers
    Unresponsive,
}

#[derive(Debug, Clone, Copy)]
struct SimPeer {
    behavior: PeerBehavior,
    latency_ms: u64,
}

pub struct SimulatedSwarm {
    data: Arc<Vec<u8>>,
    chunk_size: u32,
    peers: RwLock<HashMap<String, SimPeer>>,
    rng: Mutex<StdRng>,
    fetches: AtomicU64,
}

impl SimulatedSwarm {
    pub fn new(data: Vec<u8>, chunk_size: u32, seed: u64) -> Self {
        Self {
            data: Arc::new(data),
            chunk_size,
            peers: RwLock::new(HashMap::new()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            fetches: AtomicU64::new(0),
        }
    }

    /// Deterministic pseudo-random file contents
    pub fn random_file(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        data
    }

    pub fn manifest(&self) -> SchedulerResult<Manifest> {
        Manifest::from_bytes(&self.data, self.chunk_size)
    }

    pub fn add_peer(&self, peer_id: impl Into<String>, behavior: PeerBehavior, latency_ms: u64) {
        let mut peers = match self.peers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        peers.insert(
            peer_id.into(),
            SimPeer {
                behavior,
                latency_ms,
            },
        );
    }

    pub fn remove_peer(&self, peer_id: &str) -> bool {
        let mut peers = match self.peers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        peers.remove(peer_id).is_some()
    }

    /// Total number of fetches attempted against the swarm
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    fn lookup(&self, peer_id: &str) -> Option<SimPeer> {
        let peers = match self.peers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        peers.get(peer_id).copied()
    }

    fn roll(&self) -> f64 {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rng.gen::<f64>()
    }

    fn chunk_bytes(&self, descriptor: &ChunkDescriptor) -> Option<&[u8]> {
        let start = descriptor.index as usize * self.chunk_size as usize;
        let end = start.checked_add(descriptor.size as usize)?;
        self.data.get(start..end)
    }
}

#[async_trait]
impl ChunkTransport for SimulatedSwarm {
    async fn fetch(&self, request: &ChunkRequest, descriptor: &ChunkDescriptor) -> TransferOutcome {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let Some(peer) = self.lookup(&request.peer_id) else {
            return TransferOutcome::ConnectionFailed {
                reason: format!("peer {} is not reachable", request.peer_id),
            };
        };

        let started = Instant::now();
        let dropped = match peer.behavior {
            PeerBehavior::Flaky { failure_rate } => self.roll() < failure_rate,
            _ => false,
        };
        if peer.behavior == PeerBehavior::Unresponsive {
            debug!(peer_id = %request.peer_id, chunk_index = request.chunk_index, "Simulated peer not answering");
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(Duration::from_millis(peer.latency_ms)).await;

        if dropped {
            return TransferOutcome::ConnectionFailed {
                reason: "connection reset by peer".to_string(),
            };
        }
        let Some(bytes) = self.chunk_bytes(descriptor) else {
            warn!(chunk_index = descriptor.index, "Chunk outside simulated file");
            return TransferOutcome::ConnectionFailed {
                reason: "chunk out of range".to_string(),
            };
        };

        let elapsed = started.elapsed().as_millis() as u64;
        if peer.behavior == PeerBehavior::Corrupting {
            let mut tampered = bytes.to_vec();
            if let Some(first) = tampered.first_mut() {
                *first ^= 0xFF;
            }
            return outcome_for_bytes(descriptor, &tampered, elapsed);
        }
        outcome_for_bytes(descriptor, bytes, elapsed)
    }
}
