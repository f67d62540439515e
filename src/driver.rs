//! Host driving loop
//!
//! [`DownloadDriver`] owns the one repeating timer of a download. On every
//! tick it applies peer discovery events, feeds finished transfer outcomes
//! back into the scheduler, asks for the next batch of requests and spawns
//! one transport fetch per request. The scheduler itself stays synchronous
//! and timer-free; the lock is only taken between awaits.
//!
//! The loop ends when every chunk is received, when the caller cancels, or
//! when no peer is available and nothing is in flight for longer than
//! `stall_timeout_ms`.

use crate::config::DriverConfig;
use crate::error::{DriverError, SchedulerError};
use crate::ledger::ChunkRequest;
use crate::manifest::ChunkDescriptor;
use crate::peer_registry::PeerRecord;
use crate::scheduler::{Scheduler, SchedulerSnapshot};
use crate::shared::SharedScheduler;
use crate::transport::{ChunkTransport, TransferOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Changes reported by the peer discovery feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerEvent {
    Discovered {
        peer_id: String,
        max_concurrent: Option<u32>,
    },
    Gone {
        peer_id: String,
    },
    Health {
        peer_id: String,
        available: bool,
        response_time_ms: Option<u64>,
    },
}

/// Summary of a finished download
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadReport {
    pub total_chunks: usize,
    pub completed_chunks: usize,
    pub total_bytes: u64,
    pub requests_issued: u64,
    pub verified_reports: u64,
    pub corrupted_reports: u64,
    pub connection_failures: u64,
    /// Outcomes that arrived after their request had been reclaimed or
    /// reassigned
    pub stale_reports: u64,
    pub evicted_peers: Vec<String>,
    pub elapsed_ms: u64,
    pub peers: Vec<PeerRecord>,
}

#[derive(Debug, Default)]
struct DriveStats {
    requests_issued: u64,
    verified: u64,
    corrupted: u64,
    connection_failures: u64,
    stale: u64,
    evicted: Vec<String>,
}

pub struct DownloadDriver<T: ChunkTransport> {
    scheduler: SharedScheduler,
    transport: Arc<T>,
    config: DriverConfig,
}

impl<T: ChunkTransport> DownloadDriver<T> {
    pub fn new(scheduler: SharedScheduler, transport: Arc<T>, config: DriverConfig) -> Self {
        Self {
            scheduler,
            transport,
            config,
        }
    }

    pub fn scheduler(&self) -> &SharedScheduler {
        &self.scheduler
    }

    /// Drive the active session to completion.
    pub async fn run(
        &self,
        mut peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
        cancel: CancellationToken,
    ) -> Result<DownloadReport, DriverError> {
        let started = Instant::now();
        let (outcome_tx, mut outcome_rx) =
            mpsc::unbounded_channel::<(ChunkRequest, TransferOutcome)>();
        let mut tasks = JoinSet::new();
        let mut stats = DriveStats::default();
        let mut stalled_since: Option<Instant> = None;
        let mut last_completed = 0usize;

        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    info!("Download cancelled by caller");
                    return Err(DriverError::Cancelled);
                }
                _ = ticker.tick() => {}
            }

            if let Some(rx) = peer_events.as_mut() {
                while let Ok(event) = rx.try_recv() {
                    self.apply_peer_event(event);
                }
            }
            while let Ok((request, outcome)) = outcome_rx.try_recv() {
                self.apply_outcome(&request, outcome, &mut stats)?;
            }
            while tasks.try_join_next().is_some() {}
            self.evict_unreliable_peers(&mut stats);

            let batch_size = self.config.batch_size;
            let (batch, snapshot) = self.scheduler.with_mut(|s| {
                let batch = s.next_requests(batch_size);
                let batch = with_descriptors(s, batch);
                (batch, s.snapshot_state())
            });

            if snapshot.completed_chunks != last_completed {
                last_completed = snapshot.completed_chunks;
                info!(
                    completed = snapshot.completed_chunks,
                    total = snapshot.total_chunks,
                    progress_percent = snapshot.progress_percent(),
                    in_flight = snapshot.active_request_count,
                    "Download progress"
                );
            }

            if snapshot.is_complete() {
                tasks.abort_all();
                let report = self.build_report(&snapshot, stats, started);
                info!(
                    chunks = report.completed_chunks,
                    bytes = report.total_bytes,
                    elapsed_ms = report.elapsed_ms,
                    "Download complete"
                );
                return Ok(report);
            }

            if snapshot.is_stalled() && batch.is_empty() {
                let since = *stalled_since.get_or_insert_with(Instant::now);
                let stalled_ms = since.elapsed().as_millis() as u64;
                if stalled_ms >= self.config.stall_timeout_ms {
                    tasks.abort_all();
                    warn!(stalled_ms, "No peers available, giving up");
                    return Err(DriverError::NoPeersAvailable { stalled_ms });
                }
            } else {
                stalled_since = None;
            }

            for (request, descriptor) in batch {
                stats.requests_issued += 1;
                let transport = Arc::clone(&self.transport);
                let tx = outcome_tx.clone();
                tasks.spawn(async move {
                    let limit = Duration::from_millis(request.timeout_ms);
                    match tokio::time::timeout(limit, transport.fetch(&request, &descriptor)).await {
                        Ok(outcome) => {
                            let _ = tx.send((request, outcome));
                        }
                        Err(_) => {
                            // The scheduler reclaims the chunk on its own.
                            debug!(
                                chunk_index = request.chunk_index,
                                peer_id = %request.peer_id,
                                "Transfer exceeded its timeout"
                            );
                        }
                    }
                });
            }
        }
    }

    fn apply_peer_event(&self, event: PeerEvent) {
        self.scheduler.with_mut(|s| match event {
            PeerEvent::Discovered {
                peer_id,
                max_concurrent,
            } => s.enroll_peer(peer_id, max_concurrent),
            PeerEvent::Gone { peer_id } => {
                s.evict_peer(&peer_id);
            }
            PeerEvent::Health {
                peer_id,
                available,
                response_time_ms,
            } => s.update_peer_health(&peer_id, available, response_time_ms),
        });
    }

    fn apply_outcome(
        &self,
        request: &ChunkRequest,
        outcome: TransferOutcome,
        stats: &mut DriveStats,
    ) -> Result<(), DriverError> {
        let result = self.scheduler.with_mut(|s| {
            let current = s.active_request(request.chunk_index) == Some(request);
            match &outcome {
                TransferOutcome::Verified { response_time_ms } => {
                    s.report_success_from(
                        request.chunk_index,
                        &request.peer_id,
                        Some(*response_time_ms),
                    )?;
                    stats.verified += 1;
                    if !current {
                        stats.stale += 1;
                    }
                }
                TransferOutcome::ChecksumMismatch { expected, actual } => {
                    if !current {
                        stats.stale += 1;
                        return Ok(());
                    }
                    debug!(
                        chunk_index = request.chunk_index,
                        peer_id = %request.peer_id,
                        %expected,
                        %actual,
                        "Digest mismatch"
                    );
                    s.report_failure(request.chunk_index, true)?;
                    stats.corrupted += 1;
                }
                TransferOutcome::ConnectionFailed { reason } => {
                    if !current {
                        stats.stale += 1;
                        return Ok(());
                    }
                    debug!(
                        chunk_index = request.chunk_index,
                        peer_id = %request.peer_id,
                        %reason,
                        "Transfer failed"
                    );
                    s.report_failure(request.chunk_index, false)?;
                    stats.connection_failures += 1;
                }
            }
            Ok::<(), SchedulerError>(())
        });

        match result {
            Ok(()) => Ok(()),
            Err(SchedulerError::DuplicateOutcome { index }) => {
                debug!(chunk_index = index, "Late report for received chunk dropped");
                stats.stale += 1;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn evict_unreliable_peers(&self, stats: &mut DriveStats) {
        let Some(limit) = self.config.max_peer_failures else {
            return;
        };
        let evicted = self.scheduler.with_mut(|s| {
            let doomed: Vec<String> = s
                .list_peers()
                .into_iter()
                .filter(|p| p.failure_count >= limit)
                .map(|p| p.peer_id)
                .collect();
            for peer_id in &doomed {
                let released = s.evict_peer(peer_id);
                warn!(
                    peer_id = %peer_id,
                    failures = limit,
                    released = released.len(),
                    "Evicting unreliable peer"
                );
            }
            doomed
        });
        stats.evicted.extend(evicted);
    }

    fn build_report(
        &self,
        snapshot: &SchedulerSnapshot,
        stats: DriveStats,
        started: Instant,
    ) -> DownloadReport {
        DownloadReport {
            total_chunks: snapshot.total_chunks,
            completed_chunks: snapshot.completed_chunks,
            total_bytes: snapshot.total_bytes,
            requests_issued: stats.requests_issued,
            verified_reports: stats.verified,
            corrupted_reports: stats.corrupted,
            connection_failures: stats.connection_failures,
            stale_reports: stats.stale,
            evicted_peers: stats.evicted,
            elapsed_ms: started.elapsed().as_millis() as u64,
            peers: self.scheduler.with(Scheduler::list_peers),
        }
    }
}

fn with_descriptors(
    scheduler: &Scheduler,
    batch: Vec<ChunkRequest>,
) -> Vec<(ChunkRequest, ChunkDescriptor)> {
    let Some(manifest) = scheduler.manifest() else {
        return Vec::new();
    };
    batch
        .into_iter()
        .filter_map(|request| {
            let descriptor = manifest.get(request.chunk_index)?.clone();
            Some((request, descriptor))
        })
        .collect()
}
