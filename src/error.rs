// error.rs
// Error types surfaced by the scheduler and the download driver.
//
// Only programmer-error conditions are errors here. Timeouts, corrupted
// chunks and peer churn are ordinary state transitions inside the scheduler.

/// Errors returned by [`crate::scheduler::Scheduler`] operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("A download session is already active")]
    AlreadyActive,

    #[error("Unknown chunk index {index} (manifest has {total} chunks)")]
    UnknownChunk { index: u32, total: u32 },

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Chunk {index} was already received")]
    DuplicateOutcome { index: u32 },
}

/// Errors returned by [`crate::driver::DownloadDriver::run`]
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("No peers available: no progress possible for {stalled_ms} ms")]
    NoPeersAvailable { stalled_ms: u64 },

    #[error("Download cancelled")]
    Cancelled,

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
