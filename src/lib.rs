//! Multi-seeder chunk download scheduling.
//!
//! A file is split into chunks described by a [`Manifest`]. Several untrusted
//! peers may hold copies; the [`Scheduler`] decides which chunk to request
//! from which peer, reclaims timed-out work and tracks progress. The
//! [`DownloadDriver`] is a ready-made host loop that polls the scheduler on
//! a tokio interval and runs transfers through a [`ChunkTransport`].

pub mod chunk_state;
pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod ledger;
pub mod manifest;
pub mod peer_registry;
pub mod scheduler;
pub mod shared;
pub mod sim;
pub mod transport;

pub use chunk_state::ChunkState;
pub use clock::{Clock, ManualClock, Millis, MonotonicClock};
pub use config::{DriverConfig, SchedulerConfig, SwarmConfig};
pub use driver::{DownloadDriver, DownloadReport, PeerEvent};
pub use error::{DriverError, SchedulerError, SchedulerResult};
pub use ledger::ChunkRequest;
pub use manifest::{ChunkDescriptor, Manifest};
pub use peer_registry::PeerRecord;
pub use scheduler::{Scheduler, SchedulerSnapshot};
pub use shared::SharedScheduler;
pub use transport::{ChunkTransport, TransferOutcome};
