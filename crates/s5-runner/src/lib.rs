//! Supervisor for external `s5cmd` transfer processes
//!
//! Provides one controller per transfer with:
//! - Argument construction and validation for `s5cmd cp`
//! - Streaming output parsing into a monotonic progress value
//! - Pause/Resume/Cancel through process-group signals
//! - A single completion outcome per process, delivered over a channel
//!
//! Everything that touches OS process primitives lives behind
//! [`ProcessSpawner`] and [`ProcessSignals`], so the controller can be driven
//! by the in-memory fake in tests.

mod args;
mod controller;
mod error;
mod process;
mod progress;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use args::{
    TransferArgs, DEFAULT_CONCURRENCY, DEFAULT_NUM_WORKERS, DEFAULT_RETRY_COUNT,
};
pub use controller::{
    probe_version, CancelOutcome, ControllerState, TransferController, TransferEvents,
    TransferOutcome, DEFAULT_GRACEFUL_TIMEOUT,
};
pub use error::TransferError;
pub use process::{OsSpawner, OutputLine, OutputStream, ProcessSignals, ProcessSpawner, SpawnedProcess};
pub use progress::{parse_percent, ProgressTracker};
