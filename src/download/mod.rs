//! Download job orchestration
//!
//! Provides controllable download jobs backed by s5cmd processes:
//! - One job per `download` command, tracked in a single job table
//! - Progress mirrored from the engine's output
//! - Pause/Resume/Cancel through the job's transfer controller
//! - Model registration when a job carrying `model_meta` completes
//! - Per-job timeout and retention of finished jobs

mod orchestrator;
mod types;
mod worker;

pub use orchestrator::{derive_model_id, DownloadOrchestrator, OrchestratorSettings};
pub use types::{
    DownloadEvent, DownloadRequest, Job, JobStatus, JobSummary, ListFilter, StatusBroadcast,
    TransferOptions,
};
