//! Job records, requests and event payloads

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

use crate::db::ModelRecord;
use s5_runner::{DEFAULT_CONCURRENCY, DEFAULT_NUM_WORKERS, DEFAULT_RETRY_COUNT};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Downloading => write!(f, "downloading"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Engine tuning captured from the request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferOptions {
    #[serde(rename = "numworkers")]
    pub num_workers: u32,
    pub concurrency: u32,
    pub retry_count: u32,
    #[serde(rename = "s3_transfer_acceleration")]
    pub accelerate: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_NUM_WORKERS,
            concurrency: DEFAULT_CONCURRENCY,
            retry_count: DEFAULT_RETRY_COUNT,
            accelerate: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub bucket: String,
    pub key: String,
    pub destination: PathBuf,
    pub options: TransferOptions,
    pub model_meta: Option<Map<String, Value>>,
    pub command_id: Option<String>,
    pub download_id: Option<String>,
    /// Overrides the configured per-job timeout
    pub timeout: Option<Duration>,
}

/// Full job record as returned by `details`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Job {
    #[serde(rename = "download_id")]
    pub id: String,
    pub bucket: String,
    pub key: String,
    pub destination: PathBuf,
    pub status: JobStatus,
    pub progress: f64,
    pub transfer_options: TransferOptions,
    pub command_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_meta: Option<Map<String, Value>>,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub last_progress_update: Option<i64>,
    pub error_details: Option<String>,
}

impl Job {
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            destination: self.destination.clone(),
            start_time: self.start_time,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobSummary {
    pub id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub bucket: String,
    pub key: String,
    pub destination: PathBuf,
    pub start_time: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListFilter {
    /// Non-terminal jobs only
    #[default]
    Active,
    All,
}

/// Job lifecycle notifications published on the response channel.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DownloadEvent {
    DownloadCompleted {
        command_id: Option<String>,
        download_id: String,
        success: bool,
        status: JobStatus,
        destination: PathBuf,
    },
    DownloadError {
        command_id: Option<String>,
        download_id: String,
        success: bool,
        status: JobStatus,
        error: String,
    },
    ModelAdded {
        command_id: Option<String>,
        download_id: String,
        success: bool,
        model_id: String,
        model: ModelRecord,
    },
}

/// Periodic snapshot of non-terminal jobs.
#[derive(Debug, Clone, Serialize)]
pub struct StatusBroadcast {
    pub device_id: String,
    pub timestamp: i64,
    pub active_downloads: usize,
    pub downloads: Vec<JobSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn events_are_tagged_with_camel_case_fields() {
        let event = DownloadEvent::DownloadError {
            command_id: Some("c1".into()),
            download_id: "d1".into(),
            success: false,
            status: JobStatus::Failed,
            error: "boom".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "download_error",
                "commandId": "c1",
                "downloadId": "d1",
                "success": false,
                "status": "failed",
                "error": "boom"
            })
        );
    }
}
