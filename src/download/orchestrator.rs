//! Job table and the user-facing job operations

use futures_util::future::join_all;
use log::{error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};

use s5_runner::{ProcessSpawner, TransferArgs, TransferController, TransferError, TransferOutcome};

use super::types::{DownloadEvent, DownloadRequest, Job, JobStatus, JobSummary, ListFilter};
use super::worker;
use crate::config::ServiceConfig;
use crate::db::ModelRecord;
use crate::error::{ServiceError, ServiceResult};
use crate::registry::ModelRegistry;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub s5cmd_path: String,
    pub cancel_grace: Duration,
    pub download_timeout: Duration,
    pub max_active_jobs: Option<usize>,
}

impl From<&ServiceConfig> for OrchestratorSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            s5cmd_path: config.s5cmd_path.clone(),
            cancel_grace: config.cancel_grace(),
            download_timeout: Duration::from_secs(config.download_timeout_secs),
            max_active_jobs: config.max_active_jobs,
        }
    }
}

pub(super) struct JobEntry {
    pub job: Job,
    pub controller: Option<Arc<TransferController>>,
    /// Set once a cancel or timeout owns the final status
    pub cancel_requested: bool,
    /// Latest engine progress, including what arrived while paused
    pub engine_progress: f64,
}

impl JobEntry {
    fn new(job: Job) -> Self {
        Self {
            job,
            controller: None,
            cancel_requested: false,
            engine_progress: 0.0,
        }
    }
}

pub(super) struct Inner {
    pub settings: OrchestratorSettings,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub registry: Arc<ModelRegistry>,
    pub jobs: Mutex<HashMap<String, JobEntry>>,
    pub events: mpsc::UnboundedSender<DownloadEvent>,
    /// Held shared by every launch; `shutdown` takes it exclusively and
    /// flips it to refuse new jobs.
    pub closing: RwLock<bool>,
}

/// Sole owner of the job table. Cheap to clone.
#[derive(Clone)]
pub struct DownloadOrchestrator {
    inner: Arc<Inner>,
}

impl DownloadOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        spawner: Arc<dyn ProcessSpawner>,
        registry: Arc<ModelRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            settings,
            spawner,
            registry,
            jobs: Mutex::new(HashMap::new()),
            events,
            closing: RwLock::new(false),
        });
        (Self { inner }, events_rx)
    }

    /// Launches the engine and records the job as `downloading`.
    ///
    /// The id is reserved as `queued` while the destination is prepared and
    /// the process spawned; the table lock is not held across that I/O.
    /// Returns as soon as the process is running. A launch failure is
    /// recorded as a `failed` job and returned as a transfer error.
    pub async fn submit(&self, request: DownloadRequest) -> ServiceResult<Job> {
        if request.bucket.trim().is_empty() {
            return Err(ServiceError::Validation("bucket is required".to_string()));
        }
        if request.key.trim().is_empty() {
            return Err(ServiceError::Validation("key is required".to_string()));
        }
        if request.destination.as_os_str().is_empty() {
            return Err(ServiceError::Validation("destination is required".to_string()));
        }
        let id = match &request.download_id {
            Some(id) if id.trim().is_empty() => {
                return Err(ServiceError::Validation("download_id must not be empty".to_string()))
            }
            Some(id) => id.clone(),
            None => uuid::Uuid::new_v4().to_string(),
        };

        let args = TransferArgs {
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            destination: request.destination.clone(),
            num_workers: request.options.num_workers,
            concurrency: request.options.concurrency,
            retry_count: request.options.retry_count,
            accelerate: request.options.accelerate,
        };
        args.validate()?;
        let timeout = request.timeout.unwrap_or(self.inner.settings.download_timeout);

        let gate = self.inner.closing.read().await;
        if *gate {
            return Err(ServiceError::State("Service is shutting down".to_string()));
        }

        let now = chrono::Utc::now().timestamp();
        let job = Job {
            id: id.clone(),
            bucket: request.bucket,
            key: request.key,
            destination: request.destination,
            status: JobStatus::Queued,
            progress: 0.0,
            transfer_options: request.options,
            command_id: request.command_id,
            model_meta: request.model_meta,
            start_time: now,
            end_time: None,
            last_progress_update: None,
            error_details: None,
        };
        self.reserve(job).await?;

        if let Err(e) = prepare_destination(&args.destination, args.is_recursive()).await {
            self.inner.jobs.lock().await.remove(&id);
            return Err(e);
        }

        let launched =
            TransferController::start(self.inner.spawner.as_ref(), &self.inner.settings.s5cmd_path, &args).await;
        let (controller, transfer_events) = match launched {
            Ok(started) => started,
            Err(e) => {
                error!("download_launch_failed: {} error={}", id, e);
                let mut jobs = self.inner.jobs.lock().await;
                if let Some(entry) = jobs.get_mut(&id) {
                    entry.job.status = JobStatus::Failed;
                    entry.job.end_time = Some(chrono::Utc::now().timestamp());
                    entry.job.error_details = Some(e.to_string());
                }
                return Err(e.into());
            }
        };

        let controller = Arc::new(controller);
        let snapshot = {
            let mut jobs = self.inner.jobs.lock().await;
            let entry = jobs.get_mut(&id).ok_or_else(|| not_found(&id))?;
            entry.job.status = JobStatus::Downloading;
            entry.controller = Some(controller.clone());
            entry.job.clone()
        };

        info!(
            "download_started: {} s3://{}/{} -> {} pid={:?}",
            id,
            snapshot.bucket,
            snapshot.key,
            snapshot.destination.display(),
            controller.pid()
        );
        tokio::spawn(worker::monitor_job(
            self.inner.clone(),
            id,
            controller,
            transfer_events,
            timeout,
        ));
        drop(gate);
        Ok(snapshot)
    }

    /// Claims `job.id` in the table, enforcing uniqueness and the active cap.
    async fn reserve(&self, job: Job) -> ServiceResult<()> {
        let mut jobs = self.inner.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(ServiceError::State(format!("Download with ID {} already exists", job.id)));
        }
        if let Some(cap) = self.inner.settings.max_active_jobs {
            let active = jobs.values().filter(|e| !e.job.status.is_terminal()).count();
            if active >= cap {
                return Err(ServiceError::Capacity(format!(
                    "{} downloads already active (limit {})",
                    active, cap
                )));
            }
        }
        jobs.insert(job.id.clone(), JobEntry::new(job));
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> ServiceResult<Job> {
        let mut jobs = self.inner.jobs.lock().await;
        let entry = jobs.get_mut(id).ok_or_else(|| not_found(id))?;
        if entry.job.status != JobStatus::Downloading || entry.cancel_requested {
            return Err(invalid_transition("pause", id, entry.job.status));
        }
        let controller = entry.controller.as_ref().ok_or_else(|| invalid_transition("pause", id, entry.job.status))?;
        controller.pause()?;
        entry.job.status = JobStatus::Paused;
        info!("download_paused: {} at {:.1}%", id, entry.job.progress);
        Ok(entry.job.clone())
    }

    pub async fn resume(&self, id: &str) -> ServiceResult<Job> {
        let mut jobs = self.inner.jobs.lock().await;
        let entry = jobs.get_mut(id).ok_or_else(|| not_found(id))?;
        if entry.job.status != JobStatus::Paused || entry.cancel_requested {
            return Err(invalid_transition("resume", id, entry.job.status));
        }
        let controller = entry.controller.as_ref().ok_or_else(|| invalid_transition("resume", id, entry.job.status))?;
        controller.resume()?;
        entry.job.status = JobStatus::Downloading;
        if entry.engine_progress > entry.job.progress {
            entry.job.progress = entry.engine_progress;
            entry.job.last_progress_update = Some(chrono::Utc::now().timestamp());
        }
        info!("download_resumed: {} at {:.1}%", id, entry.job.progress);
        Ok(entry.job.clone())
    }

    /// Terminates the job's process and marks it `cancelled`.
    ///
    /// Waits for the process to be gone, bounded by the grace period plus
    /// the kill wait. When the process cannot be signalled and is still
    /// running, the job keeps its status and the error is returned.
    pub async fn cancel(&self, id: &str) -> ServiceResult<Job> {
        let controller = {
            let mut jobs = self.inner.jobs.lock().await;
            let entry = jobs.get_mut(id).ok_or_else(|| not_found(id))?;
            if entry.job.status.is_terminal() || entry.job.status == JobStatus::Queued || entry.cancel_requested {
                return Err(invalid_transition("cancel", id, entry.job.status));
            }
            entry.cancel_requested = true;
            entry.controller.clone()
        };

        let mut failure = None;
        if let Some(controller) = &controller {
            match controller.cancel(self.inner.settings.cancel_grace).await {
                Ok(outcome) => info!("download_cancel: {} {:?}", id, outcome),
                Err(e) => failure = Some(e),
            }
        }

        let mut jobs = self.inner.jobs.lock().await;
        let entry = jobs.get_mut(id).ok_or_else(|| not_found(id))?;
        if let Some(e) = failure {
            if controller.as_ref().is_some_and(|c| c.is_alive()) {
                entry.cancel_requested = false;
                error!("download_cancel_failed: {} {}", id, e);
                return Err(e.into());
            }
            warn!("download_cancel: {} signal error after exit: {}", id, e);
        }
        entry.job.status = JobStatus::Cancelled;
        entry.job.end_time = Some(chrono::Utc::now().timestamp());
        entry.controller = None;
        info!("download_cancelled: {}", id);
        Ok(entry.job.clone())
    }

    pub async fn list(&self, filter: ListFilter) -> Vec<JobSummary> {
        let jobs = self.inner.jobs.lock().await;
        let mut summaries: Vec<JobSummary> = jobs
            .values()
            .filter(|e| filter == ListFilter::All || !e.job.status.is_terminal())
            .map(|e| e.job.summary())
            .collect();
        summaries.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    pub async fn details(&self, id: &str) -> ServiceResult<Job> {
        let jobs = self.inner.jobs.lock().await;
        jobs.get(id).map(|e| e.job.clone()).ok_or_else(|| not_found(id))
    }

    pub async fn active_count(&self) -> usize {
        let jobs = self.inner.jobs.lock().await;
        jobs.values().filter(|e| !e.job.status.is_terminal()).count()
    }

    /// Drops terminal jobs that ended more than `retention` ago.
    pub async fn prune_finished(&self, retention: Duration) -> usize {
        let cutoff = chrono::Utc::now().timestamp() - retention.as_secs() as i64;
        let mut jobs = self.inner.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, e| {
            !(e.job.status.is_terminal() && e.job.end_time.is_some_and(|end| end <= cutoff))
        });
        let removed = before - jobs.len();
        if removed > 0 {
            info!("download_prune: removed {} finished jobs", removed);
        }
        removed
    }

    /// Refuses new jobs, waits for launches in flight, then cancels every
    /// non-terminal job concurrently.
    pub async fn shutdown(&self) {
        *self.inner.closing.write().await = true;
        let ids: Vec<String> = {
            let jobs = self.inner.jobs.lock().await;
            jobs.iter()
                .filter(|(_, e)| !e.job.status.is_terminal() && !e.cancel_requested)
                .map(|(id, _)| id.clone())
                .collect()
        };
        if ids.is_empty() {
            return;
        }
        info!("download_shutdown: cancelling {} jobs", ids.len());
        let results = join_all(ids.iter().map(|id| self.cancel(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!("download_shutdown: {} {}", id, e);
            }
        }
    }
}

impl Inner {
    pub(super) async fn record_progress(&self, id: &str, value: f64) {
        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.get_mut(id) {
            entry.engine_progress = entry.engine_progress.max(value);
            if entry.job.status == JobStatus::Downloading && !entry.cancel_requested && value > entry.job.progress {
                entry.job.progress = value;
                entry.job.last_progress_update = Some(chrono::Utc::now().timestamp());
            }
        }
    }

    /// Applies the engine's final outcome unless a cancel or timeout already
    /// owns the job's final state. Events and model registration run after
    /// the table lock is released.
    pub(super) async fn finish(&self, id: &str, outcome: Option<TransferOutcome>) {
        let job = {
            let mut jobs = self.jobs.lock().await;
            let Some(entry) = jobs.get_mut(id) else { return };
            entry.controller = None;
            if entry.cancel_requested || entry.job.status.is_terminal() {
                return;
            }

            let job = &mut entry.job;
            job.end_time = Some(chrono::Utc::now().timestamp());
            match outcome {
                Some(outcome) if outcome.is_success() => {
                    job.status = JobStatus::Completed;
                    job.progress = 100.0;
                }
                other => {
                    let detail = match other {
                        Some(outcome) => outcome
                            .error_detail
                            .unwrap_or_else(|| format!("exit code {}", outcome.exit_code)),
                        None => "transfer process ended without reporting an exit status".to_string(),
                    };
                    job.status = JobStatus::Failed;
                    job.error_details = Some(detail);
                }
            }
            job.clone()
        };

        if job.status != JobStatus::Completed {
            let detail = job.error_details.clone().unwrap_or_default();
            warn!("download_failed: {} {}", id, detail);
            let _ = self.events.send(DownloadEvent::DownloadError {
                command_id: job.command_id.clone(),
                download_id: id.to_string(),
                success: false,
                status: job.status,
                error: detail,
            });
            return;
        }

        info!("download_completed: {} -> {}", id, job.destination.display());
        let _ = self.events.send(DownloadEvent::DownloadCompleted {
            command_id: job.command_id.clone(),
            download_id: id.to_string(),
            success: true,
            status: job.status,
            destination: job.destination.clone(),
        });

        if let Some(meta) = job.model_meta.clone() {
            match self.register_model(&job, meta).await {
                Ok(model) => {
                    let _ = self.events.send(DownloadEvent::ModelAdded {
                        command_id: job.command_id.clone(),
                        download_id: id.to_string(),
                        success: true,
                        model_id: model.model_id.clone(),
                        model,
                    });
                }
                Err(e) => error!("download_model_register_failed: {} {}", id, e),
            }
        }
    }

    /// Fails the job and stops its process once the timeout expires.
    pub(super) async fn time_out(&self, id: &str, controller: &TransferController, limit: Duration) {
        let message = format!("Download timed out after {} seconds", limit.as_secs());
        let command_id = {
            let mut jobs = self.jobs.lock().await;
            let Some(entry) = jobs.get_mut(id) else { return };
            if entry.cancel_requested || entry.job.status.is_terminal() {
                return;
            }
            entry.cancel_requested = true;
            entry.job.status = JobStatus::Failed;
            entry.job.end_time = Some(chrono::Utc::now().timestamp());
            entry.job.error_details = Some(message.clone());
            entry.job.command_id.clone()
        };

        warn!("download_timeout: {} {}", id, message);
        if let Err(e) = controller.cancel(self.settings.cancel_grace).await {
            if !matches!(e, TransferError::InvalidState { .. }) {
                warn!("download_timeout: {} cancel failed: {}", id, e);
            }
        }
        let _ = self.events.send(DownloadEvent::DownloadError {
            command_id,
            download_id: id.to_string(),
            success: false,
            status: JobStatus::Failed,
            error: message,
        });
    }

    async fn register_model(
        &self,
        job: &Job,
        mut meta: serde_json::Map<String, Value>,
    ) -> ServiceResult<ModelRecord> {
        let has_id = meta
            .get("model_id")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty());
        if !has_id {
            meta.insert("model_id".to_string(), Value::String(derive_model_id(&job.key)));
        }
        meta.insert(
            "local_path".to_string(),
            Value::String(job.destination.to_string_lossy().into_owned()),
        );
        let record: ModelRecord = serde_json::from_value(Value::Object(meta))
            .map_err(|e| ServiceError::Validation(format!("invalid model_meta: {}", e)))?;
        self.registry.upsert(record).await
    }
}

/// Model id from the key's last segment, without extension.
pub fn derive_model_id(key: &str) -> String {
    let name = key.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    if stem.is_empty() {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("model-{}", &id[..8])
    } else {
        stem.to_string()
    }
}

async fn prepare_destination(destination: &Path, recursive: bool) -> ServiceResult<()> {
    let is_dir = recursive || destination.to_string_lossy().ends_with('/') || destination.is_dir();
    let dir: PathBuf = if is_dir {
        destination.to_path_buf()
    } else {
        match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => return Ok(()),
        }
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| ServiceError::Destination { path: dir, source })
}

fn not_found(id: &str) -> ServiceError {
    ServiceError::NotFound(format!("Download ID {} not found", id))
}

fn invalid_transition(action: &str, id: &str, status: JobStatus) -> ServiceError {
    ServiceError::State(format!("Cannot {} download {} in status {}", action, id, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_id_from_key() {
        assert_eq!(derive_model_id("models/llama-7b.gguf"), "llama-7b");
        assert_eq!(derive_model_id("models/qwen/"), "qwen");
        assert_eq!(derive_model_id("weights"), "weights");
        assert_eq!(derive_model_id("dir/.hidden"), ".hidden");
        assert!(derive_model_id("/").starts_with("model-"));
    }
}
