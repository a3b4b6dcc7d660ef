//! Routes inbound commands and publishes responses and status

use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::envelope::{command_id_of, error_response, parse_command, success_response, Command};
use crate::config::ServiceConfig;
use crate::db::ModelRecord;
use crate::download::{DownloadEvent, DownloadOrchestrator, ListFilter, StatusBroadcast};
use crate::error::{ServiceError, ServiceResult};
use crate::registry::ModelRegistry;
use crate::system;
use crate::transport::{Topics, Transport};

pub struct CommandDispatcher {
    orchestrator: DownloadOrchestrator,
    registry: Arc<ModelRegistry>,
    transport: Arc<dyn Transport>,
    topics: Topics,
    config: Arc<ServiceConfig>,
}

impl CommandDispatcher {
    pub fn new(
        orchestrator: DownloadOrchestrator,
        registry: Arc<ModelRegistry>,
        transport: Arc<dyn Transport>,
        config: Arc<ServiceConfig>,
    ) -> Self {
        let topics = Topics::new(&config.topic_prefix, &config.device_id);
        Self {
            orchestrator,
            registry,
            transport,
            topics,
            config,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Runs one command to completion and returns its response envelope.
    pub async fn execute(&self, payload: &Value) -> Value {
        let command_id = command_id_of(payload);
        let command = match parse_command(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("command_rejected: {} {}", command_id, e);
                return error_response(&command_id, None, &e);
            }
        };

        let name = command.name();
        debug!("command_received: {} {}", command_id, name);
        match self.run(command, &command_id).await {
            Ok(fields) => success_response(&command_id, name, fields),
            Err(e) => {
                warn!("command_failed: {} {} {}: {}", command_id, name, e.kind(), e);
                error_response(&command_id, Some(name), &e)
            }
        }
    }

    async fn run(&self, command: Command, command_id: &str) -> ServiceResult<Value> {
        match command {
            Command::Download(download) => {
                let request = download.into_request(command_id, &self.config.download_dir);
                let job = self.orchestrator.submit(request).await?;
                Ok(json!({
                    "downloadId": job.id,
                    "status": job.status,
                    "destination": job.destination,
                    "message": format!("Download started with ID: {}", job.id),
                }))
            }
            Command::List(list) => {
                let downloads = self.orchestrator.list(ListFilter::from(list.filter)).await;
                Ok(json!({"count": downloads.len(), "downloads": downloads}))
            }
            Command::Pause(target) => {
                let job = self.orchestrator.pause(&target.download_id).await?;
                Ok(json!({
                    "downloadId": job.id,
                    "status": job.status,
                    "progress": job.progress,
                    "message": format!("Download {} paused successfully", job.id),
                }))
            }
            Command::Resume(target) => {
                let job = self.orchestrator.resume(&target.download_id).await?;
                Ok(json!({
                    "downloadId": job.id,
                    "status": job.status,
                    "message": format!("Download {} resumed successfully", job.id),
                }))
            }
            Command::Cancel(target) => {
                let job = self.orchestrator.cancel(&target.download_id).await?;
                Ok(json!({
                    "downloadId": job.id,
                    "status": job.status,
                    "message": format!("Download {} cancelled successfully", job.id),
                }))
            }
            Command::Details(target) => {
                let job = self.orchestrator.details(&target.download_id).await?;
                Ok(json!({"downloadId": job.id, "download": job}))
            }
            Command::Status {} => {
                let downloads = self.orchestrator.list(ListFilter::Active).await;
                Ok(json!({
                    "deviceId": self.config.device_id,
                    "activeDownloads": downloads.len(),
                    "downloads": downloads,
                    "diskSpace": self.disk_space_value(),
                    "message": "System status retrieved successfully",
                }))
            }
            Command::DiskSpace {} => {
                let usage = system::disk_usage(&self.config.download_dir).map_err(|source| ServiceError::System {
                    path: self.config.download_dir.clone(),
                    source,
                })?;
                Ok(json!({"path": self.config.download_dir, "diskSpace": usage}))
            }
            Command::ModelAdd { model_meta } => {
                let record: ModelRecord = serde_json::from_value(Value::Object(model_meta))
                    .map_err(|e| ServiceError::Validation(format!("invalid model_meta: {}", e)))?;
                let model = self.registry.upsert(record).await?;
                Ok(json!({"modelId": model.model_id, "model": model}))
            }
            Command::ModelGet(target) => {
                let model = self.registry.get(&target.model_id).await?;
                Ok(json!({"modelId": model.model_id, "model": model}))
            }
            Command::ModelDelete(target) => {
                self.registry.delete(&target.model_id).await?;
                Ok(json!({
                    "modelId": target.model_id,
                    "message": format!("Model {} deleted", target.model_id),
                }))
            }
            Command::ModelList {} => {
                let models = self.registry.list().await?;
                Ok(json!({"count": models.len(), "models": models}))
            }
        }
    }

    fn disk_space_value(&self) -> Value {
        match system::disk_usage(&self.config.download_dir) {
            Ok(usage) => json!(usage),
            Err(e) => {
                debug!("disk_usage: {} {}", self.config.download_dir.display(), e);
                Value::Null
            }
        }
    }

    /// Executes a command and publishes exactly one response for it.
    pub async fn handle_message(&self, payload: Value) {
        let response = self.execute(&payload).await;
        self.publish(&self.topics.responses, &response).await;

        if response["success"] == Value::Bool(false) {
            let report = json!({
                "type": "command_error",
                "device_id": self.config.device_id,
                "timestamp": chrono::Utc::now().timestamp(),
                "command_id": response["commandId"],
                "error": response["error"],
                "message": response["message"],
            });
            self.publish(&self.topics.status, &report).await;
        }
    }

    async fn publish(&self, topic: &str, payload: &Value) {
        if let Err(e) = self.transport.publish(topic, payload).await {
            error!("publish_failed: {} {}", topic, e);
        }
    }

    /// Subscribes to the command topic; each message is handled on its own
    /// task so a slow cancel never holds up other commands.
    pub async fn spawn_command_loop(self: &Arc<Self>, shutdown: CancellationToken) -> ServiceResult<JoinHandle<()>> {
        let mut inbound = self
            .transport
            .subscribe(&self.topics.commands)
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        info!("command_loop: listening on {}", self.topics.commands);

        let dispatcher = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = inbound.recv() => message,
                };
                let Some(message) = message else { break };
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.handle_message(message.payload).await });
            }
            let _ = dispatcher.transport.unsubscribe(&dispatcher.topics.commands).await;
            debug!("command_loop: stopped");
        }))
    }

    /// Publishes job lifecycle events on the response topic.
    pub fn spawn_event_forwarder(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<DownloadEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else { break };
                match serde_json::to_value(&event) {
                    Ok(payload) => dispatcher.publish(&dispatcher.topics.responses, &payload).await,
                    Err(e) => error!("event_serialize_failed: {}", e),
                }
            }
            // Flush what finished before shutdown
            while let Ok(event) = events.try_recv() {
                if let Ok(payload) = serde_json::to_value(&event) {
                    dispatcher.publish(&dispatcher.topics.responses, &payload).await;
                }
            }
        })
    }

    /// Snapshot of non-terminal jobs for the status topic.
    pub async fn status_broadcast(&self) -> StatusBroadcast {
        let downloads = self.orchestrator.list(ListFilter::Active).await;
        StatusBroadcast {
            device_id: self.config.device_id.clone(),
            timestamp: chrono::Utc::now().timestamp(),
            active_downloads: downloads.len(),
            downloads,
        }
    }

    /// One status tick: prune, broadcast, check free space.
    pub async fn status_tick(&self) {
        self.orchestrator.prune_finished(self.config.job_retention()).await;

        let broadcast = self.status_broadcast().await;
        match serde_json::to_value(&broadcast) {
            Ok(payload) => self.publish(&self.topics.status, &payload).await,
            Err(e) => error!("status_serialize_failed: {}", e),
        }

        if let Ok(usage) = system::disk_usage(&self.config.download_dir) {
            if usage.free_gb < self.config.low_disk_threshold_gb {
                warn!("low_disk_space: {:.2} GB free", usage.free_gb);
                let warning = json!({
                    "type": "warning",
                    "device_id": self.config.device_id,
                    "timestamp": chrono::Utc::now().timestamp(),
                    "message": format!("Low disk space: {:.2} GB free", usage.free_gb),
                    "diskSpace": usage,
                });
                self.publish(&self.topics.status, &warning).await;
            }
        }
    }

    /// Status loop: an immediate broadcast, then one per interval. The
    /// interval is shorter while any job is active.
    pub fn spawn_status_loop(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.status_tick().await;
            loop {
                let secs = if dispatcher.orchestrator.active_count().await > 0 {
                    dispatcher.config.status_interval_secs
                } else {
                    dispatcher.config.idle_status_interval_secs
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                }
                dispatcher.status_tick().await;
            }
            debug!("status_loop: stopped");
        })
    }
}
