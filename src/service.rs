//! Service assembly: wires registry, orchestrator and dispatcher to a
//! transport and owns their background tasks.

use futures_util::future::join_all;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use s5_runner::{probe_version, ProcessSpawner};

use crate::commands::CommandDispatcher;
use crate::config::ServiceConfig;
use crate::db::Database;
use crate::download::{DownloadOrchestrator, OrchestratorSettings};
use crate::error::{ServiceError, ServiceResult};
use crate::registry::{spawn_delta_listener, spawn_shadow_sync, ModelRegistry};
use crate::transport::Transport;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Service {
    dispatcher: Arc<CommandDispatcher>,
    orchestrator: DownloadOrchestrator,
    registry: Arc<ModelRegistry>,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    /// Connects the transport and starts every background loop.
    pub async fn start(
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> ServiceResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        match tokio::time::timeout(PROBE_TIMEOUT, probe_version(spawner.as_ref(), &config.s5cmd_path)).await {
            Ok(Ok(version)) => info!("s5cmd_version: {}", version),
            Ok(Err(e)) => warn!("s5cmd_probe_failed: {}", e),
            Err(_) => warn!("s5cmd_probe_failed: no answer within {:?}", PROBE_TIMEOUT),
        }

        let db = Database::open(&config.database_path)
            .await
            .map_err(|e| ServiceError::Registry(e.to_string()))?;
        let registry = Arc::new(ModelRegistry::new(db));

        let (orchestrator, events) =
            DownloadOrchestrator::new(OrchestratorSettings::from(config.as_ref()), spawner, registry.clone());

        transport
            .connect()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let dispatcher = Arc::new(CommandDispatcher::new(
            orchestrator.clone(),
            registry.clone(),
            transport.clone(),
            config.clone(),
        ));
        let topics = dispatcher.topics().clone();
        let shutdown = CancellationToken::new();

        let tasks = vec![
            dispatcher.spawn_command_loop(shutdown.clone()).await?,
            dispatcher.spawn_event_forwarder(events, shutdown.clone()),
            dispatcher.spawn_status_loop(shutdown.clone()),
            spawn_shadow_sync(
                registry.clone(),
                transport.clone(),
                topics.clone(),
                config.shadow_restore_timeout(),
                shutdown.clone(),
            ),
            spawn_delta_listener(registry.clone(), transport.clone(), topics, shutdown.clone()),
        ];
        info!(
            "service_started: device={} download_dir={}",
            config.device_id,
            config.download_dir.display()
        );

        Ok(Self {
            dispatcher,
            orchestrator,
            registry,
            transport,
            shutdown,
            tasks,
        })
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn orchestrator(&self) -> &DownloadOrchestrator {
        &self.orchestrator
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Refuses new downloads, cancels every active job, then stops the
    /// loops and disconnects.
    pub async fn stop(self) {
        info!("service_stopping");
        self.orchestrator.shutdown().await;
        self.shutdown.cancel();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                warn!("service_task_failed: {}", e);
            }
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!("transport_disconnect_failed: {}", e);
        }
        info!("service_stopped");
    }
}
