use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use s3_downloader_lib::transport::{stdio, LoopbackTransport, Topics};
use s3_downloader_lib::{Service, ServiceConfig};
use s5_runner::OsSpawner;

const OUTPUT_FLUSH: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "s3-downloader")]
#[command(about = "Run controllable s5cmd download jobs driven by pub/sub commands", long_about = None)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device name used in topic names and status reports
    #[arg(long)]
    thing_name: Option<String>,

    /// Base directory for relative download destinations
    #[arg(long)]
    download_dir: Option<PathBuf>,

    #[arg(long)]
    topic_prefix: Option<String>,

    /// Status interval in seconds while downloads are active
    #[arg(long)]
    process_interval: Option<u64>,

    /// Status interval in seconds while idle
    #[arg(long)]
    idle_process_interval: Option<u64>,

    #[arg(long)]
    s5cmd_path: Option<String>,

    /// Model registry database file
    #[arg(long)]
    database: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<ServiceConfig, s3_downloader_lib::ServiceError> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::load(path)?,
            None => ServiceConfig::default(),
        };
        if let Some(v) = self.thing_name {
            config.device_id = v;
        }
        if let Some(v) = self.download_dir {
            config.download_dir = v;
        }
        if let Some(v) = self.topic_prefix {
            config.topic_prefix = v;
        }
        if let Some(v) = self.process_interval {
            config.status_interval_secs = v;
        }
        if let Some(v) = self.idle_process_interval {
            config.idle_status_interval_secs = v;
        }
        if let Some(v) = self.s5cmd_path {
            config.s5cmd_path = v;
        }
        if let Some(v) = self.database {
            config.database_path = v;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the message bridge, so logs go to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("startup_failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let topics = Topics::new(&config.topic_prefix, &config.device_id);

    let transport = Arc::new(LoopbackTransport::new());
    let bridge_shutdown = CancellationToken::new();
    let outbound = tokio::spawn(stdio::pump_outbound(transport.tap(), tokio::io::stdout()));

    let service = match Service::start(config, transport.clone(), Arc::new(OsSpawner)).await {
        Ok(service) => service,
        Err(e) => {
            log::error!("startup_failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let inbound = tokio::spawn(stdio::pump_inbound(
        BufReader::new(tokio::io::stdin()),
        transport.clone(),
        topics.commands.clone(),
        bridge_shutdown.clone(),
    ));

    wait_for_signal().await;
    log::info!("shutdown_requested");

    bridge_shutdown.cancel();
    service.stop().await;
    let _ = inbound.await;
    drop(transport);
    let _ = tokio::time::timeout(OUTPUT_FLUSH, outbound).await;
    // A pending blocking stdin read would hold up runtime teardown
    std::process::exit(0)
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("sigterm_handler_failed: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
