//! End-to-end command flows over the loopback transport.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use s3_downloader_lib::transport::{LoopbackTransport, Topics};
use s3_downloader_lib::{Service, ServiceConfig};
use s5_runner::fake::{FakeSignal, FakeSpawner};

struct Flow {
    _dir: TempDir,
    transport: Arc<LoopbackTransport>,
    spawner: Arc<FakeSpawner>,
    topics: Topics,
    service: Service,
}

fn config_in(dir: &Path) -> ServiceConfig {
    ServiceConfig {
        device_id: "edge-1".to_string(),
        download_dir: dir.join("models"),
        database_path: dir.join("registry.db"),
        status_interval_secs: 3600,
        idle_status_interval_secs: 3600,
        cancel_grace_secs: 1,
        low_disk_threshold_gb: 0.0,
        shadow_restore_timeout_secs: 0,
        ..ServiceConfig::default()
    }
}

async fn start() -> Flow {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    start_with(dir, config).await
}

async fn start_with(dir: TempDir, config: ServiceConfig) -> Flow {
    let topics = Topics::new(&config.topic_prefix, &config.device_id);
    let transport = Arc::new(LoopbackTransport::with_history(4096));
    let spawner = FakeSpawner::new();
    let service = Service::start(config, transport.clone(), spawner.clone()).await.unwrap();
    Flow {
        _dir: dir,
        transport,
        spawner,
        topics,
        service,
    }
}

impl Flow {
    /// Sends a command and waits for the response carrying its id.
    async fn send(&self, command_id: &str, mut command: Value) -> Value {
        command["command_id"] = json!(command_id);
        self.transport.inject(&self.topics.commands, command);
        self.response_for(command_id).await
    }

    async fn response_for(&self, command_id: &str) -> Value {
        self.wait_published(&self.topics.responses, |m| m["commandId"] == command_id && m.get("event").is_none())
            .await
    }

    async fn wait_published(&self, topic: &str, matches: impl Fn(&Value) -> bool) -> Value {
        for _ in 0..300 {
            if let Some(found) = self.transport.published_on(topic).into_iter().find(|m| matches(m)) {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no matching message on {}: {:?}", topic, self.transport.published_on(topic));
    }

    async fn status_of(&self, command_id: &str, download_id: &str) -> Value {
        let details = self
            .send(command_id, json!({"command": "details", "download_id": download_id}))
            .await;
        assert_eq!(details["success"], true, "{}", details);
        details["download"].clone()
    }
}

#[tokio::test]
async fn download_details_then_completion() {
    let flow = start().await;
    let response = flow
        .send(
            "c1",
            json!({"command": "download", "bucket": "b", "key": "k/", "destination": "d"}),
        )
        .await;
    assert_eq!(response["success"], true);
    assert_eq!(response["status"], "downloading");
    let id = response["downloadId"].as_str().unwrap().to_string();
    assert!(uuid_like(&id));

    let job = flow.status_of("c2", &id).await;
    assert_eq!(job["status"], "downloading");
    assert_eq!(job["progress"], 0.0);

    flow.spawner.process(0).exit(0);
    flow.wait_published(&flow.topics.responses, |m| m["event"] == "download_completed")
        .await;
    let job = flow.status_of("c3", &id).await;
    assert_eq!(job["status"], "completed");

    flow.service.stop().await;
}

fn uuid_like(id: &str) -> bool {
    id.len() == 36 && id.chars().filter(|c| *c == '-').count() == 4
}

#[tokio::test]
async fn malformed_command_gets_validation_error_and_status_report() {
    let flow = start().await;
    let response = flow.send("bad-1", json!({"command": "download", "bucket": "b"})).await;

    assert_eq!(response["success"], false);
    assert_eq!(response["error"], "ValidationError");
    assert_eq!(flow.spawner.launch_count(), 0);

    let report = flow
        .wait_published(&flow.topics.status, |m| m["type"] == "command_error")
        .await;
    assert_eq!(report["command_id"], "bad-1");
    assert_eq!(report["device_id"], "edge-1");

    flow.service.stop().await;
}

#[tokio::test]
async fn missing_command_id_is_generated() {
    let flow = start().await;
    flow.transport
        .inject(&flow.topics.commands, json!({"command": "list"}));
    let response = flow
        .wait_published(&flow.topics.responses, |m| m["command"] == "list")
        .await;
    assert!(response["commandId"].as_str().unwrap().starts_with("auto-"));
    assert_eq!(response["count"], 0);

    flow.service.stop().await;
}

#[tokio::test]
async fn model_commands_round_trip() {
    let flow = start().await;
    let added = flow
        .send(
            "m-add",
            json!({"command": "model_add", "model_meta": {"model_id": "m1", "local_path": "/p", "format": "onnx"}}),
        )
        .await;
    assert_eq!(added["success"], true);

    let got = flow.send("m-get", json!({"command": "model_get", "model_id": "m1"})).await;
    assert_eq!(got["model"]["local_path"], "/p");
    assert_eq!(got["model"]["format"], "onnx");
    assert!(got["model"]["last_updated"].as_i64().unwrap() > 0);

    let listed = flow.send("m-list", json!({"command": "model_list"})).await;
    assert_eq!(listed["count"], 1);

    let deleted = flow.send("m-del", json!({"command": "model_delete", "model_id": "m1"})).await;
    assert_eq!(deleted["success"], true);
    let missing = flow.send("m-get2", json!({"command": "model_get", "model_id": "m1"})).await;
    assert_eq!(missing["success"], false);
    assert_eq!(missing["error"], "NotFoundError");

    let shadow = flow
        .wait_published(&flow.topics.shadow_update, |m| {
            m["state"]["reported"]["models"].get("m1").is_some_and(Value::is_null)
        })
        .await;
    assert!(shadow["state"]["reported"]["models"]["m1"].is_null());

    flow.service.stop().await;
}

#[tokio::test]
async fn completed_download_registers_model() {
    let flow = start().await;
    let response = flow
        .send(
            "d1",
            json!({
                "command": "download",
                "bucket": "b",
                "key": "llm/weights.gguf",
                "destination": "llm",
                "model_meta": {"model_id": "m1", "model_name": "llm"}
            }),
        )
        .await;
    let destination = response["destination"].as_str().unwrap().to_string();
    assert!(destination.ends_with("models/llm"));

    flow.spawner.process(0).emit_progress(100.0);
    flow.spawner.process(0).exit(0);
    let added = flow
        .wait_published(&flow.topics.responses, |m| m["event"] == "model_added")
        .await;
    assert_eq!(added["commandId"], "d1");

    let got = flow.send("g1", json!({"command": "model_get", "model_id": "m1"})).await;
    assert_eq!(got["model"]["local_path"], destination.as_str());

    flow.service.stop().await;
}

#[tokio::test]
async fn pause_resume_cancel_over_commands() {
    let flow = start().await;
    let response = flow
        .send("d1", json!({"command": "download", "bucket": "b", "key": "k", "destination": "k.bin"}))
        .await;
    let id = response["downloadId"].as_str().unwrap().to_string();

    let resumed = flow.send("r0", json!({"command": "resume", "download_id": id})).await;
    assert_eq!(resumed["error"], "StateError");

    let paused = flow.send("p1", json!({"command": "pause", "download_id": id})).await;
    assert_eq!(paused["status"], "paused");
    let resumed = flow.send("r1", json!({"command": "resume", "download_id": id})).await;
    assert_eq!(resumed["status"], "downloading");

    let cancelled = flow.send("x1", json!({"command": "cancel", "download_id": id})).await;
    assert_eq!(cancelled["status"], "cancelled");
    assert!(!flow.spawner.process(0).is_alive());

    let active = flow.send("l1", json!({"command": "list"})).await;
    assert_eq!(active["count"], 0);
    let all = flow.send("l2", json!({"command": "list", "filter": "all"})).await;
    assert_eq!(all["count"], 1);

    flow.service.stop().await;
}

#[tokio::test]
async fn status_and_disk_space_commands() {
    let flow = start().await;
    let initial = flow
        .wait_published(&flow.topics.status, |m| m.get("active_downloads").is_some())
        .await;
    assert_eq!(initial["device_id"], "edge-1");
    assert_eq!(initial["active_downloads"], 0);

    let status = flow.send("s1", json!({"command": "status"})).await;
    assert_eq!(status["activeDownloads"], 0);
    assert!(status["diskSpace"]["total_gb"].as_f64().unwrap() > 0.0);

    let disk = flow.send("s2", json!({"command": "disk-space"})).await;
    assert_eq!(disk["command"], "disk_space");
    assert!(disk["diskSpace"]["free_gb"].is_number());

    flow.service.stop().await;
}

#[tokio::test]
async fn stop_cancels_running_jobs() {
    let flow = start().await;
    flow.send("d1", json!({"command": "download", "bucket": "b", "key": "k", "destination": "k.bin"}))
        .await;
    let process = flow.spawner.process(0);

    flow.service.stop().await;
    assert!(!process.is_alive());
    assert_eq!(process.signals_received()[0], FakeSignal::Terminate);
    assert!(!flow.transport.is_connected());
}

#[tokio::test]
async fn registry_survives_restart() {
    let flow = start().await;
    let added = flow
        .send(
            "m-add",
            json!({"command": "model_add", "model_meta": {"model_id": "m1", "local_path": "/p"}}),
        )
        .await;
    assert_eq!(added["success"], true);
    let Flow { _dir: dir, service, .. } = flow;
    service.stop().await;

    let config = config_in(dir.path());
    let flow = start_with(dir, config).await;
    let got = flow.send("m-get", json!({"command": "model_get", "model_id": "m1"})).await;
    assert_eq!(got["success"], true, "{}", got);
    assert_eq!(got["model"]["local_path"], "/p");

    flow.service.stop().await;
}

#[tokio::test]
async fn download_during_stop_is_refused() {
    let flow = start().await;
    flow.spawner.ignore_terminate(true);
    flow.send("d1", json!({"command": "download", "bucket": "b", "key": "k", "destination": "k.bin"}))
        .await;
    let first = flow.spawner.process(0);

    let Flow {
        _dir,
        transport,
        spawner,
        topics,
        service,
    } = flow;
    let stopping = tokio::spawn(service.stop());
    tokio::time::sleep(Duration::from_millis(200)).await;
    transport.inject(
        &topics.commands,
        json!({"command": "download", "command_id": "d2", "bucket": "b", "key": "k2", "destination": "k2.bin"}),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    stopping.await.unwrap();
    assert_eq!(spawner.launch_count(), 1);
    assert!(!first.is_alive());
    let refused: Vec<Value> = transport
        .published_on(&topics.responses)
        .into_iter()
        .filter(|m| m["commandId"] == "d2")
        .collect();
    assert_eq!(refused.len(), 1);
    assert_eq!(refused[0]["success"], false);
    assert_eq!(refused[0]["error"], "StateError");
}

#[tokio::test]
async fn unreadable_disk_usage_is_a_system_error() {
    let dir = TempDir::new().unwrap();
    let config = ServiceConfig {
        download_dir: PathBuf::from("missing-root/models"),
        ..config_in(dir.path())
    };
    let flow = start_with(dir, config).await;

    let disk = flow.send("s1", json!({"command": "disk_space"})).await;
    assert_eq!(disk["success"], false);
    assert_eq!(disk["error"], "SystemError");

    flow.service.stop().await;
}
