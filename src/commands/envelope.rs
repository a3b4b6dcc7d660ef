//! Inbound command parsing and response envelopes

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::download::{DownloadRequest, ListFilter, TransferOptions};
use crate::error::{ServiceError, ServiceResult};
use s5_runner::{DEFAULT_CONCURRENCY, DEFAULT_NUM_WORKERS, DEFAULT_RETRY_COUNT};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Download(DownloadCommand),
    List(ListCommand),
    Pause(JobTarget),
    Resume(JobTarget),
    Cancel(JobTarget),
    #[serde(alias = "getdetails")]
    Details(JobTarget),
    Status {},
    #[serde(alias = "disk-space")]
    DiskSpace {},
    ModelAdd { model_meta: Map<String, Value> },
    ModelGet(ModelTarget),
    ModelDelete(ModelTarget),
    ModelList {},
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DownloadCommand {
    pub bucket: String,
    pub key: String,
    pub destination: String,
    #[serde(default = "default_num_workers")]
    pub numworkers: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default)]
    pub s3_transfer_acceleration: bool,
    #[serde(default)]
    pub download_id: Option<String>,
    #[serde(default)]
    pub model_meta: Option<Map<String, Value>>,
    /// Seconds; falls back to the configured timeout
    #[serde(default)]
    pub download_timeout: Option<u64>,
}

fn default_num_workers() -> u32 {
    DEFAULT_NUM_WORKERS
}

fn default_concurrency() -> u32 {
    DEFAULT_CONCURRENCY
}

fn default_retry_count() -> u32 {
    DEFAULT_RETRY_COUNT
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListScope {
    #[default]
    Active,
    All,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ListCommand {
    #[serde(default)]
    pub filter: ListScope,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobTarget {
    pub download_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelTarget {
    pub model_id: String,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Download(_) => "download",
            Command::List(_) => "list",
            Command::Pause(_) => "pause",
            Command::Resume(_) => "resume",
            Command::Cancel(_) => "cancel",
            Command::Details(_) => "details",
            Command::Status {} => "status",
            Command::DiskSpace {} => "disk_space",
            Command::ModelAdd { .. } => "model_add",
            Command::ModelGet(_) => "model_get",
            Command::ModelDelete(_) => "model_delete",
            Command::ModelList {} => "model_list",
        }
    }

    /// Field checks serde cannot express: required strings must be non-blank.
    fn validate(&self) -> ServiceResult<()> {
        match self {
            Command::Download(d) => {
                require("bucket", &d.bucket)?;
                require("key", &d.key)?;
                require("destination", &d.destination)?;
                if let Some(id) = &d.download_id {
                    require("download_id", id)?;
                }
                if d.numworkers == 0 || d.concurrency == 0 {
                    return Err(ServiceError::Validation(
                        "numworkers and concurrency must be positive".to_string(),
                    ));
                }
                Ok(())
            }
            Command::Pause(t) | Command::Resume(t) | Command::Cancel(t) | Command::Details(t) => {
                require("download_id", &t.download_id)
            }
            Command::ModelGet(t) | Command::ModelDelete(t) => require("model_id", &t.model_id),
            Command::ModelAdd { model_meta } => {
                for field in ["model_id", "local_path"] {
                    match model_meta.get(field).and_then(Value::as_str) {
                        Some(v) if !v.trim().is_empty() => {}
                        _ => {
                            return Err(ServiceError::Validation(
                                "model_meta must contain model_id and local_path".to_string(),
                            ))
                        }
                    }
                }
                Ok(())
            }
            Command::List(_) | Command::Status {} | Command::DiskSpace {} | Command::ModelList {} => Ok(()),
        }
    }
}

fn require(field: &str, value: &str) -> ServiceResult<()> {
    if value.trim().is_empty() {
        Err(ServiceError::Validation(format!("{} is required", field)))
    } else {
        Ok(())
    }
}

impl DownloadCommand {
    /// Relative destinations resolve under `download_dir`.
    pub fn into_request(self, command_id: &str, download_dir: &Path) -> DownloadRequest {
        let destination = PathBuf::from(&self.destination);
        let destination = if destination.is_absolute() {
            destination
        } else {
            download_dir.join(destination)
        };
        DownloadRequest {
            bucket: self.bucket,
            key: self.key,
            destination,
            options: TransferOptions {
                num_workers: self.numworkers,
                concurrency: self.concurrency,
                retry_count: self.retry_count,
                accelerate: self.s3_transfer_acceleration,
            },
            model_meta: self.model_meta,
            command_id: Some(command_id.to_string()),
            download_id: self.download_id,
            timeout: self.download_timeout.map(Duration::from_secs),
        }
    }
}

impl From<ListScope> for ListFilter {
    fn from(scope: ListScope) -> Self {
        match scope {
            ListScope::Active => ListFilter::Active,
            ListScope::All => ListFilter::All,
        }
    }
}

/// Correlation id from the message, or a generated `auto-xxxxxxxx`.
pub fn command_id_of(payload: &Value) -> String {
    match payload.get("command_id").and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("auto-{}", &id[..8])
        }
    }
}

pub fn parse_command(payload: &Value) -> ServiceResult<Command> {
    if !payload.is_object() {
        return Err(ServiceError::Validation("command message must be a JSON object".to_string()));
    }
    match payload.get("command") {
        Some(Value::String(_)) => {}
        Some(_) => return Err(ServiceError::Validation("command must be a string".to_string())),
        None => return Err(ServiceError::Validation("Missing command type".to_string())),
    }
    let command = Command::deserialize(payload)
        .map_err(|e| ServiceError::Validation(format!("invalid command: {}", e)))?;
    command.validate()?;
    Ok(command)
}

pub fn success_response(command_id: &str, command: &str, fields: Value) -> Value {
    let mut body = Map::new();
    body.insert("success".to_string(), Value::Bool(true));
    body.insert("commandId".to_string(), Value::String(command_id.to_string()));
    body.insert("command".to_string(), Value::String(command.to_string()));
    if let Value::Object(fields) = fields {
        body.extend(fields);
    }
    Value::Object(body)
}

pub fn error_response(command_id: &str, command: Option<&str>, err: &ServiceError) -> Value {
    let mut body = json!({
        "success": false,
        "commandId": command_id,
        "error": err.kind(),
        "message": err.to_string(),
    });
    if let Some(command) = command {
        body["command"] = Value::String(command.to_string());
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_defaults_apply() {
        let payload = json!({"command": "download", "bucket": "b", "key": "k/", "destination": "/d"});
        let Command::Download(d) = parse_command(&payload).unwrap() else {
            panic!("expected download");
        };
        assert_eq!(d.numworkers, 256);
        assert_eq!(d.concurrency, 5);
        assert_eq!(d.retry_count, 10);
        assert!(!d.s3_transfer_acceleration);

        let request = d.into_request("c1", Path::new("/data"));
        assert_eq!(request.destination, PathBuf::from("/d"));
        assert_eq!(request.command_id.as_deref(), Some("c1"));
    }

    #[test]
    fn relative_destination_resolves_under_download_dir() {
        let payload = json!({"command": "download", "bucket": "b", "key": "k", "destination": "llm"});
        let Command::Download(d) = parse_command(&payload).unwrap() else {
            panic!("expected download");
        };
        let request = d.into_request("c1", Path::new("/data/models"));
        assert_eq!(request.destination, PathBuf::from("/data/models/llm"));
    }

    #[test]
    fn aliases_map_to_canonical_commands() {
        let details = parse_command(&json!({"command": "getdetails", "download_id": "x"})).unwrap();
        assert_eq!(details.name(), "details");
        let disk = parse_command(&json!({"command": "disk-space"})).unwrap();
        assert_eq!(disk, Command::DiskSpace {});
        let list = parse_command(&json!({"command": "list", "filter": "all"})).unwrap();
        assert_eq!(list, Command::List(ListCommand { filter: ListScope::All }));
    }

    #[test]
    fn shape_errors_are_validation_errors() {
        let cases = [
            json!("download"),
            json!({"bucket": "b"}),
            json!({"command": 7}),
            json!({"command": "explode"}),
            json!({"command": "download", "bucket": "b", "key": "k"}),
            json!({"command": "download", "bucket": " ", "key": "k", "destination": "/d"}),
            json!({"command": "pause"}),
            json!({"command": "cancel", "download_id": ""}),
            json!({"command": "model_get"}),
            json!({"command": "model_add", "model_meta": {"model_id": "m1"}}),
        ];
        for payload in cases {
            let err = parse_command(&payload).unwrap_err();
            assert_eq!(err.kind(), "ValidationError", "{}", payload);
        }
    }

    #[test]
    fn command_id_is_kept_or_generated() {
        assert_eq!(command_id_of(&json!({"command_id": "abc"})), "abc");
        let generated = command_id_of(&json!({"command": "list"}));
        assert!(generated.starts_with("auto-"));
        assert_eq!(generated.len(), 13);
    }

    #[test]
    fn envelopes_carry_correlation_and_kind() {
        let ok = success_response("c1", "list", json!({"count": 0}));
        assert_eq!(ok, json!({"success": true, "commandId": "c1", "command": "list", "count": 0}));

        let err = error_response("c2", None, &ServiceError::NotFound("Download ID x not found".into()));
        assert_eq!(err["success"], false);
        assert_eq!(err["commandId"], "c2");
        assert_eq!(err["error"], "NotFoundError");
        assert_eq!(err["message"], "Download ID x not found");
    }
}
