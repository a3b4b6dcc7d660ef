//! Service configuration: JSON file with defaults, overridden by CLI flags

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult};

pub const DEFAULT_TOPIC_PREFIX: &str = "s3downloader";
pub const DEFAULT_DOWNLOAD_DIR: &str = "/data/downloads/model";
pub const DEFAULT_DATABASE_PATH: &str = "/data/downloads/registry.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub device_id: String,
    pub topic_prefix: String,
    pub download_dir: PathBuf,
    /// Registry database file, created on first start
    pub database_path: PathBuf,
    pub s5cmd_path: String,
    pub status_interval_secs: u64,
    pub idle_status_interval_secs: u64,
    pub cancel_grace_secs: u64,
    pub download_timeout_secs: u64,
    pub job_retention_secs: u64,
    pub max_active_jobs: Option<usize>,
    pub low_disk_threshold_gb: f64,
    /// How long startup waits for the stored shadow; 0 skips the request
    pub shadow_restore_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            device_id: "local-device".to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            download_dir: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            s5cmd_path: "s5cmd".to_string(),
            status_interval_secs: 30,
            idle_status_interval_secs: 60,
            cancel_grace_secs: 10,
            download_timeout_secs: 3000,
            job_retention_secs: 3600,
            max_active_jobs: None,
            low_disk_threshold_gb: 1.0,
            shadow_restore_timeout_secs: 5,
        }
    }
}

impl ServiceConfig {
    /// Reads a JSON config file; missing fields take their defaults.
    pub fn load(path: &Path) -> ServiceResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| ServiceError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> ServiceResult<()> {
        if self.device_id.trim().is_empty() {
            return Err(ServiceError::Config("device_id must not be empty".to_string()));
        }
        if self.topic_prefix.trim().is_empty() {
            return Err(ServiceError::Config("topic_prefix must not be empty".to_string()));
        }
        if self.status_interval_secs == 0 || self.idle_status_interval_secs == 0 {
            return Err(ServiceError::Config("status intervals must be positive".to_string()));
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(ServiceError::Config("database_path must not be empty".to_string()));
        }
        if self.max_active_jobs == Some(0) {
            return Err(ServiceError::Config("max_active_jobs must be positive when set".to_string()));
        }
        Ok(())
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn shadow_restore_timeout(&self) -> Duration {
        Duration::from_secs(self.shadow_restore_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"device_id": "edge-7", "status_interval_secs": 5}}"#).unwrap();

        let config = ServiceConfig::load(file.path()).unwrap();
        assert_eq!(config.device_id, "edge-7");
        assert_eq!(config.status_interval_secs, 5);
        assert_eq!(config.idle_status_interval_secs, 60);
        assert_eq!(config.download_timeout_secs, 3000);
        assert_eq!(config.database_path, PathBuf::from(DEFAULT_DATABASE_PATH));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_device_and_zero_interval() {
        let mut config = ServiceConfig::default();
        config.device_id = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.status_interval_secs = 0;
        assert!(matches!(config.validate(), Err(ServiceError::Config(_))));
    }

    #[test]
    fn unreadable_file_is_config_error() {
        let err = ServiceConfig::load(Path::new("/nonexistent/config.json")).unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }
}
