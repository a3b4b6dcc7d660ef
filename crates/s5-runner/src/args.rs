//! `s5cmd cp` argument construction

use std::path::PathBuf;

use crate::error::TransferError;

/// Size of the engine's global worker pool
pub const DEFAULT_NUM_WORKERS: u32 = 256;

/// Parts transferred in parallel for a single file
pub const DEFAULT_CONCURRENCY: u32 = 5;

/// Engine-side retry budget (exponential backoff, capped at one minute)
pub const DEFAULT_RETRY_COUNT: u32 = 10;

/// Source, target and tuning knobs for one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferArgs {
    pub bucket: String,
    pub key: String,
    pub destination: PathBuf,
    pub num_workers: u32,
    pub concurrency: u32,
    pub retry_count: u32,
    pub accelerate: bool,
}

impl TransferArgs {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            destination: destination.into(),
            num_workers: DEFAULT_NUM_WORKERS,
            concurrency: DEFAULT_CONCURRENCY,
            retry_count: DEFAULT_RETRY_COUNT,
            accelerate: false,
        }
    }

    /// A key ending in `/` names a prefix; everything under it is copied.
    pub fn is_recursive(&self) -> bool {
        self.key.ends_with('/')
    }

    pub fn source_url(&self) -> String {
        if self.is_recursive() {
            format!("s3://{}/{}*", self.bucket, self.key)
        } else {
            format!("s3://{}/{}", self.bucket, self.key)
        }
    }

    /// Full argument vector: global options first, then the `cp` subcommand.
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = vec![
            "--numworkers".to_string(),
            self.num_workers.to_string(),
            "--retry-count".to_string(),
            self.retry_count.to_string(),
        ];
        if self.accelerate {
            argv.push("--use-accelerate-endpoint".to_string());
        }
        argv.extend([
            "cp".to_string(),
            "--concurrency".to_string(),
            self.concurrency.to_string(),
            "--show-progress".to_string(),
            self.source_url(),
            self.destination.to_string_lossy().into_owned(),
        ]);
        argv
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.bucket.is_empty() {
            return Err(TransferError::InvalidArguments("bucket is empty".to_string()));
        }
        if self.key.is_empty() {
            return Err(TransferError::InvalidArguments("key is empty".to_string()));
        }
        if self.destination.as_os_str().is_empty() {
            return Err(TransferError::InvalidArguments("destination is empty".to_string()));
        }
        if !self.bucket.chars().all(is_path_char) {
            return Err(TransferError::InvalidArguments(format!(
                "invalid bucket name: {}",
                self.bucket
            )));
        }
        // Wildcards are added by us for prefixes, never accepted from callers
        if self.key.starts_with('/')
            || !self.key.chars().all(|c| c == '/' || is_path_char(c))
        {
            return Err(TransferError::InvalidArguments(format!(
                "invalid object key: {}",
                self.key
            )));
        }
        if self.num_workers == 0 || self.concurrency == 0 {
            return Err(TransferError::InvalidArguments(
                "numworkers and concurrency must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_object_argv_orders_global_options_first() {
        let args = TransferArgs::new("models", "llm/weights.bin", "/data/llm");
        assert_eq!(
            args.to_argv(),
            vec![
                "--numworkers",
                "256",
                "--retry-count",
                "10",
                "cp",
                "--concurrency",
                "5",
                "--show-progress",
                "s3://models/llm/weights.bin",
                "/data/llm",
            ]
        );
    }

    #[test]
    fn prefix_key_becomes_wildcard_copy_with_acceleration() {
        let mut args = TransferArgs::new("models", "qwen/", "/data/qwen");
        args.accelerate = true;
        args.num_workers = 64;
        let argv = args.to_argv();

        assert!(args.is_recursive());
        assert_eq!(argv[4], "--use-accelerate-endpoint");
        assert_eq!(argv[1], "64");
        assert!(argv.contains(&"s3://models/qwen/*".to_string()));
    }

    #[test]
    fn validate_rejects_empty_and_unsafe_values() {
        assert!(TransferArgs::new("", "k", "/d").validate().is_err());
        assert!(TransferArgs::new("b", "", "/d").validate().is_err());
        assert!(TransferArgs::new("b", "k", "").validate().is_err());
        assert!(TransferArgs::new("b", "a;rm -rf", "/d").validate().is_err());
        assert!(TransferArgs::new("b", "dir/*", "/d").validate().is_err());
        assert!(TransferArgs::new("b/c", "k", "/d").validate().is_err());
        assert!(TransferArgs::new("my-bucket.1", "a/b_c/d-1.bin", "/d").validate().is_ok());
    }
}
