use s5_runner::TransferError;
use std::path::PathBuf;
use thiserror::Error;

/// Service-level error; every command failure is reported as one of these.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    State(String),

    #[error("{0}")]
    Capacity(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("failed to prepare destination {}: {source}", path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read disk usage of {}: {source}", path.display())]
    System {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry storage failed: {0}")]
    Registry(String),

    #[error("shadow sync failed: {0}")]
    Sync(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ServiceError {
    /// Error kind name carried in response envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "ValidationError",
            ServiceError::NotFound(_) => "NotFoundError",
            ServiceError::State(_) => "StateError",
            ServiceError::Capacity(_) => "CapacityError",
            ServiceError::Transfer(TransferError::InvalidArguments(_)) => "ValidationError",
            ServiceError::Transfer(TransferError::InvalidState { .. }) => "StateError",
            ServiceError::Transfer(_) | ServiceError::Destination { .. } => "TransferError",
            ServiceError::System { .. } => "SystemError",
            ServiceError::Registry(_) => "RegistryError",
            ServiceError::Sync(_) => "SyncError",
            ServiceError::Transport(_) => "TransportError",
            ServiceError::Config(_) => "ConfigError",
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(ServiceError::Validation("x".into()).kind(), "ValidationError");
        assert_eq!(ServiceError::NotFound("x".into()).kind(), "NotFoundError");
        assert_eq!(
            ServiceError::from(TransferError::InvalidArguments("bad".into())).kind(),
            "ValidationError"
        );
        let launch = TransferError::Launch {
            program: "s5cmd".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(ServiceError::from(launch).kind(), "TransferError");
    }

    #[test]
    fn disk_usage_failure_is_not_a_validation_error() {
        let err = ServiceError::System {
            path: PathBuf::from("/data"),
            source: std::io::Error::from_raw_os_error(libc::EIO),
        };
        assert_eq!(err.kind(), "SystemError");
        assert!(err.to_string().starts_with("cannot read disk usage of /data"));
    }
}
