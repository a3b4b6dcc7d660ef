use std::io;
use thiserror::Error;

use crate::controller::ControllerState;

/// Errors raised while launching or controlling a transfer process.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Arguments rejected before any process was started.
    #[error("invalid transfer arguments: {0}")]
    InvalidArguments(String),

    /// The engine binary could not be started.
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The requested control operation does not apply in the current state.
    #[error("cannot {action} transfer while it is {state}")]
    InvalidState {
        action: &'static str,
        state: ControllerState,
    },

    /// Signal delivery to the process group failed.
    #[error("failed to signal transfer process: {0}")]
    Signal(#[from] io::Error),
}
