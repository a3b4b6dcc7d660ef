//! Command channel: envelope parsing and dispatch

mod dispatcher;
mod envelope;

pub use dispatcher::CommandDispatcher;
pub use envelope::{
    command_id_of, error_response, parse_command, success_response, Command, DownloadCommand,
    JobTarget, ListCommand, ListScope, ModelTarget,
};
