//! Edge-device download service
//!
//! Turns commands received over a pub/sub transport into controllable
//! s5cmd download jobs, reports their progress on a status channel, and
//! keeps a durable registry of downloaded models mirrored to a shadow
//! document.

pub mod commands;
pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod registry;
pub mod service;
pub mod system;
pub mod transport;

pub use config::ServiceConfig;
pub use error::{ServiceError, ServiceResult};
pub use service::Service;
