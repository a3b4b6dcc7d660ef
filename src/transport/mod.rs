//! Pub/sub transport interface
//!
//! The service only ever talks to a [`Transport`]: a broker client in
//! production, or the in-process [`LoopbackTransport`] for tests and the
//! stdio bridge.

mod loopback;
pub mod stdio;

pub use loopback::LoopbackTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), TransportError>;

    /// Messages on `topic` arrive on the returned receiver until unsubscribed.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Message>, TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}

/// Topic names for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub commands: String,
    pub responses: String,
    pub status: String,
    pub shadow_update: String,
    pub shadow_delta: String,
    pub shadow_get: String,
    pub shadow_get_accepted: String,
}

impl Topics {
    pub fn new(prefix: &str, device_id: &str) -> Self {
        let shadow = format!("$aws/things/{}/shadow/name/models", device_id);
        Self {
            commands: format!("{}/{}/commands", prefix, device_id),
            responses: format!("{}/{}/responses", prefix, device_id),
            status: format!("{}/{}/status", prefix, device_id),
            shadow_update: format!("{}/update", shadow),
            shadow_delta: format!("{}/update/delta", shadow),
            shadow_get: format!("{}/get", shadow),
            shadow_get_accepted: format!("{}/get/accepted", shadow),
        }
    }
}
