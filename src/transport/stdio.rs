//! JSON-lines bridge between the loopback broker and stdin/stdout
//!
//! Inbound: one JSON value per line. `{"topic": .., "payload": ..}` is
//! injected on that topic; any other object is treated as a command.
//! Outbound: every published message as `{"topic": .., "payload": ..}`.

use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{LoopbackTransport, Message};

/// Reads lines until EOF or cancellation, injecting each into the broker.
pub async fn pump_inbound<R>(
    reader: R,
    transport: Arc<LoopbackTransport>,
    command_topic: String,
    shutdown: CancellationToken,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdio_inbound: eof");
                break;
            }
            Err(e) => {
                warn!("stdio_inbound: read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(&line) {
            Ok(value) => {
                let (topic, payload) = route(value, &command_topic);
                transport.inject(&topic, payload);
            }
            Err(e) => warn!("stdio_inbound: invalid JSON line: {}", e),
        }
    }
}

fn route(value: Value, command_topic: &str) -> (String, Value) {
    if let Value::Object(map) = &value {
        if let (Some(Value::String(topic)), Some(payload)) = (map.get("topic"), map.get("payload")) {
            return (topic.clone(), payload.clone());
        }
    }
    (command_topic.to_string(), value)
}

/// Writes every tapped message as one JSON line.
pub async fn pump_outbound<W>(mut rx: mpsc::UnboundedReceiver<Message>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = match serde_json::to_vec(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!("stdio_outbound: serialize failed: {}", e);
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).await {
            warn!("stdio_outbound: write failed: {}", e);
            break;
        }
        let _ = writer.flush().await;
    }
}
