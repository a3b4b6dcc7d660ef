use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::{Message, Transport, TransportError};

/// In-process broker with exact-topic fan-out.
///
/// `with_history` additionally keeps the most recent published messages
/// for inspection; `new` keeps none.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    connected: AtomicBool,
    fail_publish: AtomicBool,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
    taps: Mutex<Vec<mpsc::UnboundedSender<Message>>>,
    history_limit: usize,
    published: Mutex<VecDeque<Message>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records up to `limit` published messages, dropping the oldest.
    pub fn with_history(limit: usize) -> Self {
        Self {
            history_limit: limit,
            ..Self::default()
        }
    }

    /// Delivers a message to subscribers as if it came from the broker.
    pub fn inject(&self, topic: &str, payload: Value) {
        self.deliver(&Message {
            topic: topic.to_string(),
            payload,
        });
    }

    /// Receives a copy of every message published from now on.
    pub fn tap(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.taps).push(tx);
        rx
    }

    pub fn published(&self) -> Vec<Message> {
        lock(&self.published).iter().cloned().collect()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Value> {
        lock(&self.published)
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Makes every publish fail until switched back.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    fn deliver(&self, message: &Message) {
        let mut subscribers = lock(&self.subscribers);
        if let Some(senders) = subscribers.get_mut(&message.topic) {
            senders.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        debug!("loopback_connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.subscribers).clear();
        debug!("loopback_disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "publish failure injected".to_string(),
            });
        }

        let message = Message {
            topic: topic.to_string(),
            payload: payload.clone(),
        };
        if self.history_limit > 0 {
            let mut published = lock(&self.published);
            if published.len() == self.history_limit {
                published.pop_front();
            }
            published.push_back(message.clone());
        }
        lock(&self.taps).retain(|tx| tx.send(message.clone()).is_ok());
        self.deliver(&message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Message>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers)
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        lock(&self.subscribers).remove(topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_requires_connection() {
        let transport = LoopbackTransport::new();
        let err = transport.publish("a", &json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn fan_out_to_subscribers_and_taps() {
        let transport = LoopbackTransport::with_history(8);
        transport.connect().await.unwrap();
        let mut sub = transport.subscribe("dev/commands").await.unwrap();
        let mut tap = transport.tap();

        transport.inject("dev/commands", json!({"command": "list"}));
        assert_eq!(sub.recv().await.unwrap().payload["command"], "list");

        transport.publish("dev/responses", &json!({"success": true})).await.unwrap();
        assert_eq!(tap.recv().await.unwrap().topic, "dev/responses");
        assert_eq!(transport.published_on("dev/responses").len(), 1);

        transport.unsubscribe("dev/commands").await.unwrap();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn history_is_opt_in_and_bounded() {
        let plain = LoopbackTransport::new();
        plain.connect().await.unwrap();
        let mut tap = plain.tap();
        plain.publish("dev/status", &json!({"n": 0})).await.unwrap();
        assert!(plain.published().is_empty());
        assert_eq!(tap.recv().await.unwrap().payload["n"], 0);

        let recording = LoopbackTransport::with_history(2);
        recording.connect().await.unwrap();
        for n in 0..5 {
            recording.publish("dev/status", &json!({"n": n})).await.unwrap();
        }
        let kept: Vec<Value> = recording.published_on("dev/status");
        assert_eq!(kept, vec![json!({"n": 3}), json!({"n": 4})]);
    }
}
