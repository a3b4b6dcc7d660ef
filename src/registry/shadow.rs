use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ModelRegistry;
use crate::error::ServiceError;
use crate::transport::{Topics, Transport};

pub const SYNC_BACKOFF_START: Duration = Duration::from_secs(1);
pub const SYNC_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Publishes the reported document whenever the registry changes.
///
/// Before the first publish the stored shadow is requested and models
/// missing locally are restored from it, waiting at most `restore_wait`
/// (zero skips the request). Bursts of writes coalesce into one publish.
/// A failed publish is retried with exponential backoff; local writes never
/// wait on it.
pub fn spawn_shadow_sync(
    registry: Arc<ModelRegistry>,
    transport: Arc<dyn Transport>,
    topics: Topics,
    restore_wait: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !restore_wait.is_zero() {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = restore_from_shadow(&registry, transport.as_ref(), &topics, restore_wait) => {}
            }
        }
        // Report current state once at startup
        registry.request_sync();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = registry.sync_requested() => {}
            }

            let mut backoff = SYNC_BACKOFF_START;
            loop {
                match sync_once(&registry, transport.as_ref(), &topics).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!("shadow_sync: {} (retry in {:?})", e, backoff);
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(SYNC_BACKOFF_MAX);
                    }
                }
            }
        }
        debug!("shadow_sync: stopped");
    })
}

/// Requests the stored shadow document and seeds missing models from it.
async fn restore_from_shadow(registry: &ModelRegistry, transport: &dyn Transport, topics: &Topics, wait: Duration) {
    let mut accepted = match transport.subscribe(&topics.shadow_get_accepted).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!("shadow_restore: subscribe failed: {}", e);
            return;
        }
    };

    match transport.publish(&topics.shadow_get, &json!({})).await {
        Ok(()) => match tokio::time::timeout(wait, accepted.recv()).await {
            Ok(Some(message)) => {
                if let Err(e) = registry.restore_reported(&message.payload).await {
                    warn!("shadow_restore: {}", e);
                }
            }
            Ok(None) => warn!("shadow_restore: subscription closed"),
            Err(_) => info!("shadow_restore: no stored shadow within {:?}", wait),
        },
        Err(e) => warn!("shadow_restore: request failed: {}", e),
    }
    let _ = transport.unsubscribe(&topics.shadow_get_accepted).await;
}

async fn sync_once(
    registry: &ModelRegistry,
    transport: &dyn Transport,
    topics: &Topics,
) -> Result<(), ServiceError> {
    let (document, deleted) = registry.shadow_document().await?;
    transport
        .publish(&topics.shadow_update, &document)
        .await
        .map_err(|e| ServiceError::Sync(e.to_string()))?;
    registry.mark_deletes_synced(&deleted);
    debug!("shadow_sync: published {}", topics.shadow_update);
    Ok(())
}

/// Applies desired-state deltas pushed by the shadow service.
pub fn spawn_delta_listener(
    registry: Arc<ModelRegistry>,
    transport: Arc<dyn Transport>,
    topics: Topics,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut deltas = match transport.subscribe(&topics.shadow_delta).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("shadow_delta: subscribe failed: {}", e);
                return;
            }
        };

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = deltas.recv() => message,
            };
            let Some(message) = message else { break };

            match registry.apply_shadow_delta(&message.payload).await {
                Ok(applied) => info!("shadow_delta: applied {} entries", applied),
                Err(e) => warn!("shadow_delta: rejected: {}", e),
            }
        }
        let _ = transport.unsubscribe(&topics.shadow_delta).await;
    })
}
