//! Model registry: local durable records mirrored to a remote shadow document

mod shadow;

pub use shadow::{spawn_delta_listener, spawn_shadow_sync, SYNC_BACKOFF_MAX, SYNC_BACKOFF_START};

use log::{info, warn};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::db::{Database, ModelRecord};
use crate::error::{ServiceError, ServiceResult};

pub struct ModelRegistry {
    db: Database,
    /// Deleted ids still to be reported as `null` to the shadow
    pending_deletes: Mutex<BTreeSet<String>>,
    sync_needed: Notify,
}

impl ModelRegistry {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            pending_deletes: Mutex::new(BTreeSet::new()),
            sync_needed: Notify::new(),
        }
    }

    /// Replaces the record for `model_id` and stamps `last_updated`.
    pub async fn upsert(&self, mut record: ModelRecord) -> ServiceResult<ModelRecord> {
        if record.model_id.trim().is_empty() {
            return Err(ServiceError::Validation("model_id is required".to_string()));
        }
        if record.local_path.trim().is_empty() {
            return Err(ServiceError::Validation("local_path is required".to_string()));
        }
        record.last_updated = chrono::Utc::now().timestamp();

        self.db
            .upsert_model(&record)
            .await
            .map_err(|e| ServiceError::Registry(e.to_string()))?;
        self.lock_pending().remove(&record.model_id);
        info!("model_upsert: {} path={}", record.model_id, record.local_path);
        self.request_sync();
        Ok(record)
    }

    pub async fn get(&self, model_id: &str) -> ServiceResult<ModelRecord> {
        self.db
            .get_model(model_id)
            .await
            .map_err(|e| ServiceError::Registry(e.to_string()))?
            .ok_or_else(|| ServiceError::NotFound(format!("Model {} not found", model_id)))
    }

    pub async fn list(&self) -> ServiceResult<Vec<ModelRecord>> {
        self.db
            .list_models()
            .await
            .map_err(|e| ServiceError::Registry(e.to_string()))
    }

    pub async fn delete(&self, model_id: &str) -> ServiceResult<()> {
        let removed = self
            .db
            .delete_model(model_id)
            .await
            .map_err(|e| ServiceError::Registry(e.to_string()))?;
        if !removed {
            return Err(ServiceError::NotFound(format!("Model {} not found", model_id)));
        }
        self.lock_pending().insert(model_id.to_string());
        info!("model_delete: {}", model_id);
        self.request_sync();
        Ok(())
    }

    /// Full reported document: every record plus `null` for pending deletions.
    pub async fn shadow_document(&self) -> ServiceResult<(Value, Vec<String>)> {
        let mut models = Map::new();
        let deleted: Vec<String> = self.lock_pending().iter().cloned().collect();
        for id in &deleted {
            models.insert(id.clone(), Value::Null);
        }
        for record in self.list().await? {
            let value = serde_json::to_value(&record)
                .map_err(|e| ServiceError::Registry(e.to_string()))?;
            models.insert(record.model_id.clone(), value);
        }
        Ok((json!({"state": {"reported": {"models": models}}}), deleted))
    }

    /// Seeds records from a stored shadow document
    /// (`{state: {reported: {models: {..}}}}`).
    ///
    /// Only ids missing locally are added, keeping their `last_updated`.
    /// Returns how many were restored.
    pub async fn restore_reported(&self, document: &Value) -> ServiceResult<usize> {
        let Some(models) = document
            .pointer("/state/reported/models")
            .and_then(Value::as_object)
        else {
            return Ok(0);
        };

        let mut restored = 0;
        for (model_id, entry) in models {
            let Value::Object(fields) = entry else { continue };
            match self.db.get_model(model_id).await {
                Ok(None) => {}
                Ok(Some(_)) => continue,
                Err(e) => return Err(ServiceError::Registry(e.to_string())),
            }
            let mut fields = fields.clone();
            fields.insert("model_id".to_string(), Value::String(model_id.clone()));
            let record: ModelRecord = match serde_json::from_value(Value::Object(fields)) {
                Ok(record) => record,
                Err(e) => {
                    warn!("shadow_restore: skipped {}: {}", model_id, e);
                    continue;
                }
            };
            if record.local_path.trim().is_empty() {
                warn!("shadow_restore: skipped {}: no local_path", model_id);
                continue;
            }
            self.db
                .upsert_model(&record)
                .await
                .map_err(|e| ServiceError::Registry(e.to_string()))?;
            restored += 1;
        }
        if restored > 0 {
            info!("shadow_restore: {} models restored", restored);
        }
        Ok(restored)
    }

    /// Forget deletions once the shadow has acknowledged them.
    pub(crate) fn mark_deletes_synced(&self, ids: &[String]) {
        let mut pending = self.lock_pending();
        for id in ids {
            pending.remove(id);
        }
    }

    /// Applies `{state: {models: {<id>: record | null}}}` from the shadow.
    ///
    /// Returns the number of entries applied. Entries that cannot be applied
    /// are logged and skipped.
    pub async fn apply_shadow_delta(&self, delta: &Value) -> ServiceResult<usize> {
        let models = delta
            .get("state")
            .and_then(|s| s.get("models"))
            .and_then(Value::as_object)
            .ok_or_else(|| ServiceError::Validation("delta has no state.models object".to_string()))?;

        let mut applied = 0;
        for (model_id, change) in models {
            let result = match change {
                Value::Null => match self.delete(model_id).await {
                    Err(ServiceError::NotFound(_)) => Ok(()),
                    other => other,
                },
                Value::Object(fields) => self.merge(model_id, fields).await.map(|_| ()),
                _ => Err(ServiceError::Validation(format!(
                    "delta entry for {} is neither object nor null",
                    model_id
                ))),
            };
            match result {
                Ok(()) => applied += 1,
                Err(e) => warn!("shadow_delta: skipped {}: {}", model_id, e),
            }
        }
        Ok(applied)
    }

    async fn merge(&self, model_id: &str, fields: &Map<String, Value>) -> ServiceResult<ModelRecord> {
        let mut merged = match self.get(model_id).await {
            Ok(existing) => match serde_json::to_value(existing) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            },
            Err(ServiceError::NotFound(_)) => Map::new(),
            Err(e) => return Err(e),
        };
        for (k, v) in fields {
            merged.insert(k.clone(), v.clone());
        }
        merged.insert("model_id".to_string(), Value::String(model_id.to_string()));

        let record: ModelRecord = serde_json::from_value(Value::Object(merged))
            .map_err(|e| ServiceError::Validation(format!("invalid model record {}: {}", model_id, e)))?;
        self.upsert(record).await
    }

    pub(crate) fn request_sync(&self) {
        self.sync_needed.notify_one();
    }

    pub(crate) async fn sync_requested(&self) {
        self.sync_needed.notified().await;
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.pending_deletes.lock().unwrap_or_else(|p| p.into_inner())
    }
}
