use super::{Database, DbResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One registered model. Unknown caller fields ride along in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_id: String,
    pub local_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default)]
    pub last_updated: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Get SQL for creating the models table
pub fn get_table_sql() -> &'static str {
    "
    CREATE TABLE IF NOT EXISTS models (
        model_id TEXT PRIMARY KEY,
        local_path TEXT NOT NULL,
        model_name TEXT,
        model_version TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        last_updated INTEGER NOT NULL
    );
    "
}

impl Database {
    /// Insert or replace a model record
    pub async fn upsert_model(&self, record: &ModelRecord) -> DbResult<()> {
        let metadata = serde_json::to_string(&record.extra)?;
        let conn = self.connection().lock().await;
        conn.execute(
            "INSERT INTO models (model_id, local_path, model_name, model_version, metadata, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (model_id) DO UPDATE SET
                local_path = ?2, model_name = ?3, model_version = ?4, metadata = ?5, last_updated = ?6",
            turso::params![
                record.model_id.clone(),
                record.local_path.clone(),
                record.model_name.clone(),
                record.model_version.clone(),
                metadata,
                record.last_updated,
            ],
        )
        .await?;
        Ok(())
    }

    /// Get model by ID
    pub async fn get_model(&self, model_id: &str) -> DbResult<Option<ModelRecord>> {
        let conn = self.connection().lock().await;
        let mut rows = conn
            .query(
                "SELECT model_id, local_path, model_name, model_version, metadata, last_updated
                 FROM models WHERE model_id = ?1",
                turso::params![model_id],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(read_model(&row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn list_models(&self) -> DbResult<Vec<ModelRecord>> {
        let conn = self.connection().lock().await;
        let mut rows = conn
            .query(
                "SELECT model_id, local_path, model_name, model_version, metadata, last_updated
                 FROM models ORDER BY model_id",
                (),
            )
            .await?;

        let mut models = Vec::new();
        while let Some(row) = rows.next().await? {
            models.push(read_model(&row)?);
        }
        Ok(models)
    }

    /// Delete model; returns false when no row matched
    pub async fn delete_model(&self, model_id: &str) -> DbResult<bool> {
        let conn = self.connection().lock().await;
        let affected = conn
            .execute("DELETE FROM models WHERE model_id = ?1", turso::params![model_id])
            .await?;
        Ok(affected > 0)
    }
}

fn read_model(row: &turso::Row) -> DbResult<ModelRecord> {
    let metadata: String = row.get(4)?;
    let extra = match serde_json::from_str::<Value>(&metadata)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(ModelRecord {
        model_id: row.get(0)?,
        local_path: row.get(1)?,
        model_name: row.get(2)?,
        model_version: row.get(3)?,
        last_updated: row.get(5)?,
        extra,
    })
}
