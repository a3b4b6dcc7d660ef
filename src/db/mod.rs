use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use turso::{Builder, Connection};

// Custom error type for database operations
pub(crate) type DbResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub mod models;

pub use models::ModelRecord;

/// Handle to the local registry database.
///
/// The connection is wrapped in a Mutex so statements never interleave.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and ensure tables exist
    pub async fn open(db_path: &Path) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let path = db_path
            .to_str()
            .ok_or_else(|| format!("database path is not valid UTF-8: {}", db_path.display()))?;
        Self::open_at(path).await
    }

    pub async fn open_in_memory() -> DbResult<Self> {
        Self::open_at(":memory:").await
    }

    async fn open_at(path: &str) -> DbResult<Self> {
        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;
        conn.execute_batch(models::get_table_sql()).await?;
        log::debug!("db_open: {}", path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn connection(&self) -> &Mutex<Connection> {
        &self.conn
    }
}
