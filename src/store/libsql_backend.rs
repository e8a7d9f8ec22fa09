//! libSQL backend: async `RecordStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::RecordStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

fn parse_body(kind: &str, id: &str, raw: &str) -> Result<serde_json::Value, DatabaseError> {
    serde_json::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("{kind}/{id}: {e}")))
}

#[async_trait]
impl RecordStore for LibSqlBackend {
    async fn upsert(
        &self,
        kind: &str,
        id: &str,
        body: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let body_str =
            serde_json::to_string(body).map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        // `seq` is assigned once, on first insert, so listing keeps creation order.
        self.conn()
            .execute(
                "INSERT INTO records (kind, id, body, created_at, updated_at, seq)
                 VALUES (?1, ?2, ?3, ?4, ?4,
                         (SELECT COALESCE(MAX(seq), 0) + 1 FROM records WHERE kind = ?1))
                 ON CONFLICT (kind, id) DO UPDATE SET body = ?3, updated_at = ?4",
                params![kind, id, body_str, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert {kind}: {e}")))?;
        Ok(())
    }

    async fn get(&self, kind: &str, id: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT body FROM records WHERE kind = ?1 AND id = ?2",
                params![kind, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get {kind}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get {kind}: {e}")))?;
                parse_body(kind, id, &raw).map(Some)
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get {kind}: {e}"))),
        }
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM records WHERE kind = ?1 AND id = ?2",
                params![kind, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete {kind}: {e}")))?;
        Ok(count > 0)
    }

    async fn list(&self, kind: &str) -> Result<Vec<(String, serde_json::Value)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, body FROM records WHERE kind = ?1 ORDER BY seq ASC",
                params![kind],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list {kind}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list {kind}: {e}")))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("list {kind}: {e}")))?;
            let raw: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("list {kind}: {e}")))?;
            let body = parse_body(kind, &id, &raw)?;
            out.push((id, body));
        }
        Ok(out)
    }
}
