//! `RecordStore` trait: single async interface for all persistence.
//!
//! Every stateful component (directory, rules, channel gate, admin state,
//! sync cursor) persists through this keyed record interface. Records are
//! JSON documents grouped by kind; nothing needs range queries beyond
//! "all records of a kind".

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::DatabaseError;

/// Record kinds used across the crate.
pub mod kinds {
    pub const CONTACT: &str = "contact";
    pub const RULE: &str = "rule";
    pub const CHANNEL_STATE: &str = "channel_state";
    pub const SYNC_CURSOR: &str = "sync_cursor";
    pub const PROCESSED_ITEM: &str = "processed_item";
    pub const PENDING_ITEM: &str = "pending_item";
    pub const ADMIN_SESSION: &str = "admin_session";
}

/// Backend-agnostic keyed record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record.
    async fn upsert(
        &self,
        kind: &str,
        id: &str,
        body: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Fetch a record by kind and id.
    async fn get(&self, kind: &str, id: &str) -> Result<Option<serde_json::Value>, DatabaseError>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, kind: &str, id: &str) -> Result<bool, DatabaseError>;

    /// All records of a kind, in insertion order.
    async fn list(&self, kind: &str) -> Result<Vec<(String, serde_json::Value)>, DatabaseError>;
}

/// Serialize and upsert a typed record.
pub async fn put_record<T: Serialize + Sync>(
    store: &dyn RecordStore,
    kind: &str,
    id: &str,
    record: &T,
) -> Result<(), DatabaseError> {
    let body =
        serde_json::to_value(record).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    store.upsert(kind, id, &body).await
}

/// Fetch and deserialize a typed record.
pub async fn get_record<T: DeserializeOwned>(
    store: &dyn RecordStore,
    kind: &str,
    id: &str,
) -> Result<Option<T>, DatabaseError> {
    match store.get(kind, id).await? {
        Some(body) => serde_json::from_value(body)
            .map(Some)
            .map_err(|e| DatabaseError::Serialization(format!("{kind}/{id}: {e}"))),
        None => Ok(None),
    }
}

/// Load every record of a kind, skipping rows that no longer deserialize.
pub async fn list_records<T: DeserializeOwned>(
    store: &dyn RecordStore,
    kind: &str,
) -> Result<Vec<T>, DatabaseError> {
    let rows = store.list(kind).await?;
    let mut out = Vec::with_capacity(rows.len());
    for (id, body) in rows {
        match serde_json::from_value(body) {
            Ok(record) => out.push(record),
            Err(e) => tracing::warn!(kind, id = %id, error = %e, "Skipping unreadable record"),
        }
    }
    Ok(out)
}
