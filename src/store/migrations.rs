//! Schema versions for the record table.
//!
//! `run_migrations` reads the highest applied version from `_schema_version`
//! and applies every later step inside its own transaction, so a failed step
//! leaves the version untouched.

use libsql::Connection;
use tracing::{debug, info};

use crate::error::DatabaseError;

/// Ordered schema steps. Append only.
const STEPS: &[(i64, &str, &str)] = &[
    (
        1,
        "records",
        "CREATE TABLE IF NOT EXISTS records (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (kind, id)
        );
        CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind);",
    ),
    (
        2,
        "records_write_order",
        "ALTER TABLE records ADD COLUMN seq INTEGER NOT NULL DEFAULT 0;
        CREATE INDEX IF NOT EXISTS idx_records_kind_seq ON records(kind, seq);",
    ),
];

fn migration_err(context: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Migration(format!("{context}: {e}"))
}

pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(migration_err("creating _schema_version"))?;

    let applied = schema_version(conn).await?;
    let pending: Vec<_> = STEPS.iter().filter(|(v, _, _)| *v > applied).collect();
    if pending.is_empty() {
        debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for (version, name, sql) in pending {
        info!(version, name, "Applying schema step");
        let tx = conn
            .transaction()
            .await
            .map_err(migration_err("opening transaction"))?;
        tx.execute_batch(sql)
            .await
            .map_err(|e| DatabaseError::Migration(format!("step V{version} ({name}): {e}")))?;
        tx.execute(
            "INSERT INTO _schema_version (version, name) VALUES (?1, ?2)",
            libsql::params![*version, *name],
        )
        .await
        .map_err(migration_err("recording schema version"))?;
        tx.commit()
            .await
            .map_err(migration_err("committing schema step"))?;
    }

    info!(version = schema_version(conn).await?, "Schema migrated");
    Ok(())
}

/// Highest applied step, 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _schema_version", ())
        .await
        .map_err(migration_err("querying schema version"))?;
    match rows.next().await.map_err(migration_err("reading schema version"))? {
        Some(row) => row.get::<i64>(0).map_err(migration_err("parsing schema version")),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_conn() -> Connection {
        libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap()
            .connect()
            .unwrap()
    }

    #[tokio::test]
    async fn fresh_database_gets_record_table() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT name FROM sqlite_master WHERE type='table' AND name='records'", ())
            .await
            .unwrap();
        assert!(rows.next().await.unwrap().is_some());
        assert_eq!(schema_version(&conn).await.unwrap(), STEPS.len() as i64);
    }

    #[tokio::test]
    async fn rerun_is_a_no_op() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT COUNT(*) FROM _schema_version", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, 2);
    }
}
