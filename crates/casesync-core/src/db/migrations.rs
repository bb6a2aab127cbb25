//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Run `statements` in one transaction
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: sync log chain and cleanliness flags
async fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        1,
        &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            // One row per completed sync; doc holds the serialized log
            "CREATE TABLE IF NOT EXISTS sync_logs (
                id TEXT PRIMARY KEY,
                domain TEXT NOT NULL,
                user_id TEXT NOT NULL,
                device_id TEXT,
                previous_log_id TEXT,
                date INTEGER NOT NULL,
                had_state_error INTEGER NOT NULL DEFAULT 0,
                doc TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_logs_previous ON sync_logs(previous_log_id)",
            "CREATE INDEX IF NOT EXISTS idx_sync_logs_user ON sync_logs(domain, user_id, date DESC)",
            "CREATE TABLE IF NOT EXISTS ownership_cleanliness_flags (
                domain TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                is_clean INTEGER NOT NULL DEFAULT 0,
                hint TEXT,
                last_checked INTEGER NOT NULL,
                PRIMARY KEY (domain, owner_id)
            )",
            "INSERT INTO schema_version (version) VALUES (1)",
        ],
    )
    .await
}

/// Migration to version 2: local case store tables
async fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        CURRENT_VERSION,
        &[
            "CREATE TABLE IF NOT EXISTS cases (
                case_id TEXT PRIMARY KEY,
                domain TEXT NOT NULL,
                case_type TEXT NOT NULL DEFAULT '',
                owner_id TEXT NOT NULL,
                closed INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                server_modified_on INTEGER NOT NULL,
                indices TEXT NOT NULL DEFAULT '[]'
            )",
            "CREATE INDEX IF NOT EXISTS idx_cases_owner ON cases(domain, owner_id, closed)",
            "CREATE INDEX IF NOT EXISTS idx_cases_modified ON cases(server_modified_on)",
            "CREATE TABLE IF NOT EXISTS case_indices (
                case_id TEXT NOT NULL REFERENCES cases(case_id) ON DELETE CASCADE,
                identifier TEXT NOT NULL,
                referenced_id TEXT NOT NULL,
                relationship TEXT NOT NULL,
                PRIMARY KEY (case_id, identifier)
            )",
            "CREATE INDEX IF NOT EXISTS idx_case_indices_referenced ON case_indices(referenced_id)",
            "INSERT INTO schema_version (version) VALUES (2)",
        ],
    )
    .await
}
