//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so the bootstrap
//! is safe to re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Version tag written to `schema_meta` and stamped on activity rows.
pub const SCHEMA_VERSION: i64 = 1;

/// Apply all table definitions to the connected database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session_group (
    id              TEXT PRIMARY KEY NOT NULL,
    name            TEXT NOT NULL,
    max_concurrent  INTEGER NOT NULL CHECK(max_concurrent >= 1),
    status          TEXT NOT NULL CHECK(status IN ('pending','running','paused','completed','failed')),
    specs           TEXT NOT NULL,
    total_cost_usd  REAL NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS command_queue (
    id              TEXT PRIMARY KEY NOT NULL,
    name            TEXT NOT NULL,
    project_path    TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('pending','running','paused','completed','failed','stopped')),
    commands        TEXT NOT NULL,
    current_index   INTEGER NOT NULL DEFAULT 0,
    total_cost_usd  REAL NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT
);

CREATE TABLE IF NOT EXISTS activity (
    session_id      TEXT PRIMARY KEY NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('working','waiting_user_response','idle')),
    project_path    TEXT NOT NULL,
    last_updated    TEXT NOT NULL,
    schema_version  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_meta (
    version         INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_group_status ON session_group(status);
CREATE INDEX IF NOT EXISTS idx_queue_status ON command_queue(status);
CREATE INDEX IF NOT EXISTS idx_activity_project ON activity(project_path);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    sqlx::query(
        "INSERT INTO schema_meta (version) SELECT ?1 WHERE NOT EXISTS (SELECT 1 FROM schema_meta)",
    )
    .bind(SCHEMA_VERSION)
    .execute(pool)
    .await?;
    Ok(())
}

/// Version recorded in `schema_meta`.
///
/// # Errors
///
/// Returns `AppError::Db` if the query fails.
pub async fn schema_version(pool: &SqlitePool) -> Result<i64> {
    let (version,): (i64,) = sqlx::query_as("SELECT version FROM schema_meta LIMIT 1")
        .fetch_one(pool)
        .await?;
    Ok(version)
}
