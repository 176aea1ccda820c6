//! Activity store for `SQLite` persistence.
//!
//! Rows carry the schema version they were written under; rows from another
//! version are ignored on load.

use std::sync::Arc;

use crate::models::activity::{ActivityEntry, ActivityFilter, ActivityStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::parse_timestamp;
use super::schema::SCHEMA_VERSION;

/// Repository for activity entries keyed by session id.
#[derive(Clone)]
pub struct ActivityRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ActivityRow {
    session_id: String,
    status: String,
    project_path: String,
    last_updated: String,
}

impl ActivityRow {
    fn into_entry(self) -> Result<ActivityEntry> {
        Ok(ActivityEntry {
            status: ActivityStatus::parse(&self.status)
                .map_err(|e| AppError::Db(e.to_string()))?,
            last_updated: parse_timestamp("last_updated", &self.last_updated)?,
            session_id: self.session_id,
            project_path: self.project_path,
        })
    }
}

impl ActivityRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace the entry for its session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn upsert(&self, entry: &ActivityEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO activity (session_id, status, project_path, last_updated, schema_version)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                status = excluded.status,
                project_path = excluded.project_path,
                last_updated = excluded.last_updated,
                schema_version = excluded.schema_version",
        )
        .bind(&entry.session_id)
        .bind(entry.status.as_str())
        .bind(&entry.project_path)
        .bind(entry.last_updated.to_rfc3339())
        .bind(SCHEMA_VERSION)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Entries written under the current schema version that pass `filter`,
    /// most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row is malformed.
    pub async fn list(&self, filter: &ActivityFilter) -> Result<Vec<ActivityEntry>> {
        let rows: Vec<ActivityRow> = sqlx::query_as(
            "SELECT session_id, status, project_path, last_updated
             FROM activity
             WHERE schema_version = ?1
             ORDER BY last_updated DESC",
        )
        .bind(SCHEMA_VERSION)
        .fetch_all(self.db.as_ref())
        .await?;

        let entries = rows
            .into_iter()
            .map(ActivityRow::into_entry)
            .collect::<Result<Vec<_>>>()?;
        Ok(entries.into_iter().filter(|e| filter.matches(e)).collect())
    }

    /// Remove a session's entry; returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn remove(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM activity WHERE session_id = ?1")
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
