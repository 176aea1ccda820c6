//! Session group repository for `SQLite` persistence.
//!
//! Specs are stored as a JSON array on the group row; a group is always
//! read and written whole.

use std::sync::Arc;

use crate::models::session_group::{GroupStatus, SessionGroup, SessionSpec};
use crate::{AppError, Result};

use super::db::Database;
use super::parse_timestamp;

/// Repository for session group records.
#[derive(Clone)]
pub struct GroupRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct GroupRow {
    id: String,
    name: String,
    max_concurrent: i64,
    status: String,
    specs: String,
    total_cost_usd: f64,
    created_at: String,
    updated_at: String,
}

impl GroupRow {
    fn into_group(self) -> Result<SessionGroup> {
        let specs: Vec<SessionSpec> = serde_json::from_str(&self.specs)
            .map_err(|e| AppError::Db(format!("invalid specs for group {}: {e}", self.id)))?;
        let max_concurrent = u32::try_from(self.max_concurrent)
            .map_err(|e| AppError::Db(format!("invalid max_concurrent: {e}")))?;

        Ok(SessionGroup {
            status: GroupStatus::parse(&self.status)
                .map_err(|e| AppError::Db(e.to_string()))?,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
            id: self.id,
            name: self.name,
            max_concurrent,
            specs,
            total_cost_usd: self.total_cost_usd,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, name, max_concurrent, status, specs, total_cost_usd, created_at, updated_at
     FROM session_group";

impl GroupRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace a group record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if serialization or the write fails.
    pub async fn save(&self, group: &SessionGroup) -> Result<()> {
        let specs = serde_json::to_string(&group.specs)?;
        sqlx::query(
            "INSERT INTO session_group
                (id, name, max_concurrent, status, specs, total_cost_usd, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                max_concurrent = excluded.max_concurrent,
                status = excluded.status,
                specs = excluded.specs,
                total_cost_usd = excluded.total_cost_usd,
                updated_at = excluded.updated_at",
        )
        .bind(&group.id)
        .bind(&group.name)
        .bind(i64::from(group.max_concurrent))
        .bind(group.status.as_str())
        .bind(&specs)
        .bind(group.total_cost_usd)
        .bind(group.created_at.to_rfc3339())
        .bind(group.updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Retrieve a group by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::GroupNotFound` if no row exists.
    pub async fn get(&self, id: &str) -> Result<SessionGroup> {
        let row: Option<GroupRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.ok_or_else(|| AppError::GroupNotFound(id.to_owned()))?
            .into_group()
    }

    /// List groups, optionally by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row is malformed.
    pub async fn list(&self, status: Option<GroupStatus>) -> Result<Vec<SessionGroup>> {
        let rows: Vec<GroupRow> = match status {
            Some(status) => {
                sqlx::query_as(&format!(
                    "{SELECT_COLUMNS} WHERE status = ?1 ORDER BY created_at ASC"
                ))
                .bind(status.as_str())
                .fetch_all(self.db.as_ref())
                .await?
            }
            None => {
                sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY created_at ASC"))
                    .fetch_all(self.db.as_ref())
                    .await?
            }
        };
        rows.into_iter().map(GroupRow::into_group).collect()
    }

    /// Delete a group; returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM session_group WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
