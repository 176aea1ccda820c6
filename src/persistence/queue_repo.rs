//! Command queue repository for `SQLite` persistence.

use std::sync::Arc;

use crate::models::command_queue::{CommandQueue, QueueCommand, QueueStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_optional_timestamp, parse_timestamp};

/// Repository for command queue records.
#[derive(Clone)]
pub struct QueueRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    name: String,
    project_path: String,
    status: String,
    commands: String,
    current_index: i64,
    total_cost_usd: f64,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl QueueRow {
    fn into_queue(self) -> Result<CommandQueue> {
        let commands: Vec<QueueCommand> = serde_json::from_str(&self.commands)
            .map_err(|e| AppError::Db(format!("invalid commands for queue {}: {e}", self.id)))?;
        let current_index = usize::try_from(self.current_index)
            .map_err(|e| AppError::Db(format!("invalid current_index: {e}")))?;

        Ok(CommandQueue {
            status: QueueStatus::parse(&self.status)
                .map_err(|e| AppError::Db(e.to_string()))?,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
            started_at: parse_optional_timestamp("started_at", self.started_at.as_deref())?,
            completed_at: parse_optional_timestamp("completed_at", self.completed_at.as_deref())?,
            id: self.id,
            name: self.name,
            project_path: self.project_path,
            commands,
            current_index,
            total_cost_usd: self.total_cost_usd,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, name, project_path, status, commands, current_index,
            total_cost_usd, created_at, updated_at, started_at, completed_at
     FROM command_queue";

impl QueueRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace a queue record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if serialization or the write fails.
    pub async fn save(&self, queue: &CommandQueue) -> Result<()> {
        let commands = serde_json::to_string(&queue.commands)?;
        let current_index = i64::try_from(queue.current_index)
            .map_err(|e| AppError::Db(format!("current_index out of range: {e}")))?;
        sqlx::query(
            "INSERT INTO command_queue
                (id, name, project_path, status, commands, current_index, total_cost_usd,
                 created_at, updated_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                project_path = excluded.project_path,
                status = excluded.status,
                commands = excluded.commands,
                current_index = excluded.current_index,
                total_cost_usd = excluded.total_cost_usd,
                updated_at = excluded.updated_at,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at",
        )
        .bind(&queue.id)
        .bind(&queue.name)
        .bind(&queue.project_path)
        .bind(queue.status.as_str())
        .bind(&commands)
        .bind(current_index)
        .bind(queue.total_cost_usd)
        .bind(queue.created_at.to_rfc3339())
        .bind(queue.updated_at.to_rfc3339())
        .bind(queue.started_at.map(|ts| ts.to_rfc3339()))
        .bind(queue.completed_at.map(|ts| ts.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Retrieve a queue by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::QueueNotFound` if no row exists.
    pub async fn get(&self, id: &str) -> Result<CommandQueue> {
        let row: Option<QueueRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.ok_or_else(|| AppError::QueueNotFound(id.to_owned()))?
            .into_queue()
    }

    /// List queues, optionally by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row is malformed.
    pub async fn list(&self, status: Option<QueueStatus>) -> Result<Vec<CommandQueue>> {
        let rows: Vec<QueueRow> = match status {
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
        rows.into_iter().map(QueueRow::into_queue).collect()
    }

    /// Delete a queue; returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM command_queue WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
