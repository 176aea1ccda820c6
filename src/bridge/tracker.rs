//! In-memory activity tracker.
//!
//! Holds the latest [`ActivityEntry`] per session. Entries are created when a
//! session starts, refreshed by the update bridge on every transcript batch,
//! and marked idle when the session ends.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::activity::{ActivityEntry, ActivityFilter, ActivityStatus};

/// Shared, cloneable activity map keyed by session id.
#[derive(Debug, Clone, Default)]
pub struct ActivityTracker {
    entries: Arc<RwLock<HashMap<String, ActivityEntry>>>,
}

impl ActivityTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly started session as `working`.
    pub async fn begin(&self, session_id: &str, project_path: &str) -> ActivityEntry {
        self.record(session_id, project_path, ActivityStatus::Working)
            .await
    }

    /// Upsert a session's status, stamping `last_updated`.
    pub async fn record(
        &self,
        session_id: &str,
        project_path: &str,
        status: ActivityStatus,
    ) -> ActivityEntry {
        let mut guard = self.entries.write().await;
        let entry = guard
            .entry(session_id.to_owned())
            .and_modify(|entry| {
                entry.status = status;
                entry.last_updated = Utc::now();
                if !project_path.is_empty() {
                    project_path.clone_into(&mut entry.project_path);
                }
            })
            .or_insert_with(|| {
                ActivityEntry::new(session_id.to_owned(), project_path.to_owned(), status)
            });
        debug!(session_id, status = %status, "activity updated");
        entry.clone()
    }

    /// Mark a session idle; unknown sessions are ignored.
    pub async fn finish(&self, session_id: &str) -> Option<ActivityEntry> {
        let mut guard = self.entries.write().await;
        guard.get_mut(session_id).map(|entry| {
            entry.status = ActivityStatus::Idle;
            entry.last_updated = Utc::now();
            entry.clone()
        })
    }

    /// Insert an entry as-is, e.g. when restoring from storage.
    pub async fn restore(&self, entry: ActivityEntry) {
        self.entries
            .write()
            .await
            .insert(entry.session_id.clone(), entry);
    }

    /// Current entry for a session.
    pub async fn get(&self, session_id: &str) -> Option<ActivityEntry> {
        self.entries.read().await.get(session_id).cloned()
    }

    /// Entries matching `filter`, most recently updated first.
    pub async fn list(&self, filter: &ActivityFilter) -> Vec<ActivityEntry> {
        let guard = self.entries.read().await;
        let mut entries: Vec<ActivityEntry> = guard
            .values()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.last_updated
                .cmp(&a.last_updated)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        entries
    }
}
