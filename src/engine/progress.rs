// Groupcast Engine — Sync Progress Tracker
// Projection of sync-engine progress for pollers. The engine writes through
// start/update/finish; callers read `status`. No retries live here.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

use crate::atoms::error::EngineResult;
use crate::atoms::types::{SyncProgress, SyncStatus};
use crate::engine::store::{parse_timestamp, GroupcastStore, ProgressUpdate};

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { message: String },
    Failed { error: String },
    Cancelled,
}

impl RunOutcome {
    pub fn status(&self) -> SyncStatus {
        match self {
            RunOutcome::Completed { .. } => SyncStatus::Completed,
            RunOutcome::Failed { .. } => SyncStatus::Failed,
            RunOutcome::Cancelled => SyncStatus::Cancelled,
        }
    }
}

#[derive(Clone)]
pub struct SyncProgressTracker {
    store: Arc<GroupcastStore>,
    stale_after: Duration,
}

impl SyncProgressTracker {
    pub fn new(store: Arc<GroupcastStore>, stale_after_secs: i64) -> Self {
        SyncProgressTracker { store, stale_after: Duration::seconds(stale_after_secs) }
    }

    /// Create or overwrite the live row. `Busy` when a run is already active.
    pub fn start(&self, user_id: &str, run_id: &str) -> EngineResult<SyncProgress> {
        let row = self.store.start_progress(user_id, run_id)?;
        info!("[progress] {} run {} starting", user_id, run_id);
        Ok(row)
    }

    /// Returns false once the run is no longer the active one.
    pub fn update(&self, user_id: &str, run_id: &str, update: &ProgressUpdate) -> EngineResult<bool> {
        let applied = self.store.update_progress(user_id, run_id, update)?;
        if !applied {
            debug!("[progress] {} run {} update ignored (not active)", user_id, run_id);
        }
        Ok(applied)
    }

    pub fn finish(&self, user_id: &str, run_id: &str, outcome: &RunOutcome) -> EngineResult<bool> {
        let (message, error) = match outcome {
            RunOutcome::Completed { message } => (message.as_str(), None),
            RunOutcome::Failed { error } => ("Sync failed", Some(error.as_str())),
            RunOutcome::Cancelled => ("Cancelled", None),
        };
        let applied = self.store.finish_progress(user_id, run_id, outcome.status(), message, error)?;
        if applied {
            info!("[progress] {} run {} → {}", user_id, run_id, outcome.status());
        }
        Ok(applied)
    }

    pub fn status(&self, user_id: &str) -> EngineResult<SyncProgress> {
        self.status_at(user_id, Utc::now())
    }

    /// Missing rows and terminal rows older than the staleness window read
    /// as `not_running`.
    pub fn status_at(&self, user_id: &str, now: DateTime<Utc>) -> EngineResult<SyncProgress> {
        match self.store.get_progress(user_id)? {
            None => Ok(SyncProgress::not_running(user_id)),
            Some(row) if row.status.is_terminal() => {
                let finished = parse_timestamp(row.completed_at.as_deref().unwrap_or(&row.updated_at));
                if now - finished > self.stale_after {
                    Ok(SyncProgress::not_running(user_id))
                } else {
                    Ok(row)
                }
            }
            Some(row) => Ok(row),
        }
    }

    pub fn is_active(&self, user_id: &str) -> EngineResult<bool> {
        Ok(self.store.get_progress(user_id)?.is_some_and(|p| p.status.is_active()))
    }

    /// Finish time of the last run, when it completed successfully.
    pub fn last_completed_at(&self, user_id: &str) -> EngineResult<Option<DateTime<Utc>>> {
        Ok(self.store.get_progress(user_id)?.and_then(|p| match (p.status, p.completed_at) {
            (SyncStatus::Completed, Some(at)) => Some(parse_timestamp(&at)),
            _ => None,
        }))
    }
}
