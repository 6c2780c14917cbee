use rusqlite::{params, OptionalExtension, Row};

use super::channels::{opt_text_col, text_col};
use super::{now_timestamp, GroupcastStore};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{SyncPhase, SyncProgress, SyncStatus};

const PROGRESS_COLUMNS: &str = "user_id, run_id, status, phase, groups_found, admins_found, \
                                total_scanned, current_batch, message, started_at, updated_at, \
                                completed_at, error";

/// Partial update written by the sync engine after each page or batch.
/// `None` fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub status: Option<SyncStatus>,
    pub phase: Option<SyncPhase>,
    pub groups_found: Option<u32>,
    pub admins_found: Option<u32>,
    pub total_scanned: Option<u32>,
    pub current_batch: Option<u32>,
    pub message: Option<String>,
}

impl SyncProgress {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(SyncProgress {
            user_id: row.get(0)?,
            run_id: row.get(1)?,
            status: text_col(row, 2)?,
            phase: opt_text_col(row, 3)?,
            groups_found: row.get(4)?,
            admins_found: row.get(5)?,
            total_scanned: row.get(6)?,
            current_batch: row.get(7)?,
            message: row.get(8)?,
            started_at: row.get(9)?,
            updated_at: row.get(10)?,
            completed_at: row.get(11)?,
            error: row.get(12)?,
        })
    }
}

impl GroupcastStore {
    pub fn get_progress(&self, user_id: &str) -> EngineResult<Option<SyncProgress>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM sync_progress WHERE user_id = ?1", PROGRESS_COLUMNS);
        Ok(conn.query_row(&sql, params![user_id], SyncProgress::from_row).optional()?)
    }

    /// Overwrite the user's progress row with a fresh `starting` run.
    /// Check and write happen under one lock: a second caller gets `Busy`.
    pub fn start_progress(&self, user_id: &str, run_id: &str) -> EngineResult<SyncProgress> {
        let conn = self.conn.lock();
        let active: Option<String> = conn
            .query_row(
                "SELECT run_id FROM sync_progress
                 WHERE user_id = ?1 AND status IN ('starting', 'running')",
                params![user_id],
                |r| r.get(0),
            )
            .optional()?;
        if active.is_some() {
            return Err(EngineError::Busy(user_id.to_string()));
        }
        let now = now_timestamp();
        conn.execute(
            "INSERT OR REPLACE INTO sync_progress
                (user_id, run_id, status, phase, groups_found, admins_found, total_scanned,
                 current_batch, message, error, started_at, updated_at, completed_at)
             VALUES (?1, ?2, 'starting', NULL, 0, 0, 0, 0, 'Starting', NULL, ?3, ?3, NULL)",
            params![user_id, run_id, now],
        )?;
        let sql = format!("SELECT {} FROM sync_progress WHERE user_id = ?1", PROGRESS_COLUMNS);
        Ok(conn.query_row(&sql, params![user_id], SyncProgress::from_row)?)
    }

    /// Apply an update to the active run `run_id`. Returns false when that run
    /// is no longer the active one (finished, reaped or superseded).
    pub fn update_progress(&self, user_id: &str, run_id: &str, update: &ProgressUpdate) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sync_progress SET
                status = COALESCE(?3, status),
                phase = COALESCE(?4, phase),
                groups_found = COALESCE(?5, groups_found),
                admins_found = COALESCE(?6, admins_found),
                total_scanned = COALESCE(?7, total_scanned),
                current_batch = COALESCE(?8, current_batch),
                message = COALESCE(?9, message),
                updated_at = ?10
             WHERE user_id = ?1 AND run_id = ?2 AND status IN ('starting', 'running')",
            params![
                user_id,
                run_id,
                update.status.map(|s| s.as_str()),
                update.phase.map(|p| p.as_str()),
                update.groups_found,
                update.admins_found,
                update.total_scanned,
                update.current_batch,
                update.message,
                now_timestamp(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Mark run `run_id` terminal. Only an active run can be finished, so a
    /// late finish from a reaped run does not overwrite the reaper's verdict.
    pub fn finish_progress(
        &self,
        user_id: &str,
        run_id: &str,
        status: SyncStatus,
        message: &str,
        error: Option<&str>,
    ) -> EngineResult<bool> {
        if !status.is_terminal() {
            return Err(EngineError::invalid_state("finish sync", status));
        }
        let conn = self.conn.lock();
        let now = now_timestamp();
        let changed = conn.execute(
            "UPDATE sync_progress SET status = ?3, message = ?4, error = ?5,
                    updated_at = ?6, completed_at = ?6
             WHERE user_id = ?1 AND run_id = ?2 AND status IN ('starting', 'running')",
            params![user_id, run_id, status.as_str(), message, error, now],
        )?;
        Ok(changed > 0)
    }

    /// Active runs that have not reported since `cutoff`.
    pub fn active_runs_older_than(&self, cutoff: &str) -> EngineResult<Vec<SyncProgress>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM sync_progress
             WHERE status IN ('starting', 'running') AND updated_at < ?1
             ORDER BY updated_at",
            PROGRESS_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![cutoff], SyncProgress::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
