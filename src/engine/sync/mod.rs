// Groupcast Engine — Background Group Sync
// Two phases per run:
//   collect   — paginate list_groups with pacing and rate-limit backoff, then
//               replace the user's groups wholesale (admin_status = unknown)
//   classify  — small batches of get_group, recording the user's role per group
//
// One active run per user (the progress row is the lock). Cancellation is
// cooperative: a flag checked between pages and between batches.
//
// Module layout:
//   mod       — SyncEngine, start/run/cancel, run bookkeeping
//   collect   — phase 1
//   classify  — phase 2

mod classify;
mod collect;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ChannelStatus, SyncProgress};
use crate::engine::config::SyncConfig;
use crate::engine::gateway::GatewayApi;
use crate::engine::progress::{RunOutcome, SyncProgressTracker};
use crate::engine::store::{GroupcastStore, ProgressUpdate};

/// What a run does.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncKind {
    /// Collect every group, then classify all of them.
    Full,
    /// Classify stored groups only: the given ids, or every `unknown` one.
    Classify(Option<Vec<String>>),
}

/// How a phase stopped.
pub(crate) enum PhaseEnd {
    Done,
    Cancelled,
    Aborted(EngineError),
}

/// Per-run state shared by both phases.
pub(crate) struct RunContext {
    pub user_id: String,
    pub run_id: String,
    pub token: String,
    pub cancel: Arc<AtomicBool>,
}

impl RunContext {
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) store: Arc<GroupcastStore>,
    pub(crate) gateway: Arc<dyn GatewayApi>,
    pub(crate) progress: SyncProgressTracker,
    pub(crate) config: SyncConfig,
    /// Cancel flags of runs started by this process, by user.
    runs: Arc<Mutex<HashMap<String, (String, Arc<AtomicBool>)>>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<GroupcastStore>,
        gateway: Arc<dyn GatewayApi>,
        progress: SyncProgressTracker,
        config: SyncConfig,
    ) -> Self {
        SyncEngine { store, gateway, progress, config, runs: Arc::new(Mutex::new(HashMap::new())) }
    }

    // ── Entry points ───────────────────────────────────────────────────

    /// Start a full sync in the background. Returns the `starting` row.
    /// `Busy` while a run is active; `CoolingDown` right after a completed
    /// run unless `force`.
    pub fn start_sync(&self, user_id: &str, force: bool) -> EngineResult<SyncProgress> {
        let ctx = self.prepare(user_id, &SyncKind::Full, force)?;
        let row = self.progress.status(user_id)?;
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(ctx, SyncKind::Full).await;
        });
        Ok(row)
    }

    /// Full sync on the caller's task, returning the final row.
    pub async fn run_sync(&self, user_id: &str, force: bool) -> EngineResult<SyncProgress> {
        let ctx = self.prepare(user_id, &SyncKind::Full, force)?;
        self.execute(ctx, SyncKind::Full).await;
        self.final_row(user_id)
    }

    /// Classify a subset of stored groups (or all pending ones) on the
    /// caller's task. Same single-active-run rule as a full sync.
    pub async fn classify_groups(&self, user_id: &str, group_ids: Option<Vec<String>>) -> EngineResult<SyncProgress> {
        let kind = SyncKind::Classify(group_ids);
        let ctx = self.prepare(user_id, &kind, true)?;
        self.execute(ctx, kind).await;
        self.final_row(user_id)
    }

    /// Ask the user's run to stop at the next page or batch boundary.
    /// False when this process has no run for the user.
    pub fn cancel(&self, user_id: &str) -> bool {
        match self.runs.lock().get(user_id) {
            Some((run_id, flag)) => {
                flag.store(true, Ordering::Relaxed);
                info!("[sync] {} cancel requested for run {}", user_id, run_id);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, user_id: &str) -> bool {
        self.runs.lock().contains_key(user_id)
    }

    // ── Run bookkeeping ────────────────────────────────────────────────

    fn prepare(&self, user_id: &str, kind: &SyncKind, force: bool) -> EngineResult<RunContext> {
        let channel = self.store.require_channel(user_id)?;
        if channel.status != ChannelStatus::Connected {
            return Err(EngineError::invalid_state("sync groups", channel.status));
        }
        let token = channel
            .secret_token
            .ok_or_else(|| EngineError::invalid_state("sync groups", channel.status))?;

        if !force && *kind == SyncKind::Full {
            if let Some(done_at) = self.progress.last_completed_at(user_id)? {
                let elapsed = (Utc::now() - done_at).num_seconds();
                if elapsed < self.config.cooldown_secs {
                    return Err(EngineError::CoolingDown {
                        retry_after_secs: self.config.cooldown_secs - elapsed,
                    });
                }
            }
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        self.progress.start(user_id, &run_id)?;
        let cancel = Arc::new(AtomicBool::new(false));
        self.runs.lock().insert(user_id.to_string(), (run_id.clone(), cancel.clone()));
        info!("[sync] {} run {} prepared ({:?})", user_id, run_id, kind);
        Ok(RunContext { user_id: user_id.to_string(), run_id, token, cancel })
    }

    async fn execute(&self, ctx: RunContext, kind: SyncKind) {
        let end = match kind {
            SyncKind::Full => match self.collect(&ctx).await {
                PhaseEnd::Done => self.classify(&ctx, None).await,
                other => other,
            },
            SyncKind::Classify(ids) => self.classify(&ctx, ids.as_deref()).await,
        };

        let outcome = match end {
            PhaseEnd::Done => {
                let (total, admins) = self.store.count_groups(&ctx.user_id).unwrap_or((0, 0));
                RunOutcome::Completed { message: format!("{} groups, {} administered", total, admins) }
            }
            PhaseEnd::Cancelled => RunOutcome::Cancelled,
            PhaseEnd::Aborted(e) => {
                error!("[sync] {} run {} aborted: {}", ctx.user_id, ctx.run_id, e);
                RunOutcome::Failed { error: e.recovery_hint().to_string() }
            }
        };
        match self.progress.finish(&ctx.user_id, &ctx.run_id, &outcome) {
            Ok(true) => {}
            Ok(false) => warn!("[sync] {} run {} was no longer active at finish", ctx.user_id, ctx.run_id),
            Err(e) => error!("[sync] {} run {} finish not recorded: {}", ctx.user_id, ctx.run_id, e),
        }

        let mut runs = self.runs.lock();
        if runs.get(&ctx.user_id).is_some_and(|(id, _)| *id == ctx.run_id) {
            runs.remove(&ctx.user_id);
        }
    }

    fn final_row(&self, user_id: &str) -> EngineResult<SyncProgress> {
        Ok(self
            .store
            .get_progress(user_id)?
            .unwrap_or_else(|| SyncProgress::not_running(user_id)))
    }

    /// Write progress. A row that is no longer ours (reaped) stops the run.
    pub(crate) fn report(&self, ctx: &RunContext, update: ProgressUpdate) {
        match self.progress.update(&ctx.user_id, &ctx.run_id, &update) {
            Ok(true) => {}
            Ok(false) => {
                warn!("[sync] {} run {} lost its progress row, stopping", ctx.user_id, ctx.run_id);
                ctx.cancel.store(true, Ordering::Relaxed);
            }
            Err(e) => warn!("[sync] {} progress write failed: {}", ctx.user_id, e),
        }
    }
}
