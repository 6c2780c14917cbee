// Groupcast Engine — Reaper
// Periodic consistency sweep. The scheduler is external; each call to
// `sweep` does one pass:
//
//   1. created/initializing older than the transient timeout → disconnected,
//      identifier and token cleared (upstream channel deleted best-effort)
//   2. unauthorized older than the revalidation threshold → health check:
//      token dead or channel gone → cleared; drifted → status corrected
//   3. connected older than the revalidation threshold → health check:
//      logged out upstream → unauthorized, groups dropped
//   4. starting/running progress rows silent past the abandoned-run timeout
//      → failed
//
// Users with an active sync are skipped in steps 1–3. Channel writes are
// compare-and-swap on the row as listed, so a user whose channel moved on
// while the sweep awaited the gateway is left alone until the next pass.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::atoms::error::{EngineResult, ErrorKind};
use crate::atoms::types::{Channel, ChannelStatus, SyncStatus};
use crate::engine::config::ReaperConfig;
use crate::engine::gateway::{GatewayApi, UpstreamState};
use crate::engine::identifier::is_canonical_channel_id;
use crate::engine::progress::SyncProgressTracker;
use crate::engine::store::{timestamp, GroupcastStore};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReaperReport {
    /// Users whose stuck transient channel was cleared.
    pub cleared_stuck: Vec<String>,
    /// Users whose token was dead or whose channel vanished upstream.
    pub cleared_invalid: Vec<String>,
    /// (user, old status, new status) drift corrections.
    pub corrected: Vec<(String, ChannelStatus, ChannelStatus)>,
    /// Users checked and found consistent.
    pub confirmed: Vec<String>,
    /// Users whose abandoned run was marked failed.
    pub failed_runs: Vec<String>,
}

#[derive(Clone)]
pub struct Reaper {
    store: Arc<GroupcastStore>,
    gateway: Arc<dyn GatewayApi>,
    progress: SyncProgressTracker,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(
        store: Arc<GroupcastStore>,
        gateway: Arc<dyn GatewayApi>,
        progress: SyncProgressTracker,
        config: ReaperConfig,
    ) -> Self {
        Reaper { store, gateway, progress, config }
    }

    pub async fn sweep(&self) -> EngineResult<ReaperReport> {
        self.sweep_at(Utc::now()).await
    }

    /// One pass with `now` as the reference time.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> EngineResult<ReaperReport> {
        let mut report = ReaperReport::default();

        // ── 4 first: abandoned runs no longer block the channel checks ──
        let run_cutoff = timestamp(now - Duration::minutes(self.config.abandoned_run_mins));
        for run in self.store.active_runs_older_than(&run_cutoff)? {
            let failed = self.store.finish_progress(
                &run.user_id,
                &run.run_id,
                SyncStatus::Failed,
                "Sync abandoned",
                Some("no progress reported; run presumed dead"),
            )?;
            if failed {
                warn!("[reaper] {} run {} abandoned, marked failed", run.user_id, run.run_id);
                report.failed_runs.push(run.user_id);
            }
        }

        // ── 1: stuck transient channels ──
        let transient_cutoff = timestamp(now - Duration::minutes(self.config.transient_timeout_mins));
        let stuck = self
            .store
            .channels_stale_in(&[ChannelStatus::Created, ChannelStatus::Initializing], &transient_cutoff)?;
        for channel in stuck {
            if self.progress.is_active(&channel.user_id)? {
                continue;
            }
            self.delete_upstream(&channel).await;
            if !self.store.clear_if_unchanged(&channel)? {
                self.skipped(&channel);
                continue;
            }
            warn!("[reaper] {} stuck in {} since {}, cleared", channel.user_id, channel.status, channel.updated_at);
            report.cleared_stuck.push(channel.user_id);
        }

        // ── 2 + 3: revalidate settled channels ──
        let revalidate_cutoff = timestamp(now - Duration::hours(self.config.revalidate_after_hours));
        let settled = self
            .store
            .channels_stale_in(&[ChannelStatus::Unauthorized, ChannelStatus::Connected], &revalidate_cutoff)?;
        for channel in settled {
            if self.progress.is_active(&channel.user_id)? {
                continue;
            }
            self.revalidate(&channel, &mut report).await?;
        }

        info!(
            "[reaper] sweep: {} stuck cleared, {} invalid cleared, {} corrected, {} confirmed, {} runs failed",
            report.cleared_stuck.len(),
            report.cleared_invalid.len(),
            report.corrected.len(),
            report.confirmed.len(),
            report.failed_runs.len()
        );
        Ok(report)
    }

    async fn revalidate(&self, channel: &Channel, report: &mut ReaperReport) -> EngineResult<()> {
        let user_id = channel.user_id.as_str();
        let Some(token) = channel.secret_token.as_deref() else {
            if self.store.clear_if_unchanged(channel)? {
                report.cleared_invalid.push(user_id.to_string());
            } else {
                self.skipped(channel);
            }
            return Ok(());
        };

        let health = match self.gateway.get_status(token).await {
            Ok(h) => h,
            Err(e) if matches!(e.kind, ErrorKind::Unauthorized | ErrorKind::NotFound) => {
                warn!("[reaper] {} token invalid ({:?}), clearing", user_id, e.kind);
                if e.kind == ErrorKind::Unauthorized {
                    self.delete_upstream(channel).await;
                }
                if self.store.clear_if_unchanged(channel)? {
                    report.cleared_invalid.push(user_id.to_string());
                } else {
                    self.skipped(channel);
                }
                return Ok(());
            }
            Err(e) => {
                // Transient or unknown: try again next sweep.
                warn!("[reaper] {} health check inconclusive: {}", user_id, e);
                return Ok(());
            }
        };

        let truth = match health.state {
            UpstreamState::Connected => Some(ChannelStatus::Connected),
            UpstreamState::AwaitingAuth => Some(ChannelStatus::Unauthorized),
            _ => None,
        };
        match truth {
            Some(status) if status == channel.status => {
                if self.store.touch_if_unchanged(channel)? {
                    report.confirmed.push(user_id.to_string());
                } else {
                    self.skipped(channel);
                }
            }
            Some(status) => {
                if !self.store.correct_status_if_unchanged(channel, status)? {
                    self.skipped(channel);
                    return Ok(());
                }
                info!("[reaper] {} drift corrected {} → {}", user_id, channel.status, status);
                report.corrected.push((user_id.to_string(), channel.status, status));
            }
            None => {
                warn!("[reaper] {} upstream status {:?} while {}; left as is", user_id, health.raw, channel.status);
            }
        }
        Ok(())
    }

    fn skipped(&self, seen: &Channel) {
        info!("[reaper] {} changed during the sweep (was {}), skipped", seen.user_id, seen.status);
    }

    async fn delete_upstream(&self, channel: &Channel) {
        let Some(id) = channel.channel_id.as_deref() else { return };
        if !is_canonical_channel_id(id) {
            return;
        }
        match self.gateway.delete_channel(id).await {
            Ok(()) => info!("[reaper] upstream channel {} deleted", id),
            Err(e) if e.kind == ErrorKind::NotFound => {}
            Err(e) => warn!("[reaper] upstream delete of {} failed: {}", id, e),
        }
    }
}
