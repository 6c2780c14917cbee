// Sync phase 2 — classification
// Determines the user's role in each stored group from the group's
// participant list. Small batches; per-item retries on transient errors.
// Unauthorized aborts the phase; other per-item failures leave the group
// `unknown` for the next run. The opening status check is retried the same
// way.

use log::{debug, info, warn};

use super::{PhaseEnd, RunContext, SyncEngine};
use crate::atoms::error::{EngineError, ErrorKind, GatewayError};
use crate::atoms::types::{AdminStatus, Group, SyncPhase, SyncStatus};
use crate::engine::gateway::{GroupMetadata, ParticipantRank};
use crate::engine::http::{pacing_delay, rate_limit_delay};
use crate::engine::identifier::same_account;
use crate::engine::store::ProgressUpdate;

/// The role `me` holds in `meta`. Absent from the list reads as member.
pub fn admin_status_of(meta: &GroupMetadata, me: &str) -> AdminStatus {
    match meta.participants.iter().find(|p| same_account(&p.id, me)).map(|p| p.rank) {
        Some(ParticipantRank::Creator) => AdminStatus::Creator,
        Some(ParticipantRank::Admin) => AdminStatus::Admin,
        _ => AdminStatus::Member,
    }
}

impl SyncEngine {
    pub(crate) async fn classify(&self, ctx: &RunContext, subset: Option<&[String]>) -> PhaseEnd {
        let me = match self.own_account(ctx).await {
            Ok(me) => me,
            Err(e) => return PhaseEnd::Aborted(e),
        };

        let pending: Vec<Group> = match self.store.pending_groups(&ctx.user_id, subset) {
            Ok(p) => p,
            Err(e) => return PhaseEnd::Aborted(e),
        };
        let (total, mut admins) = match self.store.count_groups(&ctx.user_id) {
            Ok(c) => c,
            Err(e) => return PhaseEnd::Aborted(e),
        };
        info!("[sync] {} classifying {} of {} groups", ctx.user_id, pending.len(), total);
        self.report(
            ctx,
            ProgressUpdate {
                status: Some(SyncStatus::Running),
                phase: Some(SyncPhase::Classifying),
                groups_found: Some(pending.len() as u32),
                admins_found: Some(admins),
                total_scanned: Some(0),
                current_batch: Some(0),
                message: Some(format!("Checking {} groups", pending.len())),
            },
        );

        let batch_size = self.config.classify_batch_size.max(1);
        let mut scanned: u32 = 0;
        for (batch_no, batch) in pending.chunks(batch_size).enumerate() {
            if ctx.cancelled() {
                info!("[sync] {} classification cancelled after {} groups", ctx.user_id, scanned);
                return PhaseEnd::Cancelled;
            }
            if batch_no > 0 {
                let cfg = &self.config;
                tokio::time::sleep(pacing_delay(0, cfg.pace_base_ms, cfg.pace_step_ms, cfg.pace_ceiling_ms)).await;
            }

            for group in batch {
                match self.classify_one(ctx, &me, &group.group_id).await {
                    Ok(Some((status, count))) => {
                        let was_admin = group.admin_status.can_broadcast();
                        match self.store.set_admin_status(&ctx.user_id, &group.group_id, status, count) {
                            Ok(_) => {
                                if status.can_broadcast() && !was_admin {
                                    admins += 1;
                                } else if !status.can_broadcast() && was_admin {
                                    admins = admins.saturating_sub(1);
                                }
                            }
                            Err(e) => return PhaseEnd::Aborted(e),
                        }
                    }
                    Ok(None) => {}
                    Err(e) => return PhaseEnd::Aborted(e.into()),
                }
                scanned += 1;
            }

            self.report(
                ctx,
                ProgressUpdate {
                    admins_found: Some(admins),
                    total_scanned: Some(scanned),
                    current_batch: Some(batch_no as u32 + 1),
                    message: Some(format!("Checked {} of {} groups", scanned, pending.len())),
                    ..Default::default()
                },
            );
        }
        info!("[sync] {} classification done: {} administered", ctx.user_id, admins);
        PhaseEnd::Done
    }

    /// The connected account's id, with transient failures retried like
    /// group reads.
    async fn own_account(&self, ctx: &RunContext) -> Result<String, EngineError> {
        let cfg = &self.config;
        let mut attempt: u32 = 0;
        loop {
            match self.gateway.get_status(&ctx.token).await {
                Ok(health) => {
                    return health
                        .me
                        .ok_or_else(|| EngineError::Other("gateway did not report the connected account".into()))
                }
                Err(e) if e.is_transient() && attempt < cfg.classify_item_retries => {
                    attempt += 1;
                    let delay = rate_limit_delay(attempt, cfg.rate_limit_base_ms, cfg.rate_limit_ceiling_ms, e.retry_after);
                    warn!("[sync] {} status check transient ({}), retry {} in {}ms", ctx.user_id, e, attempt, delay.as_millis());
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// `Ok(None)` when the group could not be classified this run.
    /// Only `Unauthorized` is returned as an error.
    async fn classify_one(
        &self,
        ctx: &RunContext,
        me: &str,
        group_id: &str,
    ) -> Result<Option<(AdminStatus, Option<u32>)>, GatewayError> {
        let cfg = &self.config;
        let mut attempt: u32 = 0;
        loop {
            match self.gateway.get_group(&ctx.token, group_id).await {
                Ok(meta) => {
                    let status = admin_status_of(&meta, me);
                    debug!("[sync] {} group {} → {}", ctx.user_id, group_id, status);
                    let count = (!meta.participants.is_empty()).then_some(meta.participants.len() as u32);
                    return Ok(Some((status, count)));
                }
                Err(e) if e.kind == ErrorKind::Unauthorized => return Err(e),
                Err(e) if e.kind == ErrorKind::NotFound => {
                    // Left or removed from the group since collection.
                    return Ok(Some((AdminStatus::Member, None)));
                }
                Err(e) if e.is_transient() && attempt < cfg.classify_item_retries => {
                    attempt += 1;
                    let delay = rate_limit_delay(attempt, cfg.rate_limit_base_ms, cfg.rate_limit_ceiling_ms, e.retry_after);
                    warn!("[sync] {} group {} transient ({}), retry {} in {}ms", ctx.user_id, group_id, e, attempt, delay.as_millis());
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!("[sync] {} group {} left unclassified: {}", ctx.user_id, group_id, e);
                    return Ok(None);
                }
            }
        }
    }
}
