// Sync phase 1 — collection
// Paginates from offset 0 until a short or empty batch, or the API-call cap.
// Rate-limited pages are retried at the same offset after a growing backoff.
// Every request counts toward the cap; the client does not retry these.
// The result is stored only while the channel is still connected under the
// run's token.

use std::collections::HashSet;

use log::{debug, info, warn};

use super::{PhaseEnd, RunContext, SyncEngine};
use crate::atoms::error::EngineError;
use crate::atoms::types::{SyncPhase, SyncStatus};
use crate::engine::gateway::{GatewayError, GatewayGroup};
use crate::engine::http::{pacing_delay, rate_limit_delay};
use crate::engine::store::ProgressUpdate;

impl SyncEngine {
    pub(crate) async fn collect(&self, ctx: &RunContext) -> PhaseEnd {
        let (collected, end) = self.paginate(ctx).await;
        match end {
            PhaseEnd::Done => match self.store.replace_groups_for_session(&ctx.user_id, &ctx.token, &collected) {
                Ok(stored) => {
                    info!("[sync] {} collection stored {} groups", ctx.user_id, stored);
                    self.report(
                        ctx,
                        ProgressUpdate {
                            groups_found: Some(stored as u32),
                            message: Some(format!("Collected {} groups", stored)),
                            ..Default::default()
                        },
                    );
                    PhaseEnd::Done
                }
                Err(e) => {
                    warn!("[sync] {} collected groups discarded: {}", ctx.user_id, e);
                    PhaseEnd::Aborted(e)
                }
            },
            PhaseEnd::Aborted(e) => {
                // Keep what was collected before the failure.
                if !collected.is_empty() {
                    match self.store.replace_groups_for_session(&ctx.user_id, &ctx.token, &collected) {
                        Ok(n) => warn!("[sync] {} collection aborted, kept {} partial groups", ctx.user_id, n),
                        Err(store_err) => warn!("[sync] {} partial groups not stored: {}", ctx.user_id, store_err),
                    }
                }
                PhaseEnd::Aborted(e)
            }
            PhaseEnd::Cancelled => {
                info!("[sync] {} collection cancelled after {} groups", ctx.user_id, collected.len());
                PhaseEnd::Cancelled
            }
        }
    }

    /// The page loop. Returns every distinct group seen plus how it ended.
    pub(crate) async fn paginate(&self, ctx: &RunContext) -> (Vec<GatewayGroup>, PhaseEnd) {
        let cfg = &self.config;
        let batch_size = cfg.batch_size();
        let mut collected: Vec<GatewayGroup> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut offset: u32 = 0;
        let mut calls: u32 = 0;
        let mut pages: u32 = 0;
        let mut consecutive_limits: u32 = 0;
        let mut last_limit: Option<GatewayError> = None;

        self.report(
            ctx,
            ProgressUpdate {
                status: Some(SyncStatus::Running),
                phase: Some(SyncPhase::Collecting),
                message: Some("Collecting groups".into()),
                ..Default::default()
            },
        );

        loop {
            if ctx.cancelled() {
                return (collected, PhaseEnd::Cancelled);
            }
            if calls >= cfg.max_api_calls {
                if let Some(e) = last_limit.take() {
                    warn!(
                        "[sync] {} hit the {}-call cap while rate limited at offset {}",
                        ctx.user_id, cfg.max_api_calls, offset
                    );
                    return (collected, PhaseEnd::Aborted(e.into()));
                }
                warn!(
                    "[sync] {} hit the {}-call cap at offset {}, ending collection",
                    ctx.user_id, cfg.max_api_calls, offset
                );
                return (collected, PhaseEnd::Done);
            }
            if calls > 0 && consecutive_limits == 0 {
                let delay = pacing_delay(calls, cfg.pace_base_ms, cfg.pace_step_ms, cfg.pace_ceiling_ms);
                tokio::time::sleep(delay).await;
            }
            calls += 1;

            match self.gateway.list_groups(&ctx.token, offset, batch_size).await {
                Ok(batch) => {
                    consecutive_limits = 0;
                    last_limit = None;
                    pages += 1;
                    let received = batch.len() as u32;
                    for group in batch {
                        if seen.insert(group.id.clone()) {
                            collected.push(group);
                        }
                    }
                    self.report(
                        ctx,
                        ProgressUpdate {
                            groups_found: Some(collected.len() as u32),
                            total_scanned: Some(offset + received),
                            current_batch: Some(pages),
                            message: Some(format!("Collected {} groups", collected.len())),
                            ..Default::default()
                        },
                    );

                    if received == 0 {
                        info!(
                            "[sync] {} empty batch at offset {}: end of list (or an upstream gap)",
                            ctx.user_id, offset
                        );
                        return (collected, PhaseEnd::Done);
                    }
                    if received < batch_size {
                        debug!(
                            "[sync] {} short batch {} < {} at offset {}: end of list",
                            ctx.user_id, received, batch_size, offset
                        );
                        return (collected, PhaseEnd::Done);
                    }
                    offset += received;
                }
                Err(e) if e.is_transient() => {
                    consecutive_limits += 1;
                    if consecutive_limits > cfg.max_consecutive_rate_limits {
                        warn!("[sync] {} gave up after {} consecutive rate limits", ctx.user_id, consecutive_limits - 1);
                        return (collected, PhaseEnd::Aborted(e.into()));
                    }
                    let delay = rate_limit_delay(
                        consecutive_limits,
                        cfg.rate_limit_base_ms,
                        cfg.rate_limit_ceiling_ms,
                        e.retry_after,
                    );
                    warn!(
                        "[sync] {} rate limited at offset {} ({} in a row), backing off {}ms",
                        ctx.user_id,
                        offset,
                        consecutive_limits,
                        delay.as_millis()
                    );
                    self.report(
                        ctx,
                        ProgressUpdate {
                            message: Some("Gateway busy, backing off".into()),
                            ..Default::default()
                        },
                    );
                    tokio::time::sleep(delay).await;
                    last_limit = Some(e);
                }
                Err(e) => {
                    warn!("[sync] {} list_groups failed at offset {}: {}", ctx.user_id, offset, e);
                    return (collected, PhaseEnd::Aborted(EngineError::Gateway(e)));
                }
            }
        }
    }
}
