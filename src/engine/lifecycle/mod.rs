// Groupcast Engine — Channel Lifecycle Controller
// Drives one user's channel through the state machine:
//
//   none ──create──▶ created ──poll──▶ initializing ──ready──▶ unauthorized
//   unauthorized ──qr──▶ qr_displayed ──scan──▶ connected
//   unauthorized ──phone (no code)──▶ connected
//   unauthorized ──phone (code)──▶ qr_displayed
//   connected ──hard disconnect──▶ unauthorized     (token kept)
//   connected|unauthorized|qr_displayed ──delete──▶ none
//
// Module layout:
//   mod       — ChannelController, create_channel, wait_until_ready, poll_ready
//   auth      — get_qr, login_with_phone, check_status, settle_connected
//   teardown  — hard_disconnect, delete_channel
//   recovery  — repair_identifier, recover_or_recreate
//
// Every status write goes through the store's compare-and-swap `transition`,
// so two controllers racing the same user cannot both win.

mod auth;
mod recovery;
mod teardown;

use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;

pub use auth::{PhoneLoginResult, QrResult, StatusCheck};
pub use recovery::{RecoveryAction, RecoveryReport, RecoveryStep};

use crate::atoms::error::{EngineError, EngineResult, ErrorKind};
use crate::atoms::types::{Channel, ChannelStatus};
use crate::engine::config::LifecycleConfig;
use crate::engine::gateway::{GatewayApi, UpstreamState};
use crate::engine::http::{ready_poll_delay, redact};
use crate::engine::identifier::is_canonical_channel_id;
use crate::engine::progress::SyncProgressTracker;
use crate::engine::store::GroupcastStore;

/// Result of waiting for a freshly created channel to finish booting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyOutcome {
    Ready,
    Failed,
    TimedOut,
}

#[derive(Clone)]
pub struct ChannelController {
    pub(crate) store: Arc<GroupcastStore>,
    pub(crate) gateway: Arc<dyn GatewayApi>,
    pub(crate) progress: SyncProgressTracker,
    pub(crate) config: LifecycleConfig,
}

/// Upstream display name for a user's channel.
pub fn channel_display_name(user_id: &str) -> String {
    format!("groupcast_{}", user_id)
}

impl ChannelController {
    pub fn new(
        store: Arc<GroupcastStore>,
        gateway: Arc<dyn GatewayApi>,
        progress: SyncProgressTracker,
        config: LifecycleConfig,
    ) -> Self {
        ChannelController { store, gateway, progress, config }
    }

    /// Destructive operations refuse to run under an active sync.
    pub(crate) fn ensure_not_syncing(&self, user_id: &str) -> EngineResult<()> {
        if self.progress.is_active(user_id)? {
            return Err(EngineError::Busy(user_id.to_string()));
        }
        Ok(())
    }

    pub(crate) fn token_of(channel: &Channel, operation: &str) -> EngineResult<String> {
        channel
            .secret_token
            .clone()
            .ok_or_else(|| EngineError::invalid_state(operation, channel.status))
    }

    // ── Create ─────────────────────────────────────────────────────────

    /// Provision a channel upstream and store it as `created`.
    /// `AlreadyExists` when an active channel exists and `force` is false.
    pub async fn create_channel(&self, user_id: &str, force: bool) -> EngineResult<Channel> {
        let existing = self.store.get_channel(user_id)?;
        if let Some(ch) = existing.as_ref().filter(|c| c.is_active()) {
            if !force {
                return Err(EngineError::AlreadyExists {
                    user_id: user_id.to_string(),
                    status: ch.status.to_string(),
                });
            }
            self.ensure_not_syncing(user_id)?;
        }

        let provisioned = self.gateway.create_channel(&channel_display_name(user_id)).await?;
        if !is_canonical_channel_id(&provisioned.channel_id) {
            warn!(
                "[lifecycle] {} gateway issued non-canonical id {:?}; repair will be required",
                user_id, provisioned.channel_id
            );
        }

        let channel = match self.store.insert_channel(user_id, &provisioned.channel_id, &provisioned.token, force) {
            Ok(ch) => ch,
            Err(e) => {
                // Lost the race to a concurrent create: the upstream channel is an orphan.
                warn!("[lifecycle] {} insert failed ({}), deleting orphan {}", user_id, e, provisioned.channel_id);
                if let Err(del) = self.gateway.delete_channel(&provisioned.channel_id).await {
                    warn!("[lifecycle] orphan delete failed: {}", del);
                }
                return Err(e);
            }
        };

        if force {
            if let Some(old_id) = existing.and_then(|c| c.channel_id) {
                if old_id != provisioned.channel_id && is_canonical_channel_id(&old_id) {
                    if let Err(e) = self.gateway.delete_channel(&old_id).await {
                        warn!("[lifecycle] replaced channel {} not deleted upstream: {}", old_id, e);
                    }
                }
            }
            self.store.delete_groups(user_id)?;
        }

        info!(
            "[lifecycle] {} channel {} created (token {})",
            user_id,
            provisioned.channel_id,
            redact(&provisioned.token)
        );

        if self.config.auto_poll_ready {
            let this = self.clone();
            let user = user_id.to_string();
            tokio::spawn(async move {
                match this.poll_ready(&user).await {
                    Ok(outcome) => info!("[lifecycle] {} readiness poll finished: {:?}", user, outcome),
                    Err(e) => error!("[lifecycle] {} readiness poll failed: {}", user, e),
                }
            });
        }
        Ok(channel)
    }

    // ── Readiness ──────────────────────────────────────────────────────

    /// Poll the user's channel with `base × 1.5^attempt` backoff until it is
    /// launch-ready. Upstream `Failed` or a non-transient error ends the wait.
    pub async fn wait_until_ready(&self, user_id: &str, max_attempts: u32) -> EngineResult<ReadyOutcome> {
        let channel = self.store.require_channel(user_id)?;
        let token = Self::token_of(&channel, "wait for readiness")?;
        Ok(self.await_launch(&token, max_attempts).await.0)
    }

    /// Returns the outcome plus the last upstream state seen.
    async fn await_launch(&self, token: &str, max_attempts: u32) -> (ReadyOutcome, Option<UpstreamState>) {
        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = ready_poll_delay(
                    attempt - 1,
                    self.config.ready_base_delay_ms,
                    self.config.ready_max_delay_ms,
                );
                tokio::time::sleep(delay).await;
            }
            match self.gateway.get_status(token).await {
                Ok(health) if health.state.is_launch_ready() => {
                    info!("[lifecycle] launch-ready on attempt {} ({})", attempt + 1, health.raw);
                    return (ReadyOutcome::Ready, Some(health.state));
                }
                Ok(health) if health.state == UpstreamState::Failed => {
                    warn!("[lifecycle] upstream reports {} on attempt {}", health.raw, attempt + 1);
                    return (ReadyOutcome::Failed, Some(health.state));
                }
                Ok(health) => {
                    info!("[lifecycle] not ready yet ({}), attempt {}/{}", health.raw, attempt + 1, max_attempts);
                }
                Err(e) if e.is_transient() => {
                    warn!("[lifecycle] readiness check attempt {} transient: {}", attempt + 1, e);
                }
                Err(e) => {
                    warn!("[lifecycle] readiness check failed: {}", e);
                    return (ReadyOutcome::Failed, None);
                }
            }
        }
        (ReadyOutcome::TimedOut, None)
    }

    /// The readiness poll scheduled by `create_channel`:
    /// created → initializing → unauthorized. `Failed` clears the channel;
    /// `TimedOut` leaves it `initializing` for the reaper.
    pub async fn poll_ready(&self, user_id: &str) -> EngineResult<ReadyOutcome> {
        let mut channel = self.store.require_channel(user_id)?;
        match channel.status {
            ChannelStatus::Created => {
                channel = self.store.transition(user_id, ChannelStatus::Created, ChannelStatus::Initializing)?;
            }
            ChannelStatus::Initializing => {}
            ChannelStatus::Unauthorized | ChannelStatus::QrDisplayed | ChannelStatus::Connected => {
                return Ok(ReadyOutcome::Ready);
            }
            other => return Err(EngineError::invalid_state("poll readiness", other)),
        }
        let token = Self::token_of(&channel, "poll readiness")?;

        let (outcome, last_state) = self.await_launch(&token, self.config.ready_max_attempts).await;
        match outcome {
            ReadyOutcome::Ready => {
                self.store.transition(user_id, ChannelStatus::Initializing, ChannelStatus::Unauthorized)?;
                info!("[lifecycle] {} initializing → unauthorized", user_id);
                if last_state == Some(UpstreamState::Connected) {
                    self.settle_connected(user_id, ChannelStatus::Unauthorized).await?;
                }
            }
            ReadyOutcome::Failed => {
                warn!("[lifecycle] {} channel failed to launch, clearing", user_id);
                if let Some(id) = channel.channel_id.as_deref().filter(|id| is_canonical_channel_id(id)) {
                    match self.gateway.delete_channel(id).await {
                        Err(e) if e.kind != ErrorKind::NotFound => {
                            warn!("[lifecycle] upstream delete of {} failed: {}", id, e)
                        }
                        _ => {}
                    }
                }
                self.store.clear(user_id)?;
            }
            ReadyOutcome::TimedOut => {
                warn!("[lifecycle] {} not ready after {} attempts; left for the reaper", user_id, self.config.ready_max_attempts);
            }
        }
        Ok(outcome)
    }
}
