// Groupcast Engine — Service facade
// The request/response surface handed to UI, billing and scheduler
// collaborators. Wires one store and one gateway into every component.

use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Channel, ChannelMode, ChannelStatus, Group, LoginMethod, SyncProgress};
use crate::engine::broadcast::{Broadcaster, Delivery};
use crate::engine::config::EngineConfig;
use crate::engine::gateway::{GatewayApi, GatewayClient};
use crate::engine::lifecycle::{ChannelController, PhoneLoginResult, QrResult, RecoveryReport, StatusCheck};
use crate::engine::plan::{PlanEnforcement, PlanGate, PlanOracle, StaticPlanOracle};
use crate::engine::progress::SyncProgressTracker;
use crate::engine::reaper::{Reaper, ReaperReport};
use crate::engine::store::GroupcastStore;
use crate::engine::sync::SyncEngine;

/// Channel as shown to callers: never carries the token.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelView {
    pub user_id: String,
    pub status: ChannelStatus,
    pub mode: ChannelMode,
    pub channel_id: Option<String>,
    pub login_method: Option<LoginMethod>,
    pub pairing_code: Option<String>,
    pub updated_at: Option<String>,
}

impl ChannelView {
    fn none(user_id: &str) -> Self {
        ChannelView {
            user_id: user_id.to_string(),
            status: ChannelStatus::None,
            mode: ChannelMode::Trial,
            channel_id: None,
            login_method: None,
            pairing_code: None,
            updated_at: None,
        }
    }
}

impl From<Channel> for ChannelView {
    fn from(ch: Channel) -> Self {
        ChannelView {
            user_id: ch.user_id,
            status: ch.status,
            mode: ch.mode,
            channel_id: ch.channel_id,
            login_method: ch.login_method,
            pairing_code: ch.pairing_code,
            updated_at: Some(ch.updated_at),
        }
    }
}

#[derive(Clone)]
pub struct GroupcastService {
    pub store: Arc<GroupcastStore>,
    pub controller: ChannelController,
    pub sync: SyncEngine,
    pub progress: SyncProgressTracker,
    pub reaper: Reaper,
    pub plan: PlanGate,
    pub broadcaster: Broadcaster,
}

impl GroupcastService {
    pub fn new(
        config: &EngineConfig,
        store: Arc<GroupcastStore>,
        gateway: Arc<dyn GatewayApi>,
        oracle: Arc<dyn PlanOracle>,
    ) -> Self {
        let progress = SyncProgressTracker::new(store.clone(), config.sync.progress_stale_secs);
        GroupcastService {
            controller: ChannelController::new(
                store.clone(),
                gateway.clone(),
                progress.clone(),
                config.lifecycle.clone(),
            ),
            sync: SyncEngine::new(store.clone(), gateway.clone(), progress.clone(), config.sync.clone()),
            reaper: Reaper::new(store.clone(), gateway.clone(), progress.clone(), config.reaper.clone()),
            plan: PlanGate::new(store.clone(), gateway.clone(), oracle),
            broadcaster: Broadcaster::new(store.clone(), gateway, config.sync.broadcast_pace_ms),
            progress,
            store,
        }
    }

    /// Production wiring: on-disk store, HTTP gateway, config plan table.
    pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let store = Arc::new(GroupcastStore::open(&config.storage.resolved_db_path())?);
        let gateway: Arc<dyn GatewayApi> = Arc::new(GatewayClient::new(&config.gateway)?);
        let oracle: Arc<dyn PlanOracle> = Arc::new(StaticPlanOracle::new(&config.plan));
        info!("[service] ready (gateway {})", config.gateway.base_url);
        Ok(Self::new(config, store, gateway, oracle))
    }

    // ── Channel ────────────────────────────────────────────────────────

    /// Stored status; with `refresh`, reconciled against the gateway first.
    /// A refresh that finds the session gone mid-sync cancels the run and
    /// returns the stored row.
    pub async fn get_channel_status(&self, user_id: &str, refresh: bool) -> EngineResult<ChannelView> {
        let has_channel = self
            .store
            .get_channel(user_id)?
            .is_some_and(|c| c.status != ChannelStatus::None);
        if refresh && has_channel {
            match self.controller.check_status(user_id).await {
                Ok(StatusCheck { channel, .. }) => return Ok(channel.into()),
                // The session ended under a running sync: stop the run; the
                // next refresh after it finishes applies the demotion.
                Err(EngineError::Busy(_)) => {
                    warn!("[service] {} lost its session during a sync, cancelling the run", user_id);
                    self.sync.cancel(user_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(self
            .store
            .get_channel(user_id)?
            .map(ChannelView::from)
            .unwrap_or_else(|| ChannelView::none(user_id)))
    }

    pub async fn create_channel(&self, user_id: &str, force: bool) -> EngineResult<ChannelView> {
        Ok(self.controller.create_channel(user_id, force).await?.into())
    }

    pub async fn get_qr(&self, user_id: &str) -> EngineResult<QrResult> {
        self.controller.get_qr(user_id).await
    }

    pub async fn login_with_phone(&self, user_id: &str, phone: &str) -> EngineResult<PhoneLoginResult> {
        self.controller.login_with_phone(user_id, phone).await
    }

    pub async fn hard_disconnect(&self, user_id: &str) -> EngineResult<ChannelView> {
        Ok(self.controller.hard_disconnect(user_id).await?.into())
    }

    pub async fn delete_channel(&self, user_id: &str) -> EngineResult<ChannelView> {
        Ok(self.controller.delete_channel(user_id).await?.into())
    }

    pub async fn recover(&self, user_id: &str, force_new: bool) -> EngineResult<RecoveryReport> {
        self.controller.recover_or_recreate(user_id, force_new).await
    }

    // ── Sync ───────────────────────────────────────────────────────────

    pub fn get_sync_progress(&self, user_id: &str) -> EngineResult<SyncProgress> {
        self.progress.status(user_id)
    }

    pub fn start_sync(&self, user_id: &str, force: bool) -> EngineResult<SyncProgress> {
        self.sync.start_sync(user_id, force)
    }

    pub fn cancel_sync(&self, user_id: &str) -> bool {
        self.sync.cancel(user_id)
    }

    pub async fn classify_groups(&self, user_id: &str, group_ids: Option<Vec<String>>) -> EngineResult<SyncProgress> {
        self.sync.classify_groups(user_id, group_ids).await
    }

    pub fn list_groups(&self, user_id: &str, admin_only: bool) -> EngineResult<Vec<Group>> {
        self.store.list_groups(user_id, admin_only)
    }

    pub async fn broadcast(&self, user_id: &str, group_ids: &[String], text: &str) -> EngineResult<Vec<Delivery>> {
        self.broadcaster.broadcast(user_id, group_ids, text).await
    }

    // ── Plan ───────────────────────────────────────────────────────────

    pub async fn is_live_eligible(&self, user_id: &str) -> EngineResult<bool> {
        self.plan.is_live_eligible(user_id).await
    }

    pub async fn upgrade_to_live(&self, user_id: &str) -> EngineResult<ChannelView> {
        Ok(self.plan.upgrade_to_live(user_id).await?.into())
    }

    /// Tear the channel down if the plan expired. `Busy` during a sync.
    pub async fn enforce_plan(&self, user_id: &str) -> EngineResult<PlanEnforcement> {
        self.controller.ensure_not_syncing(user_id)?;
        self.plan.enforce_plan(user_id).await
    }

    // ── Maintenance ────────────────────────────────────────────────────

    pub async fn reap(&self) -> EngineResult<ReaperReport> {
        self.reaper.sweep().await
    }
}
