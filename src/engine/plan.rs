// Groupcast Engine — Plan gate
// The billing collaborator owns plan state; the engine only asks. Live mode
// needs a paid plan, and an expired plan tears the channel down to `expired`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;

use crate::atoms::error::{EngineError, EngineResult, ErrorKind};
use crate::atoms::types::{Channel, ChannelMode, ChannelStatus, PlanStatus};
use crate::engine::config::PlanConfig;
use crate::engine::gateway::GatewayApi;
use crate::engine::store::GroupcastStore;

#[async_trait]
pub trait PlanOracle: Send + Sync {
    async fn plan_status(&self, user_id: &str) -> EngineResult<PlanStatus>;
}

/// Plan table from config, for deployments without a billing service.
pub struct StaticPlanOracle {
    default_plan: PlanStatus,
    users: parking_lot::RwLock<HashMap<String, PlanStatus>>,
}

impl StaticPlanOracle {
    pub fn new(config: &PlanConfig) -> Self {
        StaticPlanOracle {
            default_plan: config.default_plan,
            users: parking_lot::RwLock::new(config.users.clone()),
        }
    }

    pub fn set(&self, user_id: &str, plan: PlanStatus) {
        self.users.write().insert(user_id.to_string(), plan);
    }
}

#[async_trait]
impl PlanOracle for StaticPlanOracle {
    async fn plan_status(&self, user_id: &str) -> EngineResult<PlanStatus> {
        Ok(self.users.read().get(user_id).copied().unwrap_or(self.default_plan))
    }
}

/// What `enforce_plan` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanEnforcement {
    Unchanged,
    Expired,
}

#[derive(Clone)]
pub struct PlanGate {
    store: Arc<GroupcastStore>,
    gateway: Arc<dyn GatewayApi>,
    oracle: Arc<dyn PlanOracle>,
}

impl PlanGate {
    pub fn new(store: Arc<GroupcastStore>, gateway: Arc<dyn GatewayApi>, oracle: Arc<dyn PlanOracle>) -> Self {
        PlanGate { store, gateway, oracle }
    }

    pub async fn is_live_eligible(&self, user_id: &str) -> EngineResult<bool> {
        Ok(self.oracle.plan_status(user_id).await? == PlanStatus::Paid)
    }

    /// Switch the channel to live mode upstream, then locally.
    pub async fn upgrade_to_live(&self, user_id: &str) -> EngineResult<Channel> {
        let channel = self.store.require_channel(user_id)?;
        if channel.mode == ChannelMode::Live {
            return Ok(channel);
        }
        if !self.is_live_eligible(user_id).await? {
            return Err(EngineError::PlanRequired(format!("user {} is not on a paid plan", user_id)));
        }
        let channel_id = channel
            .channel_id
            .as_deref()
            .ok_or_else(|| EngineError::invalid_state("upgrade to live", channel.status))?;
        self.gateway.set_channel_mode(channel_id, ChannelMode::Live).await?;
        let updated = self.store.set_mode(user_id, ChannelMode::Live)?;
        info!("[plan] {} channel {} upgraded to live", user_id, channel_id);
        Ok(updated)
    }

    /// Expired plan: delete upstream, discard identifiers, drop groups, mark
    /// the channel `expired`. Callers check for an active sync first.
    pub async fn enforce_plan(&self, user_id: &str) -> EngineResult<PlanEnforcement> {
        if self.oracle.plan_status(user_id).await? != PlanStatus::Expired {
            return Ok(PlanEnforcement::Unchanged);
        }
        let channel = match self.store.get_channel(user_id)? {
            Some(ch) if !matches!(ch.status, ChannelStatus::Expired | ChannelStatus::None) => ch,
            _ => return Ok(PlanEnforcement::Unchanged),
        };
        if let Some(channel_id) = channel.channel_id.as_deref() {
            match self.gateway.delete_channel(channel_id).await {
                Ok(()) => {}
                Err(e) if e.kind == ErrorKind::NotFound => {}
                Err(e) => warn!("[plan] upstream delete of {} failed: {}", channel_id, e),
            }
        }
        self.store.delete_groups(user_id)?;
        self.store.expire(user_id)?;
        info!("[plan] {} trial expired, channel torn down", user_id);
        Ok(PlanEnforcement::Expired)
    }
}
