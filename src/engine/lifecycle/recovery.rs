// Channel Lifecycle — recovery
// Identifier repair and the best-effort self-healing entrypoint.

use log::{info, warn};
use serde::Serialize;

use super::ChannelController;
use crate::atoms::error::{EngineError, EngineResult, ErrorClass};
use crate::atoms::types::{Channel, ChannelStatus};
use crate::engine::identifier::is_canonical_channel_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    CheckStatus,
    RepairIdentifier,
    Recreate,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStep {
    pub action: RecoveryAction,
    pub ok: bool,
    /// Short description, or the recovery hint when the step failed.
    pub detail: String,
    pub error_class: Option<ErrorClass>,
}

impl RecoveryStep {
    fn ok(action: RecoveryAction, detail: impl Into<String>) -> Self {
        RecoveryStep { action, ok: true, detail: detail.into(), error_class: None }
    }

    fn failed(action: RecoveryAction, err: &EngineError) -> Self {
        RecoveryStep {
            action,
            ok: false,
            detail: err.recovery_hint().to_string(),
            error_class: Some(err.class()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub user_id: String,
    pub steps: Vec<RecoveryStep>,
    pub final_status: ChannelStatus,
}

impl ChannelController {
    /// Replace a malformed stored identifier with the canonical one the
    /// gateway lists under the same display name. Exactly one match is
    /// required; anything else is `RepairFailed`.
    pub async fn repair_identifier(&self, user_id: &str) -> EngineResult<Channel> {
        let channel = self.store.require_channel(user_id)?;
        let Some(stored) = channel.channel_id.clone() else {
            return Err(EngineError::NoChannel(user_id.to_string()));
        };
        if is_canonical_channel_id(&stored) {
            return Ok(channel);
        }

        let listing = self.gateway.list_channels().await?;
        let mut matches: Vec<_> = listing
            .iter()
            .filter(|c| c.name == stored && is_canonical_channel_id(&c.channel_id))
            .map(|c| c.channel_id.clone())
            .collect();
        matches.sort();
        matches.dedup();

        match matches.as_slice() {
            [canonical] => {
                let repaired = self.store.update_identifier(user_id, &stored, canonical)?;
                info!("[lifecycle] {} identifier repaired {:?} → {}", user_id, stored, canonical);
                Ok(repaired)
            }
            [] => {
                warn!("[lifecycle] {} no upstream channel named {:?}", user_id, stored);
                Err(EngineError::RepairFailed(format!("no upstream channel named {:?}", stored)))
            }
            many => {
                warn!("[lifecycle] {} {} upstream channels named {:?}", user_id, many.len(), stored);
                Err(EngineError::RepairFailed(format!(
                    "{} upstream channels named {:?}",
                    many.len(),
                    stored
                )))
            }
        }
    }

    /// Check status, repair the identifier if malformed, and with `force_new`
    /// delete and recreate. Each attempted step is reported.
    pub async fn recover_or_recreate(&self, user_id: &str, force_new: bool) -> EngineResult<RecoveryReport> {
        let mut steps = Vec::new();
        let channel = self.store.get_channel(user_id)?;
        let has_channel = channel.as_ref().is_some_and(|c| c.status != ChannelStatus::None);

        if has_channel {
            match self.check_status(user_id).await {
                Ok(check) => steps.push(RecoveryStep::ok(
                    RecoveryAction::CheckStatus,
                    format!("status {}", check.channel.status),
                )),
                Err(e) => steps.push(RecoveryStep::failed(RecoveryAction::CheckStatus, &e)),
            }

            let needs_repair = self
                .store
                .get_channel(user_id)?
                .and_then(|c| c.channel_id)
                .is_some_and(|id| !is_canonical_channel_id(&id));
            if needs_repair {
                match self.repair_identifier(user_id).await {
                    Ok(ch) => steps.push(RecoveryStep::ok(
                        RecoveryAction::RepairIdentifier,
                        format!("identifier now {}", ch.channel_id.unwrap_or_default()),
                    )),
                    Err(e) => steps.push(RecoveryStep::failed(RecoveryAction::RepairIdentifier, &e)),
                }
            }
        }

        if force_new {
            match self.create_channel(user_id, true).await {
                Ok(ch) => steps.push(RecoveryStep::ok(
                    RecoveryAction::Recreate,
                    format!("new channel {}", ch.channel_id.unwrap_or_default()),
                )),
                Err(e) => steps.push(RecoveryStep::failed(RecoveryAction::Recreate, &e)),
            }
        }

        let final_status = self
            .store
            .get_channel(user_id)?
            .map(|c| c.status)
            .unwrap_or(ChannelStatus::None);
        info!(
            "[lifecycle] {} recovery ran {} steps, final status {}",
            user_id,
            steps.len(),
            final_status
        );
        Ok(RecoveryReport { user_id: user_id.to_string(), steps, final_status })
    }
}
