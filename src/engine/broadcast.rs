// Groupcast Engine — Broadcast
// Sends one text to each selected group the user administers, paced.
// Groups that are not stored or not administered are skipped and reported.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;

use crate::atoms::error::{EngineError, EngineResult, ErrorKind};
use crate::atoms::types::ChannelStatus;
use crate::engine::gateway::GatewayApi;
use crate::engine::store::GroupcastStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    pub group_id: String,
    pub delivered: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl Delivery {
    fn skipped(group_id: &str, reason: &str) -> Self {
        Delivery { group_id: group_id.to_string(), delivered: false, message_id: None, error: Some(reason.into()) }
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    store: Arc<GroupcastStore>,
    gateway: Arc<dyn GatewayApi>,
    pace: Duration,
}

impl Broadcaster {
    pub fn new(store: Arc<GroupcastStore>, gateway: Arc<dyn GatewayApi>, pace_ms: u64) -> Self {
        Broadcaster { store, gateway, pace: Duration::from_millis(pace_ms) }
    }

    /// One entry per requested group, in request order. A dead token stops
    /// the remaining sends.
    pub async fn broadcast(&self, user_id: &str, group_ids: &[String], text: &str) -> EngineResult<Vec<Delivery>> {
        if text.trim().is_empty() {
            return Err(EngineError::Other("message text is empty".into()));
        }
        let channel = self.store.require_channel(user_id)?;
        if channel.status != ChannelStatus::Connected {
            return Err(EngineError::invalid_state("broadcast", channel.status));
        }
        let token = channel
            .secret_token
            .ok_or_else(|| EngineError::invalid_state("broadcast", channel.status))?;

        let mut report = Vec::with_capacity(group_ids.len());
        let mut sent_any = false;
        let mut auth_dead = false;
        for group_id in group_ids {
            if auth_dead {
                report.push(Delivery::skipped(group_id, "token invalid, recreate channel"));
                continue;
            }
            match self.store.get_group(user_id, group_id)? {
                None => {
                    report.push(Delivery::skipped(group_id, "unknown group"));
                    continue;
                }
                Some(g) if !g.admin_status.can_broadcast() => {
                    report.push(Delivery::skipped(group_id, "not an admin of this group"));
                    continue;
                }
                Some(_) => {}
            }

            if sent_any {
                tokio::time::sleep(self.pace).await;
            }
            sent_any = true;
            match self.gateway.send_message(&token, group_id, text).await {
                Ok(sent) => report.push(Delivery {
                    group_id: group_id.clone(),
                    delivered: true,
                    message_id: Some(sent.message_id),
                    error: None,
                }),
                Err(e) => {
                    warn!("[broadcast] {} send to {} failed: {}", user_id, group_id, e);
                    let hint = EngineError::Gateway(e.clone()).recovery_hint();
                    auth_dead = e.kind == ErrorKind::Unauthorized;
                    report.push(Delivery::skipped(group_id, hint));
                }
            }
        }
        let delivered = report.iter().filter(|d| d.delivered).count();
        info!("[broadcast] {} delivered to {}/{} groups", user_id, delivered, group_ids.len());
        Ok(report)
    }
}
