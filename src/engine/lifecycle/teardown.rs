// Channel Lifecycle — teardown
// hard_disconnect keeps the token for re-auth; delete_channel discards it.

use log::{info, warn};

use super::ChannelController;
use crate::atoms::error::{EngineError, EngineResult, ErrorKind};
use crate::atoms::types::{Channel, ChannelStatus};
use crate::engine::identifier::checked_channel_id;

impl ChannelController {
    /// Log out upstream (failure is logged, not fatal), force the channel to
    /// `unauthorized` keeping its token, and drop every group row.
    pub async fn hard_disconnect(&self, user_id: &str) -> EngineResult<Channel> {
        self.ensure_not_syncing(user_id)?;
        let channel = self.store.require_channel(user_id)?;
        if channel.channel_id.is_none() {
            return Err(EngineError::invalid_state("disconnect", channel.status));
        }
        if let Some(token) = channel.secret_token.as_deref() {
            if let Err(e) = self.gateway.logout(token).await {
                warn!("[lifecycle] {} logout failed, continuing: {}", user_id, e);
            }
        }
        let updated = self.store.force_status(user_id, ChannelStatus::Unauthorized)?;
        let dropped = self.store.delete_groups(user_id)?;
        info!(
            "[lifecycle] {} hard disconnect: {} → unauthorized, {} groups dropped",
            user_id, channel.status, dropped
        );
        Ok(updated)
    }

    /// Delete edge: connected | unauthorized | qr_displayed → none.
    /// The upstream channel goes first; NotFound there counts as done.
    pub async fn delete_channel(&self, user_id: &str) -> EngineResult<Channel> {
        self.ensure_not_syncing(user_id)?;
        let channel = self.store.require_channel(user_id)?;
        if !channel.status.allows(ChannelStatus::None) {
            return Err(EngineError::invalid_state("delete channel", channel.status));
        }
        let channel_id = checked_channel_id(&channel)?;
        match self.gateway.delete_channel(channel_id).await {
            Ok(()) => {}
            Err(e) if e.kind == ErrorKind::NotFound => {
                info!("[lifecycle] {} channel {} already gone upstream", user_id, channel_id);
            }
            Err(e) => return Err(e.into()),
        }
        let updated = self.store.discard(user_id, channel.status)?;
        self.store.delete_groups(user_id)?;
        info!("[lifecycle] {} channel {} deleted", user_id, channel_id);
        Ok(updated)
    }
}
