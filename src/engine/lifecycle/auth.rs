// Channel Lifecycle — authentication
// QR and phone login, status checks, and the one "already connected" path.

use log::{info, warn};
use serde::Serialize;

use super::ChannelController;
use crate::atoms::error::{EngineError, EngineResult, ErrorKind};
use crate::atoms::types::{Channel, ChannelStatus, LoginMethod};
use crate::engine::gateway::{PhoneLoginOutcome, QrImage, QrOutcome, UpstreamState};
use crate::engine::identifier::normalize_phone;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QrResult {
    Displayed { qr: QrImage },
    /// The account authenticated while the QR was being fetched.
    AlreadyConnected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhoneLoginResult {
    Connected,
    /// The user types this code into WhatsApp on the phone. Completion is
    /// picked up by `check_status`; there is no code-submission call.
    CodeRequired { pairing_code: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCheck {
    pub channel: Channel,
    /// Raw upstream status text, `None` when no check was made.
    pub upstream: Option<String>,
    pub changed: bool,
}

impl ChannelController {
    /// Load the channel for an auth call. `created`/`initializing` channels
    /// get one status check first.
    async fn settled_channel(&self, user_id: &str, operation: &str) -> EngineResult<Channel> {
        let channel = self.store.require_channel(user_id)?;
        if !channel.status.is_transient() {
            return Ok(channel);
        }
        let check = self.check_status(user_id).await?;
        if check.channel.status.is_transient() {
            return Err(EngineError::invalid_state(operation, check.channel.status));
        }
        Ok(check.channel)
    }

    // ── QR ─────────────────────────────────────────────────────────────

    /// Request a QR image. Valid from `unauthorized` (or re-requested from
    /// `qr_displayed`); moves to `qr_displayed`.
    pub async fn get_qr(&self, user_id: &str) -> EngineResult<QrResult> {
        let channel = self.settled_channel(user_id, "request QR").await?;
        match channel.status {
            ChannelStatus::Unauthorized | ChannelStatus::QrDisplayed => {}
            ChannelStatus::Connected => return Ok(QrResult::AlreadyConnected),
            other => return Err(EngineError::invalid_state("request QR", other)),
        }
        let token = Self::token_of(&channel, "request QR")?;

        match self.gateway.get_qr(&token).await {
            Ok(QrOutcome::Image(qr)) => {
                self.store.transition_for_login(
                    user_id,
                    channel.status,
                    ChannelStatus::QrDisplayed,
                    LoginMethod::Qr,
                    None,
                )?;
                info!("[lifecycle] {} QR displayed", user_id);
                Ok(QrResult::Displayed { qr })
            }
            Ok(QrOutcome::AlreadyAuthenticated) => {
                self.settle_connected(user_id, channel.status).await?;
                Ok(QrResult::AlreadyConnected)
            }
            Err(e) => Err(self.upstream_failure(user_id, e.into())),
        }
    }

    // ── Phone login ────────────────────────────────────────────────────

    pub async fn login_with_phone(&self, user_id: &str, phone: &str) -> EngineResult<PhoneLoginResult> {
        let digits = normalize_phone(phone);
        if digits.is_empty() {
            return Err(EngineError::Other("phone number has no digits".into()));
        }
        let channel = self.settled_channel(user_id, "log in with phone").await?;
        match channel.status {
            ChannelStatus::Unauthorized | ChannelStatus::QrDisplayed => {}
            ChannelStatus::Connected => return Ok(PhoneLoginResult::Connected),
            other => return Err(EngineError::invalid_state("log in with phone", other)),
        }
        let token = Self::token_of(&channel, "log in with phone")?;

        match self.gateway.login_with_phone(&token, &digits).await {
            Ok(PhoneLoginOutcome::Connected) => {
                self.settle_connected(user_id, channel.status).await?;
                Ok(PhoneLoginResult::Connected)
            }
            Ok(PhoneLoginOutcome::CodeRequired { code }) => {
                self.store.transition_for_login(
                    user_id,
                    channel.status,
                    ChannelStatus::QrDisplayed,
                    LoginMethod::PhoneCode,
                    Some(&code),
                )?;
                info!("[lifecycle] {} phone login needs pairing code", user_id);
                Ok(PhoneLoginResult::CodeRequired { pairing_code: code })
            }
            Err(e) => Err(self.upstream_failure(user_id, e.into())),
        }
    }

    // ── Status check ───────────────────────────────────────────────────

    /// Reconcile the local status with the gateway's. Idempotent; writes only
    /// when the mapped status differs. A vanished channel is cleared locally.
    /// Demotions that drop groups return `Busy` while a sync run is active.
    pub async fn check_status(&self, user_id: &str) -> EngineResult<StatusCheck> {
        let channel = self.store.require_channel(user_id)?;
        let Some(token) = channel.secret_token.clone() else {
            return Ok(StatusCheck { channel, upstream: None, changed: false });
        };

        let health = match self.gateway.get_status(&token).await {
            Ok(h) => h,
            Err(e) if e.kind == ErrorKind::NotFound => {
                self.ensure_not_syncing(user_id)?;
                warn!("[lifecycle] {} channel vanished upstream, clearing", user_id);
                self.store.clear(user_id)?;
                self.store.delete_groups(user_id)?;
                let channel = self.store.require_channel(user_id)?;
                return Ok(StatusCheck { channel, upstream: None, changed: true });
            }
            Err(e) => return Err(e.into()),
        };

        let from = channel.status;
        let updated = match (health.state, from) {
            (UpstreamState::Connected, ChannelStatus::Connected) => None,
            (UpstreamState::Connected, _) => Some(self.settle_connected(user_id, from).await?),
            (UpstreamState::AwaitingAuth, ChannelStatus::Unauthorized | ChannelStatus::QrDisplayed) => None,
            (UpstreamState::AwaitingAuth, ChannelStatus::Connected) => {
                self.ensure_not_syncing(user_id)?;
                warn!("[lifecycle] {} logged out upstream, dropping groups", user_id);
                let ch = self.store.transition(user_id, from, ChannelStatus::Unauthorized)?;
                self.store.delete_groups(user_id)?;
                Some(ch)
            }
            (UpstreamState::AwaitingAuth, ChannelStatus::Created | ChannelStatus::Initializing) => {
                Some(self.store.transition(user_id, from, ChannelStatus::Unauthorized)?)
            }
            (UpstreamState::Initializing, ChannelStatus::Created) => {
                Some(self.store.transition(user_id, from, ChannelStatus::Initializing)?)
            }
            (UpstreamState::Failed, ChannelStatus::Created | ChannelStatus::Initializing) => {
                warn!("[lifecycle] {} upstream reports {}, clearing", user_id, health.raw);
                self.store.clear(user_id)?;
                Some(self.store.require_channel(user_id)?)
            }
            (state, _) => {
                if matches!(state, UpstreamState::Failed | UpstreamState::Unknown) {
                    warn!("[lifecycle] {} upstream status {:?} left unmapped while {}", user_id, health.raw, from);
                }
                None
            }
        };

        let changed = updated.is_some();
        let channel = match updated {
            Some(ch) => {
                info!("[lifecycle] {} status {} → {}", user_id, from, ch.status);
                ch
            }
            None => channel,
        };
        Ok(StatusCheck { channel, upstream: Some(health.raw), changed })
    }

    // ── Already-connected short circuit ────────────────────────────────

    /// The single path into `connected`, from wherever authentication was
    /// detected. Transient statuses step through `unauthorized` first.
    pub(crate) async fn settle_connected(&self, user_id: &str, from: ChannelStatus) -> EngineResult<Channel> {
        let from = match from {
            ChannelStatus::Connected => return self.store.require_channel(user_id),
            ChannelStatus::Created | ChannelStatus::Initializing => {
                self.store.transition(user_id, from, ChannelStatus::Unauthorized)?;
                ChannelStatus::Unauthorized
            }
            ChannelStatus::Unauthorized | ChannelStatus::QrDisplayed => from,
            other => return Err(EngineError::invalid_state("mark connected", other)),
        };
        let channel = self.store.transition(user_id, from, ChannelStatus::Connected)?;
        info!("[lifecycle] {} {} → connected", user_id, from);
        Ok(channel)
    }

    /// Upstream said the channel is gone: clear locally, then surface.
    fn upstream_failure(&self, user_id: &str, err: EngineError) -> EngineError {
        if let EngineError::Gateway(g) = &err {
            if g.kind == ErrorKind::NotFound {
                if !matches!(self.progress.is_active(user_id), Ok(false)) {
                    warn!("[lifecycle] {} channel vanished upstream during a sync, left for later", user_id);
                    return err;
                }
                warn!("[lifecycle] {} channel vanished upstream, clearing", user_id);
                if let Err(e) = self.store.clear(user_id).and_then(|_| self.store.delete_groups(user_id)) {
                    warn!("[lifecycle] local cleanup failed: {}", e);
                }
            }
        }
        err
    }
}
