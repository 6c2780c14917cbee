// Groupcast Engine — Partner Gateway
//
// Module layout:
//   status_map — the one table mapping upstream status vocabularies to UpstreamState
//   qr         — QrImage, data-URI / bare base64 normalisation, extract_qr
//   client     — GatewayClient: reqwest implementation of GatewayApi
//
// Callers (controller, sync engine, reaper) only see the `GatewayApi` trait,
// so tests drive them with a scripted fake. The client never touches the store.

pub mod client;
pub mod qr;
pub mod status_map;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use crate::atoms::error::{ErrorKind, GatewayError, GatewayResult};
use crate::atoms::types::ChannelMode;
pub use client::GatewayClient;
pub use qr::QrImage;
pub use status_map::{map_participant_rank, map_upstream_status, UpstreamState};

// ── Wire-level types ───────────────────────────────────────────────────────

/// A freshly provisioned partner channel.
#[derive(Debug, Clone)]
pub struct ProvisionedChannel {
    pub channel_id: String,
    pub token: String,
    pub name: String,
}

/// One row of the partner's channel listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelHealth {
    pub state: UpstreamState,
    /// The raw upstream status text, for diagnostics.
    pub raw: String,
    /// WhatsApp id of the authenticated account, once known.
    pub me: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QrOutcome {
    Image(QrImage),
    /// The account authenticated while the QR was being requested.
    AlreadyAuthenticated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhoneLoginOutcome {
    Connected,
    /// Pairing code the user enters in WhatsApp on the phone.
    CodeRequired { code: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayGroup {
    pub id: String,
    pub name: String,
    pub participant_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRank {
    Creator,
    Admin,
    Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub rank: ParticipantRank,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub id: String,
    pub name: String,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentMessage {
    pub message_id: String,
}

// ── Gateway trait ──────────────────────────────────────────────────────────

/// Typed surface of the partner gateway. Every call returns the raw
/// upstream taxonomy in `GatewayError::kind`; translation into lifecycle
/// transitions happens in the caller.
#[async_trait]
pub trait GatewayApi: Send + Sync {
    // Partner manager (partner token)
    async fn create_channel(&self, name: &str) -> GatewayResult<ProvisionedChannel>;
    async fn delete_channel(&self, channel_id: &str) -> GatewayResult<()>;
    async fn list_channels(&self) -> GatewayResult<Vec<ChannelSummary>>;
    async fn set_channel_mode(&self, channel_id: &str, mode: ChannelMode) -> GatewayResult<()>;

    // Channel surface (channel token)
    async fn get_status(&self, token: &str) -> GatewayResult<ChannelHealth>;
    async fn get_qr(&self, token: &str) -> GatewayResult<QrOutcome>;
    /// `phone` must already be digits-only.
    async fn login_with_phone(&self, token: &str, phone: &str) -> GatewayResult<PhoneLoginOutcome>;
    async fn logout(&self, token: &str) -> GatewayResult<()>;
    /// `count` is capped by the caller; a batch shorter than `count` ends the list.
    async fn list_groups(&self, token: &str, offset: u32, count: u32) -> GatewayResult<Vec<GatewayGroup>>;
    async fn get_group(&self, token: &str, group_id: &str) -> GatewayResult<GroupMetadata>;
    async fn send_message(&self, token: &str, to: &str, body: &str) -> GatewayResult<SentMessage>;
}
