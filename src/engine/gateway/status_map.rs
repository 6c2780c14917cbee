// Gateway — status vocabulary
// The partner has shipped several status vocabularies over time (`AUTH`,
// `authenticated`, `ready`, `online`, `LAUNCHED`, `QR`…). Every caller maps
// them through this one table; nothing else string-matches upstream states.

use super::ParticipantRank;
use crate::atoms::types::ChannelStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    /// Authenticated and online.
    Connected,
    /// Launched and waiting for QR scan or phone login.
    AwaitingAuth,
    /// Still booting.
    Initializing,
    /// Upstream gave up on this channel.
    Failed,
    Unknown,
}

const STATUS_TABLE: &[(&str, UpstreamState)] = &[
    ("ready", UpstreamState::Connected),
    ("authenticated", UpstreamState::Connected),
    ("auth", UpstreamState::Connected),
    ("online", UpstreamState::Connected),
    ("connected", UpstreamState::Connected),
    ("open", UpstreamState::Connected),
    ("qr", UpstreamState::AwaitingAuth),
    ("unauthorized", UpstreamState::AwaitingAuth),
    ("launched", UpstreamState::AwaitingAuth),
    ("launch", UpstreamState::AwaitingAuth),
    ("logout", UpstreamState::AwaitingAuth),
    ("close", UpstreamState::AwaitingAuth),
    ("loading", UpstreamState::Initializing),
    ("initializing", UpstreamState::Initializing),
    ("init", UpstreamState::Initializing),
    ("starting", UpstreamState::Initializing),
    ("pending", UpstreamState::Initializing),
    ("connecting", UpstreamState::Initializing),
    ("failed", UpstreamState::Failed),
    ("error", UpstreamState::Failed),
    ("stopped", UpstreamState::Failed),
    ("banned", UpstreamState::Failed),
];

pub fn map_upstream_status(raw: &str) -> UpstreamState {
    let needle = raw.trim().to_ascii_lowercase();
    STATUS_TABLE
        .iter()
        .find(|(text, _)| *text == needle)
        .map(|(_, state)| *state)
        .unwrap_or(UpstreamState::Unknown)
}

impl UpstreamState {
    /// Channel has finished booting: QR or phone login can be requested.
    pub fn is_launch_ready(self) -> bool {
        matches!(self, UpstreamState::AwaitingAuth | UpstreamState::Connected)
    }

    /// Local status this upstream state corresponds to, if any.
    pub fn local_status(self) -> Option<ChannelStatus> {
        match self {
            UpstreamState::Connected => Some(ChannelStatus::Connected),
            UpstreamState::AwaitingAuth => Some(ChannelStatus::Unauthorized),
            UpstreamState::Initializing => Some(ChannelStatus::Initializing),
            UpstreamState::Failed | UpstreamState::Unknown => None,
        }
    }
}

/// Participant role text → rank. Unrecognised roles read as plain members.
pub fn map_participant_rank(raw: &str) -> ParticipantRank {
    match raw.trim().to_ascii_lowercase().as_str() {
        "creator" | "owner" | "superadmin" => ParticipantRank::Creator,
        "admin" | "administrator" => ParticipantRank::Admin,
        _ => ParticipantRank::Member,
    }
}
