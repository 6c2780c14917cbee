// ── Groupcast Atoms: Domain Types ───────────────────────────────────────────
// Persisted records (Channel, Group, SyncProgress) and their status
// vocabularies. Status enums round-trip through the DB as snake_case text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Implements `as_str`, `Display` and `FromStr` over a fixed text vocabulary.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

// ── Channel ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    None,
    Created,
    Initializing,
    Unauthorized,
    QrDisplayed,
    Connected,
    Disconnected,
    Expired,
}

text_enum!(ChannelStatus {
    None => "none",
    Created => "created",
    Initializing => "initializing",
    Unauthorized => "unauthorized",
    QrDisplayed => "qr_displayed",
    Connected => "connected",
    Disconnected => "disconnected",
    Expired => "expired",
});

impl ChannelStatus {
    /// Edges of the lifecycle diagram the controller may take on its own.
    /// Reaper drift corrections bypass this table.
    pub fn allows(self, to: ChannelStatus) -> bool {
        use ChannelStatus::*;
        match (self, to) {
            (_, Expired) => self != Expired,
            (None | Disconnected | Expired, Created) => true,
            (Created, Initializing | Unauthorized) => true,
            (Initializing, Unauthorized) => true,
            (Unauthorized, QrDisplayed | Connected) => true,
            (QrDisplayed, Connected) => true,
            (Connected, Unauthorized) => true,
            (Connected | Unauthorized | QrDisplayed, None) => true,
            _ => false,
        }
    }

    /// Created/initializing: provisioned but not yet launch-ready.
    pub fn is_transient(self) -> bool {
        matches!(self, ChannelStatus::Created | ChannelStatus::Initializing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    #[default]
    Trial,
    Live,
}

text_enum!(ChannelMode { Trial => "trial", Live => "live" });

/// How the current authentication attempt was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginMethod {
    Qr,
    /// Phone login answered with a pairing code the user types on the phone.
    PhoneCode,
}

text_enum!(LoginMethod { Qr => "qr", PhoneCode => "phone_code" });

#[derive(Clone, Serialize, Deserialize)]
pub struct Channel {
    pub user_id: String,
    pub channel_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_token: Option<String>,
    pub status: ChannelStatus,
    pub mode: ChannelMode,
    pub login_method: Option<LoginMethod>,
    pub pairing_code: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: String,
}

// Keeps the token out of `{:?}` output.
impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("user_id", &self.user_id)
            .field("channel_id", &self.channel_id)
            .field("secret_token", &self.secret_token.as_ref().map(|_| "<redacted>"))
            .field("status", &self.status)
            .field("mode", &self.mode)
            .field("login_method", &self.login_method)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

impl Channel {
    /// Exactly one channel per user may be active. Cleared rows
    /// (`disconnected` with no identifier) do not count.
    pub fn is_active(&self) -> bool {
        !matches!(self.status, ChannelStatus::None | ChannelStatus::Expired)
            && self.channel_id.is_some()
    }
}

// ── Group ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdminStatus {
    #[default]
    Unknown,
    Admin,
    Creator,
    Member,
}

text_enum!(AdminStatus {
    Unknown => "unknown",
    Admin => "admin",
    Creator => "creator",
    Member => "member",
});

impl AdminStatus {
    pub fn can_broadcast(self) -> bool {
        matches!(self, AdminStatus::Admin | AdminStatus::Creator)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub user_id: String,
    pub group_id: String,
    pub name: String,
    pub participant_count: u32,
    pub admin_status: AdminStatus,
    pub last_synced_at: String,
    pub classified_at: Option<String>,
}

// ── Sync progress ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    NotRunning,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(SyncStatus {
    NotRunning => "not_running",
    Starting => "starting",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl SyncStatus {
    pub fn is_active(self) -> bool {
        matches!(self, SyncStatus::Starting | SyncStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SyncStatus::Completed | SyncStatus::Failed | SyncStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Collecting,
    Classifying,
}

text_enum!(SyncPhase { Collecting => "collecting", Classifying => "classifying" });

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub user_id: String,
    pub run_id: String,
    pub status: SyncStatus,
    pub phase: Option<SyncPhase>,
    pub groups_found: u32,
    pub admins_found: u32,
    pub total_scanned: u32,
    pub current_batch: u32,
    pub message: String,
    pub started_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

impl SyncProgress {
    /// Synthetic row reported when nothing is running.
    pub fn not_running(user_id: &str) -> Self {
        SyncProgress {
            user_id: user_id.to_string(),
            run_id: String::new(),
            status: SyncStatus::NotRunning,
            phase: None,
            groups_found: 0,
            admins_found: 0,
            total_scanned: 0,
            current_batch: 0,
            message: String::new(),
            started_at: String::new(),
            updated_at: String::new(),
            completed_at: None,
            error: None,
        }
    }

    /// Rough completion percentage for pollers. Collection has no known
    /// total, so it reports 0–50 and classification 50–100.
    pub fn percent(&self) -> u8 {
        match (self.status, self.phase) {
            (SyncStatus::Completed, _) => 100,
            (_, Some(SyncPhase::Classifying)) if self.groups_found > 0 => {
                let done = self.total_scanned.min(self.groups_found) as u64;
                (50 + done * 50 / self.groups_found as u64) as u8
            }
            (_, Some(SyncPhase::Classifying)) => 50,
            (_, Some(SyncPhase::Collecting)) => (self.current_batch.min(10) * 5) as u8,
            _ => 0,
        }
    }
}

// ── Plan (billing collaborator) ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Trial,
    Paid,
    Expired,
}

text_enum!(PlanStatus { Trial => "trial", Paid => "paid", Expired => "expired" });
