// ── Groupcast Atoms: Error Types ────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Gateway, lifecycle…).
//   • Foreign errors convert via `#[from]`; `?` does the rest.
//   • Every variant maps onto one `ErrorClass` and carries a short recovery hint
//     for the UI collaborator; raw upstream bodies never reach the caller.
//   • No variant carries secret material (tokens) in its message.

use serde::Serialize;
use thiserror::Error;

// ── Gateway error taxonomy ─────────────────────────────────────────────────

/// Raw upstream taxonomy surfaced by the gateway client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 401/403: bad or expired token. Never retried.
    Unauthorized,
    /// 404: the channel (or group) vanished upstream.
    NotFound,
    /// 429 or 5xx.
    RateLimited,
    /// Transport timeout or dropped connection.
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::Timeout)
    }

    /// Classify an HTTP status code. `None` for success codes.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            401 | 403 => Some(ErrorKind::Unauthorized),
            404 => Some(ErrorKind::NotFound),
            429 | 500..=599 => Some(ErrorKind::RateLimited),
            _ => Some(ErrorKind::Unknown),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    /// Truncated upstream detail, for logs only.
    pub message: String,
    /// Seconds from a `Retry-After` header, when the gateway sent one.
    pub retry_after: Option<u64>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, status: None, message: message.into(), retry_after: None }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure below the gateway taxonomy (client construction).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Partner gateway call failed; `kind` carries the upstream taxonomy.
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Compare-and-swap on the channel status lost a race.
    #[error("Conflict for user {user_id}: expected status {expected}, found {actual}")]
    Conflict { user_id: String, expected: String, actual: String },

    /// An active channel already exists and `force` was not set.
    #[error("User {user_id} already has an active channel ({status})")]
    AlreadyExists { user_id: String, status: String },

    /// Stored channel identifier fails the canonical format check.
    #[error("Malformed channel identifier: {0}")]
    MalformedIdentifier(String),

    /// Identifier repair found no gateway-confirmed match.
    #[error("Identifier repair failed: {0}")]
    RepairFailed(String),

    /// A sync run is already starting/running for this user.
    #[error("Sync already running for user {0}")]
    Busy(String),

    /// A sync run completed too recently; server-side cooldown.
    #[error("Sync cooling down, retry in {retry_after_secs}s")]
    CoolingDown { retry_after_secs: i64 },

    /// Operation is not valid from the channel's current status.
    #[error("Cannot {operation} while channel is {status}")]
    InvalidState { operation: String, status: String },

    /// The user has no channel row (or it is in `none`).
    #[error("No channel for user {0}")]
    NoChannel(String),

    /// Live mode requested without a paid plan.
    #[error("Plan required: {0}")]
    PlanRequired(String),

    /// Engine configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid caller input with no dedicated variant.
    #[error("{0}")]
    Other(String),
}

// ── Taxonomy ───────────────────────────────────────────────────────────────

/// Caller-facing error classes. Controller and engine translate everything
/// they cannot recover from locally into one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    AuthInvalid,
    NotFoundUpstream,
    Conflict,
    MalformedIdentifier,
    Busy,
    Fatal,
}

impl EngineError {
    pub fn conflict(user_id: &str, expected: impl ToString, actual: impl ToString) -> Self {
        Self::Conflict {
            user_id: user_id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn invalid_state(operation: &str, status: impl ToString) -> Self {
        Self::InvalidState { operation: operation.to_string(), status: status.to_string() }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Gateway(g) => match g.kind {
                ErrorKind::RateLimited | ErrorKind::Timeout => ErrorClass::Transient,
                ErrorKind::Unauthorized => ErrorClass::AuthInvalid,
                ErrorKind::NotFound => ErrorClass::NotFoundUpstream,
                ErrorKind::Unknown => ErrorClass::Fatal,
            },
            EngineError::Network(_) => ErrorClass::Transient,
            EngineError::Conflict { .. } | EngineError::AlreadyExists { .. } => ErrorClass::Conflict,
            EngineError::MalformedIdentifier(_) | EngineError::RepairFailed(_) => {
                ErrorClass::MalformedIdentifier
            }
            EngineError::Busy(_) | EngineError::CoolingDown { .. } => ErrorClass::Busy,
            _ => ErrorClass::Fatal,
        }
    }

    /// Short, user-facing recovery hint. Never includes upstream text.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            EngineError::Gateway(g) => match g.kind {
                ErrorKind::RateLimited => "gateway is throttling, try again in a minute",
                ErrorKind::Timeout => "gateway did not answer in time, try again",
                ErrorKind::Unauthorized => "token invalid, recreate channel",
                ErrorKind::NotFound => "channel no longer exists upstream, create a new one",
                ErrorKind::Unknown => "unexpected gateway response, run recovery",
            },
            EngineError::Conflict { .. } => "status changed concurrently, refresh and retry",
            EngineError::AlreadyExists { .. } => "a channel is already active, delete it or force replacement",
            EngineError::MalformedIdentifier(_) => "channel identifier is malformed, run repair",
            EngineError::RepairFailed(_) => "identifier could not be repaired, recreate channel",
            EngineError::Busy(_) => "a group sync is running, wait or cancel it first",
            EngineError::CoolingDown { .. } => "groups were synced recently, try again later",
            EngineError::InvalidState { .. } => "refresh channel status and retry",
            EngineError::NoChannel(_) => "create a channel first",
            EngineError::PlanRequired(_) => "upgrade to a paid plan to go live",
            EngineError::Database(_) | EngineError::Io(_) => "local storage failure, contact support",
            EngineError::Network(_) => "network failure, try again",
            _ => "unexpected failure, run recovery",
        }
    }
}

// ── Foreign conversions ────────────────────────────────────────────────────

impl From<toml::de::Error> for EngineError {
    fn from(e: toml::de::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;
