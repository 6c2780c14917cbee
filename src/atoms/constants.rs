// ── Groupcast Atoms: Constants ──────────────────────────────────────────────
// Named constants for the crate. Tunables that operators may change live in
// `engine::config` and default to the values below.

// ── Gateway pagination ─────────────────────────────────────────────────────
// Individual group-list responses must stay bounded; the gateway starts
// truncating silently above this.
pub const MAX_GROUP_BATCH: u32 = 150;
pub const DEFAULT_GROUP_BATCH: u32 = 150;
pub const DEFAULT_MAX_API_CALLS: u32 = 40;

// ── Collection pacing: min(base + calls * step, ceiling) ───────────────────
pub const DEFAULT_PACE_BASE_MS: u64 = 1_500;
pub const DEFAULT_PACE_STEP_MS: u64 = 250;
pub const DEFAULT_PACE_CEILING_MS: u64 = 5_000;

// ── Rate-limit backoff: min(base * 2^(n-1), ceiling) ───────────────────────
pub const DEFAULT_RATE_LIMIT_BASE_MS: u64 = 5_000;
pub const DEFAULT_RATE_LIMIT_CEILING_MS: u64 = 60_000;
pub const DEFAULT_MAX_CONSECUTIVE_RATE_LIMITS: u32 = 8;

// ── Classification ─────────────────────────────────────────────────────────
pub const DEFAULT_CLASSIFY_BATCH: usize = 5;
pub const DEFAULT_CLASSIFY_ITEM_RETRIES: u32 = 2;

// ── Readiness poll: base * 1.5^attempt, capped ─────────────────────────────
pub const DEFAULT_READY_BASE_MS: u64 = 2_000;
pub const DEFAULT_READY_MAX_MS: u64 = 15_000;
pub const DEFAULT_READY_MAX_ATTEMPTS: u32 = 20;
pub const READY_BACKOFF_FACTOR: f64 = 1.5;

// ── Sync bookkeeping ───────────────────────────────────────────────────────
pub const DEFAULT_SYNC_COOLDOWN_SECS: i64 = 300;
/// Terminal progress rows older than this read as `not_running`.
pub const DEFAULT_PROGRESS_STALE_SECS: i64 = 600;

// ── Reaper thresholds ──────────────────────────────────────────────────────
pub const DEFAULT_TRANSIENT_TIMEOUT_MINS: i64 = 10;
pub const DEFAULT_REVALIDATE_AFTER_HOURS: i64 = 24;
pub const DEFAULT_ABANDONED_RUN_MINS: i64 = 30;

// ── Gateway client ─────────────────────────────────────────────────────────
pub const DEFAULT_GATEWAY_URL: &str = "https://gate.example-partner.net";
pub const DEFAULT_PARTNER_URL: &str = "https://manager.example-partner.net";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_GATEWAY_RETRIES: u32 = 2;
/// Upstream bodies are truncated to this many chars before logging.
pub const LOG_BODY_LIMIT: usize = 300;

// ── Broadcast ──────────────────────────────────────────────────────────────
pub const DEFAULT_BROADCAST_PACE_MS: u64 = 2_000;

// ── Storage ────────────────────────────────────────────────────────────────
pub const DB_FILE_NAME: &str = "groupcast.db";
pub const DATA_DIR_NAME: &str = "groupcast";
