// ── Groupcast Engine: HTTP Retry & Backoff Primitives ───────────────────────
//
// Shared delay math used by the gateway client, the readiness poll, the
// collection loop and the broadcast sender. Every loop in the engine that
// sleeps computes its delay here so the curves stay in one place.
//
// Curves:
//   • Client retry:   base 1s × 2^attempt, cap 30s, ±25% jitter, honours Retry-After
//   • Readiness poll: base × 1.5^attempt, capped (2s → 15s by default)
//   • Pacing:         min(base + calls × step, ceiling), grows mildly per call
//   • Rate limit:     min(base × 2^(n-1), ceiling) over consecutive 429/5xx

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::atoms::constants::{LOG_BODY_LIMIT, READY_BACKOFF_FACTOR};

const CLIENT_RETRY_BASE_MS: u64 = 1_000;
const CLIENT_RETRY_CAP_MS: u64 = 30_000;
const RETRY_AFTER_CAP_SECS: u64 = 60;
const JITTER_FLOOR_MS: u64 = 100;

// ── Client retry delay ─────────────────────────────────────────────────────

/// Delay before client retry `attempt` (0-based). A Retry-After hint can
/// lengthen the wait, never shorten it. `scale` shrinks the whole curve;
/// tests run with 0.0.
pub fn client_retry_delay(attempt: u32, retry_after_secs: Option<u64>, scale: f64) -> Duration {
    let backoff = CLIENT_RETRY_CAP_MS.min(CLIENT_RETRY_BASE_MS << attempt.min(10));
    let hinted = retry_after_secs
        .map(|secs| secs.min(RETRY_AFTER_CAP_SECS) * 1_000)
        .unwrap_or(0);
    let ms = jittered(backoff.max(hinted), clock_entropy());
    Duration::from_millis((ms as f64 * scale.max(0.0)) as u64)
}

/// Sleep for [`client_retry_delay`] and report how long it was.
pub async fn retry_delay(attempt: u32, retry_after_secs: Option<u64>, scale: f64) -> Duration {
    let delay = client_retry_delay(attempt, retry_after_secs, scale);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    delay
}

/// Spread `ms` by up to a quarter either way, driven by `entropy`.
fn jittered(ms: u64, entropy: u64) -> u64 {
    let spread = ms / 4;
    if spread == 0 {
        return ms.max(JITTER_FLOOR_MS);
    }
    let shifted = (ms - spread) + entropy % (2 * spread + 1);
    shifted.max(JITTER_FLOOR_MS)
}

fn clock_entropy() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0)
}

/// Retry-After in delta-seconds. HTTP-date values yield `None` and the
/// computed backoff applies.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}

// ── Loop delays (deterministic, no jitter) ─────────────────────────────────

/// Readiness poll delay: `base × 1.5^attempt`, capped at `max_ms`.
pub fn ready_poll_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let raw = base_ms as f64 * READY_BACKOFF_FACTOR.powi(attempt.min(32) as i32);
    Duration::from_millis((raw.min(max_ms as f64)) as u64)
}

/// Inter-call pacing during collection: grows mildly with the number of
/// calls already made, never above `ceiling_ms`.
pub fn pacing_delay(calls_made: u32, base_ms: u64, step_ms: u64, ceiling_ms: u64) -> Duration {
    let ms = base_ms.saturating_add(step_ms.saturating_mul(calls_made as u64));
    Duration::from_millis(ms.min(ceiling_ms))
}

/// Backoff after the `consecutive`-th rate-limited response in a row (1-based).
/// Monotonically non-decreasing in `consecutive`, bounded by `ceiling_ms`.
/// A larger `Retry-After` hint wins, still under the ceiling.
pub fn rate_limit_delay(
    consecutive: u32,
    base_ms: u64,
    ceiling_ms: u64,
    retry_after_secs: Option<u64>,
) -> Duration {
    let exp = consecutive.saturating_sub(1).min(20);
    let ms = base_ms.saturating_mul(1u64 << exp);
    let hinted = retry_after_secs.map(|s| s.saturating_mul(1000)).unwrap_or(0);
    Duration::from_millis(ms.max(hinted).min(ceiling_ms))
}

// ── Log hygiene ────────────────────────────────────────────────────────────

/// Show only a short prefix of a secret token.
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    if prefix.is_empty() {
        "<empty>".into()
    } else {
        format!("{}…", prefix)
    }
}

/// Truncate an upstream body for logging, on a char boundary.
pub fn truncate_body(text: &str) -> &str {
    match text.char_indices().nth(LOG_BODY_LIMIT) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
