// Groupcast Engine — Identifier formats
// Canonical channel-id check, phone normalisation, WhatsApp JID comparison.
//
// Canonical channel ids come in two shapes issued by the partner:
//   XXXXXX-XXXXX   six and five uppercase alphanumerics joined by a dash
//   XXXXXXXXXXXX   twelve uppercase alphanumerics (older channels)
// Anything else is malformed and can only be corrected by the repair flow.

use regex::Regex;
use std::sync::LazyLock;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::Channel;

static CANONICAL_CHANNEL_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Z0-9]{6}-[A-Z0-9]{5}|[A-Z0-9]{12})$").expect("channel id regex")
});

/// True when `id` is in a canonical partner format.
pub fn is_canonical_channel_id(id: &str) -> bool {
    CANONICAL_CHANNEL_ID.is_match(id)
}

/// The channel's identifier, if present and canonical. Callers that send the
/// identifier upstream go through here; a malformed one is never sent.
pub fn checked_channel_id(channel: &Channel) -> EngineResult<&str> {
    match channel.channel_id.as_deref() {
        None => Err(EngineError::NoChannel(channel.user_id.clone())),
        Some(id) if is_canonical_channel_id(id) => Ok(id),
        Some(id) => Err(EngineError::MalformedIdentifier(id.to_string())),
    }
}

/// Digits only: `+1 (555) 010-9999` → `15550109999`.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Phone part of a WhatsApp id: `972501234567@s.whatsapp.net` → `972501234567`.
/// Device suffixes (`:12`) are dropped too.
pub fn jid_user(jid: &str) -> &str {
    let user = jid.split('@').next().unwrap_or(jid);
    user.split(':').next().unwrap_or(user)
}

/// Two WhatsApp ids name the same account.
pub fn same_account(a: &str, b: &str) -> bool {
    let (a, b) = (normalize_phone(jid_user(a)), normalize_phone(jid_user(b)));
    !a.is_empty() && a == b
}
