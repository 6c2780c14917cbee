use rusqlite::{params, Connection, OptionalExtension, Row};
use std::str::FromStr;

use super::{now_timestamp, GroupcastStore};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Channel, ChannelMode, ChannelStatus, LoginMethod};

const CHANNEL_COLUMNS: &str = "user_id, channel_id, secret_token, status, mode, login_method, \
                               pairing_code, created_at, updated_at";

/// Parse a text column through the type's `FromStr` vocabulary.
pub(super) fn text_col<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

pub(super) fn opt_text_col<T: FromStr<Err = String>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        r.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
        })
    })
    .transpose()
}

impl Channel {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Channel {
            user_id: row.get(0)?,
            channel_id: row.get(1)?,
            secret_token: row.get(2)?,
            status: text_col(row, 3)?,
            mode: text_col(row, 4)?,
            login_method: opt_text_col(row, 5)?,
            pairing_code: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

fn load(conn: &Connection, user_id: &str) -> EngineResult<Option<Channel>> {
    let sql = format!("SELECT {} FROM channels WHERE user_id = ?1", CHANNEL_COLUMNS);
    Ok(conn.query_row(&sql, params![user_id], Channel::from_row).optional()?)
}

fn load_existing(conn: &Connection, user_id: &str) -> EngineResult<Channel> {
    load(conn, user_id)?.ok_or_else(|| EngineError::NoChannel(user_id.to_string()))
}

/// Build the Conflict error for a lost compare-and-swap.
fn conflict(conn: &Connection, user_id: &str, expected: ChannelStatus) -> EngineError {
    let actual = match load(conn, user_id) {
        Ok(Some(ch)) => ch.status.to_string(),
        Ok(None) => "missing".to_string(),
        Err(e) => return e,
    };
    EngineError::conflict(user_id, expected, actual)
}

impl GroupcastStore {
    // ── Reads ──────────────────────────────────────────────────────────

    pub fn get_channel(&self, user_id: &str) -> EngineResult<Option<Channel>> {
        let conn = self.conn.lock();
        load(&conn, user_id)
    }

    /// The user's channel, or `NoChannel` when there is no row or it is `none`.
    pub fn require_channel(&self, user_id: &str) -> EngineResult<Channel> {
        match self.get_channel(user_id)? {
            Some(ch) if ch.status != ChannelStatus::None => Ok(ch),
            _ => Err(EngineError::NoChannel(user_id.to_string())),
        }
    }

    /// Channels in any of `statuses` whose last transition is older than `cutoff`.
    pub fn channels_stale_in(&self, statuses: &[ChannelStatus], cutoff: &str) -> EngineResult<Vec<Channel>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM channels WHERE status = ?1 AND updated_at < ?2 ORDER BY updated_at",
            CHANNEL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut out = Vec::new();
        for status in statuses {
            let rows = stmt.query_map(params![status.as_str(), cutoff], Channel::from_row)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    // ── Creation ───────────────────────────────────────────────────────

    /// Store a freshly provisioned channel as `created`. Rejected with
    /// `AlreadyExists` when an active channel is present and `force` is false.
    pub fn insert_channel(
        &self,
        user_id: &str,
        channel_id: &str,
        token: &str,
        force: bool,
    ) -> EngineResult<Channel> {
        let conn = self.conn.lock();
        if let Some(existing) = load(&conn, user_id)? {
            if existing.is_active() && !force {
                return Err(EngineError::AlreadyExists {
                    user_id: user_id.to_string(),
                    status: existing.status.to_string(),
                });
            }
        }
        let now = now_timestamp();
        conn.execute(
            "INSERT INTO channels (user_id, channel_id, secret_token, status, mode, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'created', 'trial', ?4, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                channel_id = excluded.channel_id,
                secret_token = excluded.secret_token,
                status = 'created',
                mode = 'trial',
                login_method = NULL,
                pairing_code = NULL,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at",
            params![user_id, channel_id, token, now],
        )?;
        load_existing(&conn, user_id)
    }

    // ── Transitions ────────────────────────────────────────────────────

    /// Compare-and-swap the status. Fails with `Conflict` when the current
    /// status is not `from`; exactly one of several racing callers wins.
    pub fn transition(&self, user_id: &str, from: ChannelStatus, to: ChannelStatus) -> EngineResult<Channel> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE channels SET status = ?3, updated_at = ?4,
                    pairing_code = CASE WHEN ?3 = 'qr_displayed' THEN pairing_code ELSE NULL END
             WHERE user_id = ?1 AND status = ?2",
            params![user_id, from.as_str(), to.as_str(), now_timestamp()],
        )?;
        if changed == 0 {
            return Err(conflict(&conn, user_id, from));
        }
        load_existing(&conn, user_id)
    }

    /// `transition` that also records how authentication was started.
    pub fn transition_for_login(
        &self,
        user_id: &str,
        from: ChannelStatus,
        to: ChannelStatus,
        method: LoginMethod,
        pairing_code: Option<&str>,
    ) -> EngineResult<Channel> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE channels SET status = ?3, updated_at = ?4, login_method = ?5, pairing_code = ?6
             WHERE user_id = ?1 AND status = ?2",
            params![user_id, from.as_str(), to.as_str(), now_timestamp(), method.as_str(), pairing_code],
        )?;
        if changed == 0 {
            return Err(conflict(&conn, user_id, from));
        }
        load_existing(&conn, user_id)
    }

    /// Unconditional status write (hard disconnect, reaper drift correction).
    /// Identifier and token are untouched.
    pub fn force_status(&self, user_id: &str, to: ChannelStatus) -> EngineResult<Channel> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE channels SET status = ?2, updated_at = ?3, pairing_code = NULL WHERE user_id = ?1",
            params![user_id, to.as_str(), now_timestamp()],
        )?;
        if changed == 0 {
            return Err(EngineError::NoChannel(user_id.to_string()));
        }
        load_existing(&conn, user_id)
    }

    /// Null identifier and token and set `disconnected`, in one statement.
    pub fn clear(&self, user_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE channels SET channel_id = NULL, secret_token = NULL, status = 'disconnected',
                    login_method = NULL, pairing_code = NULL, updated_at = ?2
             WHERE user_id = ?1",
            params![user_id, now_timestamp()],
        )?;
        Ok(())
    }

    /// Delete edge: `from` → `none`, discarding identifier and token.
    pub fn discard(&self, user_id: &str, from: ChannelStatus) -> EngineResult<Channel> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE channels SET channel_id = NULL, secret_token = NULL, status = 'none',
                    login_method = NULL, pairing_code = NULL, mode = 'trial', updated_at = ?3
             WHERE user_id = ?1 AND status = ?2",
            params![user_id, from.as_str(), now_timestamp()],
        )?;
        if changed == 0 {
            return Err(conflict(&conn, user_id, from));
        }
        load_existing(&conn, user_id)
    }

    /// Trial expiry: any status → `expired`, identifier and token discarded.
    pub fn expire(&self, user_id: &str) -> EngineResult<Channel> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE channels SET channel_id = NULL, secret_token = NULL, status = 'expired',
                    login_method = NULL, pairing_code = NULL, updated_at = ?2
             WHERE user_id = ?1",
            params![user_id, now_timestamp()],
        )?;
        if changed == 0 {
            return Err(EngineError::NoChannel(user_id.to_string()));
        }
        load_existing(&conn, user_id)
    }

    // ── Snapshot-guarded writes (reaper) ───────────────────────────────
    //
    // Each applies only if the row still matches `seen` (status, token and
    // `updated_at`), so a sweep that awaited the gateway cannot overwrite a
    // transition made in the meantime. `false` means the row moved on.

    /// Clear identifier and token and drop the user's groups.
    pub fn clear_if_unchanged(&self, seen: &Channel) -> EngineResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE channels SET channel_id = NULL, secret_token = NULL, status = 'disconnected',
                    login_method = NULL, pairing_code = NULL, updated_at = ?5
             WHERE user_id = ?1 AND status = ?2 AND updated_at = ?3 AND secret_token IS ?4",
            params![seen.user_id, seen.status.as_str(), seen.updated_at, seen.secret_token, now_timestamp()],
        )?;
        if changed > 0 {
            tx.execute("DELETE FROM channel_groups WHERE user_id = ?1", params![seen.user_id])?;
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Correct drift to `to`. Moving away from `connected` drops the groups
    /// in the same transaction.
    pub fn correct_status_if_unchanged(&self, seen: &Channel, to: ChannelStatus) -> EngineResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE channels SET status = ?5, updated_at = ?6, pairing_code = NULL
             WHERE user_id = ?1 AND status = ?2 AND updated_at = ?3 AND secret_token IS ?4",
            params![
                seen.user_id,
                seen.status.as_str(),
                seen.updated_at,
                seen.secret_token,
                to.as_str(),
                now_timestamp()
            ],
        )?;
        if changed > 0 && to != ChannelStatus::Connected {
            tx.execute("DELETE FROM channel_groups WHERE user_id = ?1", params![seen.user_id])?;
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Bump `updated_at` after a revalidation that found nothing to change.
    pub fn touch_if_unchanged(&self, seen: &Channel) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE channels SET updated_at = ?5
             WHERE user_id = ?1 AND status = ?2 AND updated_at = ?3 AND secret_token IS ?4",
            params![seen.user_id, seen.status.as_str(), seen.updated_at, seen.secret_token, now_timestamp()],
        )?;
        Ok(changed > 0)
    }

    // ── Field updates ──────────────────────────────────────────────────

    /// Replace a malformed identifier with the gateway-confirmed one.
    /// Compare-and-swap on the old identifier.
    pub fn update_identifier(&self, user_id: &str, old_id: &str, new_id: &str) -> EngineResult<Channel> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE channels SET channel_id = ?3, updated_at = ?4 WHERE user_id = ?1 AND channel_id = ?2",
            params![user_id, old_id, new_id, now_timestamp()],
        )?;
        if changed == 0 {
            let actual = load(&conn, user_id)?.and_then(|c| c.channel_id).unwrap_or_default();
            return Err(EngineError::conflict(user_id, old_id, actual));
        }
        load_existing(&conn, user_id)
    }

    pub fn set_mode(&self, user_id: &str, mode: ChannelMode) -> EngineResult<Channel> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE channels SET mode = ?2 WHERE user_id = ?1",
            params![user_id, mode.as_str()],
        )?;
        load_existing(&conn, user_id)
    }

}
