use rusqlite::{params, Connection, OptionalExtension, Row};

use super::channels::text_col;
use super::{now_timestamp, GroupcastStore};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{AdminStatus, ChannelStatus, Group};
use crate::engine::gateway::GatewayGroup;

const GROUP_COLUMNS: &str =
    "user_id, group_id, name, participant_count, admin_status, last_synced_at, classified_at";

impl Group {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Group {
            user_id: row.get(0)?,
            group_id: row.get(1)?,
            name: row.get(2)?,
            participant_count: row.get(3)?,
            admin_status: text_col(row, 4)?,
            last_synced_at: row.get(5)?,
            classified_at: row.get(6)?,
        })
    }
}

fn write_groups(conn: &Connection, user_id: &str, groups: &[GatewayGroup]) -> EngineResult<usize> {
    conn.execute("DELETE FROM channel_groups WHERE user_id = ?1", params![user_id])?;
    let now = now_timestamp();
    let mut stmt = conn.prepare(
        "INSERT OR REPLACE INTO channel_groups
            (user_id, group_id, name, participant_count, admin_status, last_synced_at)
         VALUES (?1, ?2, ?3, ?4, 'unknown', ?5)",
    )?;
    for g in groups {
        stmt.execute(params![user_id, g.id, g.name, g.participant_count, now])?;
    }
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM channel_groups WHERE user_id = ?1",
        params![user_id],
        |r| r.get(0),
    )?)
}

impl GroupcastStore {
    /// Replace the user's group set wholesale with a collection result.
    /// Every row starts as `unknown`; duplicate ids collapse to one row.
    pub fn replace_groups(&self, user_id: &str, groups: &[GatewayGroup]) -> EngineResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let stored = write_groups(&tx, user_id, groups)?;
        tx.commit()?;
        Ok(stored)
    }

    /// `replace_groups` on behalf of a sync run. Only applies while the
    /// channel is still `connected` under `token`; otherwise `Conflict` and
    /// the stored set is left alone.
    pub fn replace_groups_for_session(
        &self,
        user_id: &str,
        token: &str,
        groups: &[GatewayGroup],
    ) -> EngineResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let session: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT status, secret_token FROM channels WHERE user_id = ?1",
                params![user_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match session {
            Some((status, Some(current))) if status == ChannelStatus::Connected.as_str() && current == token => {}
            Some((status, _)) if status == ChannelStatus::Connected.as_str() => {
                return Err(EngineError::conflict(user_id, "connected (run token)", "connected (new token)"));
            }
            Some((status, _)) => return Err(EngineError::conflict(user_id, ChannelStatus::Connected, status)),
            None => return Err(EngineError::NoChannel(user_id.to_string())),
        }
        let stored = write_groups(&tx, user_id, groups)?;
        tx.commit()?;
        Ok(stored)
    }

    /// Record a classification in place. `last_synced_at` is left alone.
    /// Returns false when the group is no longer stored.
    pub fn set_admin_status(
        &self,
        user_id: &str,
        group_id: &str,
        status: AdminStatus,
        participant_count: Option<u32>,
    ) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE channel_groups
             SET admin_status = ?3,
                 participant_count = COALESCE(?4, participant_count),
                 classified_at = ?5
             WHERE user_id = ?1 AND group_id = ?2",
            params![user_id, group_id, status.as_str(), participant_count, now_timestamp()],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_groups(&self, user_id: &str) -> EngineResult<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM channel_groups WHERE user_id = ?1", params![user_id])?)
    }

    pub fn list_groups(&self, user_id: &str, admin_only: bool) -> EngineResult<Vec<Group>> {
        let conn = self.conn.lock();
        let filter = if admin_only { "AND admin_status IN ('admin', 'creator')" } else { "" };
        let sql = format!(
            "SELECT {} FROM channel_groups WHERE user_id = ?1 {} ORDER BY name COLLATE NOCASE, group_id",
            GROUP_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], Group::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Groups awaiting classification. With `subset`, exactly those stored
    /// ids (whatever their current status); otherwise every `unknown` row.
    pub fn pending_groups(&self, user_id: &str, subset: Option<&[String]>) -> EngineResult<Vec<Group>> {
        match subset {
            None => {
                let conn = self.conn.lock();
                let sql = format!(
                    "SELECT {} FROM channel_groups WHERE user_id = ?1 AND admin_status = 'unknown'
                     ORDER BY group_id",
                    GROUP_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![user_id], Group::from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            }
            Some(ids) => {
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(g) = self.get_group(user_id, id)? {
                        if !out.iter().any(|o: &Group| o.group_id == g.group_id) {
                            out.push(g);
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    pub fn get_group(&self, user_id: &str, group_id: &str) -> EngineResult<Option<Group>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM channel_groups WHERE user_id = ?1 AND group_id = ?2",
            GROUP_COLUMNS
        );
        Ok(conn.query_row(&sql, params![user_id, group_id], Group::from_row).optional()?)
    }

    /// (total groups, admin-or-creator groups) for the user.
    pub fn count_groups(&self, user_id: &str) -> EngineResult<(u32, u32)> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN admin_status IN ('admin', 'creator') THEN 1 ELSE 0 END), 0)
             FROM channel_groups WHERE user_id = ?1",
            params![user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?)
    }
}
