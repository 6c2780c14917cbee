// Database schema and migrations for the groupcast store.
// Called once by GroupcastStore::open(). Adding a table or column: append an
// idempotent CREATE TABLE IF NOT EXISTS or ALTER TABLE … ADD COLUMN (errors
// are swallowed) at the end — never edit existing SQL.

use crate::atoms::error::EngineResult;
use rusqlite::Connection;

pub(crate) fn run_migrations(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS channels (
            user_id TEXT PRIMARY KEY,
            channel_id TEXT,
            secret_token TEXT,
            status TEXT NOT NULL DEFAULT 'none',
            mode TEXT NOT NULL DEFAULT 'trial',
            login_method TEXT,
            pairing_code TEXT,
            created_at TEXT,
            updated_at TEXT NOT NULL,
            CHECK (status <> 'connected' OR secret_token IS NOT NULL),
            CHECK (status <> 'none' OR (channel_id IS NULL AND secret_token IS NULL))
        );

        CREATE INDEX IF NOT EXISTS idx_channels_status
            ON channels(status, updated_at);

        CREATE TABLE IF NOT EXISTS channel_groups (
            user_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            participant_count INTEGER NOT NULL DEFAULT 0,
            admin_status TEXT NOT NULL DEFAULT 'unknown',
            last_synced_at TEXT NOT NULL,
            classified_at TEXT,
            PRIMARY KEY (user_id, group_id)
        );

        CREATE INDEX IF NOT EXISTS idx_channel_groups_admin
            ON channel_groups(user_id, admin_status);

        CREATE TABLE IF NOT EXISTS sync_progress (
            user_id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            status TEXT NOT NULL,
            phase TEXT,
            groups_found INTEGER NOT NULL DEFAULT 0,
            admins_found INTEGER NOT NULL DEFAULT 0,
            total_scanned INTEGER NOT NULL DEFAULT 0,
            current_batch INTEGER NOT NULL DEFAULT 0,
            message TEXT NOT NULL DEFAULT '',
            error TEXT,
            started_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_progress_status
            ON sync_progress(status, updated_at);
        ",
    )?;
    Ok(())
}
