// Groupcast Engine — Store
// Channel, Group and SyncProgress rows in SQLite via rusqlite. The single
// source of truth for lifecycle state; every other component reads and writes
// through here.
//
// Module layout:
//   schema    — idempotent migrations run at open
//   channels  — channel row CRUD, compare-and-swap `transition`, clear/discard
//   groups    — wholesale replace, in-place classification updates
//   progress  — live sync-progress row per user, single-active-run guard
//
// All methods take the connection lock for their whole read-modify-write, so
// each one is atomic with respect to every other store call.

use crate::atoms::error::EngineResult;
use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

mod channels;
mod groups;
mod progress;
mod schema;

pub use progress::ProgressUpdate;

/// Thread-safe database wrapper.
pub struct GroupcastStore {
    /// The SQLite connection, protected by a Mutex.
    /// `pub` for integration tests that need to age rows.
    pub conn: Mutex<Connection>,
}

impl GroupcastStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("[store] Opening store at {:?}", path);
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::from_connection(conn)
    }

    /// Fresh in-memory database with the full schema.
    pub fn open_in_memory() -> EngineResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;").ok();
        schema::run_migrations(&conn)?;
        Ok(GroupcastStore { conn: Mutex::new(conn) })
    }
}

/// Canonical timestamp text. Fixed width with a `Z` suffix, so string order
/// equals time order inside SQL comparisons.
pub fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

/// Parse a stored timestamp; unparseable text reads as the epoch.
pub fn parse_timestamp(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
