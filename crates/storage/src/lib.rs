#![forbid(unsafe_code)]
//! Durable ledger shared by the supervisor and worker processes.
//!
//! One SQLite file holds four tables: the append-only event log, the
//! command inbox, the conversation history and the artifact ledger. WAL
//! journaling plus a five second busy timeout absorb cross-process
//! contention; every multi-statement claim runs in one transaction so the
//! status columns stay the only coordination primitive.

mod artifacts;
mod error;
mod events;
mod history;
mod inbox;

use rusqlite::Connection;
use std::path::{Path, PathBuf};

pub use artifacts::{Artifact, ArtifactStatus};
pub use error::StoreError;
pub use events::{EventRow, EventTree};
pub use history::HistoryMessage;
pub use inbox::InboxTask;

pub use events::{
    EVENT_AGENT_COMPLETED, EVENT_AGENT_FAILED, EVENT_AGENT_STARTED, EVENT_CIRCUIT_CLOSED,
    EVENT_CIRCUIT_HALF_OPEN, EVENT_CIRCUIT_OPENED, EVENT_CONTEXT_ASSEMBLED,
    EVENT_CONTROL_LIMIT_REACHED, EVENT_CRASH_LOOP_DETECTED, EVENT_PROCESS_STARTED,
    EVENT_PROGRESS_STALLED, EVENT_REPLY_SENT, EVENT_RETRY_EXHAUSTED, EVENT_RETRY_SCHEDULED,
    EVENT_REVISION_PROMOTED, EVENT_ROLLBACK_ATTEMPTED, EVENT_TOOL_CALL_COMPLETED,
    EVENT_TOOL_CALL_FAILED, EVENT_TOOL_CALL_STARTED, EVENT_TURN_COMPLETED, EVENT_TURN_STARTED,
    EVENT_WORKER_EXITED, EVENT_WORKER_SPAWNED,
};

/// Handle over one SQLite connection. Each process opens its own.
#[derive(Debug)]
pub struct Store {
    db_path: PathBuf,
    conn: Connection,
}

impl Store {
    /// Open (or create) the ledger at `path`, ensuring the parent directory
    /// exists, and initialize the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(dir) = db_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        let store = Self { db_path, conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open the ledger read-only, for diagnostics. No schema writes.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open_with_flags(
            &db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        Ok(Self { db_path, conn })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL DEFAULT (unixepoch()),
                parent_id INTEGER,
                event_type TEXT NOT NULL,
                payload TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_events_parent_id ON events(parent_id);

            CREATE TABLE IF NOT EXISTS inbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                update_id INTEGER NOT NULL UNIQUE,
                chat_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                message_date INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                locked_at INTEGER,
                error TEXT,
                created_at INTEGER NOT NULL DEFAULT (unixepoch()),
                updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            );
            CREATE INDEX IF NOT EXISTS idx_inbox_status_id ON inbox(status, id);

            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (unixepoch())
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tx_id TEXT NOT NULL UNIQUE,
                base_tx_id TEXT,
                bin_path TEXT NOT NULL,
                sha256 TEXT,
                git_revision TEXT,
                build_started_at INTEGER,
                build_finished_at INTEGER,
                test_summary TEXT,
                self_check_summary TEXT,
                approval_chat_id INTEGER,
                approval_message_id INTEGER,
                deploy_started_at INTEGER,
                deploy_finished_at INTEGER,
                status TEXT NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL DEFAULT (unixepoch()),
                updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            );
            CREATE INDEX IF NOT EXISTS idx_artifacts_status_updated_at ON artifacts(status, updated_at);
            CREATE INDEX IF NOT EXISTS idx_artifacts_base_tx_id ON artifacts(base_tx_id);
            "#,
        )?;
        Ok(())
    }
}

/// Truncate error text before it lands in a ledger column.
pub(crate) fn truncate_for_db(s: &str) -> &str {
    const MAX: usize = 2000;
    if s.len() <= MAX {
        return s;
    }
    let mut end = MAX;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
pub(crate) fn test_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let store = Store::open(dir.path().join("test.db")).expect("open store");
    (dir, store)
}
