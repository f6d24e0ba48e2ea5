#![forbid(unsafe_code)]

use super::{Store, StoreError};
use rusqlite::params;

/// One conversation turn kept for context reassembly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryMessage {
    pub role: String,
    pub text: String,
}

impl Store {
    pub fn append_history(&self, chat_id: i64, role: &str, text: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO history (chat_id, role, text) VALUES (?1, ?2, ?3)",
            params![chat_id, role, text],
        )?;
        Ok(())
    }

    /// Most recent `limit` messages for a chat, returned in chronological
    /// order. Any role other than `assistant` is mapped to `user`.
    pub fn get_history(&self, chat_id: i64, limit: i64) -> Result<Vec<HistoryMessage>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT role, text FROM history WHERE chat_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![chat_id, limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut messages = Vec::new();
        for row in rows {
            let (role, text) = row?;
            let mapped = if role == "assistant" { "assistant" } else { "user" };
            messages.push(HistoryMessage {
                role: mapped.to_string(),
                text,
            });
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn history_count(&self, chat_id: i64) -> Result<i64, StoreError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM history WHERE chat_id = ?1",
            params![chat_id],
            |row| row.get(0),
        )?)
    }
}
