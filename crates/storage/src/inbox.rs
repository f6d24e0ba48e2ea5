#![forbid(unsafe_code)]

use super::{truncate_for_db, Store, StoreError};
use autonous_core::{retry_backoff_seconds, should_retry, Policy};
use rusqlite::{params, OptionalExtension};

/// A claimed inbox row. The claimer owns it until it marks the row done or
/// failed; `attempts` already reflects the claim.
#[derive(Clone, Debug)]
pub struct InboxTask {
    pub id: i64,
    pub chat_id: i64,
    pub update_id: i64,
    pub text: String,
    pub attempts: i64,
    pub updated_at: i64,
}

/// Whether a failed row may be re-claimed now: within the retry budget and
/// past its exponential backoff.
pub(crate) fn retry_ready(attempts: i64, updated_at: i64, now_unix: i64, policy: &Policy) -> bool {
    if attempts <= 0 {
        return true;
    }
    if !should_retry(policy, attempts) {
        return false;
    }
    now_unix - updated_at >= retry_backoff_seconds(attempts)
}

impl Store {
    /// Insert an incoming update; `update_id` uniqueness makes this the
    /// dedup point. Returns whether a new row was created.
    pub fn enqueue_message(
        &self,
        update_id: i64,
        chat_id: i64,
        text: &str,
        message_date: i64,
    ) -> Result<bool, StoreError> {
        let affected = self.conn.execute(
            "INSERT OR IGNORE INTO inbox (update_id, chat_id, text, message_date, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'queued', unixepoch())",
            params![update_id, chat_id, text, message_date],
        )?;
        Ok(affected > 0)
    }

    /// Next long-poll offset: `MAX(update_id)+1`, or 0 when the inbox is
    /// empty.
    pub fn derive_offset(&self) -> Result<i64, StoreError> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(MAX(update_id) + 1, 0) FROM inbox",
            [],
            |row| row.get(0),
        )?)
    }

    /// Cheap check used to decide between a zero and a long poll timeout.
    pub fn has_runnable_tasks(&self, policy: &Policy, now_unix: i64) -> Result<bool, StoreError> {
        let queued: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM inbox WHERE status = 'queued' ORDER BY id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if queued.is_some() {
            return Ok(true);
        }
        let mut stmt = self.conn.prepare(
            "SELECT attempts, updated_at FROM inbox WHERE status = 'failed' ORDER BY id LIMIT 100",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (attempts, updated_at) = row?;
            if retry_ready(attempts, updated_at, now_unix, policy) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Claim the oldest runnable task: the head of the queue, else the first
    /// failed row whose backoff has elapsed. One short transaction; the
    /// claim increments `attempts`, clears `error` and stamps `locked_at`.
    pub fn claim_next_task(
        &mut self,
        policy: &Policy,
        now_unix: i64,
    ) -> Result<Option<InboxTask>, StoreError> {
        let tx = self.conn.transaction()?;

        let mut task: Option<InboxTask> = tx
            .query_row(
                "SELECT id, chat_id, update_id, text, attempts, updated_at FROM inbox
                 WHERE status = 'queued' ORDER BY id LIMIT 1",
                [],
                |row| {
                    Ok(InboxTask {
                        id: row.get(0)?,
                        chat_id: row.get(1)?,
                        update_id: row.get(2)?,
                        text: row.get(3)?,
                        attempts: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;

        if task.is_none() {
            let mut stmt = tx.prepare(
                "SELECT id, chat_id, update_id, text, attempts, updated_at FROM inbox
                 WHERE status = 'failed' ORDER BY id LIMIT 200",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(InboxTask {
                    id: row.get(0)?,
                    chat_id: row.get(1)?,
                    update_id: row.get(2)?,
                    text: row.get(3)?,
                    attempts: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })?;
            for row in rows {
                let candidate = row?;
                if retry_ready(candidate.attempts, candidate.updated_at, now_unix, policy) {
                    task = Some(candidate);
                    break;
                }
            }
        }

        let Some(mut task) = task else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE inbox SET status = 'in_progress', attempts = attempts + 1,
             locked_at = unixepoch(), error = NULL, updated_at = unixepoch()
             WHERE id = ?1",
            params![task.id],
        )?;
        tx.commit()?;
        task.attempts += 1;
        Ok(Some(task))
    }

    pub fn mark_task_done(&self, task_id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE inbox SET status = 'done', updated_at = unixepoch(), error = NULL WHERE id = ?1",
            params![task_id],
        )?;
        Ok(())
    }

    pub fn mark_task_failed(&self, task_id: i64, error: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE inbox SET status = 'failed', updated_at = unixepoch(), error = ?1 WHERE id = ?2",
            params![truncate_for_db(error), task_id],
        )?;
        Ok(())
    }

    /// Terminate retries for a stalled task by pushing `attempts` past the
    /// retry budget.
    pub fn mark_task_exhausted(
        &self,
        task_id: i64,
        error: &str,
        max_retries: i64,
    ) -> Result<(), StoreError> {
        let exhausted_attempts = (max_retries + 1).max(1);
        self.conn.execute(
            "UPDATE inbox SET status = 'failed', attempts = ?1, updated_at = unixepoch(), error = ?2
             WHERE id = ?3",
            params![exhausted_attempts, truncate_for_db(error), task_id],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inbox_row_status(&self, update_id: i64) -> (String, i64) {
        self.conn
            .query_row(
                "SELECT status, attempts FROM inbox WHERE update_id = ?1",
                params![update_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("inbox row")
    }
}
