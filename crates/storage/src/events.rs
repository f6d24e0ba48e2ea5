#![forbid(unsafe_code)]

use super::{Store, StoreError};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;

// Infrastructure events.
pub const EVENT_PROCESS_STARTED: &str = "process.started";
pub const EVENT_WORKER_SPAWNED: &str = "worker.spawned";
pub const EVENT_WORKER_EXITED: &str = "worker.exited";
pub const EVENT_REVISION_PROMOTED: &str = "revision.promoted";
pub const EVENT_CRASH_LOOP_DETECTED: &str = "crash_loop.detected";
pub const EVENT_ROLLBACK_ATTEMPTED: &str = "rollback.attempted";

// Agent execution events.
pub const EVENT_AGENT_STARTED: &str = "agent.started";
pub const EVENT_AGENT_COMPLETED: &str = "agent.completed";
pub const EVENT_AGENT_FAILED: &str = "agent.failed";
pub const EVENT_TURN_STARTED: &str = "turn.started";
pub const EVENT_TURN_COMPLETED: &str = "turn.completed";
pub const EVENT_TOOL_CALL_STARTED: &str = "tool_call.started";
pub const EVENT_TOOL_CALL_COMPLETED: &str = "tool_call.completed";
pub const EVENT_TOOL_CALL_FAILED: &str = "tool_call.failed";
pub const EVENT_REPLY_SENT: &str = "reply.sent";
pub const EVENT_CONTEXT_ASSEMBLED: &str = "context.assembled";
pub const EVENT_CONTROL_LIMIT_REACHED: &str = "control.limit_reached";
pub const EVENT_RETRY_SCHEDULED: &str = "retry.scheduled";
pub const EVENT_RETRY_EXHAUSTED: &str = "retry.exhausted";
pub const EVENT_CIRCUIT_OPENED: &str = "circuit.opened";
pub const EVENT_CIRCUIT_HALF_OPEN: &str = "circuit.half_open";
pub const EVENT_CIRCUIT_CLOSED: &str = "circuit.closed";
pub const EVENT_PROGRESS_STALLED: &str = "progress.stalled";

/// One row of the append-only event log.
#[derive(Clone, Debug)]
pub struct EventRow {
    pub id: i64,
    pub timestamp: i64,
    pub parent_id: Option<i64>,
    pub event_type: String,
    pub payload: Option<String>,
}

impl EventRow {
    pub fn payload_value(&self) -> Option<Value> {
        self.payload
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// In-memory tree assembled from a subtree query: events keyed by id plus
/// each node's children sorted by id.
#[derive(Debug)]
pub struct EventTree {
    pub events: HashMap<i64, EventRow>,
    pub children: HashMap<i64, Vec<i64>>,
    pub root_id: i64,
}

impl EventTree {
    pub fn root(&self) -> Option<&EventRow> {
        self.events.get(&self.root_id)
    }

    pub fn children_of(&self, id: i64) -> &[i64] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Store {
    /// Append an event; the store assigns the timestamp. `parent_id` may be
    /// absent for root events. A `None` payload stores NULL.
    pub fn log_event(
        &self,
        parent_id: Option<i64>,
        event_type: &str,
        payload: Option<&Value>,
    ) -> Result<i64, StoreError> {
        let payload_json = match payload {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        self.conn.execute(
            "INSERT INTO events (parent_id, event_type, payload) VALUES (?1, ?2, ?3)",
            params![parent_id, event_type, payload_json],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All events in the subtree rooted at `root_id`, ordered by id.
    pub fn subtree(&self, root_id: i64) -> Result<Vec<EventRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            WITH RECURSIVE subtree(id) AS (
                SELECT id FROM events WHERE id = ?1
                UNION ALL
                SELECT e.id FROM events e JOIN subtree s ON e.parent_id = s.id
            )
            SELECT e.id, e.timestamp, e.parent_id, e.event_type, e.payload
            FROM events e
            WHERE e.id IN (SELECT id FROM subtree)
            ORDER BY e.id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![root_id], |row| {
            Ok(EventRow {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                parent_id: row.get(2)?,
                event_type: row.get(3)?,
                payload: row.get(4)?,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Group a flat subtree into an id-keyed tree. Self-parenting rows are
    /// skipped; children end up sorted by id because the input already is.
    pub fn build_tree(events: Vec<EventRow>, root_id: i64) -> Option<EventTree> {
        let mut by_id = HashMap::with_capacity(events.len());
        let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
        for event in &events {
            if let Some(parent) = event.parent_id {
                if parent != event.id {
                    children.entry(parent).or_default().push(event.id);
                }
            }
        }
        for event in events {
            by_id.insert(event.id, event);
        }
        for ids in children.values_mut() {
            ids.sort_unstable();
        }
        if !by_id.contains_key(&root_id) {
            return None;
        }
        Some(EventTree {
            events: by_id,
            children,
            root_id,
        })
    }

    /// The most recent supervisor `process.started` event, used as the
    /// default root for diagnostics.
    pub fn latest_supervisor_root(&self) -> Result<Option<i64>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM events WHERE event_type = ?1
                 AND json_extract(payload, '$.role') = 'supervisor'
                 ORDER BY id DESC LIMIT 1",
                params![EVENT_PROCESS_STARTED],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// The revision from the newest `revision.promoted` event.
    pub fn current_good_rev(&self) -> Result<Option<String>, StoreError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM events WHERE event_type = ?1 ORDER BY id DESC LIMIT 1",
                params![EVENT_REVISION_PROMOTED],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = payload else {
            return Ok(None);
        };
        let value: Value = serde_json::from_str(&raw)?;
        Ok(value
            .get("revision")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }

    /// Next worker instance sequence: `worker.spawned` children of the
    /// supervisor event, plus one.
    pub fn next_worker_seq(&self, supervisor_event_id: i64) -> Result<i64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE parent_id = ?1 AND event_type = ?2",
            params![supervisor_event_id, EVENT_WORKER_SPAWNED],
            |row| row.get(0),
        )?;
        Ok(count + 1)
    }

    /// Recent `retry.scheduled` fingerprints for one task, oldest first,
    /// scanning at most the last 200 such events.
    pub fn recent_fingerprints(&self, task_id: i64, limit: usize) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT payload FROM events WHERE event_type = ?1 ORDER BY id DESC LIMIT 200",
        )?;
        let rows = stmt.query_map(params![EVENT_RETRY_SCHEDULED], |row| {
            row.get::<_, Option<String>>(0)
        })?;
        let mut newest_first = Vec::with_capacity(limit);
        for row in rows {
            if newest_first.len() >= limit {
                break;
            }
            let Some(raw) = row? else { continue };
            let Ok(payload) = serde_json::from_str::<Value>(&raw) else {
                continue;
            };
            if payload.get("task_id").and_then(Value::as_i64) != Some(task_id) {
                continue;
            }
            let Some(fp) = payload
                .get("state_fingerprint")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
            else {
                continue;
            };
            newest_first.push(fp.to_string());
        }
        newest_first.reverse();
        Ok(newest_first)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::*;
    use serde_json::json;

    /// Seed the canonical unified tree:
    ///
    /// ```text
    /// process.started (supervisor)       id=1
    /// ├── revision.promoted              id=2
    /// ├── worker.spawned                 id=3
    /// ├── process.started (worker)       id=4
    /// │   ├── agent.started              id=5
    /// │   │   ├── turn.started           id=6
    /// │   │   ├── turn.completed         id=7
    /// │   │   └── reply.sent             id=8
    /// │   └── agent.completed            id=9
    /// └── worker.exited                  id=10
    /// ```
    pub(crate) fn seed_unified_tree(store: &Store) -> i64 {
        let sup = store
            .log_event(
                None,
                EVENT_PROCESS_STARTED,
                Some(&json!({"role": "supervisor", "pid": 100})),
            )
            .unwrap();
        store
            .log_event(Some(sup), EVENT_REVISION_PROMOTED, Some(&json!({"revision": "abc123"})))
            .unwrap();
        store
            .log_event(Some(sup), EVENT_WORKER_SPAWNED, Some(&json!({"pid": 101})))
            .unwrap();
        let worker = store
            .log_event(
                Some(sup),
                EVENT_PROCESS_STARTED,
                Some(&json!({"role": "worker", "pid": 101})),
            )
            .unwrap();
        let agent = store
            .log_event(
                Some(worker),
                EVENT_AGENT_STARTED,
                Some(&json!({"chat_id": 123, "task_id": 5})),
            )
            .unwrap();
        store
            .log_event(Some(agent), EVENT_TURN_STARTED, Some(&json!({"model_name": "gpt-4o"})))
            .unwrap();
        store
            .log_event(
                Some(agent),
                EVENT_TURN_COMPLETED,
                Some(&json!({"latency_ms": 1820, "input_tokens": 42, "output_tokens": 7})),
            )
            .unwrap();
        store
            .log_event(Some(agent), EVENT_REPLY_SENT, Some(&json!({"chat_id": 123})))
            .unwrap();
        store
            .log_event(Some(worker), EVENT_AGENT_COMPLETED, Some(&json!({"task_id": 5})))
            .unwrap();
        store
            .log_event(Some(sup), EVENT_WORKER_EXITED, Some(&json!({"exit_code": 0})))
            .unwrap();
        sup
    }

    #[test]
    fn log_event_assigns_monotone_ids_and_timestamps() {
        let (_dir, store) = test_store();
        let id1 = store
            .log_event(None, EVENT_PROCESS_STARTED, Some(&json!({"role": "supervisor"})))
            .unwrap();
        let id2 = store.log_event(None, EVENT_AGENT_STARTED, Some(&json!({"chat_id": 1}))).unwrap();
        assert!(id1 > 0);
        assert!(id2 > id1);

        let rows = store.subtree(id1).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].timestamp > 0);
        let payload = rows[0].payload_value().unwrap();
        assert_eq!(payload["role"], "supervisor");
    }

    #[test]
    fn log_event_with_parent_links_rows() {
        let (_dir, store) = test_store();
        let parent = store.log_event(None, EVENT_AGENT_STARTED, None).unwrap();
        let child = store
            .log_event(Some(parent), EVENT_TURN_STARTED, Some(&json!({"model_name": "m"})))
            .unwrap();
        let rows = store.subtree(parent).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].parent_id, None);
        assert_eq!(rows[1].id, child);
        assert_eq!(rows[1].parent_id, Some(parent));
    }

    #[test]
    fn nil_payload_stores_null() {
        let (_dir, store) = test_store();
        let id = store.log_event(None, EVENT_AGENT_COMPLETED, None).unwrap();
        let rows = store.subtree(id).unwrap();
        assert_eq!(rows[0].payload, None);
        assert!(rows[0].payload_value().is_none());
    }

    #[test]
    fn subtree_returns_full_unified_tree() {
        let (_dir, store) = test_store();
        let sup = seed_unified_tree(&store);
        let rows = store.subtree(sup).unwrap();
        assert_eq!(rows.len(), 10);
        // Worker subtree: process.started + agent.started + 3 turns + agent.completed.
        let worker_rows = store.subtree(4).unwrap();
        assert_eq!(worker_rows.len(), 6);
    }

    #[test]
    fn build_tree_groups_children_by_parent() {
        let (_dir, store) = test_store();
        let sup = seed_unified_tree(&store);
        let rows = store.subtree(sup).unwrap();
        let tree = Store::build_tree(rows, sup).unwrap();
        assert_eq!(tree.children_of(sup).len(), 4);
        assert_eq!(tree.children_of(5).len(), 3);
        assert_eq!(tree.root().unwrap().event_type, EVENT_PROCESS_STARTED);
    }

    #[test]
    fn latest_supervisor_root_picks_highest_id() {
        let (_dir, store) = test_store();
        assert_eq!(store.latest_supervisor_root().unwrap(), None);
        let first = store
            .log_event(None, EVENT_PROCESS_STARTED, Some(&json!({"role": "supervisor"})))
            .unwrap();
        let second = store
            .log_event(None, EVENT_PROCESS_STARTED, Some(&json!({"role": "supervisor"})))
            .unwrap();
        assert!(second > first);
        assert_eq!(store.latest_supervisor_root().unwrap(), Some(second));
    }

    #[test]
    fn latest_supervisor_root_ignores_worker_roots() {
        let (_dir, store) = test_store();
        store
            .log_event(None, EVENT_PROCESS_STARTED, Some(&json!({"role": "worker"})))
            .unwrap();
        assert_eq!(store.latest_supervisor_root().unwrap(), None);
    }

    #[test]
    fn current_good_rev_returns_latest() {
        let (_dir, store) = test_store();
        assert_eq!(store.current_good_rev().unwrap(), None);
        store
            .log_event(None, EVENT_REVISION_PROMOTED, Some(&json!({"revision": "abc123"})))
            .unwrap();
        store
            .log_event(None, EVENT_REVISION_PROMOTED, Some(&json!({"revision": "def456"})))
            .unwrap();
        assert_eq!(store.current_good_rev().unwrap().as_deref(), Some("def456"));
    }

    #[test]
    fn next_worker_seq_counts_spawned_children() {
        let (_dir, store) = test_store();
        let sup = store
            .log_event(None, EVENT_PROCESS_STARTED, Some(&json!({"role": "supervisor"})))
            .unwrap();
        assert_eq!(store.next_worker_seq(sup).unwrap(), 1);
        store
            .log_event(Some(sup), EVENT_WORKER_SPAWNED, Some(&json!({"pid": 100})))
            .unwrap();
        assert_eq!(store.next_worker_seq(sup).unwrap(), 2);
    }

    #[test]
    fn recent_fingerprints_filters_by_task_and_orders_oldest_first() {
        let (_dir, store) = test_store();
        for (task, fp) in [(1, "fp-a"), (2, "other"), (1, "fp-b")] {
            store
                .log_event(
                    None,
                    EVENT_RETRY_SCHEDULED,
                    Some(&json!({"task_id": task, "state_fingerprint": fp})),
                )
                .unwrap();
        }
        let fps = store.recent_fingerprints(1, 5).unwrap();
        assert_eq!(fps, vec!["fp-a".to_string(), "fp-b".to_string()]);
        assert!(store.recent_fingerprints(1, 0).unwrap().is_empty());
    }
}
