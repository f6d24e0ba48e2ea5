#![forbid(unsafe_code)]
//! Context pipeline: history load, window compression, message assembly.

use crate::provider::Message;
use autonous_storage::{Store, StoreError};

/// Most recent `limit` turns for the chat, oldest first.
pub fn get_history(store: &Store, chat_id: i64, limit: i64) -> Result<Vec<Message>, StoreError> {
    let rows = store.get_history(chat_id, limit)?;
    Ok(rows
        .into_iter()
        .map(|row| Message {
            role: row.role,
            content: row.text,
        })
        .collect())
}

/// Keep only the tail of `max_messages` entries; zero disables.
pub fn compress(messages: Vec<Message>, max_messages: usize) -> Vec<Message> {
    if max_messages == 0 || messages.len() <= max_messages {
        return messages;
    }
    let skip = messages.len() - max_messages;
    messages.into_iter().skip(skip).collect()
}

/// Final provider order: system, history, user.
pub fn assemble(system: &str, history: Vec<Message>, user_text: &str) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message::new("system", system));
    messages.extend(history);
    messages.push(Message::new("user", user_text));
    messages
}

/// Slot the tool-protocol instruction directly after the primary system
/// message (or first, when there is none).
pub fn inject_tool_instruction(messages: Vec<Message>, instruction: &str) -> Vec<Message> {
    if instruction.trim().is_empty() {
        return messages;
    }
    let inst = Message::new("system", instruction);
    if messages.is_empty() {
        return vec![inst];
    }
    let mut out = Vec::with_capacity(messages.len() + 1);
    let mut iter = messages.into_iter();
    let first = iter.next().expect("non-empty");
    if first.role == "system" {
        out.push(first);
        out.push(inst);
    } else {
        out.push(inst);
        out.push(first);
    }
    out.extend(iter);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> Message {
        Message::new(role, content)
    }

    #[test]
    fn compress_keeps_tail() {
        let messages = vec![msg("user", "a"), msg("assistant", "b"), msg("user", "c")];
        let out = compress(messages.clone(), 2);
        assert_eq!(out, vec![msg("assistant", "b"), msg("user", "c")]);
        assert_eq!(compress(messages.clone(), 0), messages);
        assert_eq!(compress(messages.clone(), 10), messages);
    }

    #[test]
    fn assemble_orders_system_history_user() {
        let out = assemble("sys", vec![msg("user", "before")], "now");
        assert_eq!(
            out,
            vec![msg("system", "sys"), msg("user", "before"), msg("user", "now")]
        );
    }

    #[test]
    fn instruction_lands_after_primary_system() {
        let out = inject_tool_instruction(
            vec![msg("system", "sys"), msg("user", "u")],
            "tools available",
        );
        assert_eq!(out[0], msg("system", "sys"));
        assert_eq!(out[1], msg("system", "tools available"));
        assert_eq!(out[2], msg("user", "u"));
    }

    #[test]
    fn instruction_leads_when_no_system_message() {
        let out = inject_tool_instruction(vec![msg("user", "u")], "inst");
        assert_eq!(out[0], msg("system", "inst"));
        assert_eq!(out[1], msg("user", "u"));
    }

    #[test]
    fn empty_instruction_is_a_noop() {
        let messages = vec![msg("user", "u")];
        assert_eq!(inject_tool_instruction(messages.clone(), "  "), messages);
    }

    #[test]
    fn history_round_trips_through_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(dir.path().join("ctx.db")).unwrap();
        store.append_history(9, "user", "question").unwrap();
        store.append_history(9, "assistant", "answer").unwrap();
        let history = get_history(&store, 9, 10).unwrap();
        assert_eq!(
            history,
            vec![msg("user", "question"), msg("assistant", "answer")]
        );
    }
}
