#![forbid(unsafe_code)]

use sha1::{Digest, Sha1};

/// Build the state fingerprint recorded with each `retry.scheduled` event.
///
/// Format: `task=<id>|hist=<n>|comp=<n>|err=<class>|reply=<sha1[:8]>`.
/// Two retries with the same fingerprint mean the run saw the identical
/// world and failed the identical way; `no_progress` turns a run of those
/// into a stall verdict.
pub fn build_state_fingerprint(
    task_id: i64,
    history_count: i64,
    history_window: i64,
    error_class: &str,
    reply: &str,
) -> String {
    let compressed_count = if history_window > 0 && history_count > history_window {
        history_window
    } else {
        history_count
    };
    let reply_hash = if reply.is_empty() {
        String::new()
    } else {
        let digest = Sha1::digest(reply.as_bytes());
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    };
    format!(
        "task={task_id}|hist={history_count}|comp={compressed_count}|err={error_class}|reply={reply_hash}"
    )
}
