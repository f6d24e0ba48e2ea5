#![forbid(unsafe_code)]
//! Domain logic shared by the supervisor and worker processes.
//!
//! Everything here is pure: no store handles, no subprocesses, no clocks
//! beyond the instants callers pass in. The binaries wire these pieces to
//! the ledger and the capability seams.

mod circuit;
mod classify;
mod control;
mod fingerprint;
mod protocol;
mod redact;

pub use circuit::{CircuitBreaker, CircuitState};
pub use classify::{classify_error, classify_tool_error};
pub use control::{
    no_progress, retry_backoff_seconds, should_retry, LimitError, LimitType, Policy,
};
pub use fingerprint::build_state_fingerprint;
pub use protocol::{parse_tool_protocol, ToolCallRequest, ToolProtocol};
pub use redact::redact_secrets;

/// Rough token estimate used for context events: one token per four
/// characters, rounded up. Good enough for budget accounting; never used
/// for billing.
pub fn estimate_tokens(text: &str) -> i64 {
    let chars = text.chars().count() as i64;
    if chars <= 0 {
        return 0;
    }
    (chars + 3) / 4
}

/// Truncate to at most `max_chars` characters (not bytes), preserving
/// UTF-8 boundaries.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}
