#![forbid(unsafe_code)]

/// Classify a task-level processing error by message content. The classes
/// feed the circuit breaker and the retry events, so they must stay stable.
pub fn classify_error(message: &str) -> &'static str {
    if contains_any(message, &["telegram ", "commander"]) {
        return "command_source_api";
    }
    if contains_any(message, &["openai ", "provider", "model"]) {
        return "provider_api";
    }
    if contains_any(message, &["sqlite", "db", "database"]) {
        return "db";
    }
    "unknown"
}

/// Classify a tool-level error. Timeouts and policy denials are recognized
/// before the generic validation bucket; everything else is an execution
/// failure.
pub fn classify_tool_error(message: &str) -> &'static str {
    if contains_any(message, &["deadline exceeded", "timeout"]) {
        return "timeout";
    }
    if contains_any(message, &["outside allowlist", "denied by policy"]) {
        return "policy";
    }
    if contains_any(
        message,
        &["validation", "required", "invalid", "unknown tool", "must be"],
    ) {
        return "validation";
    }
    "tool_exec"
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let lower = haystack.to_lowercase();
    needles
        .iter()
        .any(|n| !n.is_empty() && lower.contains(&n.to_lowercase()))
}
