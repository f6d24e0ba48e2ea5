#![forbid(unsafe_code)]

use regex::Regex;
use std::sync::OnceLock;

fn secret_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?i)\bBearer\s+[A-Za-z0-9._\-=/+]+").unwrap(),
            Regex::new(r"(?i)\b(sk-[A-Za-z0-9\-_]{8,})\b").unwrap(),
            Regex::new(r#"(?i)\b([A-Za-z0-9_]*(TOKEN|SECRET|PASSWORD|API_KEY))\b\s*[:=]\s*["']?([^\s"']+)"#)
                .unwrap(),
        ]
    })
}

/// Scrub credentials from any text that crosses into the event log or back
/// into the model's context. Returns the scrubbed text and whether anything
/// was replaced, so the redaction flag can be recorded alongside.
///
/// The key portion of `KEY=value` / `KEY: value` matches is preserved.
pub fn redact_secrets(text: &str) -> (String, bool) {
    let mut out = text.to_string();
    let mut redacted = false;
    for pattern in secret_patterns() {
        let next = pattern.replace_all(&out, |caps: &regex::Captures<'_>| {
            redacted = true;
            let matched = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            if let Some(eq) = matched.find('=') {
                return format!("{}=***REDACTED***", &matched[..eq]);
            }
            if let Some(colon) = matched.find(':') {
                return format!("{}: ***REDACTED***", &matched[..colon]);
            }
            "***REDACTED***".to_string()
        });
        out = next.into_owned();
    }
    (out, redacted)
}
