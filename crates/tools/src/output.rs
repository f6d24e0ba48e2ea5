#![forbid(unsafe_code)]

use sha1::{Digest, Sha1};

/// Output truncation boundaries. Zero disables the corresponding limit.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_lines: usize,
    pub max_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_lines: 2000,
            max_bytes: 51200,
        }
    }
}

impl Limits {
    /// Replace disabled fields with the defaults.
    pub fn or_defaults(self) -> Self {
        let defaults = Self::default();
        Self {
            max_lines: if self.max_lines == 0 {
                defaults.max_lines
            } else {
                self.max_lines
            },
            max_bytes: if self.max_bytes == 0 {
                defaults.max_bytes
            } else {
                self.max_bytes
            },
        }
    }
}

/// Truncate text first by line count, then by byte length. The flags are
/// reported independently so callers can tell which boundary was hit.
pub fn apply_output_limits(text: &str, limits: Limits) -> (String, bool, bool) {
    let mut out = text.to_string();
    let mut truncated_lines = false;
    let mut truncated_bytes = false;

    if limits.max_lines > 0 {
        let lines: Vec<&str> = out.split('\n').collect();
        if lines.len() > limits.max_lines {
            out = lines[..limits.max_lines].join("\n");
            truncated_lines = true;
        }
    }

    if limits.max_bytes > 0 && out.len() > limits.max_bytes {
        let mut end = limits.max_bytes;
        while end > 0 && !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
        truncated_bytes = true;
    }

    (out, truncated_lines, truncated_bytes)
}

/// Stable cursor hint for paginated follow-up reads.
pub fn build_cursor(key: &str, offset: i64) -> String {
    let digest = Sha1::digest(key.as_bytes());
    let prefix: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}:{offset}")
}

/// Keep at most `max` non-empty lines; used by tools whose `limit` argument
/// bounds result rows rather than raw output.
pub fn limit_lines(text: &str, max: usize) -> String {
    if max == 0 || text.trim().is_empty() {
        return text.to_string();
    }
    let kept: Vec<&str> = text
        .split('\n')
        .filter(|line| !line.is_empty())
        .take(max)
        .collect();
    if kept.is_empty() {
        return String::new();
    }
    format!("{}\n", kept.join("\n"))
}
