#![forbid(unsafe_code)]

use super::ToolError;
use std::path::{Component, Path, PathBuf};

/// Path allowlist plus bash denylist. Roots are absolute, lexically
/// cleaned, symlink-resolved and de-duplicated at construction time.
#[derive(Clone, Debug)]
pub struct ToolPolicy {
    allowed_roots: Vec<PathBuf>,
    bash_denylist: Vec<String>,
}

impl ToolPolicy {
    pub fn new(allowed_roots_csv: &str, bash_denylist_csv: &str) -> Result<Self, ToolError> {
        Ok(Self {
            allowed_roots: parse_allowed_roots(allowed_roots_csv)?,
            bash_denylist: parse_csv(bash_denylist_csv),
        })
    }

    pub fn allowed_roots(&self) -> &[PathBuf] {
        &self.allowed_roots
    }

    /// Validate `path` against the allowlist and return the cleaned
    /// absolute path to hand to the subprocess.
    ///
    /// Relative paths are joined to `base_dir` (default `/workspace`).
    /// The check itself runs on the symlink-resolved form, so a link inside
    /// an allowed root pointing outside is rejected even though its lexical
    /// form looks fine. A missing leaf is resolved through its nearest
    /// existing ancestor so writes to new files still work.
    pub fn resolve_allowed_path(&self, path: &str, base_dir: &str) -> Result<PathBuf, ToolError> {
        if path.trim().is_empty() {
            return Err(ToolError::validation("path is empty"));
        }
        let base = if base_dir.is_empty() { "/workspace" } else { base_dir };
        let mut candidate = PathBuf::from(path);
        if !candidate.is_absolute() {
            candidate = Path::new(base).join(candidate);
        }
        let candidate = clean_path(&candidate);

        let resolved = resolve_for_check(&candidate)?;
        for root in &self.allowed_roots {
            if resolved == *root || resolved.starts_with(root) {
                return Ok(candidate);
            }
        }
        Err(ToolError::Policy(format!("path outside allowlist: {path}")))
    }

    /// Substring match, case-insensitive.
    pub fn is_bash_denied(&self, command: &str) -> bool {
        let lower = command.to_lowercase();
        self.bash_denylist
            .iter()
            .filter(|rule| !rule.is_empty())
            .any(|rule| lower.contains(&rule.to_lowercase()))
    }
}

fn parse_allowed_roots(raw: &str) -> Result<Vec<PathBuf>, ToolError> {
    let items = parse_csv(raw);
    if items.is_empty() {
        return Err(ToolError::validation("AUTONOUS_TOOL_ALLOWED_ROOTS is empty"));
    }
    let mut out: Vec<PathBuf> = Vec::with_capacity(items.len());
    for item in items {
        let path = Path::new(&item);
        if !path.is_absolute() {
            return Err(ToolError::validation(format!(
                "allowlist root must be absolute path: {item}"
            )));
        }
        let mut clean = clean_path(path);
        if let Ok(real) = std::fs::canonicalize(&clean) {
            clean = real;
        }
        if !out.contains(&clean) {
            out.push(clean);
        }
    }
    Ok(out)
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lexical path normalization: drop `.`, fold `..` against the previous
/// component. The filesystem is not consulted.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Symlink-resolve `path` for the allowlist check. When the leaf does not
/// exist, climb to the nearest existing ancestor, resolve that, and
/// re-append the unresolved suffix.
fn resolve_for_check(path: &Path) -> Result<PathBuf, ToolError> {
    match std::fs::canonicalize(path) {
        Ok(real) => return Ok(clean_path(&real)),
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
            return Err(ToolError::Policy(format!(
                "failed to resolve path {}: {err}",
                path.display()
            )));
        }
        Err(_) => {}
    }

    let mut dir = path.parent().map(Path::to_path_buf);
    while let Some(current) = dir {
        match std::fs::canonicalize(&current) {
            Ok(real_dir) => {
                let suffix = path.strip_prefix(&current).unwrap_or(Path::new(""));
                return Ok(clean_path(&real_dir.join(suffix)));
            }
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                return Err(ToolError::Policy(format!(
                    "failed to resolve parent path {}: {err}",
                    current.display()
                )));
            }
            Err(_) => {
                let next = current.parent().map(Path::to_path_buf);
                if next.as_deref() == Some(current.as_path()) {
                    break;
                }
                dir = next;
            }
        }
    }
    Err(ToolError::Policy(format!(
        "no existing parent for path: {}",
        path.display()
    )))
}
