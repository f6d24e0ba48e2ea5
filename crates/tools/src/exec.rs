#![forbid(unsafe_code)]

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

/// Upper bound on bytes drained per stream before the per-tool limits are
/// applied; keeps a chatty subprocess from ballooning memory.
const DRAIN_LIMIT_BYTES: usize = 4 * 1024 * 1024;

/// Raw subprocess outcome before truncation and envelope assembly.
#[derive(Debug)]
pub(crate) struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Run one command under a deadline, draining stdout/stderr concurrently so
/// a full pipe can never deadlock the child. Deadline expiry kills the
/// child; the output gathered so far is still returned.
pub(crate) fn run_with_deadline(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> std::io::Result<ExecOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    if let Some(input) = stdin {
        if let Some(mut child_stdin) = child.stdin.take() {
            // A child that exits without reading produces a broken pipe;
            // its exit status is the interesting part then.
            let _ = child_stdin.write_all(input);
        }
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_handle = thread::spawn(move || drain_limited(stdout));
    let stderr_handle = thread::spawn(move || drain_limited(stderr));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            timed_out = true;
            child.kill()?;
            child.wait()?
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    Ok(ExecOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
        timed_out,
    })
}

fn drain_limited<R: Read>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let remaining = DRAIN_LIMIT_BYTES.saturating_sub(buf.len());
                if remaining > 0 {
                    buf.extend_from_slice(&chunk[..n.min(remaining)]);
                }
                // Keep draining past the cap so the child never blocks.
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Assemble the uniform result envelope from a raw subprocess outcome.
/// Deadline expiry and non-zero exits become `ToolError::Exec` carrying the
/// truncated envelope, so callers still see stderr.
pub(crate) fn finish_result(
    tool_name: &str,
    out: ExecOutput,
    limits: crate::Limits,
    timeout: Duration,
) -> Result<crate::ToolResult, crate::ToolError> {
    let (stdout, lines_out, bytes_out) = crate::apply_output_limits(&out.stdout, limits);
    let (stderr, lines_err, bytes_err) = crate::apply_output_limits(&out.stderr, limits);
    let result = crate::ToolResult {
        ok: out.success(),
        exit_code: out.exit_code,
        stdout,
        stderr,
        truncated_lines: lines_out || lines_err,
        truncated_bytes: bytes_out || bytes_err,
        next_page_cursor: None,
        meta: None,
    };
    if out.timed_out {
        return Err(crate::ToolError::Exec {
            message: format!(
                "{tool_name} execution failed: timeout after {}s",
                timeout.as_secs()
            ),
            result: Box::new(result),
        });
    }
    if out.exit_code != 0 {
        return Err(crate::ToolError::Exec {
            message: format!("{tool_name} execution failed: exit status {}", out.exit_code),
            result: Box::new(result),
        });
    }
    Ok(result)
}

/// Whether `name` resolves to an executable on PATH.
pub(crate) fn look_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(name);
        candidate.is_file()
    })
}
