pub mod setting;

use std::path::PathBuf;
use which::which;

use crate::errors::BackupError;

/// Finds a client tool in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf, BackupError> {
    which(name).map_err(|e| {
        BackupError::EngineInvocation(format!(
            "{} executable not found in PATH ({}). Please ensure the database client tools are installed and in your PATH.",
            name, e
        ))
    })
}

/// Keeps the last `limit` bytes of a process's stderr for error reports.
///
/// A cut that lands mid-line moves forward to the next full line, unless
/// that would leave nothing.
pub fn stderr_tail(raw: &[u8], limit: usize) -> String {
    let start = raw.len().saturating_sub(limit);
    let mut tail = &raw[start..];
    if start > 0 && raw[start - 1] != b'\n' {
        if let Some(pos) = tail.iter().position(|b| *b == b'\n') {
            let rest = &tail[pos + 1..];
            if rest.iter().any(|b| !b.is_ascii_whitespace()) {
                tail = rest;
            }
        }
    }
    String::from_utf8_lossy(tail).trim().to_string()
}
