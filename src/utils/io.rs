//! File I/O primitives with consistent error handling.

use crate::error::{Error, Result};
use std::fs;
use std::io::Read;
use std::path::Path;

/// Read file contents with standardized error handling.
pub fn read_file(path: &Path, operation: &str) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(operation.to_string())))
}

/// Read all of stdin, refusing to block on an interactive terminal.
pub fn read_stdin(operation: &str) -> Result<String> {
    use std::io::IsTerminal;

    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Err(Error::validation_invalid_argument(
            operation,
            "Cannot read from stdin when stdin is a TTY",
            None,
            None,
        ));
    }

    let mut buf = String::new();
    stdin
        .read_to_string(&mut buf)
        .map_err(|e| Error::internal_io(e.to_string(), Some(operation.to_string())))?;
    Ok(buf)
}

/// Write content to file atomically (write to .tmp, then rename).
///
/// Readers always see either the old content or the new content, never a
/// partial write.
pub fn write_file_atomic(path: &Path, content: &str, operation: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let filename = path.file_name().ok_or_else(|| {
        Error::internal_io(
            format!("Invalid path: {}", path.display()),
            Some(operation.to_string()),
        )
    })?;

    let tmp_path = parent.join(format!("{}.tmp", filename.to_string_lossy()));

    fs::write(&tmp_path, content)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("{} (write temp)", operation))))?;

    fs::rename(&tmp_path, path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("{} (rename)", operation))))?;

    Ok(())
}
