//! Shared utility functions for the Crucible crate.

use anyhow::{Context, Result};
use std::path::Path;

/// Write content to a file atomically via temp file + rename.
///
/// The temp file is created in the target's directory so the rename never
/// crosses a filesystem boundary.
pub fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    std::fs::write(&tmp_path, content)
        .with_context(|| format!("Failed to write temp file {}", tmp_path.display()))?;

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e).with_context(|| format!("Failed to rename into {}", path.display()));
    }

    Ok(())
}

/// Serialize a value as pretty JSON and write it atomically.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    atomic_write(path, &content)
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    extract_delimited(text, '{', '}')
}

/// Extract a JSON array from text that may contain other content.
pub fn extract_json_array(text: &str) -> Option<String> {
    extract_delimited(text, '[', ']')
}

fn extract_delimited(text: &str, open: char, close: char) -> Option<String> {
    let start = text.find(open)?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                end = start + i + 1;
                break;
            }
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}
