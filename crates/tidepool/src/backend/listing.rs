//! Filesystem primitives run inside a sandbox, and parsers for their output.
//!
//! Listing and stat both go through `find -printf` with a fixed,
//! NUL-terminated record format, so file names containing spaces, tabs or
//! newlines parse the same as any other.

use chrono::{DateTime, Utc};

use super::BackendError;
use crate::paths;
use crate::session::{FileEntry, FileType};

/// `-printf` format: type, size, mtime, path. `find` expands the escapes.
const RECORD_FORMAT: &str = "%y\\t%s\\t%T@\\t%p\\0";

/// Depth limit for recursive listings.
pub(crate) const RECURSIVE_MAX_DEPTH: u32 = 10;

/// Argv listing the entries below `path`.
pub(crate) fn list_argv(path: &str, recursive: bool) -> Vec<String> {
    let max_depth = if recursive { RECURSIVE_MAX_DEPTH } else { 1 };
    vec![
        "find".to_string(),
        path.to_string(),
        "-mindepth".to_string(),
        "1".to_string(),
        "-maxdepth".to_string(),
        max_depth.to_string(),
        "-printf".to_string(),
        RECORD_FORMAT.to_string(),
    ]
}

/// Argv describing `path` itself without following a final symlink.
pub(crate) fn stat_argv(path: &str) -> Vec<String> {
    vec![
        "find".to_string(),
        path.to_string(),
        "-maxdepth".to_string(),
        "0".to_string(),
        "-printf".to_string(),
        RECORD_FORMAT.to_string(),
    ]
}

/// Argv creating a directory and its parents.
pub(crate) fn mkdir_argv(path: &str) -> Vec<String> {
    vec!["mkdir".to_string(), "-p".to_string(), "--".to_string(), path.to_string()]
}

/// Argv removing a path.
pub(crate) fn remove_argv(path: &str, recursive: bool) -> Vec<String> {
    let flag = if recursive { "-rf" } else { "-f" };
    vec!["rm".to_string(), flag.to_string(), "--".to_string(), path.to_string()]
}

/// Whether a primitive's stderr reports a missing path.
pub(crate) fn reports_missing(stderr: &[u8]) -> bool {
    String::from_utf8_lossy(stderr).contains("No such file or directory")
}

/// Parse NUL-terminated `find` records.
pub(crate) fn parse_records(output: &[u8]) -> Result<Vec<FileEntry>, BackendError> {
    let mut entries = Vec::new();
    for record in output.split(|b| *b == 0) {
        if record.is_empty() {
            continue;
        }
        entries.push(parse_record(record)?);
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn parse_record(record: &[u8]) -> Result<FileEntry, BackendError> {
    let text = String::from_utf8_lossy(record);
    let mut fields = text.splitn(4, '\t');
    let (Some(kind), Some(size), Some(mtime), Some(path)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(BackendError::Archive(format!(
            "malformed listing record: {text:?}"
        )));
    };

    let file_type = match kind {
        "d" => FileType::Directory,
        "l" => FileType::Symlink,
        _ => FileType::File,
    };
    let size_bytes = size
        .parse::<u64>()
        .map_err(|e| BackendError::Archive(format!("bad size {size:?}: {e}")))?;
    let path = paths::normalize(path);

    Ok(FileEntry {
        name: paths::file_name(&path).to_string(),
        path,
        file_type,
        size_bytes,
        modified_at: parse_mtime(mtime),
    })
}

/// Parse `%T@` output such as `1700000000.1234567890`.
fn parse_mtime(raw: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = raw.split_once('.').unwrap_or((raw, ""));
    let secs = secs.parse::<i64>().ok()?;
    let digits: String = frac.chars().take(9).collect();
    let nanos = if digits.is_empty() {
        0
    } else {
        let scale = 10u32.pow(9 - digits.len() as u32);
        digits.parse::<u32>().ok()? * scale
    };
    DateTime::from_timestamp(secs, nanos)
}
