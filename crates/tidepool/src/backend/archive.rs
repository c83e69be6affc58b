//! Tar helpers for the container copy-in/copy-out protocol.
//!
//! Container engines move files as tar streams: a write uploads a one-entry
//! archive into the destination directory, and a read downloads an archive
//! rooted at the requested path.

use std::io::Read;

use super::BackendError;

/// Bytes to buffer beyond a read ceiling so that headers preceding the data
/// (including PAX extensions for long names) are still complete.
pub(crate) const HEADER_SLACK: usize = 64 * 1024;

/// Build an archive holding a single regular file called `name`.
pub(crate) fn single_file(
    name: &str,
    content: &[u8],
    mode: u32,
) -> Result<Vec<u8>, BackendError> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header
        .set_path(name)
        .map_err(|e| BackendError::Archive(format!("invalid entry name {name:?}: {e}")))?;
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_size(content.len() as u64);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append(&header, content)
        .map_err(|e| BackendError::Archive(e.to_string()))?;
    builder
        .into_inner()
        .map_err(|e| BackendError::Archive(e.to_string()))
}

/// The first entry of a downloaded archive.
#[derive(Debug)]
pub(crate) struct ExtractedFile {
    pub data: Vec<u8>,
    /// Size recorded in the entry header.
    pub size: u64,
}

/// Extract the first entry of `bytes`, which must be a regular file.
///
/// At most `max_bytes` of content are read. `bytes` may be a prefix of the
/// full archive as long as it covers the header and the bytes kept.
pub(crate) fn first_file(
    bytes: &[u8],
    path: &str,
    max_bytes: Option<u64>,
) -> Result<ExtractedFile, BackendError> {
    let mut archive = tar::Archive::new(bytes);
    let mut entries = archive
        .entries()
        .map_err(|e| BackendError::Archive(e.to_string()))?;
    let mut entry = match entries.next() {
        Some(entry) => entry.map_err(|e| BackendError::Archive(e.to_string()))?,
        None => return Err(BackendError::FileNotFound(path.to_string())),
    };

    match entry.header().entry_type() {
        tar::EntryType::Regular | tar::EntryType::Continuous => {}
        tar::EntryType::Directory => return Err(BackendError::NotAFile(path.to_string())),
        other => {
            return Err(BackendError::NotAFile(format!("{path} ({other:?})")));
        }
    }

    let size = entry.size();
    let keep = max_bytes.map_or(size, |max| size.min(max));
    let mut data = Vec::with_capacity(keep as usize);
    (&mut entry)
        .take(keep)
        .read_to_end(&mut data)
        .map_err(|e| BackendError::Archive(e.to_string()))?;
    Ok(ExtractedFile { data, size })
}
