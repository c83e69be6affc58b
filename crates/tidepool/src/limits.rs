//! Resource limits for sandbox sessions

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource limits applied to a sandbox session.
///
/// Limits are fixed when the session is created. A later call that supplies
/// different limits for the same key does not change a running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Upper bound for a single exec, and the default when a call omits one
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Container memory limit in bytes (0 leaves the engine default)
    pub max_memory_bytes: u64,
    /// Container CPU quota in units of 1e-9 CPUs (0 leaves the engine default)
    pub nano_cpus: u64,
    /// Largest file that may be written into the sandbox
    pub max_file_bytes: u64,
    /// Maximum number of regular files under the working directory (0 = unlimited)
    pub max_files: u64,
    /// Maximum captured bytes per output stream of one exec
    pub max_output_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_memory_bytes: 512 * 1024 * 1024, // 512 MB
            nano_cpus: 1_000_000_000,            // 1 CPU
            max_file_bytes: 10 * 1024 * 1024,    // 10 MB
            max_files: 10_000,
            max_output_bytes: 1024 * 1024, // 1 MB per stream
        }
    }
}

/// Helper for serializing Duration as whole seconds
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Buffer that keeps at most `limit` bytes of everything written to it.
///
/// Unlike a plain `Vec`, the buffer never grows past the limit; anything
/// beyond it is dropped and remembered only as the `truncated` flag. The kept
/// prefix is byte-exact, nothing is appended to mark the cut.
#[derive(Debug, Clone)]
pub struct LimitedBuffer {
    buffer: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl LimitedBuffer {
    /// Create an empty buffer that keeps at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Append `data`, keeping only what fits. Returns the full input length.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let remaining = self.limit.saturating_sub(self.buffer.len());
        let to_write = data.len().min(remaining);
        self.buffer.extend_from_slice(&data[..to_write]);
        if to_write < data.len() {
            self.truncated = true;
        }
        data.len()
    }

    /// Consume the buffer and return the kept bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Whether any written byte was dropped.
    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    /// The kept bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl std::io::Write for LimitedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(LimitedBuffer::write(self, buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
