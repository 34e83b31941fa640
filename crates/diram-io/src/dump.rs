//! JSON snapshot of the error index.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use blake3::Hasher;
use diram_core::clock::unix_millis;
use diram_mem::{ErrorContext, ErrorIndex};
use serde::Serialize;
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Serialize)]
pub struct ErrorDump {
    pub version: &'static str,
    pub pid: u32,
    pub dumped_at_ms: u64,
    pub total_recorded: u64,
    pub total_evicted: u64,
    pub entries: Vec<ErrorContext>,
    /// BLAKE3 over the serialized `entries`, so readers can tell a truncated
    /// or edited dump.
    pub checksum: String,
}

impl ErrorDump {
    pub fn capture(index: &ErrorIndex) -> Result<Self> {
        let entries = index.snapshot();
        let mut h = Hasher::new();
        h.update(&serde_json::to_vec(&entries)?);
        Ok(Self {
            version: diram_core::VERSION,
            pid: std::process::id(),
            dumped_at_ms: unix_millis(),
            total_recorded: index.total_recorded(),
            total_evicted: index.total_evicted(),
            entries,
            checksum: h.finalize().to_hex().to_string(),
        })
    }
}

/// Write the current contents of `index` to `path` as pretty JSON.
pub fn dump_error_index(index: &ErrorIndex, path: impl AsRef<Path>) -> Result<ErrorDump> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let dump = ErrorDump::capture(index)?;
    let mut w = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut w, &dump)?;
    w.flush()?;
    debug!(path = %path.display(), entries = dump.entries.len(), "error index dumped");
    Ok(dump)
}
