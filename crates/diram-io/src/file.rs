//! Append-only line files for the trace log and the error log.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use diram_core::clock::unix_millis;
use diram_core::config::DiramConfig;
use diram_mem::error::{AllocError, Result as MemResult};
use diram_mem::LineSink;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;

/// Appends lines to a file, flushing after every line so a crash loses at
/// most the line being written.
pub struct FileLineSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileLineSink {
    /// Open `path` for append, creating parent directories. A new (empty) file
    /// gets a two-line `#` header: `title` and the column layout.
    pub fn open(path: impl AsRef<Path>, title: &str, columns: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let f = OpenOptions::new().create(true).append(true).open(&path)?;
        let fresh = f.metadata()?.len() == 0;
        let mut writer = BufWriter::new(f);
        if fresh {
            writeln!(writer, "# {title} (started {})", unix_millis())?;
            writeln!(writer, "# {columns}")?;
            writer.flush()?;
        }
        debug!(path = %path.display(), fresh, "line sink opened");
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LineSink for FileLineSink {
    fn append_line(&self, line: &str) -> MemResult<()> {
        let mut w = self.writer.lock();
        writeln!(w, "{line}").map_err(|e| AllocError::Sink(format!("write: {e}")))?;
        w.flush()
            .map_err(|e| AllocError::Sink(format!("flush: {e}")))?;
        Ok(())
    }

    fn flush(&self) -> MemResult<()> {
        self.writer
            .lock()
            .flush()
            .map_err(|e| AllocError::Sink(format!("flush: {e}")))
    }
}

/// `<log_dir>/diram_trace.log`
pub fn open_trace_log(cfg: &DiramConfig) -> Result<FileLineSink> {
    FileLineSink::open(
        cfg.trace_log_path(),
        "DIRAM allocation trace",
        "TIMESTAMP|PID|OPERATION|ADDRESS|SIZE|RECEIPT|TAG",
    )
}

/// `<log_dir>/diram_errors.log`
pub fn open_error_log(cfg: &DiramConfig) -> Result<FileLineSink> {
    FileLineSink::open(
        cfg.error_log_path(),
        "DIRAM error log",
        "TIMESTAMP|PID|CODE|SEVERITY|MESSAGE",
    )
}
