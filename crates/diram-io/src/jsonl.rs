//! Streaming NDJSON telemetry writer.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use diram_mem::error::Result as MemResult;
use diram_mem::{TelemetryEvent, TelemetrySink};
use parking_lot::Mutex;

use crate::error::{Error, Result};

pub struct JsonlTelemetrySink<W: Write + Send> {
    writer: Mutex<BufWriter<W>>,
}

impl JsonlTelemetrySink<File> {
    /// Append to `path`, creating it if missing.
    pub fn to_path(path: impl AsRef<Path>) -> Result<Self> {
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::to_writer(f))
    }
}

impl<W: Write + Send> JsonlTelemetrySink<W> {
    pub fn to_writer(writer: W) -> Self {
        Self {
            writer: Mutex::new(BufWriter::new(writer)),
        }
    }

    /// Flush and hand back the underlying writer.
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))
    }

    fn write_event(&self, event: &TelemetryEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut w = self.writer.lock();
        writeln!(w, "{}", line)?;
        w.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> TelemetrySink for JsonlTelemetrySink<W> {
    fn emit(&self, event: &TelemetryEvent) -> MemResult<()> {
        self.write_event(event).map_err(Into::into)
    }
}
