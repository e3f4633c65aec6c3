//! Output formats for terminal nodes.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use prep_types::{Row, Schema};

use crate::error::PipelineResult;

/// Writes one record envelope: a header, rows, then the schema.
///
/// Call order is `open`, any number of `write_row`, `write_schema`, then
/// `close`. Writers guarantee `open` and `write_schema` happen exactly once.
pub trait Serializer: Send {
    fn open(&mut self) -> PipelineResult<()>;
    fn write_row(&mut self, row: &Row) -> PipelineResult<()>;
    /// Ends the row section and writes the schema.
    fn write_schema(&mut self, schema: &Schema) -> PipelineResult<()>;
    fn flush(&mut self) -> PipelineResult<()>;
    fn close(&mut self) -> PipelineResult<()>;
}

/// Compact JSON envelope:
///
/// ```json
/// {"records":[{"0000":"a"}],"metadata":{"columns":[...]}}
/// ```
pub struct JsonSerializer<W: Write + Send> {
    out: W,
    rows: u64,
}

impl<W: Write + Send> JsonSerializer<W> {
    pub fn new(out: W) -> Self {
        Self { out, rows: 0 }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Serializer for JsonSerializer<W> {
    fn open(&mut self) -> PipelineResult<()> {
        self.out.write_all(b"{\"records\":[")?;
        Ok(())
    }

    fn write_row(&mut self, row: &Row) -> PipelineResult<()> {
        if self.rows > 0 {
            self.out.write_all(b",")?;
        }
        serde_json::to_writer(&mut self.out, row)?;
        self.rows += 1;
        Ok(())
    }

    fn write_schema(&mut self, schema: &Schema) -> PipelineResult<()> {
        self.out.write_all(b"],\"metadata\":")?;
        serde_json::to_writer(&mut self.out, schema)?;
        Ok(())
    }

    fn flush(&mut self) -> PipelineResult<()> {
        self.out.flush()?;
        Ok(())
    }

    fn close(&mut self) -> PipelineResult<()> {
        self.out.write_all(b"}")?;
        self.out.flush()?;
        Ok(())
    }
}

/// In-memory output shared between a writer node and whoever runs the
/// pipeline.
#[derive(Clone, Debug, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Take the written bytes, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        self.inner
            .lock()
            .map(|mut b| std::mem::take(&mut *b))
            .unwrap_or_default()
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
