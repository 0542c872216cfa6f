use std::io::Write;

use vbak_types::ChunkAddr;

use crate::entry::ManifestEntry;
use crate::error::{ManifestError, ManifestResult};

/// Streaming manifest writer enforcing strictly ascending addresses.
pub struct ManifestWriter<W: Write> {
    inner: W,
    last: Option<ChunkAddr>,
    count: u64,
}

impl<W: Write> ManifestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            last: None,
            count: 0,
        }
    }

    /// Append one entry.
    pub fn push(&mut self, entry: &ManifestEntry) -> ManifestResult<()> {
        if let Some(previous) = self.last {
            if entry.addr <= previous {
                return Err(ManifestError::OutOfOrder {
                    previous,
                    addr: entry.addr,
                });
            }
        }
        writeln!(self.inner, "{entry}")?;
        self.last = Some(entry.addr);
        self.count += 1;
        Ok(())
    }

    /// Number of entries written so far.
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Flush and return the underlying writer.
    pub fn finish(mut self) -> ManifestResult<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}
