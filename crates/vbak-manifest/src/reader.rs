use std::io::{BufRead, Cursor};

use vbak_types::ChunkAddr;

use crate::entry::ManifestEntry;
use crate::error::{ManifestError, ManifestResult};
use crate::writer::ManifestWriter;

/// Streaming manifest reader validating format and ordering.
pub struct ManifestReader<R: BufRead> {
    inner: R,
    line: usize,
    last: Option<ChunkAddr>,
    buf: String,
}

impl<R: BufRead> ManifestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: 0,
            last: None,
            buf: String::new(),
        }
    }

    fn next_entry(&mut self) -> ManifestResult<Option<ManifestEntry>> {
        self.buf.clear();
        if self.inner.read_line(&mut self.buf)? == 0 {
            return Ok(None);
        }
        self.line += 1;
        let text = self.buf.strip_suffix('\n').ok_or_else(|| ManifestError::Malformed {
            line: self.line,
            reason: "truncated line".into(),
        })?;
        let entry = ManifestEntry::parse(text).map_err(|reason| ManifestError::Malformed {
            line: self.line,
            reason,
        })?;
        if let Some(previous) = self.last {
            if entry.addr <= previous {
                return Err(ManifestError::OutOfOrder {
                    previous,
                    addr: entry.addr,
                });
            }
        }
        self.last = Some(entry.addr);
        Ok(Some(entry))
    }
}

impl<R: BufRead> Iterator for ManifestReader<R> {
    type Item = ManifestResult<ManifestEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

/// A fully loaded manifest, sorted by address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build from entries that must already be strictly ascending.
    pub fn from_entries(entries: Vec<ManifestEntry>) -> ManifestResult<Self> {
        for pair in entries.windows(2) {
            if pair[1].addr <= pair[0].addr {
                return Err(ManifestError::OutOfOrder {
                    previous: pair[0].addr,
                    addr: pair[1].addr,
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn read(reader: impl BufRead) -> ManifestResult<Self> {
        let entries = ManifestReader::new(reader).collect::<ManifestResult<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn from_bytes(data: &[u8]) -> ManifestResult<Self> {
        Self::read(Cursor::new(data))
    }

    pub fn to_bytes(&self) -> ManifestResult<Vec<u8>> {
        let mut writer = ManifestWriter::new(Vec::new());
        for entry in &self.entries {
            writer.push(entry)?;
        }
        writer.finish()
    }

    /// Entry for `addr`, if this manifest has one.
    pub fn lookup(&self, addr: ChunkAddr) -> Option<&ManifestEntry> {
        self.entries
            .binary_search_by(|e| e.addr.cmp(&addr))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries that refer to stored data.
    pub fn stored_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_zero()).count()
    }
}
