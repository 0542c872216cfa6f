//! The tar container carrying a session to the destination.

use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use tar::{Archive, Builder, EntryType, Header};

use crate::error::{StoreError, StoreResult};

const FILE_MODE: u32 = 0o640;

/// One entry of a container stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEntry {
    File { path: String, data: Vec<u8> },
    /// Hard link to a file already present at the destination (or earlier
    /// in the same stream).
    Link { path: String, target: String },
}

impl ContainerEntry {
    pub fn path(&self) -> &str {
        match self {
            Self::File { path, .. } | Self::Link { path, .. } => path,
        }
    }
}

/// Writes files and hard links as a GNU tar stream.
pub struct ContainerWriter<W: Write> {
    builder: Builder<W>,
    mtime: u64,
    files: u64,
    links: u64,
    bytes: u64,
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(inner: W) -> Self {
        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            builder: Builder::new(inner),
            mtime,
            files: 0,
            links: 0,
            bytes: 0,
        }
    }

    fn header(&self, kind: EntryType, size: u64) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(FILE_MODE);
        header.set_mtime(self.mtime);
        header.set_size(size);
        header
    }

    pub fn append_file(&mut self, path: &str, data: &[u8]) -> io::Result<()> {
        let mut header = self.header(EntryType::Regular, data.len() as u64);
        self.builder.append_data(&mut header, path, data)?;
        self.files += 1;
        self.bytes += data.len() as u64;
        Ok(())
    }

    pub fn append_link(&mut self, path: &str, target: &str) -> io::Result<()> {
        let mut header = self.header(EntryType::Link, 0);
        self.builder.append_link(&mut header, path, target)?;
        self.links += 1;
        Ok(())
    }

    /// Regular files written so far.
    pub fn files(&self) -> u64 {
        self.files
    }

    /// Hard links written so far.
    pub fn links(&self) -> u64 {
        self.links
    }

    /// Payload bytes written so far, excluding tar framing.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Write the end-of-archive marker and return the inner writer.
    pub fn finish(self) -> io::Result<W> {
        self.builder.into_inner()
    }
}

/// Read a container stream, passing each entry to `visit`. Regular files
/// larger than `limit` are rejected before their data is read.
pub fn read_container<R: Read>(
    reader: R,
    limit: u64,
    mut visit: impl FnMut(ContainerEntry) -> StoreResult<()>,
) -> StoreResult<()> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let kind = entry.header().entry_type();
        match kind {
            EntryType::Regular | EntryType::Continuous => {
                let len = entry.size();
                if len > limit {
                    return Err(StoreError::TooLarge { path, len, limit });
                }
                let mut data = Vec::with_capacity(len as usize);
                entry.read_to_end(&mut data)?;
                visit(ContainerEntry::File { path, data })?;
            }
            EntryType::Link => {
                let target = entry
                    .link_name()?
                    .map(|t| t.to_string_lossy().into_owned())
                    .ok_or_else(|| StoreError::Consumer(format!("link {path} has no target")))?;
                visit(ContainerEntry::Link { path, target })?;
            }
            EntryType::Directory => {}
            other => {
                return Err(StoreError::Consumer(format!(
                    "unsupported container entry {path} of type {other:?}"
                )))
            }
        }
    }
    Ok(())
}
