use std::io::Write;

use crate::error::{StoreError, StoreResult};

/// Stored files delivered by [`Destination::fetch`], in request order.
pub type FetchStream<'a> = Box<dyn Iterator<Item = StoreResult<(String, Vec<u8>)>> + 'a>;

/// Receiving end of a container stream.
///
/// Bytes written are a tar stream; a consumer materializes its entries
/// under the destination root while the producer keeps writing. Dropping a
/// sink without calling [`StreamSink::finish`] abandons the stream.
pub trait StreamSink: Write + Send {
    /// Close the stream and wait for the consumer to finish.
    fn finish(self: Box<Self>) -> StoreResult<()>;
}

/// A metadata mutation applied with [`Destination::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    /// Remove a file or directory tree. Missing paths are ignored.
    Remove(String),
    /// Rename, creating the parent directory of `to` if needed.
    Rename { from: String, to: String },
}

/// Archive destination holding stored chunks and session metadata.
///
/// All implementations must satisfy these invariants:
/// - Paths are relative to the destination root (see [`check_path`]).
/// - `write_atomic` and `rename` never leave a partially written file under
///   the final name.
/// - Fetched data is bounded; a file larger than the limit is an error,
///   never silently truncated.
/// - All I/O and helper failures are propagated.
pub trait Destination: Send + Sync {
    /// Short human-readable description, used in logs.
    fn describe(&self) -> String;

    /// Start a container stream into the destination root.
    fn open_stream(&self) -> StoreResult<Box<dyn StreamSink>>;

    /// Read a whole file. Returns `Ok(None)` if it does not exist.
    fn read(&self, path: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Read a file that must exist and be at most `limit` bytes.
    fn read_bounded(&self, path: &str, limit: u64) -> StoreResult<Vec<u8>> {
        let data = self
            .read(path)?
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        if data.len() as u64 > limit {
            return Err(StoreError::TooLarge {
                path: path.to_string(),
                len: data.len() as u64,
                limit,
            });
        }
        Ok(data)
    }

    /// Fetch several files, each bounded by `limit`, in the given order.
    ///
    /// Default implementation calls `read_bounded()` per path. Remote
    /// backends override it to stream everything in one round-trip.
    fn fetch<'a>(&'a self, paths: Vec<String>, limit: u64) -> StoreResult<FetchStream<'a>> {
        Ok(Box::new(paths.into_iter().map(move |path| {
            let data = self.read_bounded(&path, limit)?;
            Ok((path, data))
        })))
    }

    /// Replace a file through a temporary name and a rename.
    fn write_atomic(&self, path: &str, data: &[u8]) -> StoreResult<()>;

    /// Whether a file or directory exists.
    fn exists(&self, path: &str) -> StoreResult<bool>;

    /// Names of the entries of a directory, sorted. A missing directory is
    /// empty.
    fn list(&self, dir: &str) -> StoreResult<Vec<String>>;

    /// Rename a file or directory, creating the parent of `to` if needed.
    fn rename(&self, from: &str, to: &str) -> StoreResult<()>;

    /// Remove a file or directory tree. Missing paths are ignored.
    fn remove(&self, path: &str) -> StoreResult<()>;

    /// Apply a batch of mutations in order, stopping at the first failure.
    ///
    /// Default implementation calls `remove()`/`rename()` per operation.
    fn apply(&self, ops: &[FileOp]) -> StoreResult<()> {
        for op in ops {
            match op {
                FileOp::Remove(path) => self.remove(path)?,
                FileOp::Rename { from, to } => self.rename(from, to)?,
            }
        }
        Ok(())
    }
}

/// Reject paths that are empty, absolute, or contain `.`/`..`/empty
/// components.
pub fn check_path(path: &str) -> StoreResult<()> {
    let valid = !path.is_empty()
        && !path.starts_with('/')
        && path
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_accepted() {
        check_path("root").unwrap();
        check_path("root/S_20240101-000000/000000000/x0000000000000000").unwrap();
    }

    #[test]
    fn escaping_paths_rejected() {
        for bad in ["", "/etc/passwd", "root/../etc", "root//x", "./root", "root/"] {
            assert!(
                matches!(check_path(bad), Err(StoreError::InvalidPath(_))),
                "{bad:?} accepted"
            );
        }
    }
}
