use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::channel::{pipe, ChannelWriter};
use crate::error::{StoreError, StoreResult};
use crate::traits::{check_path, Destination, StreamSink};

const STREAM_BUFFER: usize = 64 * 1024;

/// Destination directory on a local filesystem.
///
/// Container streams are unpacked by a consumer thread fed through a
/// bounded in-process pipe.
#[derive(Debug, Clone)]
pub struct LocalDestination {
    root: PathBuf,
    drain_timeout: Duration,
}

impl LocalDestination {
    pub fn new(root: impl Into<PathBuf>, drain_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            drain_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        check_path(path)?;
        Ok(self.root.join(path))
    }
}

fn not_found_as_none<T>(result: io::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

impl Destination for LocalDestination {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    fn open_stream(&self) -> StoreResult<Box<dyn StreamSink>> {
        fs::create_dir_all(&self.root)?;
        let (writer, reader) = pipe();
        let (done_tx, done_rx) = mpsc::channel();
        let root = self.root.clone();
        thread::Builder::new()
            .name("vbak-unpack".to_string())
            .spawn(move || {
                let mut archive = tar::Archive::new(reader);
                archive.set_preserve_permissions(false);
                archive.set_overwrite(true);
                let result = match archive.unpack(&root) {
                    // Consume the end-of-archive padding so the producer never
                    // sees a closed pipe.
                    Ok(()) => io::copy(&mut archive.into_inner(), &mut io::sink()).map(|_| ()),
                    Err(e) => Err(e),
                };
                let _ = done_tx.send(result);
            })?;
        Ok(Box::new(LocalSink {
            writer: Some(BufWriter::with_capacity(STREAM_BUFFER, writer)),
            done: done_rx,
            drain_timeout: self.drain_timeout,
        }))
    }

    fn read(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(not_found_as_none(fs::read(self.resolve(path)?))?)
    }

    fn read_bounded(&self, path: &str, limit: u64) -> StoreResult<Vec<u8>> {
        let file = not_found_as_none(fs::File::open(self.resolve(path)?))?
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        let mut data = Vec::new();
        file.take(limit.saturating_add(1)).read_to_end(&mut data)?;
        if data.len() as u64 > limit {
            return Err(StoreError::TooLarge {
                path: path.to_string(),
                len: data.len() as u64,
                limit,
            });
        }
        Ok(data)
    }

    fn write_atomic(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let target = self.resolve(path)?;
        let dir = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    fn exists(&self, path: &str) -> StoreResult<bool> {
        Ok(self.resolve(path)?.exists())
    }

    fn list(&self, dir: &str) -> StoreResult<Vec<String>> {
        let Some(entries) = not_found_as_none(fs::read_dir(self.resolve(dir)?))? else {
            return Ok(Vec::new());
        };
        let mut names = Vec::new();
        for entry in entries {
            if let Some(name) = entry?.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&source, &target).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(from.to_string()),
            _ => StoreError::Io(e),
        })?;
        debug!(from, to, "renamed on destination");
        Ok(())
    }

    fn remove(&self, path: &str) -> StoreResult<()> {
        let target = self.resolve(path)?;
        let Some(meta) = not_found_as_none(fs::symlink_metadata(&target))? else {
            return Ok(());
        };
        if meta.is_dir() {
            fs::remove_dir_all(&target)?;
        } else {
            fs::remove_file(&target)?;
        }
        Ok(())
    }
}

struct LocalSink {
    writer: Option<BufWriter<ChannelWriter>>,
    done: Receiver<io::Result<()>>,
    drain_timeout: Duration,
}

impl LocalSink {
    fn writer(&mut self) -> io::Result<&mut BufWriter<ChannelWriter>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stream already closed"))
    }
}

impl Write for LocalSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl StreamSink for LocalSink {
    fn finish(mut self: Box<Self>) -> StoreResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        match self.done.recv_timeout(self.drain_timeout) {
            Ok(result) => result.map_err(|e| StoreError::Consumer(e.to_string())),
            Err(RecvTimeoutError::Timeout) => Err(StoreError::Timeout(
                "unpack thread".to_string(),
                self.drain_timeout.as_secs(),
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err(StoreError::Consumer("unpack thread exited without a result".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerWriter;
    use crate::traits::FileOp;

    fn destination() -> (tempfile::TempDir, LocalDestination) {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalDestination::new(dir.path().join("archive"), Duration::from_secs(10));
        (dir, dest)
    }

    #[test]
    fn stream_unpacks_files_and_links() {
        let (_dir, dest) = destination();
        let mut container = ContainerWriter::new(dest.open_stream().unwrap());
        container.append_file("vol/S/000000000/x0000000000000000", b"chunk").unwrap();
        container
            .append_link("vol/S/000000000/x0000000000001000", "vol/S/000000000/x0000000000000000")
            .unwrap();
        container.append_file("vol/S/manifest", b"m\n").unwrap();
        container.finish().unwrap().finish().unwrap();

        assert_eq!(dest.read("vol/S/000000000/x0000000000001000").unwrap().unwrap(), b"chunk");
        assert_eq!(dest.read("vol/S/manifest").unwrap().unwrap(), b"m\n");
        assert_eq!(dest.list("vol/S/000000000").unwrap().len(), 2);
    }

    #[test]
    fn large_stream_passes_backpressure() {
        let (_dir, dest) = destination();
        let mut container = ContainerWriter::new(dest.open_stream().unwrap());
        for i in 0..64u64 {
            container.append_file(&format!("v/s/{i:04}"), &vec![i as u8; 100_000]).unwrap();
        }
        container.finish().unwrap().finish().unwrap();
        assert_eq!(dest.read("v/s/0063").unwrap().unwrap(), vec![63u8; 100_000]);
    }

    #[test]
    fn bounded_reads() {
        let (_dir, dest) = destination();
        dest.write_atomic("a/b", &[1u8; 10]).unwrap();
        assert_eq!(dest.read_bounded("a/b", 10).unwrap().len(), 10);
        assert!(matches!(dest.read_bounded("a/b", 9), Err(StoreError::TooLarge { .. })));
        assert!(matches!(dest.read_bounded("a/c", 9), Err(StoreError::NotFound(_))));
        assert_eq!(dest.read("a/c").unwrap(), None);
    }

    #[test]
    fn fetch_preserves_order() {
        let (_dir, dest) = destination();
        dest.write_atomic("x/2", b"two").unwrap();
        dest.write_atomic("x/1", b"one").unwrap();
        let fetched: Vec<_> = dest
            .fetch(vec!["x/2".into(), "x/1".into()], 16)
            .unwrap()
            .collect::<StoreResult<_>>()
            .unwrap();
        assert_eq!(
            fetched,
            vec![("x/2".to_string(), b"two".to_vec()), ("x/1".to_string(), b"one".to_vec())]
        );
    }

    #[test]
    fn batch_renames_and_removes() {
        let (_dir, dest) = destination();
        dest.write_atomic("v/S2/000000000/x1", b"keep").unwrap();
        dest.write_atomic("v/S1/000000000/x1", b"old").unwrap();
        dest.apply(&[
            FileOp::Remove("v/S1/000000000/x1".into()),
            FileOp::Rename {
                from: "v/S2/000000000/x1".into(),
                to: "v/S1/000000000/x1".into(),
            },
            FileOp::Remove("v/S2".into()),
            FileOp::Remove("v/never-existed".into()),
        ])
        .unwrap();
        assert_eq!(dest.read("v/S1/000000000/x1").unwrap().unwrap(), b"keep");
        assert!(!dest.exists("v/S2").unwrap());
        assert_eq!(dest.list("v").unwrap(), vec!["S1".to_string()]);
    }

    #[test]
    fn rename_of_missing_source() {
        let (_dir, dest) = destination();
        assert!(matches!(dest.rename("v/a", "v/b"), Err(StoreError::NotFound(_))));
    }
}
