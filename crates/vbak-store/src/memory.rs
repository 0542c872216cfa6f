use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::container::{read_container, ContainerEntry};
use crate::error::{StoreError, StoreResult};
use crate::traits::{check_path, Destination, StreamSink};

type Files = Arc<RwLock<BTreeMap<String, Vec<u8>>>>;

fn under(key: &str, dir: &str) -> bool {
    key.len() > dir.len() && key.starts_with(dir) && key.as_bytes()[dir.len()] == b'/'
}

/// In-memory, `BTreeMap`-based destination.
///
/// Intended for tests. Directories are implicit: a directory exists while
/// some file lives below it. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    files: Files,
    fail_renames: Arc<AtomicBool>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored file path, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.files.read().expect("lock poisoned").keys().cloned().collect()
    }

    /// Overwrite a file directly, bypassing streams.
    pub fn insert(&self, path: &str, data: Vec<u8>) {
        self.files
            .write()
            .expect("lock poisoned")
            .insert(path.to_string(), data);
    }

    /// Make every subsequent rename fail, as an unreachable destination would.
    pub fn fail_renames(&self, fail: bool) {
        self.fail_renames.store(fail, Ordering::SeqCst);
    }
}

impl Destination for MemoryDestination {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn open_stream(&self) -> StoreResult<Box<dyn StreamSink>> {
        Ok(Box::new(MemorySink {
            buffer: Vec::new(),
            files: Arc::clone(&self.files),
        }))
    }

    fn read(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        check_path(path)?;
        Ok(self.files.read().expect("lock poisoned").get(path).cloned())
    }

    fn write_atomic(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        check_path(path)?;
        self.insert(path, data.to_vec());
        Ok(())
    }

    fn exists(&self, path: &str) -> StoreResult<bool> {
        check_path(path)?;
        let files = self.files.read().expect("lock poisoned");
        Ok(files.contains_key(path) || files.keys().any(|key| under(key, path)))
    }

    fn list(&self, dir: &str) -> StoreResult<Vec<String>> {
        check_path(dir)?;
        let files = self.files.read().expect("lock poisoned");
        let mut names: Vec<String> = files
            .keys()
            .filter(|key| under(key, dir))
            .filter_map(|key| key[dir.len() + 1..].split('/').next())
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        check_path(from)?;
        check_path(to)?;
        if self.fail_renames.load(Ordering::SeqCst) {
            return Err(StoreError::Transport {
                command: format!("rename {from} {to}"),
                status: "injected failure".to_string(),
                stderr: String::new(),
            });
        }
        let mut files = self.files.write().expect("lock poisoned");
        let moved: Vec<String> = files
            .keys()
            .filter(|key| *key == from || under(key, from))
            .cloned()
            .collect();
        if moved.is_empty() {
            return Err(StoreError::NotFound(from.to_string()));
        }
        for key in moved {
            if let Some(data) = files.remove(&key) {
                files.insert(format!("{to}{}", &key[from.len()..]), data);
            }
        }
        Ok(())
    }

    fn remove(&self, path: &str) -> StoreResult<()> {
        check_path(path)?;
        self.files
            .write()
            .expect("lock poisoned")
            .retain(|key, _| key != path && !under(key, path));
        Ok(())
    }
}

struct MemorySink {
    buffer: Vec<u8>,
    files: Files,
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StreamSink for MemorySink {
    fn finish(self: Box<Self>) -> StoreResult<()> {
        let mut files = self.files.write().expect("lock poisoned");
        read_container(self.buffer.as_slice(), u64::MAX, |entry| {
            match entry {
                ContainerEntry::File { path, data } => {
                    check_path(&path)?;
                    files.insert(path, data);
                }
                ContainerEntry::Link { path, target } => {
                    check_path(&path)?;
                    let data = files
                        .get(&target)
                        .cloned()
                        .ok_or(StoreError::NotFound(target))?;
                    files.insert(path, data);
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerWriter;

    #[test]
    fn stream_materializes_links() {
        let dest = MemoryDestination::new();
        dest.insert("v/P/000000000/x0000000000000000", b"old".to_vec());
        let mut container = ContainerWriter::new(dest.open_stream().unwrap());
        container
            .append_link("v/S-tmp/000000000/x0000000000001000", "v/P/000000000/x0000000000000000")
            .unwrap();
        container.append_file("v/S-tmp/manifest", b"").unwrap();
        container.finish().unwrap().finish().unwrap();
        assert_eq!(
            dest.read("v/S-tmp/000000000/x0000000000001000").unwrap().unwrap(),
            b"old"
        );
    }

    #[test]
    fn link_to_missing_target_fails() {
        let dest = MemoryDestination::new();
        let mut container = ContainerWriter::new(dest.open_stream().unwrap());
        container.append_link("v/a", "v/nowhere").unwrap();
        assert!(matches!(
            container.finish().unwrap().finish(),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn directories_are_implicit() {
        let dest = MemoryDestination::new();
        dest.insert("v/S1/info", Vec::new());
        dest.insert("v/S1/000000000/x1", Vec::new());
        dest.insert("v/S10/info", Vec::new());
        dest.insert("v/volinfo", Vec::new());
        assert_eq!(dest.list("v").unwrap(), vec!["S1", "S10", "volinfo"]);
        assert!(dest.exists("v/S1").unwrap());
        assert!(!dest.exists("v/S").unwrap());

        dest.rename("v/S1", "v/S2").unwrap();
        assert_eq!(dest.list("v").unwrap(), vec!["S10", "S2", "volinfo"]);
        dest.remove("v/S2").unwrap();
        assert_eq!(dest.paths(), vec!["v/S10/info".to_string(), "v/volinfo".to_string()]);
    }

    #[test]
    fn injected_rename_failure() {
        let dest = MemoryDestination::new();
        dest.insert("v/S-tmp/info", Vec::new());
        dest.fail_renames(true);
        assert!(matches!(
            dest.rename("v/S-tmp", "v/S"),
            Err(StoreError::Transport { .. })
        ));
        dest.fail_renames(false);
        dest.rename("v/S-tmp", "v/S").unwrap();
        assert!(dest.exists("v/S/info").unwrap());
    }
}
