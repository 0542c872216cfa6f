use std::collections::VecDeque;
use std::io::{self, BufWriter, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{sync_channel, Receiver};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::container::{read_container, ContainerEntry};
use crate::error::{StoreError, StoreResult};
use crate::traits::{check_path, Destination, FetchStream, FileOp, StreamSink};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const FETCH_DEPTH: usize = 16;

/// How helper commands reach the destination host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// `sh -c` on this machine.
    Local,
    /// `ssh <host> sh -c ...`.
    Ssh { host: String },
    /// `qvm-run -p <vm> sh -c ...` into a Qubes VM.
    Qubes { vm: String },
}

impl Transport {
    /// Build the command running `script` through this transport.
    pub fn command(&self, script: &str) -> Command {
        match self {
            Self::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(script);
                cmd
            }
            Self::Ssh { host } => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-o")
                    .arg("BatchMode=yes")
                    .arg(host)
                    .arg(format!("sh -c {}", quote(script)));
                cmd
            }
            Self::Qubes { vm } => {
                let mut cmd = Command::new("qvm-run");
                cmd.arg("--no-color-output")
                    .arg("--no-gui")
                    .arg("-p")
                    .arg(vm)
                    .arg(format!("sh -c {}", quote(script)));
                cmd
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Local => "sh".to_string(),
            Self::Ssh { host } => format!("ssh:{host}"),
            Self::Qubes { vm } => format!("qubes:{vm}"),
        }
    }
}

/// Quote a string for a POSIX shell.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn status_text(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => "termination by signal".to_string(),
    }
}

fn collect_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    let mut stderr = child.stderr.take()?;
    Some(thread::spawn(move || {
        let mut text = String::new();
        let _ = stderr.read_to_string(&mut text);
        text
    }))
}

fn join_stderr(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

/// Destination directory reached by running shell commands locally, over
/// SSH, or in a Qubes VM.
///
/// Container streams are piped into a long-lived `tar -xf -` helper;
/// fetches stream back out of `tar -cf -`.
#[derive(Debug, Clone)]
pub struct ShellDestination {
    transport: Transport,
    root: String,
    drain_timeout: Duration,
}

impl ShellDestination {
    pub fn new(transport: Transport, root: impl Into<String>, drain_timeout: Duration) -> Self {
        Self {
            transport,
            root: root.into().trim_end_matches('/').to_string(),
            drain_timeout,
        }
    }

    fn target(&self, path: &str) -> StoreResult<String> {
        check_path(path)?;
        Ok(quote(&format!("{}/{}", self.root, path)))
    }

    fn spawn(&self, script: &str) -> StoreResult<Child> {
        debug!(transport = %self.transport.describe(), script, "running destination helper");
        Ok(self
            .transport
            .command(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?)
    }

    /// Run `script` to completion with `input` on stdin; returns stdout.
    fn run(&self, script: &str, input: &[u8]) -> StoreResult<Vec<u8>> {
        let mut child = self.spawn(script)?;
        let stdin = child.stdin.take();
        let (output, fed) = thread::scope(|scope| {
            let feeder = scope.spawn(move || -> io::Result<()> {
                if let Some(mut stdin) = stdin {
                    stdin.write_all(input)?;
                }
                Ok(())
            });
            let output = child.wait_with_output();
            let fed = feeder
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdin feeder panicked")));
            (output, fed)
        });
        let output = output?;
        if !output.status.success() {
            return Err(StoreError::Transport {
                command: script.to_string(),
                status: status_text(output.status),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        fed?;
        Ok(output.stdout)
    }

    fn op_script(&self, op: &FileOp) -> StoreResult<String> {
        Ok(match op {
            FileOp::Remove(path) => format!("rm -rf -- {}", self.target(path)?),
            FileOp::Rename { from, to } => {
                let to = self.target(to)?;
                format!(
                    "mkdir -p -- \"$(dirname -- {to})\" && mv -f -- {} {to}",
                    self.target(from)?
                )
            }
        })
    }
}

impl Destination for ShellDestination {
    fn describe(&self) -> String {
        format!("{}:{}", self.transport.describe(), self.root)
    }

    fn open_stream(&self) -> StoreResult<Box<dyn StreamSink>> {
        let root = quote(&self.root);
        let script = format!("mkdir -p -- {root} && cd {root} && exec tar -xf -");
        let mut child = self.spawn(&script)?;
        let stderr = collect_stderr(&mut child);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StoreError::Consumer("helper has no stdin".to_string()))?;
        Ok(Box::new(ShellSink {
            child,
            stdin: Some(BufWriter::with_capacity(64 * 1024, stdin)),
            stderr,
            script,
            drain_timeout: self.drain_timeout,
        }))
    }

    fn read(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        let target = self.target(path)?;
        // A leading marker byte tells an empty file from a missing one.
        let script = format!("if [ -f {target} ]; then printf +; cat -- {target}; fi");
        let mut output = self.run(&script, &[])?;
        if output.is_empty() {
            return Ok(None);
        }
        output.remove(0);
        Ok(Some(output))
    }

    fn fetch<'a>(&'a self, paths: Vec<String>, limit: u64) -> StoreResult<FetchStream<'a>> {
        for path in &paths {
            check_path(path)?;
        }
        if paths.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        let root = quote(&self.root);
        // Requested chunks may share an inode; each must arrive as file data.
        let script = format!("cd {root} && exec tar --hard-dereference -cf - -T -");
        let mut child = self.spawn(&script)?;
        let stderr = collect_stderr(&mut child);

        let mut list = paths.join("\n");
        list.push('\n');
        if let Some(mut stdin) = child.stdin.take() {
            thread::spawn(move || {
                let _ = stdin.write_all(list.as_bytes());
            });
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StoreError::Consumer("helper has no stdout".to_string()))?;

        let (tx, rx) = sync_channel(FETCH_DEPTH);
        thread::Builder::new()
            .name("vbak-fetch".to_string())
            .spawn(move || {
                let read = read_container(stdout, limit, |entry| match entry {
                    ContainerEntry::File { path, data } => tx
                        .send(Ok((path, data)))
                        .map_err(|_| StoreError::Consumer("fetch abandoned".to_string())),
                    ContainerEntry::Link { path, .. } => Err(StoreError::UnexpectedEntry {
                        expected: "regular file".to_string(),
                        found: path,
                    }),
                });
                if read.is_err() {
                    let _ = child.kill();
                }
                let status = child.wait();
                let stderr = join_stderr(stderr);
                let failure = match (read, status) {
                    (Err(e), _) => Some(e),
                    (Ok(()), Err(e)) => Some(StoreError::Io(e)),
                    (Ok(()), Ok(status)) if !status.success() => Some(StoreError::Transport {
                        command: script,
                        status: status_text(status),
                        stderr,
                    }),
                    _ => None,
                };
                if let Some(e) = failure {
                    let _ = tx.send(Err(e));
                }
            })?;

        Ok(Box::new(OrderedFetch {
            rx,
            expected: paths.into(),
            failed: false,
        }))
    }

    fn write_atomic(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let target = self.target(path)?;
        let partial = self.target(&format!("{path}.partial"))?;
        let script = format!(
            "mkdir -p -- \"$(dirname -- {target})\" \
             && cat > {partial} && mv -f -- {partial} {target}"
        );
        self.run(&script, data)?;
        Ok(())
    }

    fn exists(&self, path: &str) -> StoreResult<bool> {
        let target = self.target(path)?;
        let output = self.run(&format!("if [ -e {target} ]; then printf 1; fi"), &[])?;
        Ok(!output.is_empty())
    }

    fn list(&self, dir: &str) -> StoreResult<Vec<String>> {
        let target = self.target(dir)?;
        let output = self.run(&format!("if [ -d {target} ]; then ls -1A -- {target}; fi"), &[])?;
        let mut names: Vec<String> = String::from_utf8_lossy(&output)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        let script = self.op_script(&FileOp::Rename {
            from: from.to_string(),
            to: to.to_string(),
        })?;
        self.run(&script, &[])?;
        Ok(())
    }

    fn remove(&self, path: &str) -> StoreResult<()> {
        self.run(&self.op_script(&FileOp::Remove(path.to_string()))?, &[])?;
        Ok(())
    }

    /// One helper invocation for the whole batch.
    fn apply(&self, ops: &[FileOp]) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut script = String::from("set -e\n");
        for op in ops {
            script.push_str(&self.op_script(op)?);
            script.push('\n');
        }
        self.run("sh -s", script.as_bytes())?;
        Ok(())
    }
}

struct ShellSink {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stderr: Option<JoinHandle<String>>,
    script: String,
    drain_timeout: Duration,
}

impl ShellSink {
    fn stdin(&mut self) -> io::Result<&mut BufWriter<ChildStdin>> {
        self.stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stream already closed"))
    }
}

impl Write for ShellSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stdin()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdin()?.flush()
    }
}

impl StreamSink for ShellSink {
    fn finish(mut self: Box<Self>) -> StoreResult<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush()?;
        }
        let deadline = Instant::now() + self.drain_timeout;
        let status = loop {
            if let Some(status) = self.child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                warn!(script = %self.script, "destination helper did not exit, terminating");
                let _ = self.child.kill();
                let _ = self.child.wait();
                return Err(StoreError::Timeout(
                    "destination helper".to_string(),
                    self.drain_timeout.as_secs(),
                ));
            }
            thread::sleep(POLL_INTERVAL);
        };
        let stderr = join_stderr(self.stderr.take());
        if !status.success() {
            return Err(StoreError::Transport {
                command: self.script.clone(),
                status: status_text(status),
                stderr,
            });
        }
        Ok(())
    }
}

impl Drop for ShellSink {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            self.stdin = None;
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Checks that a fetch stream delivers exactly the requested files in order.
struct OrderedFetch {
    rx: Receiver<StoreResult<(String, Vec<u8>)>>,
    expected: VecDeque<String>,
    failed: bool,
}

impl Iterator for OrderedFetch {
    type Item = StoreResult<(String, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = match self.rx.recv() {
            Ok(Ok((path, data))) => match self.expected.pop_front() {
                Some(expected) if expected == path => Ok((path, data)),
                Some(expected) => Err(StoreError::UnexpectedEntry {
                    expected,
                    found: path,
                }),
                None => Err(StoreError::UnexpectedEntry {
                    expected: String::new(),
                    found: path,
                }),
            },
            Ok(Err(e)) => Err(e),
            Err(_) if self.expected.is_empty() => return None,
            Err(_) => Err(StoreError::Truncated(self.expected.len())),
        };
        self.failed = item.is_err();
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerWriter;

    fn destination() -> (tempfile::TempDir, ShellDestination) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("archive").to_string_lossy().into_owned();
        let dest = ShellDestination::new(Transport::Local, root, Duration::from_secs(20));
        (dir, dest)
    }

    #[test]
    fn quoting() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn remote_commands_wrap_the_script() {
        let cmd = Transport::Ssh { host: "backup".into() }.command("ls '/a b'");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args.last().unwrap(), r"sh -c 'ls '\''/a b'\'''");
        let cmd = Transport::Qubes { vm: "archive-vm".into() }.command("true");
        assert_eq!(cmd.get_program(), "qvm-run");
    }

    #[test]
    fn metadata_operations() {
        let (_dir, dest) = destination();
        assert_eq!(dest.read("v/volinfo").unwrap(), None);
        assert!(!dest.exists("v").unwrap());
        dest.write_atomic("v/volinfo", b"").unwrap();
        assert_eq!(dest.read("v/volinfo").unwrap(), Some(Vec::new()));
        dest.write_atomic("v/volinfo", b"last = none\n").unwrap();
        assert_eq!(dest.read("v/volinfo").unwrap().unwrap(), b"last = none\n");
        assert_eq!(dest.list("v").unwrap(), vec!["volinfo".to_string()]);

        dest.write_atomic("v/S-tmp/info", b"i").unwrap();
        dest.rename("v/S-tmp", "v/S").unwrap();
        assert!(dest.exists("v/S/info").unwrap());
        dest.remove("v/S").unwrap();
        assert!(!dest.exists("v/S").unwrap());
    }

    #[test]
    fn stream_then_fetch() {
        let (_dir, dest) = destination();
        let mut container = ContainerWriter::new(dest.open_stream().unwrap());
        container.append_file("v/S/000000000/x0000000000000000", b"zero").unwrap();
        container.append_file("v/S/000000000/x0000000000001000", b"one").unwrap();
        container
            .append_link("v/S/000000000/x0000000000002000", "v/S/000000000/x0000000000000000")
            .unwrap();
        container.finish().unwrap().finish().unwrap();

        let paths = vec![
            "v/S/000000000/x0000000000002000".to_string(),
            "v/S/000000000/x0000000000001000".to_string(),
        ];
        let fetched: Vec<_> = dest.fetch(paths, 64).unwrap().collect::<StoreResult<_>>().unwrap();
        assert_eq!(fetched[0].1, b"zero");
        assert_eq!(fetched[1].1, b"one");
    }

    #[test]
    fn fetch_delivers_linked_files_as_data() {
        let (_dir, dest) = destination();
        let mut container = ContainerWriter::new(dest.open_stream().unwrap());
        container.append_file("v/S/000000000/x0000000000000000", b"same").unwrap();
        container
            .append_link("v/S/000000000/x0000000000020000", "v/S/000000000/x0000000000000000")
            .unwrap();
        container.finish().unwrap().finish().unwrap();

        let paths = vec![
            "v/S/000000000/x0000000000000000".to_string(),
            "v/S/000000000/x0000000000020000".to_string(),
        ];
        let fetched: Vec<_> = dest
            .fetch(paths.clone(), 64)
            .unwrap()
            .collect::<StoreResult<_>>()
            .unwrap();
        assert_eq!(fetched.len(), 2);
        for ((path, data), expected) in fetched.iter().zip(&paths) {
            assert_eq!(path, expected);
            assert_eq!(data, b"same");
        }
    }

    #[test]
    fn fetch_of_missing_file_fails() {
        let (_dir, dest) = destination();
        dest.write_atomic("v/a", b"a").unwrap();
        let results: Vec<_> = dest
            .fetch(vec!["v/a".into(), "v/missing".into()], 64)
            .unwrap()
            .collect();
        assert!(results.last().unwrap().is_err());
    }

    #[test]
    fn failing_helper_reported() {
        let dest =
            ShellDestination::new(Transport::Local, "/nonexistent/root", Duration::from_secs(5));
        let err = dest.run("exit 7", &[]).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Transport { ref status, .. } if status == "exit status 7"
        ));
    }
}
