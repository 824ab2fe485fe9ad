// SPDX-License-Identifier: Apache-2.0

//! Child process handle with captured output.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Maximum number of lines retained per output stream.
const MAX_CAPTURED_LINES: usize = 10_000;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

type LineBuffer = Arc<Mutex<VecDeque<String>>>;

/// A running (or finished) child process whose stdout and stderr are drained
/// by background threads so that a chatty child never blocks on a full pipe.
pub struct ProcessIo {
    child: Arc<Mutex<Child>>,
    pid: u32,
    command_line: String,
    stdout: LineBuffer,
    stderr: LineBuffer,
    readers: Vec<JoinHandle<()>>,
}

/// Cheap, clonable liveness check for a [`ProcessIo`].
#[derive(Clone)]
pub struct ProcessProbe {
    child: Arc<Mutex<Child>>,
    pid: u32,
}

impl ProcessIo {
    /// Spawns `executable` with `args`, capturing both output streams.
    pub fn start<S: AsRef<OsStr>>(executable: &Path, args: &[S]) -> Result<Self> {
        let command_line = render_command_line(executable, args);
        let mut child = spawn_with_retry(executable, args).map_err(|source| Error::ProcessStart {
            command: command_line.clone(),
            source,
        })?;

        let stdout = LineBuffer::default();
        let stderr = LineBuffer::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_line_reader(out, Arc::clone(&stdout)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_line_reader(err, Arc::clone(&stderr)));
        }

        Ok(ProcessIo {
            pid: child.id(),
            child: Arc::new(Mutex::new(child)),
            command_line,
            stdout,
            stderr,
            readers,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The command line this process was started with, quoted for humans.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn probe(&self) -> ProcessProbe {
        ProcessProbe {
            child: Arc::clone(&self.child),
            pid: self.pid,
        }
    }

    pub fn has_exited(&self) -> bool {
        self.probe().has_exited()
    }

    /// Exit code, if the process has exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        lock_child(&self.child)
            .try_wait()
            .ok()
            .flatten()
            .and_then(|status| status.code())
    }

    /// Forcefully terminates the process. Killing an exited process is not an error.
    pub fn kill(&self) -> io::Result<()> {
        let mut child = lock_child(&self.child);
        if matches!(child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }
        match child.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Waits up to `timeout` for the process to exit; returns whether it did.
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.has_exited() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Blocks until the process exits and its output has been fully read.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = loop {
            if let Some(status) = lock_child(&self.child).try_wait()? {
                break status;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        };
        self.join_readers();
        Ok(status)
    }

    /// Standard output lines read so far.
    pub fn stdout_lines(&self) -> Vec<String> {
        snapshot(&self.stdout)
    }

    /// Standard error lines read so far.
    pub fn stderr_lines(&self) -> Vec<String> {
        snapshot(&self.stderr)
    }

    fn join_readers(&mut self) {
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }
}

impl Drop for ProcessIo {
    fn drop(&mut self) {
        // Reap the child if it is already gone; a live one is left to its owner.
        let _ = lock_child(&self.child).try_wait();
    }
}

impl ProcessProbe {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process has exited. A process that cannot be queried counts as gone.
    pub fn has_exited(&self) -> bool {
        !matches!(lock_child(&self.child).try_wait(), Ok(None))
    }
}

/// Quotes an argument for display when it contains whitespace or quotes.
pub fn quote_if_necessary(arg: &str) -> String {
    if arg.is_empty() {
        return "\"\"".to_string();
    }
    if arg.contains(char::is_whitespace) || arg.contains('"') {
        return format!("\"{}\"", arg.replace('"', "\\\""));
    }
    arg.to_string()
}

fn render_command_line<S: AsRef<OsStr>>(executable: &Path, args: &[S]) -> String {
    let mut parts = vec![quote_if_necessary(&executable.to_string_lossy())];
    parts.extend(
        args.iter()
            .map(|a| quote_if_necessary(&a.as_ref().to_string_lossy())),
    );
    parts.join(" ")
}

/// Spawns with piped output, retrying briefly while the executable is still
/// held open for writing by another process (ETXTBSY).
fn spawn_with_retry<S: AsRef<OsStr>>(executable: &Path, args: &[S]) -> io::Result<Child> {
    const ETXTBSY: i32 = 26;
    let mut attempts = 0;
    loop {
        let spawned = Command::new(executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        match spawned {
            Err(e) if cfg!(unix) && e.raw_os_error() == Some(ETXTBSY) && attempts < 10 => {
                attempts += 1;
                thread::sleep(Duration::from_millis(50));
            }
            other => return other,
        }
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(source: R, sink: LineBuffer) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(source);
        for line in reader.lines() {
            let Ok(line) = line else {
                break;
            };
            let mut lines = sink.lock().unwrap_or_else(|e| e.into_inner());
            if lines.len() >= MAX_CAPTURED_LINES {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    })
}

fn snapshot(buffer: &LineBuffer) -> Vec<String> {
    buffer
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect()
}

fn lock_child(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(|e| e.into_inner())
}
