// SPDX-License-Identifier: Apache-2.0

//! Per-instance diagnostic logs.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::settings::LogAction;

pub const DEBUG_LOG_FILE_NAME: &str = "tempdb-debug.log";
pub const STARTUP_INFO_FILE_NAME: &str = "startup-info.log";

/// Substrings the server writes to its error log when it can't bind its port.
const PORT_CONFLICT_SIGNATURES: &[&str] = &[
    "bind on tcp/ip port",
    "address already in use",
    "do you already have another mysqld server running on port",
];

/// Debug log for one instance.
///
/// Lines always go to `tracing` and the configured log action. When verbose
/// logging is on they are also appended to a file, which starts out in the
/// temp dir and moves into the data folder once that exists.
pub struct DebugLog {
    verbose: bool,
    file: Mutex<PathBuf>,
    action: Option<LogAction>,
}

impl DebugLog {
    pub fn new(verbose: bool, action: Option<LogAction>) -> Self {
        let file = std::env::temp_dir().join(format!("tempdb-debug-{}.log", uuid::Uuid::new_v4()));
        DebugLog {
            verbose,
            file: Mutex::new(file),
            action,
        }
    }

    pub fn log(&self, message: &str) {
        debug!(target: "tempdb", "{message}");
        if let Some(action) = &self.action {
            action(message);
        }
        if !self.verbose {
            return;
        }
        let file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        // Diagnostics must never take the instance down.
        let _ = append_line(&file, message);
    }

    pub fn path(&self) -> PathBuf {
        self.file.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Moves the log into `data_dir`, replacing any copy brought along by a template.
    pub fn relocate(&self, data_dir: &Path) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let target = data_dir.join(DEBUG_LOG_FILE_NAME);
        if *file == target {
            return Ok(());
        }
        if target.exists() {
            fs::remove_file(&target)?;
        }
        if file.exists() {
            fs::create_dir_all(data_dir)?;
            if fs::rename(&*file, &target).is_err() {
                fs::copy(&*file, &target)?;
                let _ = fs::remove_file(&*file);
            }
        }
        *file = target;
        Ok(())
    }
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

/// Records how the server was launched, for post-mortems.
///
/// Retries for a few seconds since the file may be briefly locked by
/// scanners on shared CI machines; gives up silently after that.
pub fn write_startup_info(path: &Path, command_line: &str) {
    for _ in 0..10 {
        if try_write_startup_info(path, command_line).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(500));
    }
}

fn try_write_startup_info(path: &Path, command_line: &str) -> io::Result<()> {
    let mut text = String::from("mysqld started with the following startup info:\n");
    text.push_str(&format!("CLI: {command_line}\n"));
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "(unknown)".to_string());
    text.push_str(&format!("Working directory: {cwd}\n"));
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "(unknown)".to_string());
    text.push_str(&format!("Current user: {user}\n"));
    text.push_str("Environment:\n");
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    vars.sort();
    for (key, value) in vars {
        text.push_str(&format!("  {key} = {value}\n"));
    }
    fs::write(path, text)
}

/// Best-effort check of the server's error log for a failed port bind,
/// looking only at what was written after byte `since`.
///
/// Matching is by English substrings and can miss conflicts reported in
/// other locales or by future server versions.
pub fn looks_like_port_conflict(error_log: &Path, since: u64) -> bool {
    let Ok(bytes) = fs::read(error_log) else {
        return false;
    };
    let start = usize::try_from(since).unwrap_or(usize::MAX).min(bytes.len());
    text_mentions_port_conflict(&String::from_utf8_lossy(&bytes[start..]))
}

/// Current size of the error log, used to ignore earlier attempts' output.
pub fn error_log_len(error_log: &Path) -> u64 {
    fs::metadata(error_log).map(|m| m.len()).unwrap_or(0)
}

pub fn text_mentions_port_conflict(text: &str) -> bool {
    let lower = text.to_lowercase();
    PORT_CONFLICT_SIGNATURES
        .iter()
        .any(|signature| lower.contains(signature))
}

/// Reads the error log for inclusion in error messages.
pub fn read_error_log(error_log: &Path) -> String {
    fs::read_to_string(error_log).unwrap_or_else(|e| format!("(unable to read {}: {e})", error_log.display()))
}
