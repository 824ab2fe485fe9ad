// SPDX-License-Identifier: Apache-2.0

//! Error kinds surfaced by the runtime.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No mysqld could be found via settings, PATH or the service registry.
    #[error(
        "unable to detect an installed mysqld: supply a path in the settings, put mysqld in your PATH{}",
        if cfg!(windows) { " or install it as a windows service" } else { "" }
    )]
    BinaryNotFound,

    /// A companion tool (eg mysqldump) could not be found.
    #[error("unable to find {tool} next to {} or in the PATH", .mysqld.display())]
    ToolNotFound { tool: String, mysqld: PathBuf },

    #[error("{tool} failed with exit code {code:?}: {stderr}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to start process: {command}: {source}")]
    ProcessStart {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("can't find a port to listen on between {min} and {max}")]
    NoPortAvailable { min: u16, max: u16 },

    /// The server never became reachable and retries are exhausted.
    #[error(
        "{message}; please check logging in {}\nerror log: {}\nstdout: {stdout}\nstderr: {stderr}",
        .data_dir.display(),
        .error_log.display()
    )]
    FatalInit {
        message: String,
        stdout: String,
        stderr: String,
        data_dir: PathBuf,
        error_log: PathBuf,
    },

    /// The one-time data directory initialisation failed.
    #[error("unable to initialize mysql data directory:\n{0}")]
    Initialization(String),

    #[error("this instance has already been disposed")]
    Disposed,

    #[error("cannot reach the database: server is not running right now")]
    NotRunning,

    #[error("mysqld (pid {pid}) is still running after being killed")]
    StillRunning { pid: u32 },

    #[error("database driver error: {0}")]
    Driver(String),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error was produced by the fatal initialisation path.
    pub fn is_fatal_init(&self) -> bool {
        matches!(self, Error::FatalInit { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_init_message_carries_diagnostics() {
        let err = Error::FatalInit {
            message: "mysqld doesn't want to start up".to_string(),
            stdout: "out".to_string(),
            stderr: "boom".to_string(),
            data_dir: PathBuf::from("/tmp/db"),
            error_log: PathBuf::from("/tmp/db/data/mysql-err.log"),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("/tmp/db/data/mysql-err.log"));
        assert!(rendered.contains("stderr: boom"));
        assert!(err.is_fatal_init());
    }

    #[test]
    fn io_errors_convert() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_fatal_init());
    }
}
