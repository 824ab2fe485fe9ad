// SPDX-License-Identifier: Apache-2.0

//! Server version detection from `mysqld --version`.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::process::ProcessIo;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Platform string reported after `for`, eg `linux` or `win64`.
    pub platform: Option<String>,
}

impl ServerVersion {
    /// MySQL 8 wants its own empty data folder and drops some legacy options.
    pub fn is_8_or_later(&self) -> bool {
        self.major >= 8
    }

    /// Old Windows builds have no `--initialize` and ship a skeleton data folder instead.
    pub fn needs_manual_initialization(&self) -> bool {
        self.platform
            .as_deref()
            .is_some_and(|p| p.starts_with("win"))
            && self.major <= 5
            && self.minor <= 6
    }

    /// Parses output like `mysqld  Ver 8.0.36 for Linux on x86_64 (MySQL Community Server - GPL)`.
    pub fn parse(output: &str) -> Option<Self> {
        let mut version = None;
        let mut platform = None;
        let mut last = String::new();
        for word in output.split_whitespace() {
            let lower = word.to_lowercase();
            if last == "ver" && version.is_none() {
                version = parse_triplet(&lower);
            } else if last == "for" && platform.is_none() {
                platform = Some(lower.clone());
            }
            last = lower;
        }

        let (major, minor, patch) = version?;
        Some(ServerVersion {
            major,
            minor,
            patch,
            platform,
        })
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(platform) = &self.platform {
            write!(f, " ({platform})")?;
        }
        Ok(())
    }
}

const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Runs `mysqld --version` and parses the result.
pub fn query_version(mysqld: &Path) -> Result<ServerVersion> {
    query_version_within(mysqld, VERSION_QUERY_TIMEOUT)
}

fn query_version_within(mysqld: &Path, timeout: Duration) -> Result<ServerVersion> {
    let mut io = ProcessIo::start(mysqld, &["--version"])?;
    if !io.wait_for_exit(timeout) {
        let _ = io.kill();
        return Err(Error::Initialization(format!(
            "{} did not answer --version within {}s",
            mysqld.display(),
            timeout.as_secs_f32()
        )));
    }
    io.wait()?;
    let output = io.stdout_lines().join("\n");
    ServerVersion::parse(&output).ok_or_else(|| {
        Error::Initialization(format!(
            "unable to determine version of {} from output: {output}",
            mysqld.display()
        ))
    })
}

fn parse_triplet(text: &str) -> Option<(u32, u32, u32)> {
    // Strip suffixes like `-0ubuntu0.22.04.1` or `-log`.
    let numeric = text.split('-').next()?;
    let mut parts = numeric.split('.').map(|p| p.parse::<u32>().ok());
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mysql_8_linux() {
        let v = ServerVersion::parse(
            "/usr/sbin/mysqld  Ver 8.0.36-0ubuntu0.22.04.1 for Linux on x86_64 ((Ubuntu))",
        )
        .unwrap();
        assert_eq!((v.major, v.minor, v.patch), (8, 0, 36));
        assert_eq!(v.platform.as_deref(), Some("linux"));
        assert!(v.is_8_or_later());
        assert!(!v.needs_manual_initialization());
    }

    #[test]
    fn parses_old_windows_build() {
        let v = ServerVersion::parse("mysqld  Ver 5.6.51 for Win64 on x86_64 (MySQL Community Server (GPL))")
            .unwrap();
        assert_eq!((v.major, v.minor), (5, 6));
        assert!(v.needs_manual_initialization());
        assert_eq!(v.to_string(), "5.6.51 (win64)");
    }

    #[test]
    fn rejects_garbage() {
        assert!(ServerVersion::parse("command not found").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn queries_binary() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("mysqld");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"mysqld  Ver 5.7.44 for Linux on x86_64 (MySQL Community Server (GPL))\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let v = query_version(&script).unwrap();
        assert_eq!((v.major, v.minor, v.patch), (5, 7, 44));
        assert!(!v.is_8_or_later());
    }

    #[cfg(unix)]
    #[test]
    fn hanging_binary_times_out() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("mysqld");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 60\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let started = std::time::Instant::now();
        let err = query_version_within(&script, Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, Error::Initialization(ref m) if m.contains("--version")));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
