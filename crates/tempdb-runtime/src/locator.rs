// SPDX-License-Identifier: Apache-2.0

//! Locating the mysqld executable.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::process::ProcessIo;

pub const MYSQLD: &str = "mysqld";

/// Memoised mysqld location shared by every manager handed the same cache.
///
/// Discovery may spawn processes, so lookups are single flight: a second
/// caller waits for the first instead of probing again.
#[derive(Debug, Default)]
pub struct BinaryCache {
    located: Mutex<Option<PathBuf>>,
}

impl BinaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached path, running `discover` only when nothing is cached yet.
    pub fn get_or_try_locate<F>(&self, discover: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Result<PathBuf>,
    {
        let mut located = self.located.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(path) = located.as_ref() {
            return Ok(path.clone());
        }
        let path = discover()?;
        *located = Some(path.clone());
        Ok(path)
    }

    pub fn cached(&self) -> Option<PathBuf> {
        self.located
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Where the locator may look.
#[derive(Debug, Clone, Default)]
pub struct LocatorOptions {
    pub explicit_path: Option<PathBuf>,
    pub allow_path_search: bool,
    pub allow_service_search: bool,
}

/// Finds mysqld: explicit path, then PATH, then the Windows service registry.
///
/// Only discovery results are cached; an explicit path is returned as given.
pub fn locate(cache: &BinaryCache, options: &LocatorOptions, log: &dyn Fn(&str)) -> Result<PathBuf> {
    if let Some(explicit) = &options.explicit_path {
        if explicit.exists() {
            return Ok(explicit.clone());
        }
        let searchable = options.allow_path_search
            || (cfg!(windows) && options.allow_service_search);
        let next = if searchable { "searching instead" } else { "discovery is disabled" };
        log(&format!(
            "configured mysqld path {} does not exist; {next}",
            explicit.display()
        ));
    }

    cache.get_or_try_locate(|| discover(options, log))
}

fn discover(options: &LocatorOptions, log: &dyn Fn(&str)) -> Result<PathBuf> {
    let in_path = if options.allow_path_search {
        log("Looking for mysqld in the PATH...");
        find_in_path(MYSQLD)
    } else {
        None
    };

    if let Some(path) = &in_path {
        log(&format!("Found mysqld in the PATH: {}", path.display()));
        return Ok(path.clone());
    }

    if !cfg!(windows) || !options.allow_service_search {
        log("mysqld discovery is limited to the PATH on this platform");
        return Err(Error::BinaryNotFound);
    }

    let from_service = find_service_binary("mysql");
    log(&format!(
        "mysqld from service registry: {}",
        from_service
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not found)".to_string())
    ));
    from_service.ok_or(Error::BinaryNotFound)
}

/// Searches the PATH for `name`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

/// Finds a tool that ships alongside mysqld (eg mysqldump), falling back to the PATH.
pub fn locate_sibling_tool(mysqld: &Path, tool: &str) -> Result<PathBuf> {
    let file_name = if cfg!(windows) {
        format!("{tool}.exe")
    } else {
        tool.to_string()
    };
    if let Some(candidate) = mysqld.parent().map(|dir| dir.join(&file_name)) {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    find_in_path(tool).ok_or_else(|| Error::ToolNotFound {
        tool: tool.to_string(),
        mysqld: mysqld.to_path_buf(),
    })
}

/// Asks the Windows service control manager for a service whose name
/// contains `needle` and extracts the executable from its start command.
fn find_service_binary(needle: &str) -> Option<PathBuf> {
    let listing = run_service_control(&["query", "state=", "all"])?;
    let service = first_service_matching(&listing, needle)?;
    let config = run_service_control(&["qc", &service])?;
    binary_path_from_service_config(&config).map(PathBuf::from)
}

fn run_service_control(args: &[&str]) -> Option<Vec<String>> {
    let mut io = ProcessIo::start(Path::new("sc"), args).ok()?;
    io.wait().ok()?;
    Some(io.stdout_lines())
}

/// Picks the first `SERVICE_NAME:` entry containing `needle` (case-insensitive).
pub(crate) fn first_service_matching(lines: &[String], needle: &str) -> Option<String> {
    let needle = needle.to_lowercase();
    lines.iter().find_map(|line| {
        let trimmed = line.trim();
        let lower = trimmed.to_lowercase();
        if !lower.starts_with("service_name") || !lower.contains(&needle) {
            return None;
        }
        trimmed
            .split_once(':')
            .map(|(_, name)| name.trim().to_string())
            .filter(|name| !name.is_empty())
    })
}

/// Extracts the executable from a `BINARY_PATH_NAME` line of `sc qc` output.
pub(crate) fn binary_path_from_service_config(lines: &[String]) -> Option<String> {
    let command_line = lines.iter().find_map(|line| {
        let trimmed = line.trim();
        if !trimmed.starts_with("BINARY_PATH_NAME") {
            return None;
        }
        trimmed.split_once(':').map(|(_, rest)| rest.trim())
    })?;

    if let Some(quoted) = command_line.strip_prefix('"') {
        return quoted.split('"').next().map(str::to_string);
    }
    command_line.split(' ').next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn quiet(_: &str) {}

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn explicit_existing_path_wins_without_caching() {
        let tmp = tempfile::tempdir().unwrap();
        let mysqld = tmp.path().join("mysqld");
        std::fs::write(&mysqld, "").unwrap();
        let cache = BinaryCache::new();
        let options = LocatorOptions {
            explicit_path: Some(mysqld.clone()),
            ..LocatorOptions::default()
        };
        assert_eq!(locate(&cache, &options, &quiet).unwrap(), mysqld);
        assert!(cache.cached().is_none());
    }

    #[test]
    fn nothing_enabled_is_not_found() {
        let cache = BinaryCache::new();
        let options = LocatorOptions {
            explicit_path: Some(PathBuf::from("/no/such/mysqld")),
            allow_path_search: false,
            allow_service_search: false,
        };
        let seen = std::cell::RefCell::new(Vec::new());
        let err = locate(&cache, &options, &|line| seen.borrow_mut().push(line.to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::BinaryNotFound));
        let seen = seen.into_inner();
        assert!(seen[0].ends_with("does not exist; discovery is disabled"));
        assert!(!seen.iter().any(|line| line.contains("searching")));
    }

    #[test]
    fn cache_runs_discovery_once() {
        let cache = BinaryCache::new();
        let calls = Cell::new(0);
        for _ in 0..3 {
            let found = cache
                .get_or_try_locate(|| {
                    calls.set(calls.get() + 1);
                    Ok(PathBuf::from("/opt/mysql/bin/mysqld"))
                })
                .unwrap();
            assert_eq!(found, PathBuf::from("/opt/mysql/bin/mysqld"));
        }
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn failed_discovery_is_not_cached() {
        let cache = BinaryCache::new();
        assert!(cache.get_or_try_locate(|| Err(Error::BinaryNotFound)).is_err());
        let found = cache
            .get_or_try_locate(|| Ok(PathBuf::from("/usr/sbin/mysqld")))
            .unwrap();
        assert_eq!(found, PathBuf::from("/usr/sbin/mysqld"));
    }

    #[test]
    fn parses_service_listing() {
        let listing = lines(
            "SERVICE_NAME: AudioSrv\nDISPLAY_NAME: Windows Audio\n\nSERVICE_NAME: MySQL80\nDISPLAY_NAME: MySQL80\n",
        );
        assert_eq!(
            first_service_matching(&listing, "mysql").as_deref(),
            Some("MySQL80")
        );
        assert!(first_service_matching(&listing, "redis").is_none());
    }

    #[test]
    fn parses_quoted_binary_path() {
        let config = lines(
            "[SC] QueryServiceConfig SUCCESS\n\nSERVICE_NAME: MySQL80\n        BINARY_PATH_NAME   : \"C:\\Program Files\\MySQL\\MySQL Server 8.0\\bin\\mysqld.exe\" --defaults-file=\"C:\\ProgramData\\my.ini\" MySQL80\n",
        );
        assert_eq!(
            binary_path_from_service_config(&config).as_deref(),
            Some("C:\\Program Files\\MySQL\\MySQL Server 8.0\\bin\\mysqld.exe")
        );
    }

    #[test]
    fn parses_unquoted_binary_path() {
        let config = lines("        BINARY_PATH_NAME   : C:\\mysql\\bin\\mysqld.exe MySQL57\n");
        assert_eq!(
            binary_path_from_service_config(&config).as_deref(),
            Some("C:\\mysql\\bin\\mysqld.exe")
        );
    }

    #[test]
    fn sibling_tool_found_next_to_mysqld() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = tmp.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let tool = if cfg!(windows) { "mysqldump.exe" } else { "mysqldump" };
        std::fs::write(bin.join(tool), "").unwrap();
        let found = locate_sibling_tool(&bin.join("mysqld"), "mysqldump").unwrap();
        assert_eq!(found, bin.join(tool));
    }
}
