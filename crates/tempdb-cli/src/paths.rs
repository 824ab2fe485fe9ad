// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

pub fn tempdb_home() -> Option<PathBuf> {
    // Allow override via TEMPDB_HOME for testing
    if let Ok(home) = std::env::var("TEMPDB_HOME") {
        return Some(PathBuf::from(home));
    }
    dirs::home_dir().map(|h| h.join(".tempdb"))
}

/// Settings used when no `--settings` file is given, if present.
pub fn default_settings_path() -> Option<PathBuf> {
    tempdb_home().map(|h| h.join("settings.toml"))
}

/// Parent folder for instances started from the CLI.
pub fn instances_dir() -> Option<PathBuf> {
    tempdb_home().map(|h| h.join("instances"))
}
