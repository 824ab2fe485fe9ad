// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use colored::Colorize;
use tempdb_runtime::locator::{self, LocatorOptions};
use tempdb_runtime::version;
use tempdb_runtime::BinaryCache;

use super::fail;

pub fn execute(mysqld: Option<&Path>) {
    let options = LocatorOptions {
        explicit_path: mysqld.map(Path::to_path_buf),
        allow_path_search: mysqld.is_none(),
        allow_service_search: true,
    };
    let cache = BinaryCache::new();
    let path = match locator::locate(&cache, &options, &|line| tracing::debug!("{line}")) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("{} {e}", "✗".red().bold());
            eprintln!("  Install MySQL or pass {}.", "--mysqld <PATH>".bold());
            std::process::exit(1);
        }
    };

    let version = version::query_version(&path)
        .unwrap_or_else(|e| fail(format!("Found {} but {e}", path.display())));
    println!("{} {}", "✓".green().bold(), path.display());
    println!("  {:<10} {}", "Version:", version);
    println!(
        "  {:<10} {}",
        "Layout:",
        if version.is_8_or_later() {
            "data/ subfolder"
        } else {
            "instance folder"
        }
    );
}
