// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use colored::Colorize;
use tempdb_runtime::TempDb;

use super::{fail, instance_settings, read_scripts};

pub fn execute(out: &Path, settings: Option<&Path>, scripts: &[PathBuf]) {
    if out.exists() {
        fail(format!("{} already exists.", out.display()));
    }
    let mut settings = instance_settings(settings);
    // A template is always built from scratch.
    settings.template_path = None;
    let scripts = read_scripts(scripts);

    println!("{} Building template...", "!".yellow().bold());
    let db = TempDb::start_with_scripts(settings, scripts)
        .unwrap_or_else(|e| fail(format!("Failed to start mysqld: {e}")));
    let snapshot = db.snapshot(Some(out));
    let disposed = db.dispose();

    match snapshot {
        Ok(path) => println!("{} Template written to {}", "✓".green().bold(), path.display()),
        Err(e) => fail(format!("Failed to snapshot instance: {e}")),
    }
    if let Err(e) = disposed {
        eprintln!("{} Failed to clean up instance: {e}", "!".yellow().bold());
    }
    println!(
        "  Use it with {}.",
        format!("tempdb up --template {}", out.display()).bold()
    );
}
