// SPDX-License-Identifier: Apache-2.0

use std::io::{self, BufRead};
use std::path::PathBuf;

use colored::Colorize;
use serde::Serialize;
use tempdb_runtime::{ConnectionInfo, InstanceDetails, LifecycleState, TempDb};

use super::{fail, instance_settings, read_scripts};

pub struct UpOptions {
    pub settings: Option<PathBuf>,
    pub port_hint: Option<u16>,
    pub template: Option<PathBuf>,
    pub schema: Option<String>,
    pub scripts: Vec<PathBuf>,
    pub keep: bool,
    pub json: bool,
}

#[derive(Serialize)]
struct UpReport<'a> {
    state: LifecycleState,
    connection: &'a ConnectionInfo,
    connection_string: String,
    url: String,
    instance: &'a InstanceDetails,
}

pub fn execute(options: UpOptions) {
    let mut settings = instance_settings(options.settings.as_deref());
    if let Some(port) = options.port_hint {
        settings = settings.with_port_hint(port);
    }
    if let Some(template) = options.template {
        if !template.is_dir() {
            fail(format!("Template {} is not a directory.", template.display()));
        }
        settings = settings.with_template(template);
    }
    if let Some(schema) = options.schema {
        settings = settings.with_default_schema(schema);
    }
    if options.keep {
        settings = settings.with_preserve_artifacts(true);
    }
    let scripts = read_scripts(&options.scripts);

    if !options.json {
        println!("{} Starting mysqld...", "!".yellow().bold());
    }
    let db = TempDb::start_with_scripts(settings, scripts)
        .unwrap_or_else(|e| fail(format!("Failed to start mysqld: {e}")));
    let info = db
        .connection_info()
        .unwrap_or_else(|e| fail(format!("Server is not usable: {e}")));

    if options.json {
        let report = UpReport {
            state: db.state(),
            connection: &info,
            connection_string: info.connection_string(),
            url: info.url(),
            instance: db.details(),
        };
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(e) => fail(format!("Failed to render JSON: {e}")),
        }
    } else {
        print_details(&db, &info);
    }

    // Runs until Enter or end of input.
    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);

    let path = db.database_path().to_path_buf();
    if let Err(e) = db.dispose() {
        fail(format!("Failed to shut down cleanly: {e}"));
    }
    if !options.json {
        if options.keep {
            println!("{} Stopped; files kept at {}", "✓".green().bold(), path.display());
        } else {
            println!("{} Stopped and removed.", "✓".green().bold());
        }
    }
}

fn print_details(db: &TempDb, info: &ConnectionInfo) {
    let details = db.details();
    println!(
        "{} mysqld {} running on port {}\n",
        "✓".green().bold(),
        details.version,
        info.port.to_string().cyan()
    );
    println!("  {:<14} {}", "Instance:", details.instance_id);
    println!("  {:<14} {}", "Folder:", details.database_path.display());
    println!("  {:<14} {}", "Binary:", details.mysqld.display());
    if details.from_template {
        println!("  {:<14} {}", "Source:", "template".cyan());
    }
    println!("  {:<14} {}", "Schema:", info.schema);
    println!("  {:<14} {}", "URL:", info.url().bold());
    println!("  {:<14} {}", "Connection:", info.connection_string());
    println!("\n  Press {} to stop.", "Enter".bold());
}
