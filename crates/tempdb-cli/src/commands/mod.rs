// SPDX-License-Identifier: Apache-2.0

//! CLI subcommand declarations and dispatch.

pub mod config;
pub mod locate;
pub mod port;
pub mod template;
pub mod up;

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::Subcommand;
use colored::Colorize;
use tempdb_runtime::ServerSettings;
use tracing::debug;

use crate::paths;

/// Top-level CLI subcommands supported by `tempdb`.
#[derive(Subcommand)]
pub enum Commands {
    /// Start a temporary server and keep it until Enter is pressed
    Up {
        /// Settings file (TOML); defaults to $TEMPDB_HOME/settings.toml
        #[arg(long, value_name = "FILE")]
        settings: Option<PathBuf>,

        /// Preferred port; the next free port above it is used if taken
        #[arg(long)]
        port_hint: Option<u16>,

        /// Clone data from a template folder instead of initializing
        #[arg(long, value_name = "DIR")]
        template: Option<PathBuf>,

        /// Default schema for connections
        #[arg(long)]
        schema: Option<String>,

        /// SQL script run after startup (repeatable; skipped for templates)
        #[arg(long = "script", value_name = "FILE")]
        scripts: Vec<PathBuf>,

        /// Keep the instance folder after shutdown
        #[arg(long)]
        keep: bool,

        /// Print connection details as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build a template folder from scratch for fast future starts
    Template {
        /// Where to write the template
        #[arg(long, value_name = "DIR")]
        out: PathBuf,

        /// Settings file (TOML); defaults to $TEMPDB_HOME/settings.toml
        #[arg(long, value_name = "FILE")]
        settings: Option<PathBuf>,

        /// SQL script baked into the template (repeatable)
        #[arg(long = "script", value_name = "FILE")]
        scripts: Vec<PathBuf>,
    },

    /// Show which mysqld would be used, and its version
    Locate {
        /// Check this binary instead of searching
        #[arg(long, value_name = "PATH")]
        mysqld: Option<PathBuf>,
    },

    /// Print a free TCP port on the loopback interface
    Port {
        /// Lowest acceptable port
        #[arg(long, default_value_t = tempdb_runtime::settings::DEFAULT_RANDOM_PORT_MIN)]
        min: u16,

        /// Highest acceptable port
        #[arg(long, default_value_t = tempdb_runtime::settings::DEFAULT_RANDOM_PORT_MAX)]
        max: u16,

        /// Return the first free port at or above this one
        #[arg(long)]
        hint: Option<u16>,
    },

    /// Print the generated my.cnf
    Config {
        /// Settings file (TOML); defaults to $TEMPDB_HOME/settings.toml
        #[arg(long, value_name = "FILE")]
        settings: Option<PathBuf>,

        /// Render with options MySQL 8 no longer accepts removed
        #[arg(long)]
        mysql8: bool,
    },
}

/// Dispatches a parsed CLI command to its command module.
pub fn execute(command: Commands) {
    match command {
        Commands::Up {
            settings,
            port_hint,
            template,
            schema,
            scripts,
            keep,
            json,
        } => up::execute(up::UpOptions {
            settings,
            port_hint,
            template,
            schema,
            scripts,
            keep,
            json,
        }),
        Commands::Template {
            out,
            settings,
            scripts,
        } => template::execute(&out, settings.as_deref(), &scripts),
        Commands::Locate { mysqld } => locate::execute(mysqld.as_deref()),
        Commands::Port { min, max, hint } => port::execute(min, max, hint),
        Commands::Config { settings, mysql8 } => config::execute(settings.as_deref(), mysql8),
    }
}

/// Prints `message` in the error style and exits with status 1.
pub(crate) fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{} {}", "✗".red().bold(), message);
    process::exit(1);
}

/// Loads settings from `explicit`, or the home settings file if it exists,
/// or defaults.
pub(crate) fn load_settings(explicit: Option<&Path>) -> ServerSettings {
    let file = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => paths::default_settings_path().filter(|p| p.is_file()),
    };

    match &file {
        Some(path) => {
            debug!("loading settings from {}", path.display());
            ServerSettings::from_file(path).unwrap_or_else(|e| fail(e))
        }
        None => ServerSettings::default(),
    }
}

/// Like [`load_settings`], but instances land under the CLI home unless
/// the settings say otherwise.
pub(crate) fn instance_settings(explicit: Option<&Path>) -> ServerSettings {
    let mut settings = load_settings(explicit);
    if settings.base_path.is_none() && settings.database_path.is_none() {
        if let Some(dir) = paths::instances_dir() {
            if let Err(e) = fs::create_dir_all(&dir) {
                fail(format!("Failed to create {}: {e}", dir.display()));
            }
            settings.base_path = Some(dir);
        }
    }
    settings
}

/// Reads every script file, exiting on the first unreadable one.
pub(crate) fn read_scripts(scripts: &[PathBuf]) -> Vec<String> {
    scripts
        .iter()
        .map(|path| {
            fs::read_to_string(path)
                .unwrap_or_else(|e| fail(format!("Failed to read script {}: {e}", path.display())))
        })
        .collect()
}
