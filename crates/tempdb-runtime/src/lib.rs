// SPDX-License-Identifier: Apache-2.0

//! Synchronous lifecycle manager for disposable MySQL servers.
//!
//! [`TempDb`] locates an installed `mysqld`, initializes a private data
//! folder (or clones a template), starts the server on a free port and keeps
//! it alive until disposed.

pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod fsutil;
pub mod identity;
pub mod lifecycle;
pub mod locator;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod ports;
pub mod process;
pub mod settings;
pub mod version;

#[cfg(all(test, unix))]
mod testing;

pub use config::MysqldConfig;
pub use driver::{Connection, ConnectionInfo, Driver};
pub use error::{Error, Result};
pub use identity::InstanceId;
pub use lifecycle::{InstanceDetails, LifecycleState, TempDb};
pub use locator::BinaryCache;
#[cfg(feature = "mysql")]
pub use mysql::MySqlDriver;
pub use settings::ServerSettings;
pub use version::ServerVersion;

/// Returns crate version for runtime diagnostics/tests.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
