// SPDX-License-Identifier: Apache-2.0

//! Instance identity and claiming a running server as ours.
//!
//! Each manager records its id in the server's `sys.sys_config` table. A
//! server that already carries a different id belongs to someone else.

use std::fmt;

use uuid::Uuid;

use crate::driver::Connection;
use crate::error::Result;

pub const MARKER_VARIABLE: &str = "__tempdb_id__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> Self {
        InstanceId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a connected server relates to this manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The server already carries our id (a restart).
    Resumed,
    /// Our id was written into the server.
    Assimilated,
    /// Another manager's server is listening on this port.
    Foreign,
}

pub fn count_marker_sql(id: InstanceId) -> String {
    format!(
        "select count(*) from sys.sys_config where `variable` = '{MARKER_VARIABLE}' and `value` = '{id}'"
    )
}

pub fn adopt_marker_sql(id: InstanceId) -> String {
    format!("update sys.sys_config set `value` = '{id}' where `variable` = '{MARKER_VARIABLE}'")
}

pub fn insert_marker_sql(id: InstanceId) -> String {
    format!(
        "insert into sys.sys_config (`variable`, `value`, set_by) values ('{MARKER_VARIABLE}', '{id}', 'root')"
    )
}

/// Decides who owns the server behind `conn`.
///
/// With `adopt_existing` (first launch of a data folder cloned from a
/// template or snapshot) a marker copied along with the data is overwritten.
/// Otherwise the first successful write wins: if another manager inserted
/// its marker first, our insert fails and the server is reported as foreign.
pub fn resolve_ownership(
    conn: &mut dyn Connection,
    id: InstanceId,
    adopt_existing: bool,
) -> Result<Ownership> {
    if adopt_existing && conn.execute(&adopt_marker_sql(id))? > 0 {
        return Ok(Ownership::Assimilated);
    }

    let matches = conn.query_u64(&count_marker_sql(id))?;
    if matches.first().copied() == Some(1) {
        return Ok(Ownership::Resumed);
    }

    match conn.execute(&insert_marker_sql(id)) {
        Ok(_) => Ok(Ownership::Assimilated),
        Err(_) => Ok(Ownership::Foreign),
    }
}
