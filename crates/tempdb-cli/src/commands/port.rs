// SPDX-License-Identifier: Apache-2.0

use tempdb_runtime::ports;

use super::fail;

/// Prints only the port so the output can be captured by scripts.
pub fn execute(min: u16, max: u16, hint: Option<u16>) {
    if min > max {
        fail(format!("--min ({min}) must not exceed --max ({max})"));
    }
    let log = |line: &str| tracing::debug!("{line}");
    let found = match hint {
        Some(hint) => ports::find_first_open_port_from(hint, min.min(hint), max.max(hint), &log),
        None => ports::find_random_open_port(min, max, &log),
    };
    match found {
        Ok(port) => println!("{port}"),
        Err(e) => fail(e),
    }
}
