// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use tempdb_runtime::config;

use super::load_settings;

pub fn execute(settings: Option<&Path>, mysql8: bool) {
    let mut mysqld = load_settings(settings).mysqld;
    if mysql8 {
        mysqld = mysqld.without_deprecated_options();
    }
    print!("{}", config::generate(&mysqld));
}
