// SPDX-License-Identifier: Apache-2.0

//! `my.cnf` rendering.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name of the runtime defaults file written into each instance folder.
pub const CONFIG_FILE_NAME: &str = "my.cnf";

/// Name of the server's native error log, relative to the data directory.
pub const ERROR_LOG_FILE_NAME: &str = "mysql-err.log";

/// Options rendered into the `[mysqld]` section of the defaults file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqldConfig {
    pub port: Option<u16>,
    pub bind_address: Option<String>,
    pub character_set_server: String,
    pub collation_server: Option<String>,
    pub sql_mode: String,
    pub default_storage_engine: String,
    pub max_connections: u32,
    pub innodb_buffer_pool_size: String,
    pub innodb_flush_log_at_trx_commit: u8,
    pub lower_case_table_names: Option<u8>,
    pub explicit_defaults_for_timestamp: bool,
    pub skip_name_resolve: bool,
    pub general_log: bool,
    pub slow_query_log: bool,
    pub log_error: String,
    pub secure_file_priv: Option<String>,
    /// Additional raw `key=value` options; an empty value renders a bare flag.
    pub extra: BTreeMap<String, String>,
}

impl Default for MysqldConfig {
    fn default() -> Self {
        MysqldConfig {
            port: None,
            bind_address: Some("127.0.0.1".to_string()),
            character_set_server: "utf8mb4".to_string(),
            collation_server: None,
            sql_mode: "STRICT_TRANS_TABLES,NO_ZERO_IN_DATE,NO_ZERO_DATE,ERROR_FOR_DIVISION_BY_ZERO,NO_AUTO_CREATE_USER,NO_ENGINE_SUBSTITUTION".to_string(),
            default_storage_engine: "InnoDB".to_string(),
            max_connections: 250,
            innodb_buffer_pool_size: "64M".to_string(),
            innodb_flush_log_at_trx_commit: 2,
            lower_case_table_names: None,
            explicit_defaults_for_timestamp: true,
            skip_name_resolve: true,
            general_log: false,
            slow_query_log: false,
            log_error: ERROR_LOG_FILE_NAME.to_string(),
            secure_file_priv: None,
            extra: BTreeMap::new(),
        }
    }
}

impl MysqldConfig {
    /// Drops `sql_mode` flags that MySQL 8 refuses to start with.
    pub fn without_deprecated_options(mut self) -> Self {
        self.sql_mode = self
            .sql_mode
            .split(',')
            .map(str::trim)
            .filter(|mode| !mode.is_empty() && *mode != "NO_AUTO_CREATE_USER")
            .collect::<Vec<_>>()
            .join(",");
        self
    }
}

/// Renders the defaults file text for `config`. Pure; the caller writes it out.
pub fn generate(config: &MysqldConfig) -> String {
    let mut entries: Vec<(String, Option<String>)> = Vec::new();
    let mut push = |key: &str, value: Option<String>| entries.push((key.to_string(), value));

    if let Some(port) = config.port {
        push("port", Some(port.to_string()));
    }
    if let Some(addr) = &config.bind_address {
        push("bind-address", Some(addr.clone()));
    }
    push(
        "character-set-server",
        Some(config.character_set_server.clone()),
    );
    if let Some(collation) = &config.collation_server {
        push("collation-server", Some(collation.clone()));
    }
    push("sql-mode", Some(format!("\"{}\"", config.sql_mode)));
    push(
        "default-storage-engine",
        Some(config.default_storage_engine.clone()),
    );
    push("max_connections", Some(config.max_connections.to_string()));
    push(
        "innodb_buffer_pool_size",
        Some(config.innodb_buffer_pool_size.clone()),
    );
    push(
        "innodb_flush_log_at_trx_commit",
        Some(config.innodb_flush_log_at_trx_commit.to_string()),
    );
    if let Some(lctn) = config.lower_case_table_names {
        push("lower_case_table_names", Some(lctn.to_string()));
    }
    push(
        "explicit_defaults_for_timestamp",
        Some(on_off(config.explicit_defaults_for_timestamp)),
    );
    if config.skip_name_resolve {
        push("skip-name-resolve", None);
    }
    push("general_log", Some(on_off(config.general_log)));
    push("slow_query_log", Some(on_off(config.slow_query_log)));
    push("log-error", Some(config.log_error.clone()));
    if let Some(priv_dir) = &config.secure_file_priv {
        push("secure-file-priv", Some(priv_dir.clone()));
    }
    for (key, value) in &config.extra {
        let value = (!value.is_empty()).then(|| value.clone());
        push(key, value);
    }

    let mut out = String::from("[mysqld]\n");
    for (key, value) in entries {
        match value {
            Some(value) => out.push_str(&format!("{key}={value}\n")),
            None => out.push_str(&format!("{key}\n")),
        }
    }
    out
}

fn on_off(flag: bool) -> String {
    if flag { "ON" } else { "OFF" }.to_string()
}
