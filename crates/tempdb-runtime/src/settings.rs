// SPDX-License-Identifier: Apache-2.0

//! Settings for a temporary server instance.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::MysqldConfig;
use crate::error::{Error, Result};
use crate::locator::BinaryCache;

pub const ENV_MAX_STARTUP_TIME: &str = "MYSQL_MAX_STARTUP_TIME_IN_SECONDS";
pub const ENV_VERBOSE: &str = "TEMPDB_VERBOSE";
pub const ENV_GRACEFUL_SHUTDOWN: &str = "TEMPDB_GRACEFUL_SHUTDOWN";
pub const ENV_BASE_PATH: &str = "TEMPDB_BASE_PATH";

pub const DEFAULT_RANDOM_PORT_MIN: u16 = 13306;
pub const DEFAULT_RANDOM_PORT_MAX: u16 = 53306;

/// Receives every diagnostic line an instance produces.
pub type LogAction = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct ServerSettings {
    /// Start the sequential port search here instead of picking randomly.
    pub port_hint: Option<u16>,
    pub random_port_min: u16,
    pub random_port_max: u16,
    /// Explicit instance folder. Generated under `base_path` when unset.
    pub database_path: Option<PathBuf>,
    /// Parent folder for generated instance folders; the system temp dir by default.
    pub base_path: Option<PathBuf>,
    /// Pre-initialised instance folder to clone instead of bootstrapping.
    pub template_path: Option<PathBuf>,
    pub root_password: String,
    pub default_schema: String,
    pub inactivity_timeout: Option<Duration>,
    pub absolute_lifespan: Option<Duration>,
    pub verbose_logging: bool,
    pub attempt_graceful_shutdown: bool,
    pub path_to_mysqld: Option<PathBuf>,
    /// Search the PATH even when `path_to_mysqld` is set but missing.
    pub force_find_in_path: bool,
    pub allow_service_search: bool,
    pub max_startup_wait: Duration,
    pub max_startup_attempts: u32,
    pub max_port_conflict_retries: u32,
    pub connect_timeout: Duration,
    /// Leave the instance folder on disk after disposal.
    pub preserve_artifacts: bool,
    pub log_port_discovery: bool,
    pub log_action: Option<LogAction>,
    pub binary_cache: Arc<BinaryCache>,
    pub mysqld: MysqldConfig,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            port_hint: None,
            random_port_min: DEFAULT_RANDOM_PORT_MIN,
            random_port_max: DEFAULT_RANDOM_PORT_MAX,
            database_path: None,
            base_path: None,
            template_path: None,
            root_password: "root".to_string(),
            default_schema: "tempdb".to_string(),
            inactivity_timeout: None,
            absolute_lifespan: None,
            verbose_logging: false,
            attempt_graceful_shutdown: true,
            path_to_mysqld: None,
            force_find_in_path: false,
            allow_service_search: true,
            max_startup_wait: Duration::from_secs(45),
            max_startup_attempts: 5,
            max_port_conflict_retries: 5,
            connect_timeout: Duration::from_secs(5),
            preserve_artifacts: false,
            log_port_discovery: false,
            log_action: None,
            binary_cache: Arc::new(BinaryCache::new()),
            mysqld: MysqldConfig::default(),
        }
    }
}

impl fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSettings")
            .field("port_hint", &self.port_hint)
            .field("random_port_min", &self.random_port_min)
            .field("random_port_max", &self.random_port_max)
            .field("database_path", &self.database_path)
            .field("base_path", &self.base_path)
            .field("template_path", &self.template_path)
            .field("default_schema", &self.default_schema)
            .field("inactivity_timeout", &self.inactivity_timeout)
            .field("absolute_lifespan", &self.absolute_lifespan)
            .field("verbose_logging", &self.verbose_logging)
            .field("attempt_graceful_shutdown", &self.attempt_graceful_shutdown)
            .field("path_to_mysqld", &self.path_to_mysqld)
            .field("max_startup_wait", &self.max_startup_wait)
            .field("max_startup_attempts", &self.max_startup_attempts)
            .field("max_port_conflict_retries", &self.max_port_conflict_retries)
            .field("preserve_artifacts", &self.preserve_artifacts)
            .field("log_action", &self.log_action.as_ref().map(|_| "<fn>"))
            .finish_non_exhaustive()
    }
}

impl ServerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port_hint(mut self, port: u16) -> Self {
        self.port_hint = Some(port);
        self
    }

    pub fn with_random_port_range(mut self, min: u16, max: u16) -> Self {
        self.random_port_min = min;
        self.random_port_max = max;
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    pub fn with_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.template_path = Some(path.into());
        self
    }

    pub fn with_root_password(mut self, password: impl Into<String>) -> Self {
        self.root_password = password.into();
        self
    }

    pub fn with_default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = schema.into();
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    pub fn with_absolute_lifespan(mut self, lifespan: Duration) -> Self {
        self.absolute_lifespan = Some(lifespan);
        self
    }

    pub fn with_verbose_logging(mut self, verbose: bool) -> Self {
        self.verbose_logging = verbose;
        self
    }

    pub fn with_graceful_shutdown(mut self, graceful: bool) -> Self {
        self.attempt_graceful_shutdown = graceful;
        self
    }

    pub fn with_mysqld(mut self, path: impl Into<PathBuf>) -> Self {
        self.path_to_mysqld = Some(path.into());
        self
    }

    pub fn with_max_startup_wait(mut self, wait: Duration) -> Self {
        self.max_startup_wait = wait;
        self
    }

    pub fn with_max_startup_attempts(mut self, attempts: u32) -> Self {
        self.max_startup_attempts = attempts;
        self
    }

    pub fn with_max_port_conflict_retries(mut self, retries: u32) -> Self {
        self.max_port_conflict_retries = retries;
        self
    }

    pub fn with_preserve_artifacts(mut self, preserve: bool) -> Self {
        self.preserve_artifacts = preserve;
        self
    }

    pub fn with_log_action<F>(mut self, action: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.log_action = Some(Arc::new(action));
        self
    }

    pub fn with_binary_cache(mut self, cache: Arc<BinaryCache>) -> Self {
        self.binary_cache = cache;
        self
    }

    pub fn with_mysqld_config(mut self, config: MysqldConfig) -> Self {
        self.mysqld = config;
        self
    }

    /// Applies the process environment on top of these settings.
    pub fn with_env_overrides(self) -> Self {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`; unparseable values are ignored.
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secs) = lookup(ENV_MAX_STARTUP_TIME).and_then(|v| v.trim().parse::<u64>().ok()) {
            self.max_startup_wait = Duration::from_secs(secs);
        }
        if let Some(verbose) = lookup(ENV_VERBOSE).as_deref().and_then(parse_flag) {
            self.verbose_logging = verbose;
        }
        if let Some(graceful) = lookup(ENV_GRACEFUL_SHUTDOWN).as_deref().and_then(parse_flag) {
            self.attempt_graceful_shutdown = graceful;
        }
        if let Some(base) = lookup(ENV_BASE_PATH).filter(|v| !v.trim().is_empty()) {
            self.base_path = Some(PathBuf::from(base));
        }
        self
    }

    /// Parses settings from TOML. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: SettingsFile =
            toml::from_str(text).map_err(|e| Error::Settings(e.to_string()))?;
        Ok(file.into_settings(ServerSettings::default()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Settings(format!("unable to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    port_hint: Option<u16>,
    random_port_min: Option<u16>,
    random_port_max: Option<u16>,
    database_path: Option<PathBuf>,
    base_path: Option<PathBuf>,
    template_path: Option<PathBuf>,
    root_password: Option<String>,
    default_schema: Option<String>,
    inactivity_timeout_secs: Option<u64>,
    absolute_lifespan_secs: Option<u64>,
    verbose_logging: Option<bool>,
    attempt_graceful_shutdown: Option<bool>,
    path_to_mysqld: Option<PathBuf>,
    force_find_in_path: Option<bool>,
    allow_service_search: Option<bool>,
    max_startup_wait_secs: Option<u64>,
    max_startup_attempts: Option<u32>,
    max_port_conflict_retries: Option<u32>,
    connect_timeout_secs: Option<u64>,
    preserve_artifacts: Option<bool>,
    log_port_discovery: Option<bool>,
    mysqld: Option<MysqldConfig>,
}

impl SettingsFile {
    fn into_settings(self, mut s: ServerSettings) -> ServerSettings {
        s.port_hint = self.port_hint.or(s.port_hint);
        s.random_port_min = self.random_port_min.unwrap_or(s.random_port_min);
        s.random_port_max = self.random_port_max.unwrap_or(s.random_port_max);
        s.database_path = self.database_path.or(s.database_path);
        s.base_path = self.base_path.or(s.base_path);
        s.template_path = self.template_path.or(s.template_path);
        s.root_password = self.root_password.unwrap_or(s.root_password);
        s.default_schema = self.default_schema.unwrap_or(s.default_schema);
        s.inactivity_timeout = self
            .inactivity_timeout_secs
            .map(Duration::from_secs)
            .or(s.inactivity_timeout);
        s.absolute_lifespan = self
            .absolute_lifespan_secs
            .map(Duration::from_secs)
            .or(s.absolute_lifespan);
        s.verbose_logging = self.verbose_logging.unwrap_or(s.verbose_logging);
        s.attempt_graceful_shutdown = self
            .attempt_graceful_shutdown
            .unwrap_or(s.attempt_graceful_shutdown);
        s.path_to_mysqld = self.path_to_mysqld.or(s.path_to_mysqld);
        s.force_find_in_path = self.force_find_in_path.unwrap_or(s.force_find_in_path);
        s.allow_service_search = self.allow_service_search.unwrap_or(s.allow_service_search);
        if let Some(secs) = self.max_startup_wait_secs {
            s.max_startup_wait = Duration::from_secs(secs);
        }
        s.max_startup_attempts = self.max_startup_attempts.unwrap_or(s.max_startup_attempts);
        s.max_port_conflict_retries = self
            .max_port_conflict_retries
            .unwrap_or(s.max_port_conflict_retries);
        if let Some(secs) = self.connect_timeout_secs {
            s.connect_timeout = Duration::from_secs(secs);
        }
        s.preserve_artifacts = self.preserve_artifacts.unwrap_or(s.preserve_artifacts);
        s.log_port_discovery = self.log_port_discovery.unwrap_or(s.log_port_discovery);
        if let Some(mysqld) = self.mysqld {
            s.mysqld = mysqld;
        }
        s
    }
}
