// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of one temporary server instance.
//!
//! A supervisor thread owns the server process and all lifecycle state.
//! [`TempDb`] is a handle that sends it commands. For every server it starts,
//! the supervisor runs a watcher thread that reports unexpected exits back
//! over the same channel, so the supervisor stays the only writer of the
//! process handle.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{self, MysqldConfig, CONFIG_FILE_NAME, ERROR_LOG_FILE_NAME};
use crate::diagnostics::{self, DebugLog, DEBUG_LOG_FILE_NAME, STARTUP_INFO_FILE_NAME};
use crate::driver::{client_connection_ids, Connection, ConnectionInfo, Driver};
use crate::error::{Error, Result};
use crate::fsutil;
use crate::identity::{self, InstanceId, Ownership};
use crate::locator::{self, LocatorOptions};
use crate::ports;
use crate::process::ProcessIo;
use crate::settings::ServerSettings;
use crate::version::{self, ServerVersion};

const WATCH_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const GRACEFUL_STOP_WAIT: Duration = Duration::from_secs(5);
const FORCED_STOP_WAIT: Duration = Duration::from_secs(3);
const MIN_AUTO_DISPOSE_TICK: Duration = Duration::from_millis(10);
const MAX_AUTO_DISPOSE_TICK: Duration = Duration::from_secs(1);

const ADMIN_SCHEMA: &str = "mysql";
const ROOT_USER: &str = "root";

/// Files left out of snapshots; they describe the instance that wrote them.
const VOLATILE_FILES: &[&str] = &[
    ERROR_LOG_FILE_NAME,
    STARTUP_INFO_FILE_NAME,
    DEBUG_LOG_FILE_NAME,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Starting,
    VerifyingConnectivity,
    Running,
    Restarting,
    StoppingGraceful,
    StoppingForced,
    Stopped,
    Disposed,
    FatalInitFailure,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Starting => "starting",
            LifecycleState::VerifyingConnectivity => "verifying connectivity",
            LifecycleState::Running => "running",
            LifecycleState::Restarting => "restarting",
            LifecycleState::StoppingGraceful => "stopping (graceful)",
            LifecycleState::StoppingForced => "stopping (forced)",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Disposed => "disposed",
            LifecycleState::FatalInitFailure => "fatal init failure",
        };
        f.write_str(name)
    }
}

/// Facts about an instance that never change once it has started.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceDetails {
    #[serde(serialize_with = "serialize_display")]
    pub instance_id: InstanceId,
    pub mysqld: PathBuf,
    #[serde(serialize_with = "serialize_display")]
    pub version: ServerVersion,
    pub database_path: PathBuf,
    pub data_dir: PathBuf,
    pub from_template: bool,
}

fn serialize_display<T: fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// What became of one attempt to bring the server up.
#[derive(Debug)]
enum StartupOutcome {
    Connected,
    /// Something else owns the port; try another.
    PortConflict,
    StartupFailed(String),
}

enum Command {
    ProcessExited {
        generation: u64,
    },
    SwitchSchema {
        schema: String,
        reply: Sender<Result<()>>,
    },
    Restart {
        reply: Sender<Result<()>>,
    },
    Snapshot {
        target: Option<PathBuf>,
        reply: Sender<Result<PathBuf>>,
    },
    Dispose {
        reply: Sender<Result<()>>,
    },
}

/// Read model published by the supervisor for the handle.
struct Status {
    state: LifecycleState,
    port: u16,
    pid: Option<u32>,
    schema: String,
    root_password_set: bool,
    last_activity: Instant,
}

struct Shared {
    status: Mutex<Status>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }
}

/// Credentials and client options shared by the handle and the supervisor.
#[derive(Clone)]
struct ClientOptions {
    root_password: String,
    character_set: String,
    connect_timeout: Duration,
}

impl ClientOptions {
    fn info(&self, port: u16, root_password_set: bool, schema: &str) -> ConnectionInfo {
        ConnectionInfo {
            host: "localhost".to_string(),
            port,
            user: ROOT_USER.to_string(),
            password: if root_password_set {
                self.root_password.clone()
            } else {
                String::new()
            },
            schema: schema.to_string(),
            character_set: self.character_set.clone(),
            connect_timeout: self.connect_timeout,
        }
    }
}

/// A running temporary MySQL server. Dropping it disposes the instance.
pub struct TempDb {
    commands: Sender<Command>,
    shared: Arc<Shared>,
    driver: Arc<dyn Driver>,
    log: Arc<DebugLog>,
    client: ClientOptions,
    details: InstanceDetails,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    disposed: Mutex<bool>,
}

impl fmt::Debug for TempDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempDb")
            .field("details", &self.details)
            .field("state", &self.state())
            .field("port", &self.port())
            .finish_non_exhaustive()
    }
}

impl TempDb {
    /// Starts a server with the default `mysql_async` connector.
    #[cfg(feature = "mysql")]
    pub fn start(settings: ServerSettings) -> Result<Self> {
        Self::start_with_scripts(settings, Vec::new())
    }

    /// Starts a server and runs `creation_scripts` against the default schema.
    /// Scripts are skipped when the instance is cloned from a template.
    #[cfg(feature = "mysql")]
    pub fn start_with_scripts(settings: ServerSettings, creation_scripts: Vec<String>) -> Result<Self> {
        let driver = Arc::new(crate::mysql::MySqlDriver::new()?);
        Self::start_with_driver(settings, creation_scripts, driver)
    }

    pub fn start_with_driver(
        settings: ServerSettings,
        creation_scripts: Vec<String>,
        driver: Arc<dyn Driver>,
    ) -> Result<Self> {
        let settings = settings.with_env_overrides();
        let log = Arc::new(DebugLog::new(
            settings.verbose_logging,
            settings.log_action.clone(),
        ));
        let client = ClientOptions {
            root_password: settings.root_password.clone(),
            character_set: settings.mysqld.character_set_server.clone(),
            connect_timeout: settings.connect_timeout,
        };
        let shared = Arc::new(Shared {
            status: Mutex::new(Status {
                state: LifecycleState::Uninitialized,
                port: 0,
                pid: None,
                schema: String::new(),
                root_password_set: false,
                last_activity: Instant::now(),
            }),
        });

        let (commands, inbox) = mpsc::channel();
        let (ready, started) = mpsc::channel();
        let supervisor = Supervisor::new(
            settings,
            creation_scripts,
            Arc::clone(&driver),
            Arc::clone(&log),
            Arc::clone(&shared),
            commands.clone(),
            client.clone(),
        );
        let thread = thread::Builder::new()
            .name("tempdb-supervisor".to_string())
            .spawn(move || supervisor.run(inbox, ready))?;

        let details = match started.recv() {
            Ok(Ok(details)) => details,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::Initialization(
                    "supervisor thread exited during startup".to_string(),
                ));
            }
        };

        info!(
            target: "tempdb",
            "mysqld {} running on port {} from {}",
            details.version,
            shared.lock().port,
            details.database_path.display()
        );

        Ok(TempDb {
            commands,
            shared,
            driver,
            log,
            client,
            details,
            supervisor: Mutex::new(Some(thread)),
            disposed: Mutex::new(false),
        })
    }

    pub fn details(&self) -> &InstanceDetails {
        &self.details
    }

    pub fn instance_id(&self) -> InstanceId {
        self.details.instance_id
    }

    pub fn database_path(&self) -> &Path {
        &self.details.database_path
    }

    pub fn data_dir(&self) -> &Path {
        &self.details.data_dir
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lock().state
    }

    pub fn port(&self) -> u16 {
        self.shared.lock().port
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.lock().pid
    }

    /// The schema new connections use.
    pub fn schema(&self) -> String {
        self.shared.lock().schema.clone()
    }

    pub fn root_password_set(&self) -> bool {
        self.shared.lock().root_password_set
    }

    /// Path of the per-instance debug log (only written with verbose logging).
    pub fn debug_log_path(&self) -> PathBuf {
        self.log.path()
    }

    /// Connection details for the active schema.
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        self.ensure_live()?;
        let status = self.shared.lock();
        if status.state != LifecycleState::Running {
            return Err(Error::NotRunning);
        }
        let info = self
            .client
            .info(status.port, status.root_password_set, &status.schema);
        drop(status);
        self.shared.touch();
        Ok(info)
    }

    pub fn connection_string(&self) -> Result<String> {
        Ok(self.connection_info()?.connection_string())
    }

    pub fn open_connection(&self) -> Result<Box<dyn Connection>> {
        let info = self.connection_info()?;
        self.driver.connect(&info)
    }

    /// Runs a statement against the active schema.
    pub fn execute(&self, sql: &str) -> Result<u64> {
        self.open_connection()?.execute(sql)
    }

    pub fn create_schema_if_not_exists(&self, schema: &str) -> Result<()> {
        self.execute(&create_schema_sql(schema)).map(|_| ())
    }

    /// Makes `schema` the default for new connections, creating it if needed.
    /// An empty name leaves connections schemaless.
    pub fn switch_to_schema(&self, schema: &str) -> Result<()> {
        self.request(|reply| Command::SwitchSchema {
            schema: schema.to_string(),
            reply,
        })
    }

    /// Creates a user reachable from any host with full rights on `schemas`.
    pub fn create_user(&self, user: &str, password: &str, schemas: &[&str]) -> Result<()> {
        let mut conn = self.open_connection()?;
        conn.execute(&format!(
            "create user {}@'%' identified by {}",
            quote(user),
            quote(password)
        ))?;
        for schema in schemas {
            conn.execute(&grant_all_sql(user, schema, "%"))?;
        }
        Ok(())
    }

    pub fn grant_all_permissions_for(&self, user: &str, schema: &str, host: &str) -> Result<()> {
        self.execute(&grant_all_sql(user, schema, host)).map(|_| ())
    }

    /// Dumps the active schema with the `mysqldump` shipped next to mysqld.
    pub fn dump_schema(&self) -> Result<String> {
        let info = self.connection_info()?;
        let tool = locator::locate_sibling_tool(&self.details.mysqld, "mysqldump")?;
        let args = vec![
            "-u".to_string(),
            info.user.clone(),
            format!("--password={}", info.password),
            "-h".to_string(),
            info.host.clone(),
            "-P".to_string(),
            info.port.to_string(),
            "--protocol".to_string(),
            "TCP".to_string(),
            info.schema.clone(),
        ];
        let mut io = ProcessIo::start(&tool, &args)?;
        let status = io.wait()?;
        if !status.success() {
            return Err(Error::ToolFailed {
                tool: tool.display().to_string(),
                code: status.code(),
                stderr: io.stderr_lines().join("\n"),
            });
        }
        Ok(io.stdout_lines().join("\n"))
    }

    /// Kills every client connection except the one used to do so.
    pub fn close_all_connections(&self) -> Result<()> {
        let info = self.connection_info()?.with_schema(ADMIN_SCHEMA);
        let log = Arc::clone(&self.log);
        kill_other_connections(self.driver.as_ref(), &info, &|line| log.log(line))
    }

    /// Stops and starts the server again on the same port.
    pub fn restart(&self) -> Result<()> {
        self.request(|reply| Command::Restart { reply })
    }

    /// Copies the instance folder to `target` (or a generated sibling folder)
    /// while the server is briefly stopped; the copy can be used as a template.
    pub fn snapshot(&self, target: Option<&Path>) -> Result<PathBuf> {
        self.request(|reply| Command::Snapshot {
            target: target.map(Path::to_path_buf),
            reply,
        })
    }

    /// Stops the server and removes its files. Calling it again does nothing.
    pub fn dispose(&self) -> Result<()> {
        let mut disposed = self.disposed.lock().unwrap_or_else(|e| e.into_inner());
        if *disposed {
            return Ok(());
        }
        *disposed = true;

        let (reply, response) = mpsc::channel();
        let result = match self.commands.send(Command::Dispose { reply }) {
            Ok(()) => response.recv().unwrap_or(Ok(())),
            // The supervisor already disposed the instance on its own.
            Err(_) => Ok(()),
        };
        let thread = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
        result
    }

    fn ensure_live(&self) -> Result<()> {
        let disposed = *self.disposed.lock().unwrap_or_else(|e| e.into_inner());
        if disposed || self.state() == LifecycleState::Disposed {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn request<T>(&self, command: impl FnOnce(Sender<Result<T>>) -> Command) -> Result<T> {
        self.ensure_live()?;
        let (reply, response) = mpsc::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| Error::Disposed)?;
        response.recv().map_err(|_| Error::Disposed)?
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(target: "tempdb", "error disposing {}: {e}", self.details.database_path.display());
        }
    }
}

struct Watcher {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct Supervisor {
    settings: ServerSettings,
    creation_scripts: Vec<String>,
    driver: Arc<dyn Driver>,
    log: Arc<DebugLog>,
    shared: Arc<Shared>,
    events: Sender<Command>,
    client: ClientOptions,
    instance_id: InstanceId,
    mysqld: PathBuf,
    version: ServerVersion,
    database_path: PathBuf,
    data_dir: PathBuf,
    port: u16,
    process: Option<ProcessIo>,
    watcher: Option<Watcher>,
    generation: u64,
    state: LifecycleState,
    schema: String,
    root_password_set: bool,
    /// Overwrite an existing marker on the next connection. Only set for a
    /// data folder cloned from a template, until its first connection or
    /// its first port conflict.
    adopt_marker: bool,
    start_attempts: u32,
    port_conflicts: u32,
    keep_artifacts: bool,
    started_at: Instant,
    disposed: bool,
}

impl Supervisor {
    fn new(
        settings: ServerSettings,
        creation_scripts: Vec<String>,
        driver: Arc<dyn Driver>,
        log: Arc<DebugLog>,
        shared: Arc<Shared>,
        events: Sender<Command>,
        client: ClientOptions,
    ) -> Self {
        let instance_id = InstanceId::new();
        let database_path = settings.database_path.clone().unwrap_or_else(|| {
            settings
                .base_path
                .clone()
                .unwrap_or_else(std::env::temp_dir)
                .join(format!("tempdb-{instance_id}"))
        });
        Supervisor {
            settings,
            creation_scripts,
            driver,
            log,
            shared,
            events,
            client,
            instance_id,
            mysqld: PathBuf::new(),
            version: ServerVersion::default(),
            data_dir: database_path.clone(),
            database_path,
            port: 0,
            process: None,
            watcher: None,
            generation: 0,
            state: LifecycleState::Uninitialized,
            schema: String::new(),
            root_password_set: false,
            adopt_marker: false,
            start_attempts: 0,
            port_conflicts: 0,
            keep_artifacts: false,
            started_at: Instant::now(),
            disposed: false,
        }
    }

    fn run(mut self, inbox: Receiver<Command>, ready: Sender<Result<InstanceDetails>>) {
        match self.bootstrap() {
            Ok(details) => {
                let _ = ready.send(Ok(details));
            }
            Err(e) => {
                self.abandon(&e);
                let _ = ready.send(Err(e));
                return;
            }
        }

        loop {
            if let Some(reason) = self.auto_dispose_reason() {
                info!(target: "tempdb", "{reason}; disposing {}", self.database_path.display());
                self.log(&format!("{reason}; disposing"));
                if let Err(e) = self.dispose() {
                    warn!(target: "tempdb", "auto-dispose failed: {e}");
                }
                return;
            }

            let command = match self.auto_dispose_tick() {
                Some(tick) => match inbox.recv_timeout(tick) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                },
                None => match inbox.recv() {
                    Ok(command) => command,
                    Err(_) => return,
                },
            };

            match command {
                Command::ProcessExited { generation } => self.on_process_exited(generation),
                Command::SwitchSchema { schema, reply } => {
                    let _ = reply.send(self.switch_schema(&schema));
                }
                Command::Restart { reply } => {
                    let _ = reply.send(self.restart());
                }
                Command::Snapshot { target, reply } => {
                    let _ = reply.send(self.snapshot(target));
                }
                Command::Dispose { reply } => {
                    let _ = reply.send(self.dispose());
                    return;
                }
            }
        }
    }

    fn bootstrap(&mut self) -> Result<InstanceDetails> {
        self.set_state(LifecycleState::Initializing);
        self.log(&format!(
            "instance {} lives at {}",
            self.instance_id,
            self.database_path.display()
        ));
        self.mysqld = self.locate_mysqld()?;
        self.version = version::query_version(&self.mysqld)?;
        self.log(&format!("mysqld is version {}", self.version));
        if self.version.is_8_or_later() {
            // mysql 8 wants a clean folder to initialize in
            self.data_dir = self.database_path.join("data");
        }

        let mut mysqld_config = self.settings.mysqld.clone();
        if self.version.is_8_or_later() {
            mysqld_config = mysqld_config.without_deprecated_options();
        }

        let template = self.settings.template_path.clone().filter(|p| p.is_dir());
        if let Some(template) = &template {
            self.log(&format!("re-using data from template {}", template.display()));
            fsutil::remove_dir_all(&self.database_path)?;
            fsutil::copy_dir(template, &self.database_path)?;
            self.root_password_set = true;
            self.adopt_marker = true;
        } else {
            if let Some(missing) = &self.settings.template_path {
                self.log(&format!(
                    "template {} not found; initializing from scratch",
                    missing.display()
                ));
            }
            self.initialize_data_dir(&mysqld_config)?;
        }

        if let Err(e) = self.log.relocate(&self.data_dir) {
            self.log(&format!("unable to move debug log into {}: {e}", self.data_dir.display()));
        }

        let config_path = self.database_path.join(CONFIG_FILE_NAME);
        self.log(&format!("writing runtime defaults file to {}", config_path.display()));
        fs::write(&config_path, config::generate(&mysqld_config))?;

        self.port = self.initial_port()?;
        self.start_server()?;
        if !self.root_password_set {
            self.set_root_password()?;
        }
        let default_schema = self.settings.default_schema.clone();
        self.switch_schema(&default_schema)?;
        if template.is_none() {
            self.run_creation_scripts()?;
        }

        self.started_at = Instant::now();
        self.shared.touch();
        Ok(InstanceDetails {
            instance_id: self.instance_id,
            mysqld: self.mysqld.clone(),
            version: self.version.clone(),
            database_path: self.database_path.clone(),
            data_dir: self.data_dir.clone(),
            from_template: template.is_some(),
        })
    }

    fn locate_mysqld(&self) -> Result<PathBuf> {
        let options = LocatorOptions {
            explicit_path: self.settings.path_to_mysqld.clone(),
            allow_path_search: self.settings.path_to_mysqld.is_none()
                || self.settings.force_find_in_path,
            allow_service_search: self.settings.allow_service_search,
        };
        let log = Arc::clone(&self.log);
        locator::locate(&self.settings.binary_cache, &options, &|line| log.log(line))
    }

    fn basedir(&self) -> PathBuf {
        self.mysqld
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn error_log_path(&self) -> PathBuf {
        self.data_dir.join(ERROR_LOG_FILE_NAME)
    }

    fn initialize_data_dir(&mut self, mysqld_config: &MysqldConfig) -> Result<()> {
        self.log("creating initial database");
        fsutil::remove_dir_all(&self.database_path)?;
        fs::create_dir_all(&self.database_path)?;

        if self.version.needs_manual_initialization() {
            let skeleton = self.basedir().join("data");
            self.log(&format!("copying skeleton data folder from {}", skeleton.display()));
            fsutil::copy_dir(&skeleton, &self.data_dir)?;
            return Ok(());
        }

        // The data folder must be empty for --initialize, so the init-only
        // defaults file lives in a scratch folder.
        let parent = self
            .database_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let scratch = tempfile::Builder::new()
            .prefix("tempdb-init-")
            .tempdir_in(&parent)?;
        let defaults = scratch.path().join(CONFIG_FILE_NAME);
        fs::write(&defaults, config::generate(mysqld_config))?;

        let args = vec![
            format!("--defaults-file={}", defaults.display()),
            format!("--basedir={}", self.basedir().display()),
            format!("--datadir={}", self.data_dir.display()),
            "--initialize-insecure".to_string(),
        ];
        let mut io = ProcessIo::start(&self.mysqld, &args)?;
        self.log(&format!("initializing: {}", io.command_line()));
        let status = io.wait()?;
        if !status.success() {
            self.keep_artifacts = true;
            return Err(Error::Initialization(format!(
                "{} exited with {status}\nstderr:\n{}\nerror log:\n{}",
                io.command_line(),
                io.stderr_lines().join("\n"),
                diagnostics::read_error_log(&self.error_log_path())
            )));
        }
        Ok(())
    }

    fn port_range(&self) -> (u16, u16) {
        let (min, max) = (self.settings.random_port_min, self.settings.random_port_max);
        match self.settings.port_hint {
            Some(hint) => (min.min(hint), max.max(hint)),
            None => (min, max),
        }
    }

    fn initial_port(&self) -> Result<u16> {
        let (min, max) = self.port_range();
        let log = |line: &str| self.log_port_discovery(line);
        match self.settings.port_hint {
            Some(hint) => ports::find_first_open_port_from(hint, min, max, &log),
            None => ports::find_random_open_port(min, max, &log),
        }
    }

    fn port_after_conflict(&self) -> Result<u16> {
        let (min, max) = self.port_range();
        let log = |line: &str| self.log_port_discovery(line);
        if self.settings.port_hint.is_some() {
            let next = self
                .port
                .checked_add(1)
                .ok_or(Error::NoPortAvailable { min, max })?;
            self.log(&format!("incrementing port hint to {next}"));
            return ports::find_first_open_port_from(next, min, max, &log);
        }
        ports::find_random_open_port_except(self.port, min, max, &log)
    }

    fn log_port_discovery(&self, line: &str) {
        if self.settings.log_port_discovery {
            self.log(line);
        }
    }

    /// Runs start attempts until the server is up or a ceiling is reached.
    fn start_server(&mut self) -> Result<()> {
        let result = self.start_attempts_loop();
        if result.is_err() {
            self.keep_artifacts = true;
            self.set_state(LifecycleState::FatalInitFailure);
        }
        result
    }

    fn start_attempts_loop(&mut self) -> Result<()> {
        self.stop_watcher();
        self.start_attempts = 0;
        self.port_conflicts = 0;

        loop {
            match self.launch_and_verify()? {
                StartupOutcome::Connected => {
                    self.adopt_marker = false;
                    self.set_state(LifecycleState::Running);
                    self.spawn_watcher();
                    self.log("mysqld is up and running; watching for unexpected exits");
                    return Ok(());
                }
                StartupOutcome::PortConflict => {
                    // Whatever answered may have been another manager's server.
                    self.adopt_marker = false;
                    let output = self.kill_process();
                    self.port_conflicts += 1;
                    if self.port_conflicts > self.settings.max_port_conflict_retries {
                        return Err(self.fatal(
                            format!(
                                "gave up after {} port conflicts, last on port {}",
                                self.port_conflicts, self.port
                            ),
                            output,
                        ));
                    }
                    let previous = self.port;
                    self.port = self.port_after_conflict()?;
                    self.log(&format!(
                        "looks like a port conflict at {previous}; trying port {}",
                        self.port
                    ));
                    self.publish();
                }
                StartupOutcome::StartupFailed(reason) => {
                    let output = self.kill_process();
                    self.start_attempts += 1;
                    if self.start_attempts >= self.settings.max_startup_attempts {
                        self.log(&format!(
                            "giving up: tried {} times and limit is {}",
                            self.start_attempts, self.settings.max_startup_attempts
                        ));
                        return Err(self.fatal(
                            format!(
                                "mysqld doesn't want to start up ({reason}) after {} attempts",
                                self.start_attempts
                            ),
                            output,
                        ));
                    }
                    self.log(&format!("mysqld did not start properly ({reason}); retrying"));
                }
            }
        }
    }

    fn launch_and_verify(&mut self) -> Result<StartupOutcome> {
        self.set_state(LifecycleState::Starting);
        fs::create_dir_all(&self.data_dir)?;
        let error_log = self.error_log_path();
        let log_offset = diagnostics::error_log_len(&error_log);

        let process = ProcessIo::start(&self.mysqld, &self.server_args())?;
        diagnostics::write_startup_info(
            &self.data_dir.join(STARTUP_INFO_FILE_NAME),
            process.command_line(),
        );
        self.log(&format!(
            "started mysqld (pid {}): {}",
            process.pid(),
            process.command_line()
        ));
        self.process = Some(process);
        self.set_state(LifecycleState::VerifyingConnectivity);
        Ok(self.verify_connectivity(&error_log, log_offset))
    }

    fn server_args(&self) -> Vec<String> {
        let mut args = vec![
            format!(
                "--defaults-file={}",
                self.database_path.join(CONFIG_FILE_NAME).display()
            ),
            format!("--basedir={}", self.basedir().display()),
            format!("--datadir={}", self.data_dir.display()),
            format!("--port={}", self.port),
        ];
        if self.settings.verbose_logging {
            args.push("--log-error-verbosity=3".to_string());
        }
        if self.version.is_8_or_later() {
            // shut down as fast as possible, and stay attached to the console
            args.push("--innodb-fast-shutdown=2".to_string());
            args.push("--console".to_string());
        }
        args
    }

    fn verify_connectivity(&self, error_log: &Path, log_offset: u64) -> StartupOutcome {
        let deadline = Instant::now() + self.settings.max_startup_wait;
        let adopt = self.adopt_marker;
        let info = self.client.info(self.port, self.root_password_set, "");

        let reason = loop {
            let Some(process) = self.process.as_ref() else {
                break "no server process".to_string();
            };
            if process.has_exited() {
                break format!("process exited early with code {:?}", process.exit_code());
            }

            match self.driver.connect(&info) {
                Ok(mut conn) => {
                    match identity::resolve_ownership(conn.as_mut(), self.instance_id, adopt) {
                        Ok(Ownership::Foreign) => {
                            self.log(&format!(
                                "encountered another instance on port {}",
                                self.port
                            ));
                            return StartupOutcome::PortConflict;
                        }
                        Ok(ownership) => {
                            self.log(&format!(
                                "connected on port {} ({ownership:?})",
                                self.port
                            ));
                            return StartupOutcome::Connected;
                        }
                        Err(e) => self.log(&format!("unable to check instance ownership: {e}")),
                    }
                }
                Err(e) => self.log(&format!("not accepting connections yet: {e}")),
            }

            if Instant::now() >= deadline {
                break format!(
                    "no connection after {}s",
                    self.settings.max_startup_wait.as_secs()
                );
            }
            thread::sleep(CONNECT_POLL_INTERVAL);
        };

        let stderr = self
            .process
            .as_ref()
            .map(|p| p.stderr_lines().join("\n"))
            .unwrap_or_default();
        if diagnostics::text_mentions_port_conflict(&stderr)
            || diagnostics::looks_like_port_conflict(error_log, log_offset)
        {
            self.log(&format!("error output suggests port {} is taken", self.port));
            return StartupOutcome::PortConflict;
        }
        StartupOutcome::StartupFailed(reason)
    }

    /// Kills the current process, if any, and returns its captured output.
    fn kill_process(&mut self) -> (String, String) {
        let Some(mut process) = self.process.take() else {
            return ("(none)".to_string(), "(none)".to_string());
        };
        if let Err(e) = process.kill() {
            self.log(&format!("unable to kill mysqld (pid {}): {e}", process.pid()));
        }
        if process.wait_for_exit(FORCED_STOP_WAIT) {
            let _ = process.wait();
        }
        self.publish();
        (
            process.stdout_lines().join("\n"),
            process.stderr_lines().join("\n"),
        )
    }

    fn fatal(&mut self, message: String, (stdout, stderr): (String, String)) -> Error {
        self.keep_artifacts = true;
        self.set_state(LifecycleState::FatalInitFailure);
        warn!(
            target: "tempdb",
            "{message}; keeping {} for diagnostics",
            self.database_path.display()
        );
        Error::FatalInit {
            message,
            stdout,
            stderr,
            data_dir: self.database_path.clone(),
            error_log: self.error_log_path(),
        }
    }

    fn spawn_watcher(&mut self) {
        let Some(process) = &self.process else {
            return;
        };
        self.generation += 1;
        let generation = self.generation;
        let probe = process.probe();
        let events = self.events.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stopped = Arc::clone(&stop);

        let spawned = thread::Builder::new()
            .name(format!("tempdb-watch-{}", probe.pid()))
            .spawn(move || {
                while !stopped.load(Ordering::SeqCst) {
                    if probe.has_exited() {
                        if !stopped.load(Ordering::SeqCst) {
                            let _ = events.send(Command::ProcessExited { generation });
                        }
                        return;
                    }
                    thread::sleep(WATCH_INTERVAL);
                }
            });
        match spawned {
            Ok(thread) => self.watcher = Some(Watcher { stop, thread }),
            Err(e) => self.log(&format!("unable to start process watcher: {e}")),
        }
    }

    fn stop_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop.store(true, Ordering::SeqCst);
            let _ = watcher.thread.join();
        }
    }

    fn on_process_exited(&mut self, generation: u64) {
        if generation != self.generation || self.state != LifecycleState::Running {
            return;
        }
        let code = self.process.as_ref().and_then(ProcessIo::exit_code);
        warn!(
            target: "tempdb",
            "mysqld on port {} went away (exit code {code:?}); restarting",
            self.port
        );
        self.log(&format!(
            "mysqld seems to have gone away; restarting on port {}",
            self.port
        ));
        self.set_state(LifecycleState::Restarting);
        let _ = self.kill_process();
        if let Err(e) = self.start_server() {
            warn!(target: "tempdb", "unable to restart mysqld: {e}");
            self.log(&format!("unable to restart mysqld: {e}"));
        }
    }

    fn set_root_password(&mut self) -> Result<()> {
        self.log("setting root password");
        let mut conn = self.driver.connect(&self.client.info(self.port, false, ""))?;
        conn.execute(&root_password_sql(&self.version, &self.settings.root_password))?;
        self.root_password_set = true;
        self.publish();
        Ok(())
    }

    fn switch_schema(&mut self, schema: &str) -> Result<()> {
        if self.state != LifecycleState::Running {
            return Err(Error::NotRunning);
        }
        // The previous schema may be gone; stay schemaless until the new one exists.
        self.schema.clear();
        self.publish();
        if schema.trim().is_empty() {
            self.log("empty schema provided; not switching");
            return Ok(());
        }

        let mut conn = self
            .driver
            .connect(&self.client.info(self.port, self.root_password_set, ""))?;
        conn.execute(&create_schema_sql(schema))?;
        conn.execute(&format!("use {}", quote_identifier(schema)))?;
        self.schema = schema.to_string();
        self.log(&format!("switched to schema {schema}"));
        self.publish();
        Ok(())
    }

    fn run_creation_scripts(&mut self) -> Result<()> {
        if self.creation_scripts.is_empty() {
            return Ok(());
        }
        let info = self
            .client
            .info(self.port, self.root_password_set, &self.schema);
        let mut conn = self.driver.connect(&info)?;
        for (index, script) in self.creation_scripts.iter().enumerate() {
            self.log(&format!("running creation script {}", index + 1));
            conn.execute(script)?;
        }
        Ok(())
    }

    fn stop_server(&mut self) -> Result<()> {
        self.stop_watcher();
        let Some(process) = self.process.take() else {
            self.set_state(LifecycleState::Stopped);
            return Ok(());
        };

        if self.settings.attempt_graceful_shutdown && !process.has_exited() {
            self.set_state(LifecycleState::StoppingGraceful);
            self.shut_down_gracefully(&process);
        }

        self.set_state(LifecycleState::StoppingForced);
        if !process.has_exited() {
            self.log(&format!("killing mysqld (pid {})", process.pid()));
            if let Err(e) = process.kill() {
                self.log(&format!("unable to kill mysqld (pid {}): {e}", process.pid()));
            }
        }
        let exited = process.wait_for_exit(FORCED_STOP_WAIT);
        self.publish();
        if !exited {
            return Err(Error::StillRunning { pid: process.pid() });
        }
        self.set_state(LifecycleState::Stopped);
        Ok(())
    }

    fn shut_down_gracefully(&self, process: &ProcessIo) {
        let info = self
            .client
            .info(self.port, self.root_password_set, ADMIN_SCHEMA);
        let log = |line: &str| self.log(line);
        if let Err(e) = kill_other_connections(self.driver.as_ref(), &info, &log) {
            self.log(&format!("unable to close client connections: {e}"));
        }
        let shutdown = self
            .driver
            .connect(&info)
            .and_then(|mut conn| conn.execute("SHUTDOWN"));
        if let Err(e) = shutdown {
            self.log(&format!("SHUTDOWN failed: {e}"));
        }
        if !process.wait_for_exit(GRACEFUL_STOP_WAIT) {
            self.log("mysqld remains alive after SHUTDOWN; killing it");
        }
    }

    fn restart(&mut self) -> Result<()> {
        self.stop_server()?;
        self.set_state(LifecycleState::Restarting);
        self.start_server()
    }

    fn snapshot(&mut self, target: Option<PathBuf>) -> Result<PathBuf> {
        if self.state == LifecycleState::Running {
            let info = self
                .client
                .info(self.port, self.root_password_set, ADMIN_SCHEMA);
            let log = |line: &str| self.log(line);
            if let Err(e) = kill_other_connections(self.driver.as_ref(), &info, &log) {
                self.log(&format!("unable to close client connections: {e}"));
            }
        }
        self.stop_server()?;

        let target = target.unwrap_or_else(|| self.generate_template_path());
        self.log(&format!(
            "snapshotting {} to {}",
            self.database_path.display(),
            target.display()
        ));
        let copied = self.copy_snapshot(&target);

        self.set_state(LifecycleState::Restarting);
        self.start_server()?;
        copied.map(|()| target)
    }

    fn copy_snapshot(&self, target: &Path) -> Result<()> {
        fsutil::copy_dir(&self.database_path, target)?;
        let target_data = if self.version.is_8_or_later() {
            target.join("data")
        } else {
            target.to_path_buf()
        };
        for file in VOLATILE_FILES {
            fsutil::remove_file(&target_data.join(file))?;
        }
        Ok(())
    }

    fn generate_template_path(&self) -> PathBuf {
        self.database_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir)
            .join(format!("template-{}.db", Uuid::new_v4()))
    }

    fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        let stopped = self.stop_server();
        if self.settings.preserve_artifacts || self.keep_artifacts {
            self.log(&format!(
                "keeping instance files at {}",
                self.database_path.display()
            ));
        } else if let Err(e) = fsutil::remove_dir_all(&self.database_path) {
            warn!(
                target: "tempdb",
                "unable to remove {}: {e}",
                self.database_path.display()
            );
        }
        self.set_state(LifecycleState::Disposed);
        stopped
    }

    /// Cleans up after a failed bootstrap, keeping files for inspection.
    fn abandon(&mut self, error: &Error) {
        self.stop_watcher();
        let _ = self.kill_process();
        self.keep_artifacts = true;
        self.disposed = true;
        self.set_state(LifecycleState::FatalInitFailure);
        self.log(&format!("startup failed: {error}"));
        warn!(target: "tempdb", "unable to start mysqld: {error}");
    }

    fn auto_dispose_tick(&self) -> Option<Duration> {
        [self.settings.absolute_lifespan, self.settings.inactivity_timeout]
            .into_iter()
            .flatten()
            .map(|limit| limit / 4)
            .min()
            .map(|tick| tick.clamp(MIN_AUTO_DISPOSE_TICK, MAX_AUTO_DISPOSE_TICK))
    }

    fn auto_dispose_reason(&self) -> Option<String> {
        if let Some(lifespan) = self.settings.absolute_lifespan {
            if self.started_at.elapsed() >= lifespan {
                return Some(format!("absolute lifespan of {lifespan:?} reached"));
            }
        }

        let timeout = self.settings.inactivity_timeout?;
        if self.state == LifecycleState::Running {
            let info = self
                .client
                .info(self.port, self.root_password_set, ADMIN_SCHEMA);
            match self.driver.fetch_active_connection_count(&info) {
                Ok(count) if count > 0 => self.shared.touch(),
                Ok(_) => {}
                Err(e) => self.log(&format!("unable to count client connections: {e}")),
            }
        }
        let idle = self.shared.lock().last_activity.elapsed();
        (idle >= timeout).then(|| format!("no client activity for {idle:?}"))
    }

    fn set_state(&mut self, state: LifecycleState) {
        if self.state != state {
            self.log(&format!("state: {} -> {state}", self.state));
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        let mut status = self.shared.lock();
        status.state = self.state;
        status.port = self.port;
        status.pid = self.process.as_ref().map(ProcessIo::pid);
        status.schema.clone_from(&self.schema);
        status.root_password_set = self.root_password_set;
    }

    fn log(&self, message: &str) {
        self.log.log(message);
    }
}

fn kill_other_connections(
    driver: &dyn Driver,
    info: &ConnectionInfo,
    log: &dyn Fn(&str),
) -> Result<()> {
    let mut conn = driver.connect(info)?;
    for id in client_connection_ids(conn.as_mut())? {
        if let Err(e) = conn.execute(&format!("kill {id}")) {
            log(&format!("unable to kill connection {id}: {e}"));
        }
    }
    Ok(())
}

fn root_password_sql(version: &ServerVersion, password: &str) -> String {
    let password = quote(password);
    if version.major > 5 || (version.major == 5 && version.minor >= 7) {
        format!("alter user 'root'@'localhost' identified by {password}")
    } else {
        format!("set password for 'root'@'localhost' = password({password})")
    }
}

fn create_schema_sql(schema: &str) -> String {
    format!("create schema if not exists {}", quote_identifier(schema))
}

fn grant_all_sql(user: &str, schema: &str, host: &str) -> String {
    format!(
        "grant all privileges on {}.* to {}@{}",
        quote_identifier(schema),
        quote(user),
        quote(host)
    )
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}
