// SPDX-License-Identifier: Apache-2.0

//! Stand-ins for a real mysqld and client driver.
//!
//! The fake server is a shell script that records every start in a state
//! folder, and "listens" by writing `listening-<port>` holding its pid. The
//! fake driver connects whenever that file exists and keeps an in-memory
//! marker table per port.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use uuid::Uuid;

use crate::driver::{Connection, ConnectionInfo, Driver, CLIENT_THREADS_SQL};
use crate::error::{Error, Result};
use crate::locator::BinaryCache;
use crate::settings::ServerSettings;

const FAKE_MYSQLD: &str = r#"#!/bin/sh
STATE='@STATE@'
FAIL_FIRST=@FAIL_FIRST@
datadir=""
port=""
init=0
for arg in "$@"; do
  case "$arg" in
    --version) echo "mysqld  Ver @VERSION@ for Linux on x86_64 (fake)"; exit 0 ;;
    --datadir=*) datadir="${arg#--datadir=}" ;;
    --port=*) port="${arg#--port=}" ;;
    --initialize-insecure) init=1 ;;
  esac
done
if [ "$init" = 1 ]; then
  mkdir -p "$datadir"
  echo "fake" > "$datadir/ibdata1"
  echo "$datadir" >> "$STATE/initialized"
  exit 0
fi
echo "$port" >> "$STATE/starts"
count=$(( $(wc -l < "$STATE/starts") ))
if [ -f "$STATE/conflict-$port" ]; then
  echo "[ERROR] [MY-010262] [Server] Can't start server: Bind on TCP/IP port: Address already in use" >> "$datadir/mysql-err.log"
  exit 1
fi
if [ "$count" -le "$FAIL_FIRST" ]; then
  echo "fake mysqld refusing start $count" >&2
  exit 1
fi
echo "$$" > "$STATE/listening-$port"
echo "ready for connections on port $port"
exec sleep 60
"#;

const FAKE_MYSQLDUMP: &str = r#"#!/bin/sh
echo "-- fake dump"
for arg in "$@"; do
  echo "-- arg $arg"
done
"#;

/// A throw-away mysqld installation under `<dir>/bin`.
pub(crate) struct FakeInstall {
    pub dir: TempDir,
    pub mysqld: PathBuf,
    pub state: PathBuf,
}

impl FakeInstall {
    pub fn new() -> Self {
        Self::with_options("8.0.36", 0)
    }

    /// `fail_first` starts exit immediately before one succeeds.
    pub fn with_options(version: &str, fail_first: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        let state = dir.path().join("state");
        fs::create_dir_all(&bin).unwrap();
        fs::create_dir_all(&state).unwrap();

        let script = FAKE_MYSQLD
            .replace("@STATE@", &state.display().to_string())
            .replace("@FAIL_FIRST@", &fail_first.to_string())
            .replace("@VERSION@", version);
        let mysqld = bin.join("mysqld");
        write_executable(&mysqld, &script);

        FakeInstall { dir, mysqld, state }
    }

    pub fn add_mysqldump(&self) {
        write_executable(&self.dir.path().join("bin").join("mysqldump"), FAKE_MYSQLDUMP);
    }

    /// Settings pointing at this install, with quick timeouts.
    pub fn settings(&self) -> ServerSettings {
        ServerSettings::default()
            .with_mysqld(&self.mysqld)
            .with_base_path(self.dir.path().join("instances"))
            .with_graceful_shutdown(false)
            .with_max_startup_wait(Duration::from_secs(5))
            .with_binary_cache(Arc::new(BinaryCache::new()))
    }

    pub fn driver(&self) -> Arc<FakeDriver> {
        Arc::new(FakeDriver::new(&self.state))
    }

    /// Ports of every server start, in order.
    pub fn starts(&self) -> Vec<u16> {
        fs::read_to_string(self.state.join("starts"))
            .unwrap_or_default()
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect()
    }

    pub fn initializations(&self) -> usize {
        fs::read_to_string(self.state.join("initialized"))
            .unwrap_or_default()
            .lines()
            .count()
    }

    /// Makes starts on `port` fail with a bind error in the error log.
    pub fn block_port(&self, port: u16) {
        fs::write(self.state.join(format!("conflict-{port}")), "").unwrap();
    }
}

fn write_executable(path: &Path, text: &str) {
    fs::write(path, text).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Kills `pid` with SIGKILL, simulating a crash.
pub(crate) fn crash(pid: u32) {
    let status = Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());
}

/// Polls `condition` every 50ms until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    condition()
}

#[derive(Default)]
struct FakeServers {
    markers: HashMap<u16, String>,
    statements: HashMap<u16, Vec<String>>,
}

pub(crate) struct FakeDriver {
    state: PathBuf,
    servers: Arc<Mutex<FakeServers>>,
    pub active_connections: AtomicUsize,
}

impl FakeDriver {
    fn new(state: &Path) -> Self {
        FakeDriver {
            state: state.to_path_buf(),
            servers: Arc::default(),
            active_connections: AtomicUsize::new(0),
        }
    }

    pub fn statements(&self, port: u16) -> Vec<String> {
        self.servers
            .lock()
            .unwrap()
            .statements
            .get(&port)
            .cloned()
            .unwrap_or_default()
    }

    pub fn marker(&self, port: u16) -> Option<String> {
        self.servers.lock().unwrap().markers.get(&port).cloned()
    }

    /// Pretends another manager's server already claimed `port`.
    pub fn seed_marker(&self, port: u16, id: &str) {
        self.servers
            .lock()
            .unwrap()
            .markers
            .insert(port, id.to_string());
    }
}

impl Driver for FakeDriver {
    fn connect(&self, info: &ConnectionInfo) -> Result<Box<dyn Connection>> {
        let listening = self.state.join(format!("listening-{}", info.port));
        if !listening.exists() {
            return Err(Error::Driver(format!(
                "can't connect to localhost:{} (connection refused)",
                info.port
            )));
        }
        Ok(Box::new(FakeConnection {
            port: info.port,
            listening,
            servers: Arc::clone(&self.servers),
        }))
    }

    fn fetch_active_connection_count(&self, _info: &ConnectionInfo) -> Result<usize> {
        Ok(self.active_connections.load(Ordering::SeqCst))
    }
}

struct FakeConnection {
    port: u16,
    listening: PathBuf,
    servers: Arc<Mutex<FakeServers>>,
}

impl Connection for FakeConnection {
    fn execute(&mut self, sql: &str) -> Result<u64> {
        let mut servers = self.servers.lock().unwrap();
        servers
            .statements
            .entry(self.port)
            .or_default()
            .push(sql.to_string());
        let lower = sql.to_lowercase();
        let id = sql
            .split('\'')
            .find(|part| Uuid::parse_str(part).is_ok())
            .map(str::to_string);

        if lower.starts_with("update sys.sys_config") {
            return match (servers.markers.contains_key(&self.port), id) {
                (true, Some(id)) => {
                    servers.markers.insert(self.port, id);
                    Ok(1)
                }
                _ => Ok(0),
            };
        }
        if lower.starts_with("insert into sys.sys_config") {
            if servers.markers.contains_key(&self.port) {
                return Err(Error::Driver("Duplicate entry '__tempdb_id__' for key 'PRIMARY'".to_string()));
            }
            if let Some(id) = id {
                servers.markers.insert(self.port, id);
            }
            return Ok(1);
        }
        if lower == "shutdown" {
            let pid = fs::read_to_string(&self.listening).unwrap_or_default();
            let _ = fs::remove_file(&self.listening);
            let _ = Command::new("kill").arg(pid.trim()).status();
        }
        Ok(0)
    }

    fn query_u64(&mut self, sql: &str) -> Result<Vec<u64>> {
        let mut servers = self.servers.lock().unwrap();
        servers
            .statements
            .entry(self.port)
            .or_default()
            .push(sql.to_string());
        let lower = sql.to_lowercase();

        if lower.starts_with("select count(*) from sys.sys_config") {
            let hit = servers
                .markers
                .get(&self.port)
                .is_some_and(|marker| sql.contains(marker.as_str()));
            return Ok(vec![u64::from(hit)]);
        }
        if lower == "select connection_id()" {
            return Ok(vec![1]);
        }
        if sql == CLIENT_THREADS_SQL {
            return Ok(vec![1, 2, 3]);
        }
        Ok(Vec::new())
    }
}
