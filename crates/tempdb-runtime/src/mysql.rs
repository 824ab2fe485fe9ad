// SPDX-License-Identifier: Apache-2.0

//! Default connector over `mysql_async`.
//!
//! The runtime is synchronous, so the async driver runs on a private
//! current-thread tokio runtime and every call blocks on it.

use std::sync::Arc;

use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Row};
use tokio::runtime::{Builder, Runtime};

use crate::driver::{Connection, ConnectionInfo, Driver};
use crate::error::{Error, Result};

pub struct MySqlDriver {
    runtime: Arc<Runtime>,
}

impl MySqlDriver {
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(MySqlDriver {
            runtime: Arc::new(runtime),
        })
    }
}

impl Driver for MySqlDriver {
    fn connect(&self, info: &ConnectionInfo) -> Result<Box<dyn Connection>> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(info.host.clone())
            .tcp_port(info.port)
            .prefer_socket(false)
            .user(Some(info.user.clone()))
            .pass((!info.password.is_empty()).then(|| info.password.clone()))
            .db_name((!info.schema.is_empty()).then(|| info.schema.clone()));

        let conn = self.runtime.block_on(async {
            match tokio::time::timeout(info.connect_timeout, Conn::new(opts)).await {
                Ok(result) => result.map_err(driver_error),
                Err(_) => Err(Error::Driver(format!(
                    "timed out connecting to {}:{}",
                    info.host, info.port
                ))),
            }
        })?;

        Ok(Box::new(MySqlConnection {
            runtime: Arc::clone(&self.runtime),
            conn: Some(conn),
        }))
    }
}

struct MySqlConnection {
    runtime: Arc<Runtime>,
    conn: Option<Conn>,
}

impl MySqlConnection {
    fn conn(&mut self) -> Result<&mut Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Driver("connection already closed".to_string()))
    }
}

impl Connection for MySqlConnection {
    fn execute(&mut self, sql: &str) -> Result<u64> {
        let runtime = Arc::clone(&self.runtime);
        let conn = self.conn()?;
        runtime.block_on(async {
            conn.query_drop(sql).await.map_err(driver_error)?;
            Ok(conn.affected_rows())
        })
    }

    fn query_u64(&mut self, sql: &str) -> Result<Vec<u64>> {
        let runtime = Arc::clone(&self.runtime);
        let conn = self.conn()?;
        let rows: Vec<Row> = runtime.block_on(conn.query(sql)).map_err(driver_error)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.get_opt::<u64, usize>(0).and_then(|v| v.ok()))
            .collect())
    }
}

impl Drop for MySqlConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // The server may already be gone; nothing useful to do with the error.
            let _ = self.runtime.block_on(conn.disconnect());
        }
    }
}

fn driver_error(e: mysql_async::Error) -> Error {
    Error::Driver(e.to_string())
}
