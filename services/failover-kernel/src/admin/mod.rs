//! Administrative client contract for a single database node.
//!
//! The orchestrator never talks SQL directly; every read and every write it
//! issues against a node goes through [`DbAdmin`], so the protocol can be
//! driven against a real MariaDB fleet or the in-memory fleet used in tests.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{gtid::GtidList, server::ServerUrl, ErrorClass};

pub mod mysql;

pub use mysql::MySqlConnector;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdminError {
    #[error("server {server} unreachable: {reason}")]
    Connectivity { server: String, reason: String },
    #[error("access denied on {server}: {reason}")]
    AccessDenied { server: String, reason: String },
    #[error("query `{statement}` failed on {server}: {reason}")]
    Query {
        server: String,
        statement: String,
        reason: String,
    },
    #[error("operation on {server} timed out after {elapsed:?}")]
    Timeout { server: String, elapsed: Duration },
    #[error("server {0} has no administrative connection")]
    NotConfigured(String),
}

impl AdminError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AdminError::Connectivity { .. }
            | AdminError::Timeout { .. }
            | AdminError::NotConfigured(_) => ErrorClass::Connectivity,
            AdminError::AccessDenied { .. } => ErrorClass::Prerequisite,
            AdminError::Query { .. } => ErrorClass::BestEffort,
        }
    }

    pub fn is_connectivity(&self) -> bool {
        self.class() == ErrorClass::Connectivity
    }
}

/// How a replica locates its position on the new source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GtidMode {
    /// `MASTER_USE_GTID=slave_pos`
    SlavePos,
    /// `MASTER_USE_GTID=current_pos`
    CurrentPos,
}

impl GtidMode {
    pub fn as_sql(&self) -> &'static str {
        match self {
            GtidMode::SlavePos => "slave_pos",
            GtidMode::CurrentPos => "current_pos",
        }
    }

    pub fn from_using_gtid(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "slave_pos" => Some(GtidMode::SlavePos),
            "current_pos" => Some(GtidMode::CurrentPos),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeSourceOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub connect_retry: Duration,
    /// `None` keeps whatever GTID mode the replica was already using.
    pub mode: Option<GtidMode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// `FLUSH NO_WRITE_TO_BINLOG TABLES`
    NoLog,
    /// `FLUSH TABLES WITH READ LOCK`, held until [`DbAdmin::unlock_tables`].
    WithReadLock,
    /// `FLUSH TABLES`
    Plain,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached,
    TimedOut,
}

/// One row of `SHOW SLAVE STATUS`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub master_host: String,
    pub master_port: u16,
    pub master_server_id: u64,
    pub io_running: bool,
    pub sql_running: bool,
    /// `Seconds_Behind_Master`; `None` when the server reports NULL.
    pub seconds_behind_master: Option<i64>,
    pub using_gtid: String,
    pub gtid_io_pos: GtidList,
    pub master_log_file: String,
    pub read_master_log_pos: u64,
    pub relay_master_log_file: String,
    pub exec_master_log_pos: u64,
    pub last_io_errno: u32,
    pub last_io_error: String,
    pub last_sql_errno: u32,
    pub last_sql_error: String,
}

impl ReplicationStatus {
    pub fn is_running(&self) -> bool {
        self.io_running && self.sql_running
    }

    /// The SQL thread has applied everything the I/O thread fetched.
    pub fn relay_drained(&self) -> bool {
        self.relay_master_log_file == self.master_log_file
            && self.exec_master_log_pos >= self.read_master_log_pos
    }
}

/// One row of `SHOW MASTER STATUS`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterStatus {
    pub file: String,
    pub position: u64,
    pub binlog_do_db: String,
    pub binlog_ignore_db: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Privileges {
    pub super_priv: bool,
    pub reload_priv: bool,
    pub repl_client_priv: bool,
    pub repl_slave_priv: bool,
}

/// Typed operations against one database node.
#[async_trait]
pub trait DbAdmin: Send + Sync {
    async fn ping(&self) -> Result<(), AdminError>;
    /// `None` when the node has no replication link configured.
    async fn replication_status(&self) -> Result<Option<ReplicationStatus>, AdminError>;
    /// Global variables with upper-cased names.
    async fn variables(&self) -> Result<HashMap<String, String>, AdminError>;
    /// Global status counters with upper-cased names.
    async fn status(&self) -> Result<HashMap<String, String>, AdminError>;
    async fn master_status(&self) -> Result<Option<MasterStatus>, AdminError>;
    async fn privileges(&self, user: &str, host: &str) -> Result<Privileges, AdminError>;
    /// Number of connected replicas (binlog dump threads).
    async fn binlog_dump_count(&self) -> Result<u64, AdminError>;
    async fn stop_replica(&self) -> Result<(), AdminError>;
    async fn start_replica(&self) -> Result<(), AdminError>;
    async fn reset_replica(&self, all: bool) -> Result<(), AdminError>;
    async fn change_replication_source(
        &self,
        options: &ChangeSourceOptions,
    ) -> Result<(), AdminError>;
    async fn set_read_only(&self, read_only: bool) -> Result<(), AdminError>;
    async fn flush_tables(&self, mode: FlushMode) -> Result<(), AdminError>;
    async fn unlock_tables(&self) -> Result<(), AdminError>;
    /// Kills every client thread except replication and system threads.
    async fn kill_client_threads(&self) -> Result<u64, AdminError>;
    async fn wait_for_position(
        &self,
        position: &GtidList,
        timeout: Duration,
    ) -> Result<WaitOutcome, AdminError>;
    async fn check_long_running_writes(&self, threshold: Duration) -> Result<u64, AdminError>;
    async fn set_max_connections(&self, value: u64) -> Result<(), AdminError>;
    async fn set_gtid_slave_pos(&self, position: &GtidList) -> Result<(), AdminError>;
}

/// Opens administrative connections to nodes by URL.
#[async_trait]
pub trait AdminConnector: Send + Sync {
    async fn connect(&self, url: &ServerUrl) -> Result<Arc<dyn DbAdmin>, AdminError>;
}

pub(crate) fn flag(value: Option<&String>) -> bool {
    value
        .map(|value| value.eq_ignore_ascii_case("ON") || value == "1")
        .unwrap_or(false)
}
