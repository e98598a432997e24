use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    admin::{flag, AdminError, DbAdmin, MasterStatus, ReplicationStatus},
    gtid::GtidList,
};

pub const DEFAULT_PORT: u16 = 3306;

/// Stable identity of a monitored node, `host:port`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ServerUrl {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServerUrlError {
    #[error("empty server address")]
    Empty,
    #[error("invalid port in `{0}`")]
    Port(String),
}

impl ServerUrl {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for ServerUrl {
    type Err = ServerUrlError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err(ServerUrlError::Empty);
        }
        match value.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse()
                    .map_err(|_| ServerUrlError::Port(value.to_string()))?;
                Ok(Self::new(host, port))
            }
            Some(_) => Err(ServerUrlError::Empty),
            None => Ok(Self::new(value, DEFAULT_PORT)),
        }
    }
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<ServerUrl> for String {
    fn from(url: ServerUrl) -> Self {
        url.to_string()
    }
}

impl TryFrom<String> for ServerUrl {
    type Error = ServerUrlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerState {
    Unconnected,
    Slave,
    Suspect,
    Failed,
    Master,
}

impl ServerState {
    /// Transition table of the health state machine. Staying in the same
    /// state is always allowed and is not listed here.
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (Unconnected, Slave | Master | Suspect | Failed)
                | (Slave, Suspect | Failed | Master | Unconnected)
                | (Suspect, Failed | Slave | Master | Unconnected)
                | (Master, Suspect | Failed | Slave | Unconnected)
                | (Failed, Unconnected | Slave)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Unconnected => "Unconnected",
            ServerState::Slave => "Slave",
            ServerState::Suspect => "Suspect",
            ServerState::Failed => "Failed",
            ServerState::Master => "Master",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("{server}: transition {from} -> {to} is not allowed")]
    Invalid {
        server: String,
        from: ServerState,
        to: ServerState,
    },
    #[error("{server}: already moved to {applied} in this cycle, refusing {requested}")]
    Conflicting {
        server: String,
        applied: ServerState,
        requested: ServerState,
    },
}

/// Binary log coordinates, file plus byte offset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogPosition {
    pub file: String,
    pub position: u64,
}

/// Everything a reachability probe learns about a node. Gathered
/// concurrently, applied to the [`Server`] afterwards.
#[derive(Clone, Debug, Default)]
pub struct ServerFacts {
    pub server_id: u64,
    pub read_only: bool,
    pub log_bin: bool,
    pub current_gtid: GtidList,
    pub slave_gtid: GtidList,
    pub binlog_gtid: GtidList,
    pub semisync_master: bool,
    pub semisync_slave: bool,
    pub replication: Option<ReplicationStatus>,
    pub binlog: Option<BinlogPosition>,
}

/// Reads variables, status and replication state from one node.
pub async fn probe(admin: &dyn DbAdmin) -> Result<ServerFacts, AdminError> {
    admin.ping().await?;
    let variables = admin.variables().await?;
    let status = admin.status().await?;
    let replication = admin.replication_status().await?;
    let binlog = admin
        .master_status()
        .await?
        .map(|MasterStatus { file, position, .. }| BinlogPosition { file, position });
    let text = |name: &str| variables.get(name).cloned().unwrap_or_default();
    Ok(ServerFacts {
        server_id: text("SERVER_ID").parse().unwrap_or(0),
        read_only: flag(variables.get("READ_ONLY")),
        log_bin: flag(variables.get("LOG_BIN")),
        current_gtid: GtidList::parse_lossy(&text("GTID_CURRENT_POS")),
        slave_gtid: GtidList::parse_lossy(&text("GTID_SLAVE_POS")),
        binlog_gtid: GtidList::parse_lossy(&text("GTID_BINLOG_POS")),
        semisync_master: flag(status.get("RPL_SEMI_SYNC_MASTER_STATUS")),
        semisync_slave: flag(status.get("RPL_SEMI_SYNC_SLAVE_STATUS")),
        replication,
        binlog,
    })
}

/// One monitored database instance.
pub struct Server {
    pub url: ServerUrl,
    pub server_id: u64,
    state: ServerState,
    prev_state: ServerState,
    pub fail_count: u32,
    pub current_gtid: GtidList,
    pub slave_gtid: GtidList,
    pub binlog_gtid: GtidList,
    pub binlog: Option<BinlogPosition>,
    pub replication: Option<ReplicationStatus>,
    pub read_only: bool,
    pub log_bin: bool,
    pub semisync_master: bool,
    pub semisync_slave: bool,
    pub admin: Option<Arc<dyn DbAdmin>>,
    /// Refresh cycle of the last applied transition and its target.
    last_transition: Option<(u64, ServerState)>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("url", &self.url)
            .field("server_id", &self.server_id)
            .field("state", &self.state)
            .field("fail_count", &self.fail_count)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(url: ServerUrl) -> Self {
        Self {
            url,
            server_id: 0,
            state: ServerState::Unconnected,
            prev_state: ServerState::Unconnected,
            fail_count: 0,
            current_gtid: GtidList::default(),
            slave_gtid: GtidList::default(),
            binlog_gtid: GtidList::default(),
            binlog: None,
            replication: None,
            read_only: false,
            log_bin: false,
            semisync_master: false,
            semisync_slave: false,
            admin: None,
            last_transition: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn prev_state(&self) -> ServerState {
        self.prev_state
    }

    /// Moves the server to `next` within refresh cycle `epoch`.
    ///
    /// Returns `Ok(true)` when the state changed. A second transition to a
    /// different target in the same cycle is rejected; callers must refresh
    /// (advance the epoch) first.
    pub fn transition(&mut self, next: ServerState, epoch: u64) -> Result<bool, TransitionError> {
        if next == self.state {
            return Ok(false);
        }
        if let Some((applied_epoch, applied)) = self.last_transition {
            if applied_epoch == epoch && applied != next {
                return Err(TransitionError::Conflicting {
                    server: self.url.to_string(),
                    applied,
                    requested: next,
                });
            }
        }
        if !self.state.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                server: self.url.to_string(),
                from: self.state,
                to: next,
            });
        }
        self.prev_state = self.state;
        self.state = next;
        self.last_transition = Some((epoch, next));
        Ok(true)
    }

    pub fn admin(&self) -> Result<Arc<dyn DbAdmin>, AdminError> {
        self.admin
            .clone()
            .ok_or_else(|| AdminError::NotConfigured(self.url.to_string()))
    }

    pub fn apply_facts(&mut self, facts: ServerFacts) {
        self.server_id = facts.server_id;
        self.read_only = facts.read_only;
        self.log_bin = facts.log_bin;
        self.current_gtid = facts.current_gtid;
        self.slave_gtid = facts.slave_gtid;
        self.binlog_gtid = facts.binlog_gtid;
        self.semisync_master = facts.semisync_master;
        self.semisync_slave = facts.semisync_slave;
        self.replication = facts.replication;
        self.binlog = facts.binlog;
    }

    pub fn is_failed(&self) -> bool {
        self.state == ServerState::Failed
    }

    pub fn master_server_id(&self) -> Option<u64> {
        self.replication
            .as_ref()
            .map(|status| status.master_server_id)
    }

    pub fn master_host(&self) -> Option<&str> {
        self.replication
            .as_ref()
            .map(|status| status.master_host.as_str())
    }

    pub fn delay(&self) -> Option<i64> {
        self.replication
            .as_ref()
            .and_then(|status| status.seconds_behind_master)
    }

    /// True when the node replicates from `master`, judged by address.
    pub fn is_replica_of(&self, master: &ServerUrl) -> bool {
        self.replication
            .as_ref()
            .map(|status| status.master_host == master.host && status.master_port == master.port)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            url: self.url.clone(),
            server_id: self.server_id,
            state: self.state,
            prev_state: self.prev_state,
            fail_count: self.fail_count,
            current_gtid: self.current_gtid.clone(),
            read_only: self.read_only,
            master_server_id: self.master_server_id(),
            delay: self.delay(),
            io_running: self.replication.as_ref().map(|status| status.io_running),
            sql_running: self.replication.as_ref().map(|status| status.sql_running),
        }
    }
}

/// Copy of a server's observable state, safe to hand to readers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub url: ServerUrl,
    pub server_id: u64,
    pub state: ServerState,
    pub prev_state: ServerState,
    pub fail_count: u32,
    pub current_gtid: GtidList,
    pub read_only: bool,
    pub master_server_id: Option<u64>,
    pub delay: Option<i64>,
    pub io_running: Option<bool>,
    pub sql_running: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_lists_with_default_port() {
        assert_eq!(
            "db1".parse::<ServerUrl>(),
            Ok(ServerUrl::new("db1", 3306))
        );
        assert_eq!(
            "10.0.0.4:3307".parse::<ServerUrl>(),
            Ok(ServerUrl::new("10.0.0.4", 3307))
        );
        assert!(matches!(
            "db1:abc".parse::<ServerUrl>(),
            Err(ServerUrlError::Port(_))
        ));
        assert_eq!("".parse::<ServerUrl>(), Err(ServerUrlError::Empty));
    }

    #[test]
    fn failed_servers_cannot_be_promoted_directly() {
        let mut server = Server::new(ServerUrl::new("db1", 3306));
        server.transition(ServerState::Failed, 1).expect("unconnected -> failed");
        let error = server
            .transition(ServerState::Master, 2)
            .expect_err("failed -> master");
        assert!(matches!(error, TransitionError::Invalid { .. }));
        assert_eq!(server.state(), ServerState::Failed);
    }

    #[test]
    fn rejects_conflicting_transitions_within_one_cycle() {
        let mut server = Server::new(ServerUrl::new("db1", 3306));
        assert_eq!(server.transition(ServerState::Slave, 7), Ok(true));
        assert!(matches!(
            server.transition(ServerState::Suspect, 7),
            Err(TransitionError::Conflicting { .. })
        ));
        assert_eq!(server.transition(ServerState::Slave, 7), Ok(false));
        assert_eq!(server.transition(ServerState::Suspect, 8), Ok(true));
        assert_eq!(server.prev_state(), ServerState::Slave);
    }

    #[test]
    fn replica_link_is_matched_by_address() {
        let mut server = Server::new(ServerUrl::new("db2", 3306));
        server.replication = Some(ReplicationStatus {
            master_host: "db1".into(),
            master_port: 3306,
            master_server_id: 1,
            ..ReplicationStatus::default()
        });
        assert!(server.is_replica_of(&ServerUrl::new("db1", 3306)));
        assert!(!server.is_replica_of(&ServerUrl::new("db1", 3307)));
        assert_eq!(server.master_server_id(), Some(1));
    }
}
