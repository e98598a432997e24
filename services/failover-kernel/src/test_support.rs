//! In-memory MariaDB replication fleet for unit and integration tests.
//!
//! Replicas with running threads and no configured lag catch up with their
//! master lazily, whenever any node of the fleet is queried.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    admin::{
        AdminConnector, AdminError, ChangeSourceOptions, DbAdmin, FlushMode, GtidMode,
        MasterStatus, Privileges, ReplicationStatus, WaitOutcome,
    },
    arbitration::{ArbitrationError, ArbitrationResponse, Arbitrator, HeartbeatRecord, Verdict},
    config::ClusterConfig,
    failover::Crash,
    gtid::{Gtid, GtidList},
    rejoin::{LogTools, RejoinError},
    server::ServerUrl,
};

pub const DB_CREDENTIALS: &str = "repman:repman";
pub const REPLICATION_CREDENTIALS: &str = "repl:repl";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimulatedLink {
    pub master: ServerUrl,
    pub io_running: bool,
    pub sql_running: bool,
    pub mode: Option<GtidMode>,
    pub last_sql_error: String,
}

#[derive(Clone, Debug)]
pub struct SimulatedNode {
    pub server_id: u64,
    pub alive: bool,
    /// Alive and replicating, but unreachable from the monitor.
    pub partitioned: bool,
    pub access_denied: bool,
    pub read_only: bool,
    pub log_bin: bool,
    pub current_gtid: GtidList,
    pub slave_gtid: GtidList,
    pub link: Option<SimulatedLink>,
    /// Seconds behind master; a lagging replica does not catch up.
    pub lag: i64,
    /// Ages of open write transactions.
    pub open_writes: Vec<Duration>,
    pub binlog_do_db: String,
    pub binlog_ignore_db: String,
    pub replicate_do_db: String,
    pub semisync_master: bool,
    pub semisync_slave: bool,
    pub max_connections: u64,
    pub read_lock: bool,
    pub privileges: Privileges,
    /// Administrative statements received, in order.
    pub history: Vec<String>,
    /// Statements that fail with a query error instead of running.
    pub failing: Vec<String>,
}

impl SimulatedNode {
    fn new(server_id: u64) -> Self {
        Self {
            server_id,
            alive: true,
            partitioned: false,
            access_denied: false,
            read_only: false,
            log_bin: true,
            current_gtid: GtidList::default(),
            slave_gtid: GtidList::default(),
            link: None,
            lag: 0,
            open_writes: Vec::new(),
            binlog_do_db: String::new(),
            binlog_ignore_db: String::new(),
            replicate_do_db: String::new(),
            semisync_master: false,
            semisync_slave: false,
            max_connections: 151,
            read_lock: false,
            privileges: Privileges {
                super_priv: true,
                reload_priv: true,
                repl_client_priv: true,
                repl_slave_priv: true,
            },
            history: Vec::new(),
            failing: Vec::new(),
        }
    }

    fn position(&self) -> u64 {
        4 + self.current_gtid.sequence() * 256
    }
}

#[derive(Default)]
struct FleetState {
    nodes: BTreeMap<ServerUrl, SimulatedNode>,
}

impl FleetState {
    /// Lets every healthy replica catch up with its master, following relay
    /// chains until nothing moves.
    fn sync(&mut self) {
        for _ in 0..self.nodes.len() {
            let mut moved = false;
            let urls: Vec<ServerUrl> = self.nodes.keys().cloned().collect();
            for url in urls {
                let Some(node) = self.nodes.get(&url) else {
                    continue;
                };
                let Some(link) = node.link.clone() else {
                    continue;
                };
                if !node.alive || !link.io_running || !link.sql_running || node.lag > 0 {
                    continue;
                }
                let Some(master) = self.nodes.get(&link.master).filter(|master| master.alive)
                else {
                    continue;
                };
                let source = master.current_gtid.clone();
                let start = match link.mode {
                    Some(GtidMode::SlavePos) => node.slave_gtid.clone(),
                    _ => node.current_gtid.clone(),
                };
                let Some(node) = self.nodes.get_mut(&url) else {
                    continue;
                };
                if start.is_ahead_of(&source) {
                    if let Some(link) = node.link.as_mut() {
                        link.sql_running = false;
                        link.last_sql_error = format!("replica at {start} is ahead of {source}");
                    }
                    continue;
                }
                if node.current_gtid != source || node.slave_gtid != source {
                    node.current_gtid = source.clone();
                    node.slave_gtid = source;
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
    }
}

/// A fleet of simulated nodes shared by every admin handle it hands out.
#[derive(Clone, Default)]
pub struct SimulatedFleet {
    state: Arc<Mutex<FleetState>>,
}

pub fn url(index: usize) -> ServerUrl {
    ServerUrl::new(format!("db{index}"), 3306)
}

impl SimulatedFleet {
    /// `db1` is the writable master, `db2..=dbN` replicate from it with
    /// GTID slave_pos. Ten transactions have been replicated everywhere.
    pub fn standard(size: usize) -> Self {
        let fleet = Self::default();
        {
            let mut state = fleet.lock();
            for index in 1..=size {
                let mut node = SimulatedNode::new(index as u64);
                node.current_gtid = GtidList::new(vec![Gtid {
                    domain_id: 0,
                    server_id: 1,
                    seq_no: 10,
                }]);
                node.slave_gtid = if index == 1 {
                    GtidList::default()
                } else {
                    node.current_gtid.clone()
                };
                if index > 1 {
                    node.read_only = true;
                    node.link = Some(SimulatedLink {
                        master: url(1),
                        io_running: true,
                        sql_running: true,
                        mode: Some(GtidMode::SlavePos),
                        last_sql_error: String::new(),
                    });
                }
                state.nodes.insert(url(index), node);
            }
        }
        fleet
    }

    fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn hosts(&self) -> Vec<String> {
        self.lock().nodes.keys().map(ToString::to_string).collect()
    }

    pub fn cluster_config(&self, name: &str) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            hosts: self.hosts(),
            db_credentials: DB_CREDENTIALS.to_string(),
            replication_credentials: REPLICATION_CREDENTIALS.to_string(),
            monitoring_ticker: Duration::from_millis(50),
            max_fail: 2,
            wait_kill: Duration::from_millis(100),
            wait_position_timeout: Duration::from_millis(200),
            hook_timeout: Duration::from_secs(5),
            rejoin_backoff: Duration::from_millis(10),
            ..ClusterConfig::default()
        }
    }

    pub fn connector(&self) -> Arc<dyn AdminConnector> {
        Arc::new(SimulatedConnector {
            fleet: self.clone(),
        })
    }

    pub fn node(&self, url: &ServerUrl) -> Option<SimulatedNode> {
        let mut state = self.lock();
        state.sync();
        state.nodes.get(url).cloned()
    }

    pub fn update<R>(&self, url: &ServerUrl, change: impl FnOnce(&mut SimulatedNode) -> R) -> Option<R> {
        let mut state = self.lock();
        let result = state.nodes.get_mut(url).map(change);
        state.sync();
        result
    }

    pub fn kill(&self, url: &ServerUrl) {
        self.update(url, |node| node.alive = false);
    }

    pub fn revive(&self, url: &ServerUrl) {
        self.update(url, |node| {
            node.alive = true;
            node.read_lock = false;
            node.open_writes.clear();
        });
    }

    /// Commits `count` transactions on `url`. Returns false when the node
    /// refuses writes.
    pub fn write(&self, url: &ServerUrl, count: u64) -> bool {
        self.update(url, |node| {
            if !node.alive || node.read_only || node.read_lock {
                return false;
            }
            let seq = node.current_gtid.seq_for_domain(0).unwrap_or(0);
            let mut entries: Vec<Gtid> = node
                .current_gtid
                .entries()
                .iter()
                .filter(|gtid| gtid.domain_id != 0)
                .copied()
                .collect();
            entries.push(Gtid {
                domain_id: 0,
                server_id: node.server_id,
                seq_no: seq + count,
            });
            node.current_gtid = GtidList::new(entries);
            true
        })
        .unwrap_or(false)
    }

    pub fn history(&self, url: &ServerUrl) -> Vec<String> {
        self.node(url).map(|node| node.history).unwrap_or_default()
    }

    fn with_node<R>(
        &self,
        url: &ServerUrl,
        statement: &str,
        op: impl FnOnce(&mut FleetState, &ServerUrl) -> Result<R, AdminError>,
    ) -> Result<R, AdminError> {
        let mut state = self.lock();
        state.sync();
        let Some(node) = state.nodes.get_mut(url) else {
            return Err(unreachable(url));
        };
        if !node.alive || node.partitioned {
            return Err(unreachable(url));
        }
        if node.access_denied {
            return Err(AdminError::AccessDenied {
                server: url.to_string(),
                reason: "Access denied for user 'repman'".into(),
            });
        }
        if !statement.is_empty() {
            node.history.push(statement.to_string());
        }
        if node.failing.iter().any(|failing| failing == statement) {
            return Err(AdminError::Query {
                server: url.to_string(),
                statement: statement.to_string(),
                reason: "Lock wait timeout exceeded".into(),
            });
        }
        let result = op(&mut *state, url);
        state.sync();
        result
    }
}

fn unreachable(url: &ServerUrl) -> AdminError {
    AdminError::Connectivity {
        server: url.to_string(),
        reason: "connection refused".into(),
    }
}

fn node_mut<'a>(state: &'a mut FleetState, url: &ServerUrl) -> Result<&'a mut SimulatedNode, AdminError> {
    state.nodes.get_mut(url).ok_or_else(|| unreachable(url))
}

fn on_off(value: bool) -> String {
    if value { "ON" } else { "OFF" }.to_string()
}

pub struct SimulatedConnector {
    fleet: SimulatedFleet,
}

#[async_trait]
impl AdminConnector for SimulatedConnector {
    async fn connect(&self, url: &ServerUrl) -> Result<Arc<dyn DbAdmin>, AdminError> {
        if self.fleet.lock().nodes.contains_key(url) {
            Ok(Arc::new(SimulatedAdmin {
                fleet: self.fleet.clone(),
                url: url.clone(),
            }))
        } else {
            Err(unreachable(url))
        }
    }
}

pub struct SimulatedAdmin {
    fleet: SimulatedFleet,
    url: ServerUrl,
}

#[async_trait]
impl DbAdmin for SimulatedAdmin {
    async fn ping(&self) -> Result<(), AdminError> {
        self.fleet.with_node(&self.url, "", |_, _| Ok(()))
    }

    async fn replication_status(&self) -> Result<Option<ReplicationStatus>, AdminError> {
        self.fleet.with_node(&self.url, "", |state, url| {
            let node = node_mut(state, url)?.clone();
            let Some(link) = node.link else {
                return Ok(None);
            };
            let master = state.nodes.get(&link.master);
            let master_server_id = master.map(|master| master.server_id).unwrap_or(0);
            let master_position = master.map(SimulatedNode::position).unwrap_or(4);
            let io_running = link.io_running && master.is_some_and(|master| master.alive);
            let running = io_running && link.sql_running;
            let exec = if node.lag > 0 {
                master_position.saturating_sub(256)
            } else {
                master_position
            };
            Ok(Some(ReplicationStatus {
                master_host: link.master.host.clone(),
                master_port: link.master.port,
                master_server_id,
                io_running,
                sql_running: link.sql_running,
                seconds_behind_master: running.then_some(node.lag),
                using_gtid: match link.mode {
                    Some(GtidMode::SlavePos) => "Slave_Pos".into(),
                    Some(GtidMode::CurrentPos) => "Current_Pos".into(),
                    None => "No".into(),
                },
                gtid_io_pos: if io_running {
                    master.map(|m| m.current_gtid.clone()).unwrap_or_default()
                } else {
                    node.slave_gtid.clone()
                },
                master_log_file: "bin.000001".into(),
                read_master_log_pos: master_position,
                relay_master_log_file: "bin.000001".into(),
                exec_master_log_pos: exec,
                last_sql_errno: if link.last_sql_error.is_empty() { 0 } else { 1950 },
                last_sql_error: link.last_sql_error,
                ..ReplicationStatus::default()
            }))
        })
    }

    async fn variables(&self) -> Result<HashMap<String, String>, AdminError> {
        self.fleet.with_node(&self.url, "", |state, url| {
            let node = node_mut(state, url)?;
            Ok(HashMap::from([
                ("SERVER_ID".to_string(), node.server_id.to_string()),
                ("READ_ONLY".to_string(), on_off(node.read_only)),
                ("LOG_BIN".to_string(), on_off(node.log_bin)),
                ("GTID_CURRENT_POS".to_string(), node.current_gtid.to_string()),
                ("GTID_BINLOG_POS".to_string(), node.current_gtid.to_string()),
                ("GTID_SLAVE_POS".to_string(), node.slave_gtid.to_string()),
                ("MAX_CONNECTIONS".to_string(), node.max_connections.to_string()),
                ("REPLICATE_DO_DB".to_string(), node.replicate_do_db.clone()),
            ]))
        })
    }

    async fn status(&self) -> Result<HashMap<String, String>, AdminError> {
        self.fleet.with_node(&self.url, "", |state, url| {
            let node = node_mut(state, url)?;
            Ok(HashMap::from([
                (
                    "RPL_SEMI_SYNC_MASTER_STATUS".to_string(),
                    on_off(node.semisync_master),
                ),
                (
                    "RPL_SEMI_SYNC_SLAVE_STATUS".to_string(),
                    on_off(node.semisync_slave),
                ),
            ]))
        })
    }

    async fn master_status(&self) -> Result<Option<MasterStatus>, AdminError> {
        self.fleet.with_node(&self.url, "", |state, url| {
            let node = node_mut(state, url)?;
            Ok(node.log_bin.then(|| MasterStatus {
                file: "bin.000001".into(),
                position: node.position(),
                binlog_do_db: node.binlog_do_db.clone(),
                binlog_ignore_db: node.binlog_ignore_db.clone(),
            }))
        })
    }

    async fn privileges(&self, _user: &str, _host: &str) -> Result<Privileges, AdminError> {
        self.fleet
            .with_node(&self.url, "", |state, url| Ok(node_mut(state, url)?.privileges))
    }

    async fn binlog_dump_count(&self) -> Result<u64, AdminError> {
        self.fleet.with_node(&self.url, "", |state, url| {
            Ok(state
                .nodes
                .values()
                .filter(|node| {
                    node.alive
                        && node
                            .link
                            .as_ref()
                            .is_some_and(|link| &link.master == url && link.io_running)
                })
                .count() as u64)
        })
    }

    async fn stop_replica(&self) -> Result<(), AdminError> {
        self.fleet.with_node(&self.url, "STOP SLAVE", |state, url| {
            if let Some(link) = node_mut(state, url)?.link.as_mut() {
                link.io_running = false;
                link.sql_running = false;
            }
            Ok(())
        })
    }

    async fn start_replica(&self) -> Result<(), AdminError> {
        self.fleet.with_node(&self.url, "START SLAVE", |state, url| {
            let master_alive = state
                .nodes
                .get(url)
                .and_then(|node| node.link.as_ref())
                .and_then(|link| state.nodes.get(&link.master))
                .is_some_and(|master| master.alive);
            if let Some(link) = node_mut(state, url)?.link.as_mut() {
                link.io_running = master_alive;
                link.sql_running = true;
                link.last_sql_error.clear();
            }
            Ok(())
        })
    }

    async fn reset_replica(&self, all: bool) -> Result<(), AdminError> {
        let statement = if all { "RESET SLAVE ALL" } else { "RESET SLAVE" };
        self.fleet.with_node(&self.url, statement, |state, url| {
            let node = node_mut(state, url)?;
            if all {
                node.link = None;
            }
            Ok(())
        })
    }

    async fn change_replication_source(
        &self,
        options: &ChangeSourceOptions,
    ) -> Result<(), AdminError> {
        let statement = format!("CHANGE MASTER TO {}:{}", options.host, options.port);
        self.fleet.with_node(&self.url, &statement, |state, url| {
            let node = node_mut(state, url)?;
            let mode = options
                .mode
                .or_else(|| node.link.as_ref().and_then(|link| link.mode));
            node.link = Some(SimulatedLink {
                master: ServerUrl::new(options.host.clone(), options.port),
                io_running: false,
                sql_running: false,
                mode,
                last_sql_error: String::new(),
            });
            Ok(())
        })
    }

    async fn set_read_only(&self, read_only: bool) -> Result<(), AdminError> {
        let statement = format!("SET GLOBAL read_only={}", u8::from(read_only));
        self.fleet.with_node(&self.url, &statement, |state, url| {
            node_mut(state, url)?.read_only = read_only;
            Ok(())
        })
    }

    async fn flush_tables(&self, mode: FlushMode) -> Result<(), AdminError> {
        let statement = match mode {
            FlushMode::NoLog => "FLUSH NO_WRITE_TO_BINLOG TABLES",
            FlushMode::WithReadLock => "FLUSH TABLES WITH READ LOCK",
            FlushMode::Plain => "FLUSH TABLES",
        };
        self.fleet.with_node(&self.url, statement, |state, url| {
            if mode == FlushMode::WithReadLock {
                node_mut(state, url)?.read_lock = true;
            }
            Ok(())
        })
    }

    async fn unlock_tables(&self) -> Result<(), AdminError> {
        self.fleet.with_node(&self.url, "UNLOCK TABLES", |state, url| {
            node_mut(state, url)?.read_lock = false;
            Ok(())
        })
    }

    async fn kill_client_threads(&self) -> Result<u64, AdminError> {
        self.fleet.with_node(&self.url, "KILL", |state, url| {
            let node = node_mut(state, url)?;
            let killed = node.open_writes.len() as u64;
            node.open_writes.clear();
            Ok(killed)
        })
    }

    async fn wait_for_position(
        &self,
        position: &GtidList,
        _timeout: Duration,
    ) -> Result<WaitOutcome, AdminError> {
        let statement = format!("MASTER_GTID_WAIT('{position}')");
        self.fleet.with_node(&self.url, &statement, |state, url| {
            let node = node_mut(state, url)?;
            if node.current_gtid.is_behind(position) {
                Ok(WaitOutcome::TimedOut)
            } else {
                Ok(WaitOutcome::Reached)
            }
        })
    }

    async fn check_long_running_writes(&self, threshold: Duration) -> Result<u64, AdminError> {
        self.fleet.with_node(&self.url, "", |state, url| {
            Ok(node_mut(state, url)?
                .open_writes
                .iter()
                .filter(|age| **age > threshold)
                .count() as u64)
        })
    }

    async fn set_max_connections(&self, value: u64) -> Result<(), AdminError> {
        let statement = format!("SET GLOBAL max_connections={value}");
        self.fleet.with_node(&self.url, &statement, |state, url| {
            node_mut(state, url)?.max_connections = value;
            Ok(())
        })
    }

    async fn set_gtid_slave_pos(&self, position: &GtidList) -> Result<(), AdminError> {
        let statement = format!("SET GLOBAL gtid_slave_pos='{position}'");
        self.fleet.with_node(&self.url, &statement, |state, url| {
            node_mut(state, url)?.slave_gtid = position.clone();
            Ok(())
        })
    }
}

/// Records log tool invocations. When attached to a fleet, flashback
/// rewinds the node to the crash point and reseed copies the source's
/// position onto the target.
#[derive(Default)]
pub struct RecordingLogTools {
    calls: Mutex<Vec<String>>,
    fleet: Option<SimulatedFleet>,
    failing: bool,
}

impl RecordingLogTools {
    pub fn with_fleet(fleet: SimulatedFleet) -> Self {
        Self {
            fleet: Some(fleet),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: String) -> Result<(), RejoinError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.clone());
        if self.failing {
            return Err(RejoinError::Tool {
                tool: call,
                reason: "simulated failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LogTools for RecordingLogTools {
    async fn backup_binlogs(&self, server: &ServerUrl, _crash: &Crash) -> Result<(), RejoinError> {
        self.record(format!("backup {server}"))
    }

    async fn flashback(&self, server: &ServerUrl, crash: &Crash) -> Result<(), RejoinError> {
        self.record(format!("flashback {server} to {}", crash.gtid_io_pos))?;
        if let Some(fleet) = &self.fleet {
            fleet.update(server, |node| {
                node.current_gtid = crash.gtid_io_pos.clone();
                node.slave_gtid = crash.gtid_io_pos.clone();
            });
        }
        Ok(())
    }

    async fn reseed(&self, source: &ServerUrl, target: &ServerUrl) -> Result<(), RejoinError> {
        self.record(format!("reseed {target} from {source}"))?;
        if let Some(fleet) = &self.fleet {
            let position = fleet
                .node(source)
                .map(|node| node.current_gtid)
                .unwrap_or_default();
            fleet.update(target, |node| {
                node.current_gtid = position.clone();
                node.slave_gtid = position;
            });
        }
        Ok(())
    }
}

/// Arbitrator returning a fixed verdict, or failing when `verdict` is `None`.
pub struct StaticArbitrator {
    verdict: Option<Verdict>,
    heartbeats: Mutex<Vec<HeartbeatRecord>>,
    requests: Mutex<Vec<HeartbeatRecord>>,
}

impl StaticArbitrator {
    pub fn new(verdict: Option<Verdict>) -> Self {
        Self {
            verdict,
            heartbeats: Mutex::default(),
            requests: Mutex::default(),
        }
    }

    pub fn heartbeats(&self) -> usize {
        self.heartbeats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn requests(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Arbitrator for StaticArbitrator {
    async fn heartbeat(&self, record: &HeartbeatRecord) -> Result<(), ArbitrationError> {
        self.heartbeats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    async fn arbitrate(
        &self,
        record: &HeartbeatRecord,
    ) -> Result<ArbitrationResponse, ArbitrationError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        match self.verdict {
            Some(arbitration) => Ok(ArbitrationResponse {
                arbitration,
                master: record.master.clone(),
            }),
            None => Err(ArbitrationError::Transport("connection refused".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replicas_follow_master_writes() {
        let fleet = SimulatedFleet::standard(3);
        assert!(fleet.write(&url(1), 5));
        let replica = fleet.node(&url(2)).expect("db2");
        assert_eq!(replica.current_gtid.to_string(), "0-1-15");
        assert!(!fleet.write(&url(2), 1), "replicas are read only");
    }

    #[tokio::test]
    async fn lagging_replica_stays_behind() {
        let fleet = SimulatedFleet::standard(2);
        fleet.update(&url(2), |node| node.lag = 60);
        fleet.write(&url(1), 3);
        let admin = fleet.connector().connect(&url(2)).await.expect("connect");
        let status = admin.replication_status().await.expect("status").expect("linked");
        assert_eq!(status.seconds_behind_master, Some(60));
        assert!(!status.relay_drained());
        assert_eq!(
            fleet.node(&url(2)).expect("db2").current_gtid.to_string(),
            "0-1-10"
        );
    }

    #[tokio::test]
    async fn dead_node_is_unreachable() {
        let fleet = SimulatedFleet::standard(2);
        fleet.kill(&url(1));
        let admin = fleet.connector().connect(&url(1)).await.expect("connect");
        assert!(admin.ping().await.expect_err("dead").is_connectivity());
        let replica = fleet.connector().connect(&url(2)).await.expect("connect");
        replica.stop_replica().await.expect("stop");
        replica.start_replica().await.expect("start");
        let status = replica.replication_status().await.expect("status").expect("linked");
        assert!(!status.io_running);
        assert_eq!(status.seconds_behind_master, None);
    }
}
