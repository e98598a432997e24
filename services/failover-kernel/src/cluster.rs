use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    admin::{AdminConnector, AdminError, DbAdmin},
    alert::{AlertNotifier, StateAlert},
    arbitration::{Arbitrator, HeartbeatRecord},
    config::{ClusterConfig, ConfigError},
    failover::Crash,
    rejoin::{LogTools, RejoinTracker},
    server::{Server, ServerSnapshot, ServerState, ServerUrl},
    state::{LedgerEntry, StateMachine},
    telemetry::failover::record_state_transition,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    #[default]
    Standard,
    MultiMaster,
    MultiTierRelay,
    Ring,
}

/// The orchestrated aggregate. Owns every [`Server`]; the master and the
/// replica set are indices into that vector.
pub struct Cluster {
    pub(crate) config: Arc<ClusterConfig>,
    pub(crate) servers: Vec<Server>,
    pub(crate) master: Option<usize>,
    pub(crate) slaves: Vec<usize>,
    pub(crate) topology: TopologyKind,
    pub(crate) sme: Arc<StateMachine>,
    pub(crate) connector: Arc<dyn AdminConnector>,
    pub(crate) arbitrator: Option<Arc<dyn Arbitrator>>,
    pub(crate) log_tools: Arc<dyn LogTools>,
    pub(crate) alerts: AlertNotifier,
    pub(crate) rejoin: RejoinTracker,
    pub(crate) crashes: Vec<Crash>,
    pub(crate) monitor_id: Uuid,
    pub(crate) epoch: u64,
}

impl Cluster {
    pub fn new(
        config: ClusterConfig,
        connector: Arc<dyn AdminConnector>,
        log_tools: Arc<dyn LogTools>,
    ) -> Result<Self, ConfigError> {
        let servers = config
            .server_urls()?
            .into_iter()
            .map(Server::new)
            .collect();
        let topology = if config.multi_master {
            TopologyKind::MultiMaster
        } else {
            TopologyKind::Standard
        };
        let rejoin = RejoinTracker::new(config.rejoin_max_attempts, config.rejoin_backoff);
        // a configured id keeps the arbitrator row across restarts
        let monitor_id = config
            .arbitration
            .unique_id
            .map_or_else(Uuid::new_v4, |id| Uuid::from_u64_pair(id, 0));
        Ok(Self {
            config: Arc::new(config),
            servers,
            master: None,
            slaves: Vec::new(),
            topology,
            sme: Arc::new(StateMachine::new()),
            connector,
            arbitrator: None,
            log_tools,
            alerts: AlertNotifier::disabled(),
            rejoin,
            crashes: Vec::new(),
            monitor_id,
            epoch: 0,
        })
    }

    pub fn with_arbitrator(mut self, arbitrator: Arc<dyn Arbitrator>) -> Self {
        self.arbitrator = Some(arbitrator);
        self
    }

    pub fn with_alerts(mut self, alerts: AlertNotifier) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn server(&self, url: &ServerUrl) -> Option<&Server> {
        self.servers.iter().find(|server| &server.url == url)
    }

    pub(crate) fn index_of(&self, url: &ServerUrl) -> Option<usize> {
        self.servers.iter().position(|server| &server.url == url)
    }

    pub fn master(&self) -> Option<&Server> {
        self.master.map(|index| &self.servers[index])
    }

    pub fn slaves(&self) -> impl Iterator<Item = &Server> {
        self.slaves.iter().map(|index| &self.servers[*index])
    }

    pub fn topology(&self) -> TopologyKind {
        self.topology
    }

    pub fn is_multi_master(&self) -> bool {
        self.topology == TopologyKind::MultiMaster
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.sme
    }

    pub fn crashes(&self) -> &[Crash] {
        &self.crashes
    }

    pub(crate) fn last_crash_of(&self, url: &ServerUrl) -> Option<&Crash> {
        self.crashes.iter().rev().find(|crash| &crash.url == url)
    }

    /// Starts a new refresh cycle; servers may transition once per cycle.
    pub(crate) fn begin_cycle(&mut self) {
        self.epoch += 1;
    }

    /// Applies a state transition and fires the side effects that go with it.
    /// Returns whether the state changed.
    pub(crate) fn set_state(&mut self, index: usize, next: ServerState) -> bool {
        let epoch = self.epoch;
        let server = &mut self.servers[index];
        let from = server.state();
        match server.transition(next, epoch) {
            Ok(true) => {
                info!(cluster = %self.config.name, server = %server.url, %from, to = %next, "server state changed");
                record_state_transition(&self.config.name, from, next);
                if next != ServerState::Suspect {
                    self.alerts.notify(StateAlert {
                        cluster: self.config.name.clone(),
                        server: server.url.clone(),
                        from,
                        to: next,
                        at: Utc::now(),
                    });
                }
                true
            }
            Ok(false) => false,
            Err(error) => {
                warn!(cluster = %self.config.name, %error, "state transition refused");
                false
            }
        }
    }

    pub(crate) fn add_slave(&mut self, index: usize) {
        if !self.slaves.contains(&index) {
            self.slaves.push(index);
        }
    }

    pub(crate) fn remove_slave(&mut self, index: usize) {
        self.slaves.retain(|slave| *slave != index);
    }

    /// Returns the administrative connection of a server, opening it first
    /// when the server was never reached.
    pub(crate) async fn ensure_admin(&mut self, index: usize) -> Result<Arc<dyn DbAdmin>, AdminError> {
        if let Some(admin) = &self.servers[index].admin {
            return Ok(admin.clone());
        }
        let admin = self.connector.connect(&self.servers[index].url).await?;
        self.servers[index].admin = Some(admin.clone());
        Ok(admin)
    }

    pub(crate) fn ledger(&self, entry: LedgerEntry) {
        self.sme.add_state(entry);
    }

    /// Identity of this monitor at the arbitrator.
    pub fn arbitration_uid(&self) -> u64 {
        self.config
            .arbitration
            .unique_id
            .unwrap_or_else(|| self.monitor_id.as_u64_pair().0)
    }

    pub fn heartbeat_record(&self) -> HeartbeatRecord {
        HeartbeatRecord {
            uuid: self.monitor_id.to_string(),
            secret: self.config.arbitration.secret.clone(),
            cluster: self.config.name.clone(),
            master: self
                .master()
                .map(|master| master.url.to_string())
                .unwrap_or_default(),
            uid: self.arbitration_uid(),
            hosts: self.servers.len() as u32,
            failed: self.servers.iter().filter(|server| server.is_failed()).count() as u32,
        }
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            name: self.config.name.clone(),
            topology: self.topology,
            master: self.master().map(|master| master.url.clone()),
            slaves: self.slaves().map(|slave| slave.url.clone()).collect(),
            servers: self.servers.iter().map(Server::snapshot).collect(),
            failover_count: self.sme.failover_count(),
            last_failover: self.sme.last_failover(),
            in_failover: self.sme.is_in_failover(),
            errors: self
                .sme
                .open_errors()
                .into_iter()
                .map(|entry| format!("{} : {}", entry.code, entry.description))
                .collect(),
            warnings: self
                .sme
                .open_warnings()
                .into_iter()
                .map(|entry| format!("{} : {}", entry.code, entry.description))
                .collect(),
        }
    }
}

/// Point-in-time copy of a cluster handed to readers outside the loop.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub name: String,
    pub topology: TopologyKind,
    pub master: Option<ServerUrl>,
    pub slaves: Vec<ServerUrl>,
    pub servers: Vec<ServerSnapshot>,
    pub failover_count: u64,
    pub last_failover: Option<DateTime<Utc>>,
    pub in_failover: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ClusterSnapshot {
    pub fn server(&self, url: &ServerUrl) -> Option<&ServerSnapshot> {
        self.servers.iter().find(|server| &server.url == url)
    }

    pub fn masters(&self) -> usize {
        self.servers
            .iter()
            .filter(|server| server.state == ServerState::Master)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingLogTools, SimulatedFleet};

    fn cluster() -> Cluster {
        let fleet = SimulatedFleet::standard(3);
        let config = fleet.cluster_config("east");
        Cluster::new(config, fleet.connector(), Arc::new(RecordingLogTools::default()))
            .expect("cluster")
    }

    #[test]
    fn builds_servers_from_host_list() {
        let cluster = cluster();
        assert_eq!(cluster.servers().len(), 3);
        assert!(cluster.master().is_none());
        assert!(cluster
            .servers()
            .iter()
            .all(|server| server.state() == ServerState::Unconnected));
    }

    #[test]
    fn replica_set_holds_each_server_once() {
        let mut cluster = cluster();
        cluster.add_slave(1);
        cluster.add_slave(1);
        cluster.add_slave(2);
        assert_eq!(cluster.slaves().count(), 2);
        cluster.remove_slave(1);
        assert_eq!(cluster.slaves().next().map(|s| s.url.host.as_str()), Some("db3"));
    }

    #[test]
    fn one_transition_per_cycle() {
        let mut cluster = cluster();
        cluster.begin_cycle();
        assert!(cluster.set_state(0, ServerState::Slave));
        assert!(!cluster.set_state(0, ServerState::Failed));
        cluster.begin_cycle();
        assert!(cluster.set_state(0, ServerState::Failed));
        assert_eq!(cluster.servers()[0].prev_state(), ServerState::Slave);
    }

    #[test]
    fn heartbeat_carries_identity_and_failures() {
        let mut cluster = cluster();
        cluster.begin_cycle();
        cluster.set_state(2, ServerState::Failed);
        let record = cluster.heartbeat_record();
        assert_eq!(record.cluster, "east");
        assert_eq!(record.hosts, 3);
        assert_eq!(record.failed, 1);
        assert_eq!(record.uid, cluster.arbitration_uid());
        assert!(record.master.is_empty());
    }

    #[test]
    fn configured_unique_id_gives_a_stable_uuid() {
        let fleet = SimulatedFleet::standard(3);
        let build = || {
            let mut config = fleet.cluster_config("east");
            config.arbitration.unique_id = Some(42);
            Cluster::new(config, fleet.connector(), Arc::new(RecordingLogTools::default()))
                .expect("cluster")
        };
        let first = build().heartbeat_record();
        let second = build().heartbeat_record();
        assert_eq!(first.uuid, second.uuid);
        assert_eq!(first.uid, 42);
        assert_ne!(cluster().heartbeat_record().uuid, cluster().heartbeat_record().uuid);
    }
}
