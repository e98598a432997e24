//! One monitoring loop per cluster.
//!
//! The loop task exclusively owns its [`Cluster`]. Operators reach it through
//! a [`MonitorHandle`]: requests travel over a channel and are served between
//! ticks, and every tick publishes a fresh [`ClusterSnapshot`].

use std::sync::Arc;

use thiserror::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    admin::MySqlConnector,
    alert::AlertNotifier,
    arbitration::HttpArbitrator,
    cluster::{Cluster, ClusterSnapshot},
    config::ClusterConfig,
    failover::{automatic_failover, master_failover, FailoverError, FailoverReport},
    health,
    rejoin::{retry_pending, ExternalLogTools},
    state::LedgerChange,
    topology::{discover, DiscoveryError},
    ErrorClass, KernelError,
};

const REQUEST_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor for cluster {0} is not running")]
    Stopped(String),
    #[error(transparent)]
    Failover(#[from] FailoverError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

impl MonitorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MonitorError::Stopped(_) => ErrorClass::Connectivity,
            MonitorError::Failover(error) => error.class(),
            MonitorError::Discovery(error) => error.class(),
        }
    }
}

enum OperatorRequest {
    Failover(oneshot::Sender<Result<FailoverReport, FailoverError>>),
    Switchover(oneshot::Sender<Result<FailoverReport, FailoverError>>),
    Discover(oneshot::Sender<Result<ClusterSnapshot, DiscoveryError>>),
}

/// Cloneable access to a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    name: String,
    requests: mpsc::Sender<OperatorRequest>,
    snapshots: watch::Receiver<ClusterSnapshot>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl MonitorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClusterSnapshot> {
        self.snapshots.clone()
    }

    /// Operator-triggered failover; the master is assumed dead.
    pub async fn failover(&self) -> Result<FailoverReport, MonitorError> {
        Ok(self.request(OperatorRequest::Failover).await??)
    }

    /// Planned hand-over from a live master.
    pub async fn switchover(&self) -> Result<FailoverReport, MonitorError> {
        Ok(self.request(OperatorRequest::Switchover).await??)
    }

    pub async fn discover(&self) -> Result<ClusterSnapshot, MonitorError> {
        Ok(self.request(OperatorRequest::Discover).await??)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> OperatorRequest,
    ) -> Result<T, MonitorError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(build(reply))
            .await
            .map_err(|_| MonitorError::Stopped(self.name.clone()))?;
        response
            .await
            .map_err(|_| MonitorError::Stopped(self.name.clone()))
    }
}

pub struct ClusterMonitor {
    cluster: Cluster,
}

impl ClusterMonitor {
    pub fn new(cluster: Cluster) -> Self {
        Self { cluster }
    }

    /// Wires a cluster to real MariaDB nodes, the external log tools, the
    /// alert webhook and, when enabled, the HTTP arbitrator.
    pub fn from_config(config: ClusterConfig) -> Result<Self, KernelError> {
        config.validate()?;
        let credentials = config.db_credentials();
        let connector = Arc::new(MySqlConnector::new(
            credentials.user,
            credentials.password,
            config.connect_timeout,
        ));
        let log_tools = Arc::new(ExternalLogTools::from_config(&config));
        let alerts = AlertNotifier::new(config.alert_webhook.clone());
        let arbitrator = if config.arbitration.enabled {
            Some(HttpArbitrator::new(
                config.arbitration.url.clone(),
                config.arbitration.timeout,
            )?)
        } else {
            None
        };
        let mut cluster = Cluster::new(config, connector, log_tools)?.with_alerts(alerts);
        if let Some(arbitrator) = arbitrator {
            cluster = cluster.with_arbitrator(Arc::new(arbitrator));
        }
        Ok(Self::new(cluster))
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Runs one monitoring pass.
    pub async fn tick(&mut self) {
        let span = info_span!("monitor.tick", cluster = %self.cluster.config.name);
        run_tick(&mut self.cluster).instrument(span).await
    }

    /// Moves the monitor onto its own task and returns a handle to it.
    pub fn spawn(mut self) -> (MonitorHandle, JoinHandle<()>) {
        let name = self.cluster.config.name.clone();
        let (requests, mut inbox) = mpsc::channel(REQUEST_BUFFER);
        let (snapshot_tx, snapshots) = watch::channel(self.cluster.snapshot());
        let (shutdown, mut stop) = watch::channel(false);
        let handle = MonitorHandle {
            name: name.clone(),
            requests,
            snapshots,
            shutdown: Arc::new(shutdown),
        };

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.cluster.config.monitoring_ticker);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(cluster = %name, hosts = self.cluster.servers.len(), "monitor started");
            loop {
                if *stop.borrow() {
                    break;
                }
                select! {
                    _ = ticker.tick() => self.tick().await,
                    Some(request) = inbox.recv() => self.serve(request).await,
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
                snapshot_tx.send_replace(self.cluster.snapshot());
            }
            info!(cluster = %name, "monitor stopped");
        });

        (handle, task)
    }

    async fn serve(&mut self, request: OperatorRequest) {
        let cluster = &mut self.cluster;
        match request {
            OperatorRequest::Failover(reply) => {
                info!(cluster = %cluster.config.name, "operator requested failover");
                let _ = reply.send(master_failover(cluster, true).await);
            }
            OperatorRequest::Switchover(reply) => {
                info!(cluster = %cluster.config.name, "operator requested switchover");
                let _ = reply.send(master_failover(cluster, false).await);
            }
            OperatorRequest::Discover(reply) => {
                let result = discover(cluster).await.map(|()| cluster.snapshot());
                let _ = reply.send(result);
            }
        }
    }
}

async fn run_tick(cluster: &mut Cluster) {
    if cluster.sme.is_in_failover() {
        debug!("promotion in progress, skipping tick");
        return;
    }
    cluster.sme.clear_state();

    let report = health::check(cluster).await;
    if let Err(error) = discover(cluster).await {
        debug!(%error, "topology not monitorable");
    }
    for change in cluster.sme.changes() {
        match change {
            LedgerChange::Opened(entry) => {
                info!(code = %entry.code, severity = %entry.severity, origin = %entry.origin, "OPENED : {}", entry.description)
            }
            LedgerChange::Resolved(entry) => {
                info!(code = %entry.code, origin = %entry.origin, "RESOLV : {}", entry.description)
            }
        }
    }

    retry_pending(cluster).await;

    if cluster.master().is_some_and(|master| master.is_failed()) {
        match automatic_failover(cluster).await {
            Ok(Some(report)) => {
                info!(new_master = %report.new_master, failures = report.failures.len(), "automatic failover complete")
            }
            Ok(None) if report.master_failed => {
                warn!("master failed, waiting for an operator to trigger the failover")
            }
            Ok(None) => {}
            Err(error) if report.master_failed => warn!(%error, "automatic failover refused"),
            Err(error) => debug!(%error, "automatic failover still refused"),
        }
    }

    if cluster.config.arbitration.enabled {
        if let Some(arbitrator) = cluster.arbitrator.clone() {
            let record = cluster.heartbeat_record();
            if let Err(error) = arbitrator.heartbeat(&record).await {
                warn!(%error, "arbitrator heartbeat failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::{
        config::FailoverMode,
        server::ServerState,
        state::codes,
        test_support::{url, RecordingLogTools, SimulatedFleet},
    };

    fn monitor(fleet: &SimulatedFleet, configure: impl FnOnce(&mut ClusterConfig)) -> ClusterMonitor {
        let mut config = fleet.cluster_config("east");
        configure(&mut config);
        let cluster = Cluster::new(
            config,
            fleet.connector(),
            Arc::new(RecordingLogTools::default()),
        )
        .expect("cluster");
        ClusterMonitor::new(cluster)
    }

    #[tokio::test]
    async fn first_tick_discovers_topology() {
        let fleet = SimulatedFleet::standard(3);
        let mut monitor = monitor(&fleet, |_| {});
        monitor.tick().await;
        let snapshot = monitor.cluster().snapshot();
        assert_eq!(snapshot.master, Some(url(1)));
        assert_eq!(snapshot.slaves, vec![url(2), url(3)]);
        assert_eq!(snapshot.masters(), 1);
    }

    #[tokio::test]
    async fn automatic_mode_replaces_dead_master() {
        let fleet = SimulatedFleet::standard(3);
        let mut monitor = monitor(&fleet, |config| config.failover_mode = FailoverMode::Automatic);
        monitor.tick().await;
        fleet.kill(&url(1));

        monitor.tick().await;
        assert_eq!(monitor.cluster().servers()[0].state(), ServerState::Suspect);
        monitor.tick().await;

        let snapshot = monitor.cluster().snapshot();
        assert_eq!(snapshot.master, Some(url(2)));
        assert_eq!(snapshot.failover_count, 1);
        assert_eq!(
            fleet.node(&url(3)).expect("db3").link.expect("linked").master,
            url(2)
        );
    }

    #[tokio::test]
    async fn manual_mode_waits_for_operator() {
        let fleet = SimulatedFleet::standard(3);
        let mut monitor = monitor(&fleet, |_| {});
        monitor.tick().await;
        fleet.kill(&url(1));
        for _ in 0..3 {
            monitor.tick().await;
        }
        let snapshot = monitor.cluster().snapshot();
        assert_eq!(snapshot.master, Some(url(1)));
        assert_eq!(
            snapshot.server(&url(1)).map(|server| server.state),
            Some(ServerState::Failed)
        );
        assert_eq!(snapshot.failover_count, 0);
    }

    #[tokio::test]
    async fn partitioned_master_is_not_replaced() {
        let fleet = SimulatedFleet::standard(3);
        let mut monitor = monitor(&fleet, |config| config.failover_mode = FailoverMode::Automatic);
        monitor.tick().await;
        fleet.update(&url(1), |node| node.partitioned = true);
        for _ in 0..3 {
            monitor.tick().await;
        }
        assert_eq!(monitor.cluster().snapshot().failover_count, 0);
        assert!(monitor
            .cluster()
            .state_machine()
            .is_in_current_state(codes::MASTER_UNREACHABLE_SLAVES_RUNNING));
        assert!(!fleet.node(&url(2)).expect("db2").history.iter().any(|s| s.contains("RESET SLAVE")));
    }

    #[tokio::test]
    async fn handle_serves_operator_requests() {
        let fleet = SimulatedFleet::standard(3);
        let monitor = monitor(&fleet, |config| config.monitoring_ticker = Duration::from_millis(20));
        let (handle, task) = monitor.spawn();

        let snapshot = handle.discover().await.expect("discover");
        assert_eq!(snapshot.master, Some(url(1)));

        let report = handle.switchover().await.expect("switchover");
        assert_eq!(report.new_master, url(2));

        let mut updates = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while updates.borrow_and_update().master != Some(url(2)) {
                updates.changed().await.expect("published");
            }
        })
        .await
        .expect("snapshot published");
        assert_eq!(handle.snapshot().failover_count, 0);

        handle.shutdown();
        task.await.expect("monitor task");
        assert!(matches!(
            handle.discover().await,
            Err(MonitorError::Stopped(_))
        ));
    }
}
