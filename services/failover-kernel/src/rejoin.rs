//! Reintegration of nodes that come back after a failover.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::{
    admin::{AdminError, ChangeSourceOptions, GtidMode},
    cluster::Cluster,
    config::{ClusterConfig, Credentials},
    failover::Crash,
    gtid::GtidList,
    hooks::{self, HookError},
    server::{ServerState, ServerUrl},
    telemetry::failover::{record_rejoin, RejoinOutcome},
};

#[derive(Debug, Error)]
pub enum RejoinError {
    #[error(transparent)]
    Admin(#[from] AdminError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error("{tool} failed: {reason}")]
    Tool { tool: String, reason: String },
    #[error("no master is known to rejoin {0}")]
    NoMaster(String),
    #[error("{server} is ahead of the election point and neither flashback nor reseed is enabled")]
    Diverged { server: String },
    #[error("{server} has no gtid position to rejoin from and reseed is disabled")]
    NoPosition { server: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejoinStrategy {
    Positional,
    Flashback,
    Reseed,
}

impl RejoinStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejoinStrategy::Positional => "positional",
            RejoinStrategy::Flashback => "flashback",
            RejoinStrategy::Reseed => "dump",
        }
    }
}

/// Binary log and dump tooling used by the heavier rejoin strategies.
#[async_trait]
pub trait LogTools: Send + Sync {
    /// Saves the binary logs `server` wrote after the crash point.
    async fn backup_binlogs(&self, server: &ServerUrl, crash: &Crash) -> Result<(), RejoinError>;
    /// Rewinds `server` to the crash point.
    async fn flashback(&self, server: &ServerUrl, crash: &Crash) -> Result<(), RejoinError>;
    /// Replaces the data of `target` with a logical dump of `source`.
    async fn reseed(&self, source: &ServerUrl, target: &ServerUrl) -> Result<(), RejoinError>;
}

/// Runs `mysqlbinlog`, `mysql` and `mysqldump` from the configured paths.
pub struct ExternalLogTools {
    mysqlbinlog: String,
    mysql: String,
    mysqldump: String,
    working_dir: String,
    credentials: Credentials,
    timeout: Duration,
}

impl ExternalLogTools {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            mysqlbinlog: config.mysqlbinlog_path.clone(),
            mysql: config.mysql_client_path.clone(),
            mysqldump: config.mysqldump_path.clone(),
            working_dir: config.working_dir.trim_end_matches('/').to_string(),
            credentials: config.db_credentials(),
            timeout: config.hook_timeout,
        }
    }

    fn connection_args(&self, server: &ServerUrl) -> Vec<String> {
        vec![
            format!("--host={}", server.host),
            format!("--port={}", server.port),
            format!("--user={}", self.credentials.user),
            format!("--password={}", self.credentials.password),
        ]
    }

    fn file(&self, server: &ServerUrl, suffix: &str) -> String {
        format!("{}/{}_{}_{suffix}", self.working_dir, server.host, server.port)
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<(), RejoinError> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = hooks::run_script(program, &args, self.timeout).await?;
        if !output.is_empty() {
            info!(program, %output, "log tool output");
        }
        Ok(())
    }

    async fn load(&self, target: &ServerUrl, file: &str) -> Result<(), RejoinError> {
        let mut args = self.connection_args(target);
        args.push(format!("--execute=source {file}"));
        self.run(&self.mysql, args).await
    }
}

#[async_trait]
impl LogTools for ExternalLogTools {
    async fn backup_binlogs(&self, server: &ServerUrl, crash: &Crash) -> Result<(), RejoinError> {
        let mut args = self.connection_args(server);
        args.extend([
            "--read-from-remote-server".to_string(),
            "--raw".to_string(),
            "--to-last-log".to_string(),
            format!("--result-file={}", self.file(server, "")),
            crash.master_log_file.clone(),
        ]);
        self.run(&self.mysqlbinlog, args).await
    }

    async fn flashback(&self, server: &ServerUrl, crash: &Crash) -> Result<(), RejoinError> {
        let file = self.file(server, "flashback.sql");
        let mut args = self.connection_args(server);
        args.extend([
            "--read-from-remote-server".to_string(),
            "--flashback".to_string(),
            "--to-last-log".to_string(),
            format!("--start-position={}", crash.master_log_pos),
            format!("--result-file={file}"),
            crash.master_log_file.clone(),
        ]);
        self.run(&self.mysqlbinlog, args).await?;
        self.load(server, &file).await
    }

    async fn reseed(&self, source: &ServerUrl, target: &ServerUrl) -> Result<(), RejoinError> {
        let file = self.file(target, "dump.sql");
        let mut args = self.connection_args(source);
        args.extend([
            "--all-databases".to_string(),
            "--single-transaction".to_string(),
            "--gtid".to_string(),
            "--master-data=1".to_string(),
            format!("--result-file={file}"),
        ]);
        self.run(&self.mysqldump, args).await?;
        self.load(target, &file).await
    }
}

#[derive(Clone, Copy, Debug)]
struct Attempts {
    count: u32,
    next_at: Instant,
}

/// Retry budget of failed rejoins, with jittered exponential backoff.
#[derive(Debug)]
pub struct RejoinTracker {
    max_attempts: u32,
    base: Duration,
    attempts: HashMap<ServerUrl, Attempts>,
}

impl RejoinTracker {
    pub fn new(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts,
            base,
            attempts: HashMap::new(),
        }
    }

    pub fn is_pending(&self, url: &ServerUrl) -> bool {
        self.attempts.contains_key(url)
    }

    pub fn attempts(&self, url: &ServerUrl) -> u32 {
        self.attempts.get(url).map_or(0, |attempts| attempts.count)
    }

    pub fn is_exhausted(&self, url: &ServerUrl) -> bool {
        self.max_attempts > 0 && self.attempts(url) >= self.max_attempts
    }

    pub fn is_due(&self, url: &ServerUrl, now: Instant) -> bool {
        !self.is_exhausted(url)
            && self
                .attempts
                .get(url)
                .map_or(true, |attempts| now >= attempts.next_at)
    }

    /// Records a failed attempt and returns the delay before the next one,
    /// or `None` once the budget is spent.
    pub fn record_failure(&mut self, url: &ServerUrl, now: Instant) -> Option<Duration> {
        let count = self.attempts(url) + 1;
        let exponent = count.saturating_sub(1).min(16);
        let delay = jittered_interval(self.base.saturating_mul(1 << exponent));
        self.attempts.insert(
            url.clone(),
            Attempts {
                count,
                next_at: now + delay,
            },
        );
        (!self.is_exhausted(url)).then_some(delay)
    }

    pub fn record_success(&mut self, url: &ServerUrl) {
        self.attempts.remove(url);
    }

    /// Drops the budget of a node so the next reconnect starts afresh.
    pub fn forget(&mut self, url: &ServerUrl) {
        self.attempts.remove(url);
    }
}

fn jittered_interval(base: Duration) -> Duration {
    let jitter: f64 = thread_rng().gen_range(0.6..1.2);
    let millis = (base.as_millis() as f64 * jitter).max(1.0);
    Duration::from_millis(millis as u64)
}

fn source_options(cluster: &Cluster, master: &ServerUrl, mode: GtidMode) -> ChangeSourceOptions {
    let credentials = cluster.config.replication_credentials();
    ChangeSourceOptions {
        host: master.host.clone(),
        port: master.port,
        user: credentials.user,
        password: credentials.password,
        connect_retry: cluster.config.master_connect_retry,
        mode: Some(mode),
    }
}

/// Rejoins a recovered former master, or any unlinked node, as a replica
/// of the current master.
#[instrument(skip(cluster), fields(cluster = %cluster.config.name))]
pub async fn rejoin_master(
    cluster: &mut Cluster,
    index: usize,
) -> Result<RejoinStrategy, RejoinError> {
    let url = cluster.servers[index].url.clone();
    let master_url = cluster
        .master()
        .map(|master| master.url.clone())
        .ok_or_else(|| RejoinError::NoMaster(url.to_string()))?;
    let admin = cluster.ensure_admin(index).await?;
    let crash = cluster.last_crash_of(&url).cloned();
    let position = admin
        .variables()
        .await?
        .get("GTID_CURRENT_POS")
        .map(|value| GtidList::parse_lossy(value))
        .unwrap_or_default();

    if cluster.config.read_only {
        admin.set_read_only(true).await?;
    }

    if let Some(crash) = &crash {
        if cluster.config.autorejoin_backup_binlog {
            if let Err(error) = cluster.log_tools.backup_binlogs(&url, crash).await {
                warn!(server = %url, %error, "binlog backup before rejoin failed");
            }
        }
    }

    let ahead = crash
        .as_ref()
        .is_some_and(|crash| position.is_ahead_of(&crash.gtid_io_pos));
    let strategy = if position.is_empty() {
        if !cluster.config.autorejoin_dump {
            return Err(RejoinError::NoPosition {
                server: url.to_string(),
            });
        }
        RejoinStrategy::Reseed
    } else if ahead && cluster.config.autorejoin_flashback {
        RejoinStrategy::Flashback
    } else if ahead && cluster.config.autorejoin_dump {
        RejoinStrategy::Reseed
    } else if ahead {
        return Err(RejoinError::Diverged {
            server: url.to_string(),
        });
    } else {
        RejoinStrategy::Positional
    };
    info!(server = %url, master = %master_url, strategy = strategy.as_str(), "rejoining");

    admin.stop_replica().await?;
    let mode = match (strategy, &crash) {
        (RejoinStrategy::Flashback, Some(crash)) => {
            cluster.log_tools.flashback(&url, crash).await?;
            admin.set_gtid_slave_pos(&crash.gtid_io_pos).await?;
            GtidMode::SlavePos
        }
        (RejoinStrategy::Reseed, _) => {
            cluster.log_tools.reseed(&master_url, &url).await?;
            GtidMode::SlavePos
        }
        _ => GtidMode::CurrentPos,
    };
    admin
        .change_replication_source(&source_options(cluster, &master_url, mode))
        .await?;
    admin.start_replica().await?;

    if let Err(error) = hooks::run_failover_hook(
        "rejoin",
        cluster.config.rejoin_script.as_deref(),
        &url.host,
        &master_url.host,
        cluster.config.hook_timeout,
    )
    .await
    {
        warn!(server = %url, %error, "rejoin script failed");
    }
    Ok(strategy)
}

/// Repoints a replica still following a node that is no longer the master,
/// provided it has not applied past the election point.
#[instrument(skip(cluster), fields(cluster = %cluster.config.name))]
pub async fn rejoin_slave(cluster: &mut Cluster, index: usize) -> Result<bool, RejoinError> {
    let Some(master) = cluster.master().filter(|master| !master.is_failed()) else {
        return Ok(false);
    };
    let master_url = master.url.clone();
    let master_gtid = master.current_gtid.clone();
    let server = &cluster.servers[index];
    if server.url == master_url || server.is_replica_of(&master_url) {
        return Ok(false);
    }
    let Some(old_master) = server
        .replication
        .as_ref()
        .map(|status| ServerUrl::new(status.master_host.clone(), status.master_port))
    else {
        return Ok(false);
    };
    let election_point = cluster
        .last_crash_of(&old_master)
        .map(|crash| crash.gtid_io_pos.clone())
        .unwrap_or(master_gtid);
    if server.slave_gtid.is_ahead_of(&election_point) {
        warn!(server = %server.url, %election_point, "replica is ahead of the election point, not repointing");
        return Ok(false);
    }
    let url = server.url.clone();
    let admin = cluster.ensure_admin(index).await?;
    info!(server = %url, from = %old_master, to = %master_url, "repointing replica at current master");
    admin.stop_replica().await?;
    admin
        .change_replication_source(&source_options(cluster, &master_url, GtidMode::SlavePos))
        .await?;
    admin.start_replica().await?;
    if cluster.config.read_only {
        admin.set_read_only(true).await?;
    }
    Ok(true)
}

/// Attempts a rejoin of `index` within its retry budget.
pub(crate) async fn try_rejoin(cluster: &mut Cluster, index: usize) {
    let url = cluster.servers[index].url.clone();
    let now = Instant::now();
    if !cluster.rejoin.is_due(&url, now) {
        return;
    }
    let name = cluster.config.name.clone();
    match rejoin_master(cluster, index).await {
        Ok(strategy) => {
            record_rejoin(&name, strategy.as_str(), RejoinOutcome::Ok);
            cluster.rejoin.record_success(&url);
            cluster.servers[index].fail_count = 0;
            info!(cluster = %name, server = %url, strategy = strategy.as_str(), "rejoin complete");
        }
        Err(error) => {
            record_rejoin(&name, "none", RejoinOutcome::Error);
            match cluster.rejoin.record_failure(&url, now) {
                Some(delay) => {
                    warn!(cluster = %name, server = %url, %error, retry_in = ?delay, "rejoin failed")
                }
                None => {
                    warn!(cluster = %name, server = %url, %error, "rejoin failed, retry budget exhausted; operator action required")
                }
            }
        }
    }
}

/// Retries rejoins that failed on earlier ticks.
pub(crate) async fn retry_pending(cluster: &mut Cluster) {
    if cluster.master.is_none() || !cluster.config.autorejoin {
        return;
    }
    let pending: Vec<usize> = cluster
        .servers
        .iter()
        .enumerate()
        .filter(|(index, server)| {
            Some(*index) != cluster.master
                && server.state() == ServerState::Unconnected
                && cluster.rejoin.is_pending(&server.url)
        })
        .map(|(index, _)| index)
        .collect();
    for index in pending {
        try_rejoin(cluster, index).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;

    use crate::test_support::{url, RecordingLogTools, SimulatedFleet};

    #[test]
    fn backoff_grows_until_budget_is_spent() {
        let mut tracker = RejoinTracker::new(3, Duration::from_millis(100));
        let node = url(1);
        let now = Instant::now();
        assert!(tracker.is_due(&node, now));

        let first = tracker.record_failure(&node, now).expect("retry");
        assert!(first >= Duration::from_millis(60) && first <= Duration::from_millis(120));
        assert!(!tracker.is_due(&node, now));
        assert!(tracker.is_due(&node, now + Duration::from_millis(121)));

        let second = tracker.record_failure(&node, now).expect("retry");
        assert!(second >= Duration::from_millis(120) && second <= Duration::from_millis(240));
        assert_eq!(tracker.record_failure(&node, now), None);
        assert!(tracker.is_exhausted(&node));
        assert!(!tracker.is_due(&node, now + Duration::from_secs(3600)));

        tracker.record_success(&node);
        assert_eq!(tracker.attempts(&node), 0);
    }

    async fn cluster_after_failover(
        fleet: &SimulatedFleet,
        tools: Arc<RecordingLogTools>,
        configure: impl FnOnce(&mut ClusterConfig),
    ) -> Cluster {
        let mut config = fleet.cluster_config("east");
        configure(&mut config);
        let mut cluster = Cluster::new(config, fleet.connector(), tools).expect("cluster");
        // db2 took over from db1 at 0-1-10
        for index in 0..3 {
            cluster.ensure_admin(index).await.expect("admin");
        }
        cluster.begin_cycle();
        cluster.set_state(1, ServerState::Master);
        cluster.master = Some(1);
        cluster.crashes.push(Crash {
            url: url(1),
            elected: url(2),
            gtid_io_pos: "0-1-10".parse().expect("gtid"),
            master_log_file: "bin.000001".into(),
            master_log_pos: 2564,
            semisync: false,
            at: Utc::now(),
        });
        let admin = cluster.servers[1].admin().expect("admin");
        admin.stop_replica().await.expect("stop");
        admin.reset_replica(true).await.expect("reset");
        admin.set_read_only(false).await.expect("rw");
        fleet.update(&url(1), |node| node.read_only = true);
        cluster
    }

    /// db1 commits two transactions nobody receives.
    fn diverge_old_master(fleet: &SimulatedFleet) {
        fleet.update(&url(3), |node| node.lag = 1);
        fleet.update(&url(1), |node| node.read_only = false);
        assert!(fleet.write(&url(1), 2));
        fleet.update(&url(1), |node| node.read_only = true);
    }

    #[tokio::test]
    async fn positional_rejoin_when_not_ahead() {
        let fleet = SimulatedFleet::standard(3);
        let tools = Arc::new(RecordingLogTools::with_fleet(fleet.clone()));
        let mut cluster = cluster_after_failover(&fleet, tools.clone(), |_| {}).await;
        fleet.write(&url(2), 2);

        let strategy = rejoin_master(&mut cluster, 0).await.expect("rejoin");
        assert_eq!(strategy, RejoinStrategy::Positional);
        let node = fleet.node(&url(1)).expect("db1");
        let link = node.link.expect("linked");
        assert_eq!(link.master, url(2));
        assert!(link.sql_running);
        assert_eq!(node.current_gtid.to_string(), "0-2-12");
        assert_eq!(tools.calls(), vec!["backup db1:3306".to_string()]);
    }

    #[tokio::test]
    async fn ahead_node_is_flashed_back_before_repointing() {
        let fleet = SimulatedFleet::standard(3);
        let tools = Arc::new(RecordingLogTools::with_fleet(fleet.clone()));
        let mut cluster = cluster_after_failover(&fleet, tools.clone(), |config| {
            config.autorejoin_flashback = true;
        })
        .await;
        diverge_old_master(&fleet);

        let strategy = rejoin_master(&mut cluster, 0).await.expect("rejoin");
        assert_eq!(strategy, RejoinStrategy::Flashback);
        assert!(tools.calls().iter().any(|call| call.starts_with("flashback db1:3306")));
        let node = fleet.node(&url(1)).expect("db1");
        assert!(node.link.expect("linked").sql_running);
        assert_eq!(node.current_gtid.to_string(), "0-1-10");
    }

    #[tokio::test]
    async fn ahead_node_without_recovery_options_is_refused() {
        let fleet = SimulatedFleet::standard(3);
        let tools = Arc::new(RecordingLogTools::with_fleet(fleet.clone()));
        let mut cluster = cluster_after_failover(&fleet, tools, |_| {}).await;
        diverge_old_master(&fleet);

        let error = rejoin_master(&mut cluster, 0).await.expect_err("diverged");
        assert!(matches!(error, RejoinError::Diverged { .. }));
        assert!(fleet.node(&url(1)).expect("db1").link.is_none());
    }

    #[tokio::test]
    async fn reseed_when_dump_is_enabled() {
        let fleet = SimulatedFleet::standard(3);
        let tools = Arc::new(RecordingLogTools::with_fleet(fleet.clone()));
        let mut cluster = cluster_after_failover(&fleet, tools.clone(), |config| {
            config.autorejoin_dump = true;
        })
        .await;
        diverge_old_master(&fleet);

        let strategy = rejoin_master(&mut cluster, 0).await.expect("rejoin");
        assert_eq!(strategy, RejoinStrategy::Reseed);
        assert!(tools
            .calls()
            .contains(&"reseed db1:3306 from db2:3306".to_string()));
        assert!(fleet.node(&url(1)).expect("db1").link.expect("linked").sql_running);
    }

    #[tokio::test]
    async fn failed_rejoins_consume_the_budget() {
        let fleet = SimulatedFleet::standard(3);
        let tools = Arc::new(RecordingLogTools::with_fleet(fleet.clone()));
        let mut cluster = cluster_after_failover(&fleet, tools, |config| {
            config.rejoin_max_attempts = 1;
        })
        .await;
        diverge_old_master(&fleet);

        try_rejoin(&mut cluster, 0).await;
        assert!(cluster.rejoin.is_exhausted(&url(1)));
        assert!(!cluster.rejoin.is_due(&url(1), Instant::now() + Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn replica_following_old_master_is_repointed() {
        let fleet = SimulatedFleet::standard(3);
        let tools = Arc::new(RecordingLogTools::default());
        let mut cluster = cluster_after_failover(&fleet, tools, |_| {}).await;
        let facts = crate::server::probe(cluster.servers[2].admin().expect("admin").as_ref())
            .await
            .expect("probe");
        cluster.servers[2].apply_facts(facts);

        assert!(rejoin_slave(&mut cluster, 2).await.expect("rejoin slave"));
        let link = fleet.node(&url(3)).expect("db3").link.expect("linked");
        assert_eq!(link.master, url(2));
        assert!(link.io_running && link.sql_running);
    }
}
