//! Failover and switchover protocol.
//!
//! [`master_failover`] is the single entry point. `fail = true` replaces a
//! dead master, `fail = false` hands the role over from a live one. Everything
//! before the freeze of the old master may abort without side effects; from
//! the freeze on, step failures are recorded and the protocol runs to the end.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{info, info_span, warn, Instrument};

use crate::{
    admin::{AdminError, ChangeSourceOptions, DbAdmin, FlushMode, GtidMode, WaitOutcome},
    arbitration::{ArbitrationError, Verdict},
    cluster::Cluster,
    config::FailoverMode,
    election::{elect, CandidateFacts, ElectionPolicy, ElectionReason, Filters, MasterFacts},
    gtid::GtidList,
    hooks,
    server::{probe, ServerState, ServerUrl},
    state::codes,
    telemetry::failover::{
        record_arbitration_verdict, record_promotion_attempt, record_promotion_result,
        ArbitrationVerdict, PromotionKind, PromotionOutcome,
    },
    ErrorClass,
};

const POLL_STEP: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("a promotion is already in progress")]
    InProgress,
    #[error("no master is known for this cluster")]
    NoMaster,
    #[error("pre-check on {server} failed: {source}")]
    PreCheck {
        server: String,
        #[source]
        source: AdminError,
    },
    #[error("{server} has {count} write transaction(s) running longer than {threshold:?}")]
    BusyMaster {
        server: String,
        count: u64,
        threshold: Duration,
    },
    #[error("no eligible candidate: {0}")]
    NoCandidate(String),
    #[error("arbitrator elected another monitor")]
    ArbitrationLost,
    #[error("arbitration failed: {0}")]
    Arbitration(#[from] ArbitrationError),
    #[error("replicas are still connected to the unreachable master")]
    ReplicasConnected,
    #[error("failover limit of {limit} reached")]
    LimitReached { limit: u32 },
    #[error("previous failover at {at} is more recent than {interval:?}")]
    TooSoon {
        at: DateTime<Utc>,
        interval: Duration,
    },
}

impl FailoverError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FailoverError::ArbitrationLost | FailoverError::Arbitration(_) => {
                ErrorClass::Arbitration
            }
            FailoverError::LimitReached { .. } | FailoverError::TooSoon { .. } => {
                ErrorClass::Prerequisite
            }
            _ => ErrorClass::ConsistencyRisk,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    PreCheck,
    Election,
    PreHook,
    Freeze,
    Synchronize,
    Promote,
    PostHook,
    Demote,
    Repoint,
    Finalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A best-effort step that did not succeed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub phase: Phase,
    pub server: ServerUrl,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverReport {
    pub fail: bool,
    pub old_master: ServerUrl,
    pub new_master: ServerUrl,
    pub reason: ElectionReason,
    pub failures: Vec<StepFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FailoverReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Where the new master stood when it was elected to replace a dead one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crash {
    pub url: ServerUrl,
    pub elected: ServerUrl,
    pub gtid_io_pos: GtidList,
    pub master_log_file: String,
    pub master_log_pos: u64,
    pub semisync: bool,
    pub at: DateTime<Utc>,
}

struct Steps {
    failures: Vec<StepFailure>,
}

impl Steps {
    fn record<T, E: fmt::Display>(
        &mut self,
        phase: Phase,
        server: &ServerUrl,
        result: Result<T, E>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(%phase, %server, %error, "step failed, continuing");
                self.failures.push(StepFailure {
                    phase,
                    server: server.clone(),
                    error: error.to_string(),
                });
                None
            }
        }
    }
}

/// Refuses an automatic failover once the configured limits are hit.
pub fn check_failover_limits(cluster: &Cluster) -> Result<(), FailoverError> {
    let config = &cluster.config;
    if config.failover_limit > 0 && cluster.sme.failover_count() >= u64::from(config.failover_limit) {
        return Err(FailoverError::LimitReached {
            limit: config.failover_limit,
        });
    }
    if !config.failover_time_limit.is_zero() {
        if let Some(at) = cluster.sme.last_failover() {
            let elapsed = (Utc::now() - at).to_std().unwrap_or_default();
            if elapsed < config.failover_time_limit {
                return Err(FailoverError::TooSoon {
                    at,
                    interval: config.failover_time_limit,
                });
            }
        }
    }
    Ok(())
}

/// Failover triggered by the monitor itself. Returns `Ok(None)` in manual
/// mode. Refused when the limits are hit or when the replicas still receive
/// events from the master the monitor lost.
pub async fn automatic_failover(cluster: &mut Cluster) -> Result<Option<FailoverReport>, FailoverError> {
    if cluster.config.failover_mode != FailoverMode::Automatic {
        return Ok(None);
    }
    check_failover_limits(cluster)?;
    if cluster
        .sme
        .is_in_current_state(codes::MASTER_UNREACHABLE_SLAVES_RUNNING)
    {
        return Err(FailoverError::ReplicasConnected);
    }
    master_failover(cluster, true).await.map(Some)
}

/// Promotes a replica to master. At most one promotion runs per cluster; a
/// concurrent call returns [`FailoverError::InProgress`] without touching
/// anything.
pub async fn master_failover(
    cluster: &mut Cluster,
    fail: bool,
) -> Result<FailoverReport, FailoverError> {
    let name = cluster.config.name.clone();
    let kind = PromotionKind::from_fail(fail);
    let Some(_guard) = cluster.sme.try_begin_failover() else {
        record_promotion_result(&name, kind, PromotionOutcome::Rejected);
        return Err(FailoverError::InProgress);
    };
    record_promotion_attempt(&name, kind);
    let span = info_span!("failover.run", cluster = %name, fail);
    let result = run(cluster, fail).instrument(span).await;
    let outcome = match &result {
        Ok(report) if report.is_clean() => PromotionOutcome::Completed,
        Ok(_) => PromotionOutcome::Degraded,
        Err(_) => PromotionOutcome::Aborted,
    };
    record_promotion_result(&name, kind, outcome);
    match &result {
        Ok(report) => info!(
            old_master = %report.old_master,
            new_master = %report.new_master,
            failures = report.failures.len(),
            "promotion complete"
        ),
        Err(error) => warn!(%error, "promotion aborted"),
    }
    result
}

async fn run(cluster: &mut Cluster, fail: bool) -> Result<FailoverReport, FailoverError> {
    let started_at = Utc::now();
    let old = cluster.master.ok_or(FailoverError::NoMaster)?;
    let old_url = cluster.servers[old].url.clone();
    let config = cluster.config.clone();
    let mut steps = Steps {
        failures: Vec::new(),
    };
    cluster.begin_cycle();
    if fail {
        info!(master = %old_url, "starting failover");
    } else {
        info!(master = %old_url, "starting switchover");
    }

    // Phase 1: a planned switchover must not freeze a busy master
    let old_admin = if fail {
        None
    } else {
        let precheck = |source| FailoverError::PreCheck {
            server: old_url.to_string(),
            source,
        };
        let admin = cluster.ensure_admin(old).await.map_err(precheck)?;
        steps.record(Phase::PreCheck, &old_url, admin.flush_tables(FlushMode::NoLog).await);
        let busy = admin
            .check_long_running_writes(config.switchover_busy_threshold)
            .await
            .map_err(precheck)?;
        if busy > 0 {
            return Err(FailoverError::BusyMaster {
                server: old_url.to_string(),
                count: busy,
                threshold: config.switchover_busy_threshold,
            });
        }
        Some(admin)
    };

    // Phase 2
    let (new, reason) = elect_candidate(cluster, old, fail, old_admin.as_deref()).await?;
    let new_url = cluster.servers[new].url.clone();
    info!(candidate = %new_url, ?reason, "candidate elected");

    if config.arbitration.enabled {
        arbitrate(cluster, &new_url).await?;
    }

    let new_admin = cluster
        .ensure_admin(new)
        .await
        .map_err(|source| FailoverError::PreCheck {
            server: new_url.to_string(),
            source,
        })?;
    let crash = if fail {
        let status = new_admin.replication_status().await.ok().flatten();
        Some(Crash {
            url: old_url.clone(),
            elected: new_url.clone(),
            gtid_io_pos: status
                .as_ref()
                .map(|status| status.gtid_io_pos.clone())
                .filter(|position| !position.is_empty())
                .unwrap_or_else(|| cluster.servers[new].slave_gtid.clone()),
            master_log_file: status
                .as_ref()
                .map(|status| status.master_log_file.clone())
                .unwrap_or_default(),
            master_log_pos: status
                .as_ref()
                .map(|status| status.read_master_log_pos)
                .unwrap_or_default(),
            semisync: cluster.servers[old].semisync_master,
            at: Utc::now(),
        })
    } else {
        None
    };

    // Phase 3
    let hook = hooks::run_failover_hook(
        "pre",
        config.pre_failover_script.as_deref(),
        &old_url.host,
        &new_url.host,
        config.hook_timeout,
    )
    .await;
    steps.record(Phase::PreHook, &old_url, hook);

    // Phase 4
    let mut restore_connections = None;
    let mut old_position = GtidList::default();
    if let Some(admin) = &old_admin {
        restore_connections = freeze(admin.as_ref(), &old_url, &config, &mut steps).await;
        old_position = steps
            .record(Phase::Freeze, &old_url, admin.variables().await)
            .and_then(|variables| variables.get("GTID_BINLOG_POS").cloned())
            .map(|value| GtidList::parse_lossy(&value))
            .unwrap_or_default();
    }

    // Phase 5
    if old_admin.is_some() {
        let waited = new_admin
            .wait_for_position(&old_position, config.wait_position_timeout)
            .await;
        if let Some(WaitOutcome::TimedOut) = steps.record(Phase::Synchronize, &new_url, waited) {
            steps.record::<(), _>(
                Phase::Synchronize,
                &new_url,
                Err(format!("did not reach {old_position} within {:?}", config.wait_position_timeout)),
            );
        }
    } else {
        drain_relay_log(new_admin.as_ref(), &new_url, config.wait_position_timeout, &mut steps).await;
    }

    // Phase 6
    steps.record(Phase::Promote, &new_url, new_admin.stop_replica().await);
    steps.record(Phase::Promote, &new_url, new_admin.reset_replica(true).await);
    steps.record(Phase::Promote, &new_url, new_admin.set_read_only(false).await);
    cluster.remove_slave(new);
    if !fail {
        cluster.remove_slave(old);
    }
    cluster.set_state(new, ServerState::Master);
    cluster.master = Some(new);
    cluster.servers[new].replication = None;

    // Phase 7
    let hook = hooks::run_failover_hook(
        "post",
        config.post_failover_script.as_deref(),
        &old_url.host,
        &new_url.host,
        config.hook_timeout,
    )
    .await;
    steps.record(Phase::PostHook, &new_url, hook);

    let source = |cluster: &Cluster| {
        let credentials = cluster.config.replication_credentials();
        ChangeSourceOptions {
            host: new_url.host.clone(),
            port: new_url.port,
            user: credentials.user,
            password: credentials.password,
            connect_retry: cluster.config.master_connect_retry,
            mode: Some(GtidMode::SlavePos),
        }
    };

    // Phase 8
    if let Some(admin) = &old_admin {
        steps.record(Phase::Demote, &new_url, new_admin.flush_tables(FlushMode::Plain).await);
        steps.record(Phase::Demote, &old_url, admin.unlock_tables().await);
        steps.record(Phase::Demote, &old_url, admin.stop_replica().await);
        steps.record(Phase::Demote, &old_url, admin.set_gtid_slave_pos(&old_position).await);
        steps.record(
            Phase::Demote,
            &old_url,
            admin.change_replication_source(&source(&*cluster)).await,
        );
        steps.record(Phase::Demote, &old_url, admin.start_replica().await);
        steps.record(Phase::Demote, &old_url, admin.set_read_only(config.read_only).await);
        if let Some(value) = restore_connections {
            steps.record(Phase::Demote, &old_url, admin.set_max_connections(value).await);
        }
        cluster.set_state(old, ServerState::Slave);
        cluster.add_slave(old);
    }

    // Phase 9
    let others: Vec<usize> = cluster
        .slaves
        .iter()
        .copied()
        .filter(|index| *index != old && *index != new)
        .filter(|index| {
            !(cluster.is_multi_master() && cluster.servers[*index].state() == ServerState::Master)
        })
        .collect();
    for index in others {
        let url = cluster.servers[index].url.clone();
        let Some(admin) = steps.record(Phase::Repoint, &url, cluster.ensure_admin(index).await) else {
            continue;
        };
        if old_admin.is_some() {
            let waited = admin
                .wait_for_position(&old_position, config.wait_position_timeout)
                .await;
            if let Some(WaitOutcome::TimedOut) = steps.record(Phase::Repoint, &url, waited) {
                steps.record::<(), _>(
                    Phase::Repoint,
                    &url,
                    Err(format!("did not reach {old_position} before repointing")),
                );
            }
        }
        steps.record(Phase::Repoint, &url, admin.stop_replica().await);
        steps.record(
            Phase::Repoint,
            &url,
            admin.change_replication_source(&source(&*cluster)).await,
        );
        steps.record(Phase::Repoint, &url, admin.start_replica().await);
        if config.read_only {
            steps.record(Phase::Repoint, &url, admin.set_read_only(true).await);
        }
    }

    // Phase 10
    cluster.servers[new].fail_count = 0;
    if let Some(facts) = steps.record(Phase::Finalize, &new_url, probe(new_admin.as_ref()).await) {
        cluster.servers[new].apply_facts(facts);
    }
    if fail {
        let now = Utc::now();
        cluster.sme.record_failover(now);
        cluster.rejoin.forget(&old_url);
        if let Some(crash) = crash {
            cluster.crashes.push(crash);
        }
    } else {
        cluster.servers[old].fail_count = 0;
    }

    Ok(FailoverReport {
        fail,
        old_master: old_url,
        new_master: new_url,
        reason,
        failures: steps.failures,
        started_at,
        finished_at: Utc::now(),
    })
}

async fn elect_candidate(
    cluster: &mut Cluster,
    old: usize,
    fail: bool,
    old_admin: Option<&dyn DbAdmin>,
) -> Result<(usize, ElectionReason), FailoverError> {
    let mut replicas: Vec<usize> = cluster
        .slaves
        .iter()
        .copied()
        .filter(|index| *index != old)
        .collect();
    // ties go to the first replica in host order
    replicas.sort_unstable();
    for index in &replicas {
        if let Ok(admin) = cluster.ensure_admin(*index).await {
            if let Ok(facts) = probe(admin.as_ref()).await {
                cluster.servers[*index].apply_facts(facts);
            }
        }
    }

    let mut master = MasterFacts {
        failed: fail || cluster.servers[old].is_failed(),
        current_gtid: cluster.servers[old].current_gtid.clone(),
        filters: Filters::default(),
    };
    if let Some(admin) = old_admin {
        if let Ok(filters) = Filters::read(admin).await {
            master.filters = filters;
        }
        if let Ok(variables) = admin.variables().await {
            if let Some(position) = variables.get("GTID_CURRENT_POS") {
                master.current_gtid = GtidList::parse_lossy(position);
            }
        }
    }

    let mut candidates = Vec::with_capacity(replicas.len());
    for index in &replicas {
        candidates.push(CandidateFacts::gather(&cluster.servers[*index]).await);
    }
    let policy = ElectionPolicy {
        multi_master: cluster.is_multi_master(),
        ..ElectionPolicy::from_config(&cluster.config)
    };
    let outcome = elect(&candidates, &master, &policy);
    for (url, rejection) in &outcome.rejections {
        warn!(server = %url, %rejection, "candidate skipped");
    }
    match (outcome.winner, outcome.reason) {
        (Some(winner), Some(reason)) => Ok((replicas[winner], reason)),
        _ => {
            let reasons = outcome
                .rejections
                .iter()
                .map(|(url, rejection)| format!("{url}: {rejection}"))
                .collect::<Vec<_>>()
                .join(", ");
            Err(FailoverError::NoCandidate(if reasons.is_empty() {
                "no replicas".to_string()
            } else {
                reasons
            }))
        }
    }
}

async fn arbitrate(cluster: &Cluster, candidate: &ServerUrl) -> Result<(), FailoverError> {
    let name = &cluster.config.name;
    let Some(arbitrator) = cluster.arbitrator.clone() else {
        record_arbitration_verdict(name, ArbitrationVerdict::Error);
        return Err(ArbitrationError::Disabled.into());
    };
    let mut record = cluster.heartbeat_record();
    record.master = candidate.to_string();
    match arbitrator
        .arbitrate(&record)
        .instrument(info_span!("arbitration.request", cluster = %name))
        .await
    {
        Ok(response) if response.arbitration == Verdict::Winner => {
            record_arbitration_verdict(name, ArbitrationVerdict::Winner);
            info!(candidate = %candidate, "arbitration won");
            Ok(())
        }
        Ok(response) => {
            record_arbitration_verdict(name, ArbitrationVerdict::Loser);
            warn!(elected_master = %response.master, "arbitration lost, standing down");
            Err(FailoverError::ArbitrationLost)
        }
        Err(error) => {
            record_arbitration_verdict(name, ArbitrationVerdict::Error);
            Err(error.into())
        }
    }
}

/// Stops writes on the old master. Returns the `max_connections` value to
/// restore once it has been demoted.
async fn freeze(
    admin: &dyn DbAdmin,
    url: &ServerUrl,
    config: &crate::config::ClusterConfig,
    steps: &mut Steps,
) -> Option<u64> {
    steps.record(Phase::Freeze, url, admin.set_read_only(true).await);

    let deadline = Instant::now() + config.wait_kill;
    loop {
        match admin.check_long_running_writes(Duration::ZERO).await {
            Ok(0) => break,
            Ok(running) if Instant::now() >= deadline => {
                info!(server = %url, running, "write threads still running after grace period");
                break;
            }
            Ok(_) => sleep(POLL_STEP.min(deadline.saturating_duration_since(Instant::now()))).await,
            Err(error) => {
                steps.record::<(), _>(Phase::Freeze, url, Err(error));
                break;
            }
        }
    }

    let previous = steps
        .record(Phase::Freeze, url, admin.variables().await)
        .and_then(|variables| variables.get("MAX_CONNECTIONS").and_then(|v| v.parse().ok()));
    steps.record(Phase::Freeze, url, admin.set_max_connections(0).await);
    if let Some(killed) = steps.record(Phase::Freeze, url, admin.kill_client_threads().await) {
        if killed > 0 {
            info!(server = %url, killed, "killed client threads");
        }
    }
    steps.record(Phase::Freeze, url, admin.flush_tables(FlushMode::WithReadLock).await);
    previous
}

async fn drain_relay_log(admin: &dyn DbAdmin, url: &ServerUrl, timeout: Duration, steps: &mut Steps) {
    let deadline = Instant::now() + timeout;
    loop {
        match admin.replication_status().await {
            Ok(Some(status)) if !status.relay_drained() && Instant::now() < deadline => {
                sleep(POLL_STEP.min(deadline.saturating_duration_since(Instant::now()))).await;
            }
            Ok(Some(status)) if !status.relay_drained() => {
                steps.record::<(), _>(
                    Phase::Synchronize,
                    url,
                    Err(format!("relay log not drained within {timeout:?}")),
                );
                return;
            }
            Ok(_) => return,
            Err(error) => {
                steps.record::<(), _>(Phase::Synchronize, url, Err(error));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::{
        test_support::{url, RecordingLogTools, SimulatedFleet, StaticArbitrator},
        topology,
    };

    async fn discovered(fleet: &SimulatedFleet) -> Cluster {
        let mut cluster = Cluster::new(
            fleet.cluster_config("east"),
            fleet.connector(),
            Arc::new(RecordingLogTools::default()),
        )
        .expect("cluster");
        topology::discover(&mut cluster).await.expect("discover");
        cluster
    }

    fn writable_count(fleet: &SimulatedFleet) -> usize {
        (1..=3)
            .filter_map(|n| fleet.node(&url(n)))
            .filter(|node| node.alive && !node.read_only)
            .count()
    }

    #[tokio::test]
    async fn switchover_swaps_roles() {
        let fleet = SimulatedFleet::standard(3);
        let mut cluster = discovered(&fleet).await;

        let report = master_failover(&mut cluster, false).await.expect("switchover");
        assert!(report.is_clean(), "{:?}", report.failures);
        assert_eq!(report.old_master, url(1));
        assert_eq!(report.new_master, url(2));
        assert_eq!(cluster.master().map(|m| m.url.clone()), Some(url(2)));
        assert_eq!(cluster.servers()[0].state(), ServerState::Slave);

        let old = fleet.node(&url(1)).expect("db1");
        assert!(old.read_only);
        assert!(!old.read_lock);
        assert_eq!(old.max_connections, 151);
        let link = old.link.expect("old master replicates");
        assert_eq!(link.master, url(2));
        assert!(link.io_running && link.sql_running);
        assert_eq!(
            fleet.node(&url(3)).expect("db3").link.expect("linked").master,
            url(2)
        );
        assert!(!fleet.node(&url(2)).expect("db2").read_only);
        assert_eq!(cluster.state_machine().failover_count(), 0);
        assert!(!cluster.state_machine().is_in_failover());

        // writes land on the new master and reach everybody
        assert!(fleet.write(&url(2), 1));
        assert_eq!(fleet.node(&url(1)).expect("db1").current_gtid.to_string(), "0-2-11");
    }

    #[tokio::test]
    async fn busy_master_aborts_switchover() {
        let fleet = SimulatedFleet::standard(3);
        let mut cluster = discovered(&fleet).await;
        fleet.update(&url(1), |node| node.open_writes.push(Duration::from_secs(20)));

        let error = master_failover(&mut cluster, false).await.expect_err("busy");
        assert!(matches!(error, FailoverError::BusyMaster { count: 1, .. }));
        assert!(error.class().aborts_promotion());
        assert_eq!(cluster.master().map(|m| m.url.clone()), Some(url(1)));
        let master = fleet.node(&url(1)).expect("db1");
        assert!(!master.read_only);
        assert!(!master.history.iter().any(|statement| statement.contains("READ LOCK")));
    }

    #[tokio::test]
    async fn failed_table_flush_does_not_stop_switchover() {
        let fleet = SimulatedFleet::standard(3);
        let mut cluster = discovered(&fleet).await;
        fleet.update(&url(1), |node| {
            node.failing.push("FLUSH NO_WRITE_TO_BINLOG TABLES".into())
        });

        let report = master_failover(&mut cluster, false).await.expect("switchover");
        assert_eq!(report.new_master, url(2));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].phase, Phase::PreCheck);
        assert_eq!(report.failures[0].server, url(1));
        assert_eq!(writable_count(&fleet), 1);
        assert!(!fleet.node(&url(2)).expect("db2").read_only);
    }

    #[tokio::test]
    async fn busy_check_still_runs_after_failed_flush() {
        let fleet = SimulatedFleet::standard(3);
        let mut cluster = discovered(&fleet).await;
        fleet.update(&url(1), |node| {
            node.failing.push("FLUSH NO_WRITE_TO_BINLOG TABLES".into());
            node.open_writes.push(Duration::from_secs(20));
        });

        let error = master_failover(&mut cluster, false).await.expect_err("busy");
        assert!(matches!(error, FailoverError::BusyMaster { count: 1, .. }));
        assert_eq!(cluster.master().map(|m| m.url.clone()), Some(url(1)));
    }

    #[tokio::test]
    async fn short_transactions_are_killed_during_freeze() {
        let fleet = SimulatedFleet::standard(2);
        let mut cluster = discovered(&fleet).await;
        fleet.update(&url(1), |node| node.open_writes.push(Duration::from_secs(2)));

        let report = master_failover(&mut cluster, false).await.expect("switchover");
        assert_eq!(report.new_master, url(2));
        let history = fleet.history(&url(1));
        let position = |needle: &str| {
            history
                .iter()
                .position(|statement| statement.contains(needle))
                .unwrap_or_else(|| panic!("{needle} missing from {history:?}"))
        };
        assert!(position("read_only=1") < position("max_connections=0"));
        assert!(position("max_connections=0") < position("KILL"));
        assert!(position("KILL") < position("READ LOCK"));
        assert!(position("READ LOCK") < position("UNLOCK"));
    }

    #[tokio::test]
    async fn lagging_only_candidate_aborts_switchover() {
        let fleet = SimulatedFleet::standard(2);
        fleet.update(&url(2), |node| node.lag = 120);
        let mut cluster = discovered(&fleet).await;

        let error = master_failover(&mut cluster, false).await.expect_err("no candidate");
        assert!(matches!(error, FailoverError::NoCandidate(_)));
        assert_eq!(cluster.master().map(|m| m.url.clone()), Some(url(1)));
        assert!(!fleet.node(&url(1)).expect("db1").read_only);
    }

    #[tokio::test]
    async fn failover_promotes_most_advanced_replica() {
        let fleet = SimulatedFleet::standard(3);
        let mut cluster = discovered(&fleet).await;
        // db3 received two more transactions than db2 before the crash
        fleet.update(&url(2), |node| node.lag = 1);
        assert!(fleet.write(&url(1), 2));
        fleet.kill(&url(1));
        fleet.update(&url(2), |node| node.lag = 0);
        cluster.begin_cycle();
        cluster.set_state(0, ServerState::Failed);

        let report = master_failover(&mut cluster, true).await.expect("failover");
        assert_eq!(report.new_master, url(3));
        assert_eq!(cluster.master().map(|m| m.url.clone()), Some(url(3)));
        assert_eq!(cluster.servers()[0].state(), ServerState::Failed);
        assert_eq!(cluster.state_machine().failover_count(), 1);
        assert!(cluster.state_machine().last_failover().is_some());
        let crash = &cluster.crashes()[0];
        assert_eq!(crash.url, url(1));
        assert_eq!(crash.gtid_io_pos.to_string(), "0-1-12");

        let db2 = fleet.node(&url(2)).expect("db2");
        let link = db2.link.expect("linked");
        assert_eq!(link.master, url(3));
        assert_eq!(db2.current_gtid.to_string(), "0-1-12");
        assert!(!fleet.history(&url(3)).iter().any(|s| s.contains("READ LOCK")));
    }

    #[tokio::test]
    async fn second_promotion_is_rejected_while_one_runs() {
        let fleet = SimulatedFleet::standard(3);
        let mut cluster = discovered(&fleet).await;
        let before = fleet.history(&url(1));
        let _held = cluster.state_machine().try_begin_failover().expect("flag");

        let error = master_failover(&mut cluster, false).await.expect_err("in progress");
        assert!(matches!(error, FailoverError::InProgress));
        assert_eq!(cluster.master().map(|m| m.url.clone()), Some(url(1)));
        assert_eq!(fleet.history(&url(1)), before);
    }

    #[tokio::test]
    async fn lost_arbitration_aborts_before_freeze() {
        let fleet = SimulatedFleet::standard(3);
        let mut config = fleet.cluster_config("east");
        config.arbitration.enabled = true;
        config.arbitration.secret = "s3cr3t".into();
        let arbitrator = Arc::new(StaticArbitrator::new(Some(Verdict::Loser)));
        let mut cluster = Cluster::new(
            config,
            fleet.connector(),
            Arc::new(RecordingLogTools::default()),
        )
        .expect("cluster")
        .with_arbitrator(arbitrator.clone());
        topology::discover(&mut cluster).await.expect("discover");

        let error = master_failover(&mut cluster, false).await.expect_err("loser");
        assert!(matches!(error, FailoverError::ArbitrationLost));
        assert_eq!(error.class(), ErrorClass::Arbitration);
        assert_eq!(arbitrator.requests(), 1);
        assert!(!fleet.node(&url(1)).expect("db1").read_only);
    }

    #[tokio::test]
    async fn unreachable_arbitrator_fails_safe() {
        let fleet = SimulatedFleet::standard(3);
        let mut config = fleet.cluster_config("east");
        config.arbitration.enabled = true;
        config.arbitration.secret = "s3cr3t".into();
        let mut cluster = Cluster::new(
            config,
            fleet.connector(),
            Arc::new(RecordingLogTools::default()),
        )
        .expect("cluster")
        .with_arbitrator(Arc::new(StaticArbitrator::new(None)));
        topology::discover(&mut cluster).await.expect("discover");
        fleet.kill(&url(1));
        cluster.begin_cycle();
        cluster.set_state(0, ServerState::Failed);

        let error = master_failover(&mut cluster, true).await.expect_err("no verdict");
        assert!(matches!(error, FailoverError::Arbitration(_)));
        assert_eq!(cluster.master().map(|m| m.url.clone()), Some(url(1)));
        assert_eq!(cluster.state_machine().failover_count(), 0);
    }

    #[tokio::test]
    async fn failover_limits_are_enforced() {
        let fleet = SimulatedFleet::standard(3);
        let mut config = fleet.cluster_config("east");
        config.failover_limit = 1;
        config.failover_time_limit = Duration::from_secs(3600);
        let cluster = Cluster::new(
            config,
            fleet.connector(),
            Arc::new(RecordingLogTools::default()),
        )
        .expect("cluster");
        assert!(check_failover_limits(&cluster).is_ok());
        cluster.state_machine().record_failover(Utc::now());
        assert!(matches!(
            check_failover_limits(&cluster),
            Err(FailoverError::LimitReached { limit: 1 })
        ));
    }
}
