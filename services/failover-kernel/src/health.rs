//! Per-tick health check.
//!
//! Probes fan out concurrently; their results are applied one server at a
//! time so every state transition goes through [`Cluster::set_state`].

use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    admin::AdminError,
    cluster::Cluster,
    rejoin::{rejoin_slave, try_rejoin},
    server::{ServerFacts, ServerState, ServerUrl},
    telemetry::failover::{record_probe, ProbeOutcome},
    topology::probe_all,
};

/// What a health pass found that the monitor has to act on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// The master crossed the failure threshold during this pass.
    pub master_failed: bool,
    /// A failed master answered again before anyone replaced it.
    pub master_recovered: bool,
    pub repointed: Vec<ServerUrl>,
}

pub async fn check(cluster: &mut Cluster) -> HealthReport {
    let span = info_span!("health.check", cluster = %cluster.config.name);
    run(cluster).instrument(span).await
}

async fn run(cluster: &mut Cluster) -> HealthReport {
    let mut report = HealthReport::default();
    if cluster.sme.is_in_failover() {
        debug!("promotion in progress, skipping health check");
        return report;
    }
    cluster.begin_cycle();
    for (index, result) in probe_all(cluster).await {
        match result {
            Ok(facts) => {
                record_probe(&cluster.config.name, ProbeOutcome::Ok);
                on_reachable(cluster, index, facts, &mut report).await;
            }
            Err(error) => {
                record_probe(&cluster.config.name, ProbeOutcome::Error);
                on_unreachable(cluster, index, error, &mut report);
            }
        }
    }
    report
}

fn on_unreachable(cluster: &mut Cluster, index: usize, error: AdminError, report: &mut HealthReport) {
    let url = cluster.servers[index].url.clone();
    if let AdminError::AccessDenied { .. } = error {
        warn!(server = %url, %error, "access denied");
        cluster.set_state(index, ServerState::Unconnected);
        return;
    }
    if cluster.servers[index].is_failed() {
        return;
    }
    let is_master = cluster.master == Some(index);
    let server = &mut cluster.servers[index];
    server.fail_count = server.fail_count.saturating_add(1);
    let fail_count = server.fail_count;
    debug!(server = %url, fail_count, %error, "probe failed");

    if fail_count >= cluster.config.max_fail {
        if cluster.set_state(index, ServerState::Failed) {
            warn!(server = %url, fail_count, "server failed");
        }
        if is_master {
            report.master_failed = true;
        } else {
            cluster.remove_slave(index);
        }
    } else {
        cluster.set_state(index, ServerState::Suspect);
    }
}

async fn on_reachable(
    cluster: &mut Cluster,
    index: usize,
    facts: ServerFacts,
    report: &mut HealthReport,
) {
    let is_master = cluster.master == Some(index);
    let state = cluster.servers[index].state();
    let replicating = facts.replication.is_some();
    cluster.servers[index].apply_facts(facts);
    let url = cluster.servers[index].url.clone();

    match state {
        ServerState::Master => cluster.servers[index].fail_count = 0,
        ServerState::Suspect => {
            cluster.servers[index].fail_count = 0;
            let next = if is_master {
                ServerState::Master
            } else if replicating {
                ServerState::Slave
            } else {
                ServerState::Unconnected
            };
            if cluster.set_state(index, next) {
                info!(server = %url, state = %next, "server recovered");
            }
        }
        ServerState::Failed | ServerState::Unconnected if is_master => {
            cluster.servers[index].fail_count = 0;
            if state == ServerState::Failed {
                info!(server = %url, "failed master is reachable again");
                cluster.set_state(index, ServerState::Unconnected);
                report.master_recovered = true;
            }
        }
        ServerState::Failed | ServerState::Unconnected if replicating => {
            cluster.servers[index].fail_count = 0;
            if cluster.set_state(index, ServerState::Slave) {
                cluster.add_slave(index);
                enforce_read_only(cluster, index).await;
            }
        }
        ServerState::Failed => {
            cluster.servers[index].fail_count = 0;
            cluster.set_state(index, ServerState::Unconnected);
            enforce_read_only(cluster, index).await;
            if cluster.config.autorejoin && cluster.master.is_some() {
                try_rejoin(cluster, index).await;
            }
        }
        ServerState::Unconnected => {}
        ServerState::Slave => {
            cluster.servers[index].fail_count = 0;
            if replicating && !cluster.is_multi_master() {
                match rejoin_slave(cluster, index).await {
                    Ok(true) => report.repointed.push(url),
                    Ok(false) => {}
                    Err(error) => warn!(server = %url, %error, "could not repoint replica"),
                }
            }
        }
    }
}

async fn enforce_read_only(cluster: &mut Cluster, index: usize) {
    if !cluster.config.read_only || cluster.servers[index].read_only {
        return;
    }
    let url = cluster.servers[index].url.clone();
    match cluster.ensure_admin(index).await {
        Ok(admin) => match admin.set_read_only(true).await {
            Ok(()) => cluster.servers[index].read_only = true,
            Err(error) => warn!(server = %url, %error, "could not set read_only"),
        },
        Err(error) => warn!(server = %url, %error, "could not set read_only"),
    }
}
