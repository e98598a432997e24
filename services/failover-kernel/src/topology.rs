//! Topology discovery: works out which node is the master and which nodes
//! replicate, and raises the ledger entries that block monitoring when the
//! replication layout cannot be trusted.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    admin::{AdminConnector, AdminError, DbAdmin},
    cluster::{Cluster, TopologyKind},
    server::{probe, ServerFacts, ServerState, ServerUrl},
    state::{codes, LedgerEntry, Severity},
    ErrorClass,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("no replica found in the topology")]
    NoReplicas,
    #[error("could not identify a master")]
    NoMaster,
    #[error("binary log is disabled on replica {server}")]
    BinlogDisabled { server: String },
    #[error("monitoring blocked by open errors: {}", codes.join(", "))]
    Blocked { codes: Vec<String> },
}

impl DiscoveryError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::ConsistencyRisk
    }
}

/// Probes every server of the cluster concurrently, opening administrative
/// connections where none exist yet. Results come back in server order.
pub(crate) async fn probe_all(cluster: &mut Cluster) -> Vec<(usize, Result<ServerFacts, AdminError>)> {
    let timeout = cluster.config.connect_timeout;
    let mut tasks = JoinSet::new();
    for (index, server) in cluster.servers.iter().enumerate() {
        let admin = server.admin.clone();
        let connector = Arc::clone(&cluster.connector);
        let url = server.url.clone();
        tasks.spawn(async move {
            let result = probe_one(admin, connector.as_ref(), &url, timeout).await;
            (index, result)
        });
    }

    let mut results = Vec::with_capacity(cluster.servers.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Ok((admin, facts)))) => {
                cluster.servers[index].admin = Some(admin);
                results.push((index, Ok(facts)));
            }
            Ok((index, Err(error))) => results.push((index, Err(error))),
            Err(error) => warn!(%error, "probe task failed"),
        }
    }
    results.sort_by_key(|(index, _)| *index);
    results
}

async fn probe_one(
    admin: Option<Arc<dyn DbAdmin>>,
    connector: &dyn AdminConnector,
    url: &ServerUrl,
    timeout: std::time::Duration,
) -> Result<(Arc<dyn DbAdmin>, ServerFacts), AdminError> {
    let admin = match admin {
        Some(admin) => admin,
        None => connector.connect(url).await?,
    };
    let facts = tokio::time::timeout(timeout, probe(admin.as_ref()))
        .await
        .map_err(|_| AdminError::Timeout {
            server: url.to_string(),
            elapsed: timeout,
        })??;
    Ok((admin, facts))
}

/// Rebuilds the master and replica set from what the servers report.
///
/// Running it twice against an unchanged fleet changes nothing: states are
/// only written when they differ and `read_only` is only enforced on
/// replicas that are writable.
pub async fn discover(cluster: &mut Cluster) -> Result<(), DiscoveryError> {
    let span = info_span!("topology.discover", cluster = %cluster.config.name);
    run(cluster).instrument(span).await
}

async fn run(cluster: &mut Cluster) -> Result<(), DiscoveryError> {
    if cluster.sme.is_in_failover() {
        debug!("promotion in progress, skipping discovery");
        return Ok(());
    }
    cluster.begin_cycle();
    let config = cluster.config.clone();
    let results = probe_all(cluster).await;

    let mut targets: Vec<Option<ServerState>> = vec![None; cluster.servers.len()];
    let mut slaves = Vec::new();
    let mut master = None;
    let mut responded = Vec::new();

    for (index, result) in results {
        let url = cluster.servers[index].url.clone();
        let facts = match result {
            Ok(facts) => facts,
            Err(error @ AdminError::AccessDenied { .. }) => {
                cluster.ledger(
                    LedgerEntry::new(
                        codes::PRIVILEGES_UNREADABLE,
                        Severity::Warn,
                        "TOPO",
                        format!("Database {url} access denied: {error}"),
                    )
                    .on(&url),
                );
                targets[index] = Some(ServerState::Unconnected);
                continue;
            }
            Err(error) => {
                debug!(server = %url, %error, "server unreachable");
                cluster.ledger(
                    LedgerEntry::new(
                        codes::SERVER_DOWN,
                        Severity::Info,
                        "TOPO",
                        format!("Server {url} is down"),
                    )
                    .on(&url),
                );
                // later failures are the health check's business
                if cluster.servers[index].state() == ServerState::Unconnected {
                    targets[index] = Some(ServerState::Failed);
                }
                continue;
            }
        };
        let is_replica = facts.replication.is_some();
        cluster.servers[index].apply_facts(facts);
        responded.push(index);

        let Ok(admin) = cluster.servers[index].admin() else {
            continue;
        };
        if is_replica {
            slaves.push(index);
            targets[index] = Some(ServerState::Slave);
        } else {
            match admin.binlog_dump_count().await {
                Ok(0) => {
                    debug!(server = %url, "no replica connected");
                    targets[index] = Some(ServerState::Unconnected);
                }
                Ok(_) => master = Some(index),
                Err(error) => {
                    cluster.ledger(
                        LedgerEntry::new(
                            codes::BINLOG_DUMP_UNREADABLE,
                            Severity::Error,
                            "CONF",
                            format!("Error getting binlog dump count on server {url}: {error}"),
                        )
                        .on(&url),
                    );
                    targets[index] = Some(ServerState::Failed);
                    continue;
                }
            }
        }
        check_privileges(cluster, admin.as_ref(), &url).await;
    }

    if slaves.is_empty() {
        cluster.ledger(LedgerEntry::new(
            codes::NO_SLAVES,
            Severity::Error,
            "TOPO",
            "No slaves were detected",
        ));
    }

    if !cluster.is_multi_master() {
        let first = slaves
            .first()
            .and_then(|index| cluster.servers[*index].master_server_id());
        let mut diverged = false;
        for index in &slaves {
            if cluster.servers[*index].master_server_id() != first {
                diverged = true;
                cluster.ledger(
                    LedgerEntry::new(
                        codes::MULTIPLE_MASTERS,
                        Severity::Warn,
                        "TOPO",
                        "Multiple masters were detected",
                    )
                    .on(&cluster.servers[*index].url),
                );
            }
        }
        if diverged {
            // sticky: a later pass never switches back to standard
            info!(cluster = %config.name, "replicas follow different masters, switching to multi-master monitoring");
            cluster.topology = TopologyKind::MultiMaster;
        }
    }
    let multi_master = cluster.is_multi_master();

    if multi_master {
        let writable = responded
            .iter()
            .filter(|index| !cluster.servers[**index].read_only)
            .count();
        let read_only = responded.len() - writable;
        if writable > 1 {
            cluster.ledger(LedgerEntry::new(
                codes::MULTI_MASTER_RW,
                Severity::Warn,
                "TOPO",
                "RW server count > 1 in multi-master mode, switching to preferred master",
            ));
        }
        if read_only > 1 {
            cluster.ledger(LedgerEntry::new(
                codes::MULTI_MASTER_RO,
                Severity::Warn,
                "TOPO",
                "RO server count > 1 in multi-master mode, switching to preferred master",
            ));
            match config
                .preferred_master_url()
                .and_then(|url| cluster.index_of(&url))
            {
                Some(preferred) => {
                    if let Ok(admin) = cluster.ensure_admin(preferred).await {
                        if let Err(error) = admin.set_read_only(false).await {
                            warn!(%error, "could not make preferred master writable");
                        } else {
                            cluster.servers[preferred].read_only = false;
                        }
                    }
                }
                None => cluster.ledger(LedgerEntry::new(
                    codes::MULTI_MASTER_NO_PREFERRED,
                    Severity::Warn,
                    "TOPO",
                    "Multi-master needs a preferred master",
                )),
            }
        }
    } else if config.read_only {
        for index in &slaves {
            if cluster.servers[*index].read_only {
                continue;
            }
            let url = cluster.servers[*index].url.clone();
            match cluster.servers[*index].admin() {
                Ok(admin) => match admin.set_read_only(true).await {
                    Ok(()) => {
                        info!(server = %url, "enforced read_only on replica");
                        cluster.servers[*index].read_only = true;
                    }
                    Err(error) => warn!(server = %url, %error, "could not enforce read_only"),
                },
                Err(error) => warn!(server = %url, %error, "could not enforce read_only"),
            }
        }
    }

    if master.is_none() && !slaves.is_empty() {
        master = resolve_master(cluster, &slaves, &targets, multi_master);
    }

    let mut binlog_off = None;
    if let Some(master) = master {
        let master_url = cluster.servers[master].url.clone();
        let mut replication_ok = false;
        if !multi_master {
            for index in &slaves {
                let slave = &cluster.servers[*index];
                if !slave.is_replica_of(&master_url) {
                    cluster.ledger(
                        LedgerEntry::new(
                            codes::NOT_SLAVE_OF_MASTER,
                            Severity::Warn,
                            "TOPO",
                            format!("Server {} is not a slave of declared master {master_url}", slave.url),
                        )
                        .on(&slave.url),
                    );
                }
                if !slave.log_bin {
                    binlog_off.get_or_insert_with(|| slave.url.to_string());
                    cluster.ledger(
                        LedgerEntry::new(
                            codes::SLAVE_BINLOG_OFF,
                            Severity::Error,
                            "TOPO",
                            format!("Binary log disabled on slave: {}", slave.url),
                        )
                        .on(&slave.url),
                    );
                }
                let in_time = slave
                    .delay()
                    .is_some_and(|delay| delay <= config.max_delay.as_secs() as i64);
                let sql_running = slave
                    .replication
                    .as_ref()
                    .is_some_and(|status| status.sql_running);
                if in_time && sql_running {
                    replication_ok = true;
                }
            }
        }

        let master_failed = targets[master] == Some(ServerState::Failed)
            || (targets[master].is_none() && cluster.servers[master].is_failed());
        let all_running = slaves.iter().all(|index| {
            cluster.servers[*index]
                .replication
                .as_ref()
                .is_some_and(|status| status.is_running())
        });
        if master_failed && all_running {
            cluster.ledger(LedgerEntry::new(
                codes::MASTER_UNREACHABLE_SLAVES_RUNNING,
                Severity::Error,
                "NET",
                "Network issue - Master is unreachable but slaves are replicating",
            ));
        }
        if !master_failed {
            targets[master] = Some(ServerState::Master);
        }
        cluster
            .sme
            .set_master_up_and_sync(cluster.servers[master].semisync_master, replication_ok);
    } else {
        cluster.ledger(LedgerEntry::new(
            codes::NO_MASTER,
            Severity::Error,
            "TOPO",
            "Could not autodetect a master",
        ));
    }

    for (index, target) in targets.into_iter().enumerate() {
        let current = cluster.servers[index].state();
        // Suspect and Failed servers belong to the health check
        if matches!(current, ServerState::Suspect | ServerState::Failed) {
            continue;
        }
        if let Some(target) = target {
            cluster.set_state(index, target);
        }
    }
    if master != cluster.master {
        match master {
            Some(index) => info!(master = %cluster.servers[index].url, "master discovered"),
            None => warn!("master lost"),
        }
    }
    cluster.master = master;
    cluster.slaves = slaves;

    if cluster.sme.can_monitor() {
        return Ok(());
    }
    Err(if cluster.slaves.is_empty() {
        DiscoveryError::NoReplicas
    } else if cluster.master.is_none() {
        DiscoveryError::NoMaster
    } else if let Some(server) = binlog_off {
        DiscoveryError::BinlogDisabled { server }
    } else {
        DiscoveryError::Blocked {
            codes: cluster.sme.current_errors(),
        }
    })
}

/// Finds the master the replicas point at when no node announced itself
/// through its binlog dump threads.
fn resolve_master(
    cluster: &Cluster,
    slaves: &[usize],
    targets: &[Option<ServerState>],
    multi_master: bool,
) -> Option<usize> {
    let first = &cluster.servers[slaves[0]];
    let server_id = first.master_server_id();
    let found = cluster.servers.iter().enumerate().position(|(index, server)| {
        if multi_master {
            targets[index] != Some(ServerState::Failed) && !server.is_failed() && !server.read_only
        } else {
            targets[index] == Some(ServerState::Unconnected) && Some(server.server_id) == server_id
        }
    });
    if found.is_some() {
        return found;
    }
    // the replicas still point at a master this pass could not reach
    let host = first.master_host()?;
    cluster.servers.iter().enumerate().position(|(index, server)| {
        let unreachable = matches!(targets[index], None | Some(ServerState::Failed));
        unreachable && server.url.host == host
    })
}

async fn check_privileges(cluster: &Cluster, admin: &dyn DbAdmin, url: &ServerUrl) {
    let config = &cluster.config;
    let user = config.db_credentials().user;
    match admin.privileges(&user, &url.host).await {
        Ok(grants) => {
            let missing = [
                (grants.repl_client_priv, codes::MISSING_REPLICATION_CLIENT, "REPLICATION CLIENT"),
                (grants.super_priv, codes::MISSING_SUPER, "SUPER"),
                (grants.reload_priv, codes::MISSING_RELOAD, "RELOAD"),
            ];
            for (granted, code, privilege) in missing {
                if !granted {
                    cluster.ledger(
                        LedgerEntry::new(
                            code,
                            Severity::Warn,
                            "CONF",
                            format!("User {user} must have {privilege} privilege"),
                        )
                        .on(url),
                    );
                }
            }
        }
        Err(error) => cluster.ledger(
            LedgerEntry::new(
                codes::PRIVILEGES_UNREADABLE,
                Severity::Warn,
                "CONF",
                format!("Error getting privileges for user {user}@{url}: {error}"),
            )
            .on(url),
        ),
    }

    let replication_user = config.replication_credentials().user;
    match admin.privileges(&replication_user, &url.host).await {
        Ok(grants) if !grants.repl_slave_priv => cluster.ledger(
            LedgerEntry::new(
                codes::MISSING_REPLICATION_SLAVE,
                Severity::Warn,
                "CONF",
                format!("User {replication_user} must have REPLICATION SLAVE privilege"),
            )
            .on(url),
        ),
        Ok(_) => {}
        Err(error) => cluster.ledger(
            LedgerEntry::new(
                codes::REPL_PRIVILEGES_UNREADABLE,
                Severity::Warn,
                "CONF",
                format!("Error getting privileges for user {replication_user} on server {url}: {error}"),
            )
            .on(url),
        ),
    }
}
