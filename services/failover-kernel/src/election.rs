//! Master candidate election.
//!
//! [`elect`] is a pure function over facts gathered from the replicas just
//! before the decision, so the rules can be exercised without a fleet.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    admin::{AdminError, DbAdmin},
    config::ClusterConfig,
    gtid::GtidList,
    server::{Server, ServerState, ServerUrl},
};

const REPLICATION_FILTER_VARIABLES: [&str; 6] = [
    "REPLICATE_DO_DB",
    "REPLICATE_IGNORE_DB",
    "REPLICATE_DO_TABLE",
    "REPLICATE_IGNORE_TABLE",
    "REPLICATE_WILD_DO_TABLE",
    "REPLICATE_WILD_IGNORE_TABLE",
];

/// Binlog and replication filters of one node. Two nodes must carry the
/// same filters for one to take over from the other.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    pub binlog_do_db: String,
    pub binlog_ignore_db: String,
    pub replication: Vec<(String, String)>,
}

impl Filters {
    pub async fn read(admin: &dyn DbAdmin) -> Result<Self, AdminError> {
        let variables = admin.variables().await?;
        let master = admin.master_status().await?.unwrap_or_default();
        Ok(Self {
            binlog_do_db: master.binlog_do_db,
            binlog_ignore_db: master.binlog_ignore_db,
            replication: REPLICATION_FILTER_VARIABLES
                .iter()
                .map(|name| {
                    (
                        name.to_string(),
                        variables.get(*name).cloned().unwrap_or_default(),
                    )
                })
                .collect(),
        })
    }

    fn same_binlog_filters(&self, other: &Filters) -> bool {
        self.binlog_do_db == other.binlog_do_db && self.binlog_ignore_db == other.binlog_ignore_db
    }
}

/// What the election knows about one replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateFacts {
    pub url: ServerUrl,
    pub state: ServerState,
    pub reachable: bool,
    pub log_bin: bool,
    pub seconds_behind_master: Option<i64>,
    pub slave_gtid: GtidList,
    pub semisync_slave: bool,
    pub filters: Filters,
}

impl CandidateFacts {
    /// Reads fresh replication state and filters from `server`. An
    /// unreachable node yields facts that fail the prerequisite check.
    pub async fn gather(server: &Server) -> Self {
        let mut facts = Self {
            url: server.url.clone(),
            state: server.state(),
            reachable: false,
            log_bin: server.log_bin,
            seconds_behind_master: server.delay(),
            slave_gtid: server.slave_gtid.clone(),
            semisync_slave: server.semisync_slave,
            filters: Filters::default(),
        };
        let Ok(admin) = server.admin() else {
            return facts;
        };
        if admin.ping().await.is_err() {
            return facts;
        }
        facts.reachable = true;
        if let Ok(status) = admin.replication_status().await {
            facts.seconds_behind_master = status.and_then(|status| status.seconds_behind_master);
        }
        if let Ok(variables) = admin.variables().await {
            if let Some(position) = variables.get("GTID_SLAVE_POS") {
                facts.slave_gtid = GtidList::parse_lossy(position);
            }
        }
        if let Ok(filters) = Filters::read(admin.as_ref()).await {
            facts.filters = filters;
        }
        facts
    }
}

/// What the election knows about the master being replaced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MasterFacts {
    pub failed: bool,
    pub current_gtid: GtidList,
    pub filters: Filters,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElectionPolicy {
    pub max_delay: Duration,
    pub gtid_check: bool,
    pub rpl_checks: bool,
    pub fail_sync: bool,
    pub multi_master: bool,
    pub preferred: Option<ServerUrl>,
    pub ignored: Vec<ServerUrl>,
}

impl ElectionPolicy {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            max_delay: config.max_delay,
            gtid_check: config.gtid_check,
            rpl_checks: config.rpl_checks,
            fail_sync: config.fail_sync,
            multi_master: config.multi_master,
            preferred: config.preferred_master_url(),
            ignored: config
                .ignore_servers
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    Ignored,
    AlreadyMaster,
    BinlogFiltersDiffer,
    ReplicationFiltersDiffer,
    NotInSync,
    SemisyncOff,
    Unreachable,
    BinlogDisabled,
    ReplicationStopped,
    Delayed { delay: i64, max: i64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Ignored => f.write_str("in the ignore list"),
            Rejection::AlreadyMaster => f.write_str("already a master"),
            Rejection::BinlogFiltersDiffer => f.write_str("binlog filters differ from the master"),
            Rejection::ReplicationFiltersDiffer => {
                f.write_str("replication filters differ from the master")
            }
            Rejection::NotInSync => f.write_str("gtid position differs from the master"),
            Rejection::SemisyncOff => f.write_str("semi-sync replication is off"),
            Rejection::Unreachable => f.write_str("unreachable"),
            Rejection::BinlogDisabled => f.write_str("binary log disabled"),
            Rejection::ReplicationStopped => f.write_str("replication is stopped"),
            Rejection::Delayed { delay, max } => {
                write!(f, "{delay}s of replication delay exceeds {max}s")
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionReason {
    Preferred,
    HighestSequence,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElectionOutcome {
    /// Index into the candidate slice.
    pub winner: Option<usize>,
    pub reason: Option<ElectionReason>,
    pub rejections: Vec<(ServerUrl, Rejection)>,
}

impl ElectionOutcome {
    pub fn winner_url<'a>(&self, candidates: &'a [CandidateFacts]) -> Option<&'a ServerUrl> {
        self.winner.map(|index| &candidates[index].url)
    }
}

fn check(
    candidate: &CandidateFacts,
    master: &MasterFacts,
    policy: &ElectionPolicy,
) -> Result<(), Rejection> {
    if policy.ignored.contains(&candidate.url) {
        return Err(Rejection::Ignored);
    }
    if policy.multi_master && candidate.state == ServerState::Master {
        return Err(Rejection::AlreadyMaster);
    }
    // a dead master has nothing to compare against
    if !master.failed {
        if !candidate.filters.same_binlog_filters(&master.filters) {
            return Err(Rejection::BinlogFiltersDiffer);
        }
        if candidate.filters.replication != master.filters.replication {
            return Err(Rejection::ReplicationFiltersDiffer);
        }
        if policy.gtid_check && policy.rpl_checks && candidate.slave_gtid != master.current_gtid {
            return Err(Rejection::NotInSync);
        }
        if policy.fail_sync && policy.rpl_checks && !candidate.semisync_slave {
            return Err(Rejection::SemisyncOff);
        }
    }
    if !candidate.reachable {
        return Err(Rejection::Unreachable);
    }
    if !candidate.log_bin {
        return Err(Rejection::BinlogDisabled);
    }
    if policy.rpl_checks {
        match candidate.seconds_behind_master {
            None if !master.failed => return Err(Rejection::ReplicationStopped),
            Some(delay) if delay > policy.max_delay.as_secs() as i64 => {
                return Err(Rejection::Delayed {
                    delay,
                    max: policy.max_delay.as_secs() as i64,
                })
            }
            _ => {}
        }
    }
    Ok(())
}

/// Picks the candidate to promote.
///
/// An eligible preferred master wins outright. Otherwise the eligible
/// candidate with the highest summed GTID sequence wins; on a tie the one
/// listed first wins.
pub fn elect(
    candidates: &[CandidateFacts],
    master: &MasterFacts,
    policy: &ElectionPolicy,
) -> ElectionOutcome {
    let mut rejections = Vec::new();
    let mut best: Option<(usize, u64)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        if let Err(rejection) = check(candidate, master, policy) {
            rejections.push((candidate.url.clone(), rejection));
            continue;
        }
        if policy.preferred.as_ref() == Some(&candidate.url) {
            return ElectionOutcome {
                winner: Some(index),
                reason: Some(ElectionReason::Preferred),
                rejections,
            };
        }
        let sequence = candidate.slave_gtid.sequence();
        if best.map_or(true, |(_, highest)| sequence > highest) {
            best = Some((index, sequence));
        }
    }
    ElectionOutcome {
        winner: best.map(|(index, _)| index),
        reason: best.map(|_| ElectionReason::HighestSequence),
        rejections,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(host: &str, seq: u64) -> CandidateFacts {
        CandidateFacts {
            url: ServerUrl::new(host, 3306),
            state: ServerState::Slave,
            reachable: true,
            log_bin: true,
            seconds_behind_master: Some(0),
            slave_gtid: format!("0-1-{seq}").parse().expect("gtid"),
            semisync_slave: true,
            filters: Filters::default(),
        }
    }

    fn policy() -> ElectionPolicy {
        ElectionPolicy::from_config(&ClusterConfig::default())
    }

    fn alive_master() -> MasterFacts {
        MasterFacts {
            failed: false,
            current_gtid: "0-1-10".parse().expect("gtid"),
            filters: Filters::default(),
        }
    }

    #[test]
    fn highest_sequence_wins() {
        let candidates = [candidate("db2", 8), candidate("db3", 10)];
        let outcome = elect(&candidates, &alive_master(), &policy());
        assert_eq!(outcome.winner, Some(1));
        assert_eq!(outcome.reason, Some(ElectionReason::HighestSequence));
    }

    #[test]
    fn first_listed_wins_a_tie() {
        let candidates = [candidate("db2", 10), candidate("db3", 10)];
        let outcome = elect(&candidates, &alive_master(), &policy());
        assert_eq!(outcome.winner, Some(0));
    }

    #[test]
    fn eligible_preferred_master_is_rigged_in() {
        let candidates = [candidate("db2", 10), candidate("db3", 2)];
        let mut policy = policy();
        policy.preferred = Some(ServerUrl::new("db3", 3306));
        let outcome = elect(&candidates, &alive_master(), &policy);
        assert_eq!(outcome.winner, Some(1));
        assert_eq!(outcome.reason, Some(ElectionReason::Preferred));
    }

    #[test]
    fn delayed_preferred_master_loses_its_advantage() {
        let mut preferred = candidate("db3", 2);
        preferred.seconds_behind_master = Some(120);
        let candidates = [candidate("db2", 10), preferred];
        let mut policy = policy();
        policy.preferred = Some(ServerUrl::new("db3", 3306));
        let outcome = elect(&candidates, &alive_master(), &policy);
        assert_eq!(outcome.winner, Some(0));
        assert_eq!(
            outcome.rejections,
            vec![(
                ServerUrl::new("db3", 3306),
                Rejection::Delayed { delay: 120, max: 30 }
            )]
        );
    }

    #[test]
    fn only_candidate_too_delayed_means_no_winner() {
        let mut lagging = candidate("db2", 10);
        lagging.seconds_behind_master = Some(31);
        let outcome = elect(&[lagging], &alive_master(), &policy());
        assert_eq!(outcome.winner, None);
        assert_eq!(outcome.reason, None);
    }

    #[test]
    fn stopped_replica_is_only_rejected_while_master_lives() {
        let mut stopped = candidate("db2", 10);
        stopped.seconds_behind_master = None;
        let candidates = [stopped];
        assert_eq!(elect(&candidates, &alive_master(), &policy()).winner, None);

        let dead = MasterFacts {
            failed: true,
            ..MasterFacts::default()
        };
        assert_eq!(elect(&candidates, &dead, &policy()).winner, Some(0));
    }

    #[test]
    fn filters_must_match_a_live_master() {
        let mut filtered = candidate("db2", 10);
        filtered.filters.binlog_ignore_db = "scratch".into();
        let mut replicated = candidate("db3", 9);
        replicated.filters.replication = vec![("REPLICATE_DO_DB".into(), "app".into())];
        let outcome = elect(&[filtered, replicated], &alive_master(), &policy());
        assert_eq!(outcome.winner, None);
        assert_eq!(outcome.rejections[0].1, Rejection::BinlogFiltersDiffer);
        assert_eq!(outcome.rejections[1].1, Rejection::ReplicationFiltersDiffer);
    }

    #[test]
    fn strict_gtid_check_requires_identical_position() {
        let mut policy = policy();
        policy.gtid_check = true;
        let candidates = [candidate("db2", 9), candidate("db3", 10)];
        let outcome = elect(&candidates, &alive_master(), &policy);
        assert_eq!(outcome.winner, Some(1));
        assert_eq!(outcome.rejections[0].1, Rejection::NotInSync);
    }

    #[test]
    fn semisync_requirement_and_ignore_list() {
        let mut policy = policy();
        policy.fail_sync = true;
        policy.ignored = vec![ServerUrl::new("db3", 3306)];
        let mut async_replica = candidate("db2", 10);
        async_replica.semisync_slave = false;
        let outcome = elect(
            &[async_replica, candidate("db3", 10), candidate("db4", 1)],
            &alive_master(),
            &policy,
        );
        assert_eq!(outcome.winner, Some(2));
        assert_eq!(outcome.rejections[0].1, Rejection::SemisyncOff);
        assert_eq!(outcome.rejections[1].1, Rejection::Ignored);
    }

    #[test]
    fn unreachable_and_binlogless_candidates_are_skipped() {
        let mut down = candidate("db2", 10);
        down.reachable = false;
        let mut no_binlog = candidate("db3", 10);
        no_binlog.log_bin = false;
        let outcome = elect(&[down, no_binlog], &alive_master(), &policy());
        assert_eq!(outcome.winner, None);
        assert_eq!(outcome.rejections.len(), 2);
    }
}
