//! Process-wide health ledger of one cluster.
//!
//! Entries are keyed by a stable code so repeated detections of the same
//! condition collapse into one entry. Every tick the current map rotates
//! into the previous one, which lets the monitor report what opened and what
//! got resolved since the last tick.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::server::ServerUrl;

pub mod codes {
    pub const SERVER_DOWN: &str = "INF00001";
    pub const PRIVILEGES_UNREADABLE: &str = "ERR00005";
    pub const MISSING_REPLICATION_CLIENT: &str = "ERR00006";
    pub const MISSING_REPLICATION_SLAVE: &str = "ERR00007";
    pub const MISSING_SUPER: &str = "ERR00008";
    pub const MISSING_RELOAD: &str = "ERR00009";
    pub const NO_SLAVES: &str = "ERR00010";
    pub const MULTIPLE_MASTERS: &str = "ERR00011";
    pub const NO_MASTER: &str = "ERR00012";
    pub const SLAVE_BINLOG_OFF: &str = "ERR00013";
    pub const BINLOG_DUMP_UNREADABLE: &str = "ERR00014";
    pub const REPL_PRIVILEGES_UNREADABLE: &str = "ERR00015";
    pub const MASTER_UNREACHABLE_SLAVES_RUNNING: &str = "ERR00016";
    pub const MULTI_MASTER_RW: &str = "WARN00003";
    pub const MULTI_MASTER_RO: &str = "WARN00004";
    pub const NOT_SLAVE_OF_MASTER: &str = "WARN00005";
    pub const MULTI_MASTER_NO_PREFERRED: &str = "WARN00006";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Test,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Test => "TEST",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub code: String,
    pub severity: Severity,
    pub description: String,
    /// Subsystem that raised the entry (`TOPO`, `CONF`, `CHECK`, ...).
    pub origin: String,
    pub server: Option<ServerUrl>,
}

impl LedgerEntry {
    pub fn new(
        code: &str,
        severity: Severity,
        origin: &str,
        description: impl Into<String>,
    ) -> Self {
        Self {
            code: code.to_string(),
            severity,
            description: description.into(),
            origin: origin.to_string(),
            server: None,
        }
    }

    pub fn on(mut self, server: &ServerUrl) -> Self {
        self.server = Some(server.clone());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerChange {
    Opened(LedgerEntry),
    Resolved(LedgerEntry),
}

impl fmt::Display for LedgerChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerChange::Opened(entry) => write!(f, "OPENED {} : {}", entry.code, entry.description),
            LedgerChange::Resolved(entry) => {
                write!(f, "RESOLV {} : {}", entry.code, entry.description)
            }
        }
    }
}

/// Availability counters, in seconds since `first_time`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sla {
    pub first_time: DateTime<Utc>,
    pub uptime: i64,
    pub uptime_failable: i64,
    pub uptime_semisync: i64,
}

struct Ledger {
    current: BTreeMap<String, LedgerEntry>,
    previous: BTreeMap<String, LedgerEntry>,
    heartbeats: u64,
    first_time: DateTime<Utc>,
    last_time: DateTime<Utc>,
    uptime: i64,
    uptime_failable: i64,
    uptime_semisync: i64,
    failover_count: u64,
    last_failover: Option<DateTime<Utc>>,
}

impl Ledger {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            current: BTreeMap::new(),
            previous: BTreeMap::new(),
            heartbeats: 0,
            first_time: now,
            last_time: now,
            uptime: 0,
            uptime_failable: 0,
            uptime_semisync: 0,
            failover_count: 0,
            last_failover: None,
        }
    }

    fn failable(&self) -> bool {
        !self
            .previous
            .values()
            .any(|entry| entry.severity == Severity::Error)
    }

    fn percent(&self, value: i64) -> f64 {
        let elapsed = (self.last_time - self.first_time).num_seconds();
        if elapsed <= 0 {
            return 0.0;
        }
        (100.0 * value as f64 / elapsed as f64).min(99.99999)
    }
}

pub struct StateMachine {
    ledger: Mutex<Ledger>,
    in_failover: AtomicBool,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            ledger: Mutex::new(Ledger::new(Utc::now())),
            in_failover: AtomicBool::new(false),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens an entry unless one with the same code is already open.
    pub fn add_state(&self, entry: LedgerEntry) {
        let mut ledger = self.ledger();
        if ledger.heartbeats == 0 {
            ledger
                .previous
                .entry(entry.code.clone())
                .or_insert_with(|| entry.clone());
        }
        ledger.current.entry(entry.code.clone()).or_insert(entry);
    }

    pub fn delete_state(&self, code: &str) {
        self.ledger().current.remove(code);
    }

    /// Whether `code` was open at the end of the previous tick.
    pub fn is_in_state(&self, code: &str) -> bool {
        self.ledger().previous.contains_key(code)
    }

    /// Whether `code` has been raised during the current tick.
    pub fn is_in_current_state(&self, code: &str) -> bool {
        self.ledger().current.contains_key(code)
    }

    /// Starts a new tick: the current entries become the previous ones.
    pub fn clear_state(&self) {
        let mut ledger = self.ledger();
        ledger.previous = std::mem::take(&mut ledger.current);
    }

    /// False while an ERROR is open in the current tick.
    pub fn can_monitor(&self) -> bool {
        !self
            .ledger()
            .current
            .values()
            .any(|entry| entry.severity == Severity::Error)
    }

    /// Codes of the ERROR entries raised during the current tick.
    pub fn current_errors(&self) -> Vec<String> {
        self.ledger()
            .current
            .values()
            .filter(|entry| entry.severity == Severity::Error)
            .map(|entry| entry.code.clone())
            .collect()
    }

    /// False while an ERROR was open at the end of the previous tick.
    pub fn is_failable(&self) -> bool {
        self.ledger().failable()
    }

    pub fn changes(&self) -> Vec<LedgerChange> {
        let ledger = self.ledger();
        let resolved = ledger
            .previous
            .iter()
            .filter(|(code, _)| !ledger.current.contains_key(*code))
            .map(|(_, entry)| LedgerChange::Resolved(entry.clone()));
        let opened = ledger
            .current
            .iter()
            .filter(|(code, _)| !ledger.previous.contains_key(*code))
            .map(|(_, entry)| LedgerChange::Opened(entry.clone()));
        resolved.chain(opened).collect()
    }

    pub fn open_errors(&self) -> Vec<LedgerEntry> {
        self.open_entries(|severity| severity == Severity::Error)
    }

    pub fn open_warnings(&self) -> Vec<LedgerEntry> {
        self.open_entries(|severity| severity != Severity::Error)
    }

    fn open_entries(&self, keep: impl Fn(Severity) -> bool) -> Vec<LedgerEntry> {
        self.ledger()
            .previous
            .values()
            .filter(|entry| keep(entry.severity))
            .cloned()
            .collect()
    }

    pub fn set_master_up_and_sync(&self, semisync: bool, not_delayed: bool) {
        self.set_master_up_and_sync_at(semisync, not_delayed, Utc::now());
    }

    /// Accumulates availability for the interval since the last call.
    /// Nothing accrues while an ERROR is open.
    pub fn set_master_up_and_sync_at(&self, semisync: bool, not_delayed: bool, now: DateTime<Utc>) {
        let mut ledger = self.ledger();
        let elapsed = (now - ledger.last_time).num_seconds().max(0);
        if ledger.failable() {
            ledger.uptime += elapsed;
            if semisync {
                ledger.uptime_semisync += elapsed;
            }
            if not_delayed {
                ledger.uptime_failable += elapsed;
            }
        }
        ledger.last_time = now;
        ledger.heartbeats += 1;
    }

    pub fn heartbeats(&self) -> u64 {
        self.ledger().heartbeats
    }

    pub fn uptime(&self) -> f64 {
        let ledger = self.ledger();
        ledger.percent(ledger.uptime)
    }

    pub fn uptime_failable(&self) -> f64 {
        let ledger = self.ledger();
        ledger.percent(ledger.uptime_failable)
    }

    pub fn uptime_semisync(&self) -> f64 {
        let ledger = self.ledger();
        ledger.percent(ledger.uptime_semisync)
    }

    pub fn sla(&self) -> Sla {
        let ledger = self.ledger();
        Sla {
            first_time: ledger.first_time,
            uptime: ledger.uptime,
            uptime_failable: ledger.uptime_failable,
            uptime_semisync: ledger.uptime_semisync,
        }
    }

    pub fn is_in_failover(&self) -> bool {
        self.in_failover.load(Ordering::SeqCst)
    }

    /// Test-and-set on the in-failover flag. Returns `None` when another
    /// promotion already holds it; the flag is released when the guard drops.
    pub fn try_begin_failover(self: &Arc<Self>) -> Option<FailoverGuard> {
        self.in_failover
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| FailoverGuard {
                sme: Arc::clone(self),
            })
    }

    pub fn record_failover(&self, at: DateTime<Utc>) {
        let mut ledger = self.ledger();
        ledger.failover_count += 1;
        ledger.last_failover = Some(at);
    }

    pub fn failover_count(&self) -> u64 {
        self.ledger().failover_count
    }

    pub fn last_failover(&self) -> Option<DateTime<Utc>> {
        self.ledger().last_failover
    }

    /// Operator reset: forget every entry, counter and timestamp.
    pub fn reset(&self) {
        *self.ledger() = Ledger::new(Utc::now());
        self.in_failover.store(false, Ordering::SeqCst);
    }
}

pub struct FailoverGuard {
    sme: Arc<StateMachine>,
}

impl Drop for FailoverGuard {
    fn drop(&mut self) {
        self.sme.in_failover.store(false, Ordering::SeqCst);
    }
}
