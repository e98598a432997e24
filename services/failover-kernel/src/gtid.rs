use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single MariaDB global transaction id, `domain-server-sequence`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gtid {
    pub domain_id: u32,
    pub server_id: u64,
    pub seq_no: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GtidParseError {
    #[error("gtid `{0}` must have three dash-separated components")]
    Shape(String),
    #[error("gtid `{0}` has a non-numeric component")]
    Number(String),
}

impl FromStr for Gtid {
    type Err = GtidParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let parts: Vec<&str> = value.split('-').collect();
        if parts.len() != 3 {
            return Err(GtidParseError::Shape(value.to_string()));
        }
        let number = |part: &str| GtidParseError::Number(part.to_string());
        Ok(Self {
            domain_id: parts[0].parse().map_err(|_| number(value))?,
            server_id: parts[1].parse().map_err(|_| number(value))?,
            seq_no: parts[2].parse().map_err(|_| number(value))?,
        })
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.seq_no)
    }
}

/// A GTID position as reported by `gtid_current_pos`, `gtid_slave_pos` or
/// `gtid_binlog_pos`: at most one entry per replication domain.
///
/// Entries are kept sorted by domain so two positions compare equal
/// regardless of the order the server printed them in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct GtidList {
    entries: Vec<Gtid>,
}

impl GtidList {
    pub fn new(mut entries: Vec<Gtid>) -> Self {
        entries.sort();
        entries.dedup_by_key(|gtid| gtid.domain_id);
        Self { entries }
    }

    /// Parses a server-reported position, treating malformed input as empty.
    pub fn parse_lossy(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Gtid] {
        &self.entries
    }

    pub fn domain_ids(&self) -> Vec<u32> {
        self.entries.iter().map(|gtid| gtid.domain_id).collect()
    }

    pub fn seq_nos(&self) -> Vec<u64> {
        self.entries.iter().map(|gtid| gtid.seq_no).collect()
    }

    /// Sum of the sequence numbers across domains. With a single domain this
    /// is simply the sequence number of the last applied transaction.
    pub fn sequence(&self) -> u64 {
        self.entries
            .iter()
            .fold(0u64, |acc, gtid| acc.saturating_add(gtid.seq_no))
    }

    /// Sequence number recorded for transactions originated by `server_id`,
    /// or 0 when that server never originated one in this position.
    pub fn seq_for_server(&self, server_id: u64) -> u64 {
        self.entries
            .iter()
            .find(|gtid| gtid.server_id == server_id)
            .map(|gtid| gtid.seq_no)
            .unwrap_or(0)
    }

    pub fn seq_for_domain(&self, domain_id: u32) -> Option<u64> {
        self.entries
            .iter()
            .find(|gtid| gtid.domain_id == domain_id)
            .map(|gtid| gtid.seq_no)
    }

    /// True when some domain present in `other` has not been applied up to
    /// the same sequence here.
    pub fn is_behind(&self, other: &GtidList) -> bool {
        other.entries.iter().any(|theirs| {
            self.seq_for_domain(theirs.domain_id)
                .map_or(true, |ours| ours < theirs.seq_no)
        })
    }

    /// True when some domain has advanced further here than in `other`.
    pub fn is_ahead_of(&self, other: &GtidList) -> bool {
        self.entries.iter().any(|ours| {
            other
                .seq_for_domain(ours.domain_id)
                .map_or(ours.seq_no > 0, |theirs| ours.seq_no > theirs)
        })
    }
}

impl FromStr for GtidList {
    type Err = GtidParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let entries = value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Gtid>, _>>()?;
        Ok(Self::new(entries))
    }
}

impl fmt::Display for GtidList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for gtid in &self.entries {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{gtid}")?;
            first = false;
        }
        Ok(())
    }
}

impl From<GtidList> for String {
    fn from(list: GtidList) -> Self {
        list.to_string()
    }
}

impl TryFrom<String> for GtidList {
    type Error = GtidParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
