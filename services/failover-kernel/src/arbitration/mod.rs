//! Split-brain arbitration between monitors guarding the same cluster.
//!
//! Each monitor posts a heartbeat every tick and, before freezing a master,
//! asks the arbitrator for a verdict. The arbitrator keeps one row per
//! (secret, cluster, monitor) and grants the elected flag to at most one
//! monitor at a time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
pub mod server;
pub mod store;

pub use client::HttpArbitrator;
pub use server::router;
pub use store::{ArbitrationStore, MemoryArbitrationStore, MySqlArbitrationStore};

/// Heartbeats younger than this count as live monitors.
pub const FRESHNESS_SECS: i64 = 10;

#[derive(Debug, Error)]
pub enum ArbitrationError {
    #[error("arbitrator unreachable: {0}")]
    Transport(String),
    #[error("arbitrator answered with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected arbitrator response: {0}")]
    Decode(String),
    #[error("arbitration store failure: {0}")]
    Store(String),
    #[error("arbitration is not configured")]
    Disabled,
}

impl From<sqlx::Error> for ArbitrationError {
    fn from(error: sqlx::Error) -> Self {
        ArbitrationError::Store(error.to_string())
    }
}

/// Heartbeat and arbitration request body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    /// Identity of the requesting monitor; rows are keyed by it.
    pub uuid: String,
    pub secret: String,
    pub cluster: String,
    pub master: String,
    /// Numeric id the monitor derived its `uuid` from, informational only.
    #[serde(default)]
    pub uid: u64,
    /// Hosts this monitor can see.
    #[serde(default)]
    pub hosts: u32,
    /// Hosts this monitor considers failed.
    #[serde(default)]
    pub failed: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "winner")]
    Winner,
    #[serde(rename = "looser")]
    Loser,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitrationResponse {
    pub arbitration: Verdict,
    /// Master URL claimed by the elected monitor, empty when none is elected.
    #[serde(default)]
    pub master: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub heartbeat: String,
}

impl HeartbeatRecord {
    /// Checks the fields a row key is built from.
    pub fn validate(&self) -> Result<(), String> {
        if self.uuid.trim().is_empty() {
            return Err("uuid is required".into());
        }
        if self.secret.is_empty() {
            return Err("secret is required".into());
        }
        Ok(())
    }
}

/// Client side of the arbitration protocol.
#[async_trait]
pub trait Arbitrator: Send + Sync {
    async fn heartbeat(&self, record: &HeartbeatRecord) -> Result<(), ArbitrationError>;
    async fn arbitrate(
        &self,
        record: &HeartbeatRecord,
    ) -> Result<ArbitrationResponse, ArbitrationError>;
}
