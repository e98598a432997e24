//! Failover orchestration for MariaDB/MySQL replication clusters.
//!
//! A [`cluster::Cluster`] owns its servers and drives topology discovery,
//! per-tick health checks, candidate election, the failover/switchover
//! protocol and the rejoin of recovered nodes. [`monitor`] runs one loop per
//! cluster; [`arbitration`] keeps two monitors guarding the same cluster from
//! promoting concurrently.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod admin;
pub mod alert;
pub mod arbitration;
pub mod cluster;
pub mod config;
pub mod election;
pub mod failover;
pub mod gtid;
pub mod health;
pub mod hooks;
pub mod monitor;
pub mod rejoin;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod test_support;
pub mod topology;

pub use admin::{AdminConnector, AdminError, DbAdmin};
pub use cluster::{Cluster, ClusterSnapshot, TopologyKind};
pub use config::{ClusterConfig, ConfigError, MonitorConfig};
pub use failover::{FailoverError, FailoverReport};
pub use monitor::{ClusterMonitor, MonitorHandle};
pub use server::{Server, ServerState, ServerUrl};
pub use state::StateMachine;
pub use topology::DiscoveryError;

/// How a failure should be treated by whoever observes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Node unreachable; absorbed by failure counters.
    Connectivity,
    /// Missing grants or configuration; reported as a warning.
    Prerequisite,
    /// Promotion must not proceed.
    ConsistencyRisk,
    /// Arbitrator said no or could not be asked; promotion must not proceed.
    Arbitration,
    /// Logged, the running protocol continues.
    BestEffort,
}

impl ErrorClass {
    pub fn aborts_promotion(self) -> bool {
        matches!(self, ErrorClass::ConsistencyRisk | ErrorClass::Arbitration)
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Admin(#[from] AdminError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Failover(#[from] FailoverError),
    #[error(transparent)]
    Arbitration(#[from] arbitration::ArbitrationError),
    #[error(transparent)]
    Hook(#[from] hooks::HookError),
    #[error(transparent)]
    Rejoin(#[from] rejoin::RejoinError),
}

impl KernelError {
    pub fn class(&self) -> ErrorClass {
        match self {
            KernelError::Admin(error) => error.class(),
            KernelError::Config(_) => ErrorClass::Prerequisite,
            KernelError::Discovery(error) => error.class(),
            KernelError::Failover(error) => error.class(),
            KernelError::Arbitration(_) => ErrorClass::Arbitration,
            KernelError::Hook(_) | KernelError::Rejoin(_) => ErrorClass::BestEffort,
        }
    }
}
