use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::server::{ServerUrl, ServerUrlError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid host `{host}`: {source}")]
    Host {
        host: String,
        #[source]
        source: ServerUrlError,
    },
    #[error("invalid value `{value}` for {name}")]
    Env { name: String, value: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverMode {
    #[default]
    Manual,
    Automatic,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    pub enabled: bool,
    pub url: String,
    pub secret: String,
    /// Stable identity of this monitor at the arbitrator. Derived from the
    /// process id of the monitor when unset.
    pub unique_id: Option<u64>,
    #[serde(with = "secs")]
    pub timeout: Duration,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://127.0.0.1:8080".to_string(),
            secret: String::new(),
            unique_id: None,
            timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub name: String,
    pub hosts: Vec<String>,
    /// `user:password` used for monitoring and administration.
    pub db_credentials: String,
    /// `user:password` replicas use to connect to their master.
    pub replication_credentials: String,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    #[serde(with = "secs")]
    pub monitoring_ticker: Duration,

    pub max_fail: u32,
    pub failover_mode: FailoverMode,
    /// Maximum number of automatic failovers, 0 for unlimited.
    pub failover_limit: u32,
    /// Minimum time between two automatic failovers, 0 for none.
    #[serde(with = "secs")]
    pub failover_time_limit: Duration,
    pub multi_master: bool,

    #[serde(with = "secs")]
    pub max_delay: Duration,
    pub gtid_check: bool,
    pub rpl_checks: bool,
    pub fail_sync: bool,
    pub preferred_master: Option<String>,
    pub ignore_servers: Vec<String>,

    #[serde(with = "secs")]
    pub switchover_busy_threshold: Duration,
    #[serde(with = "millis")]
    pub wait_kill: Duration,
    #[serde(with = "secs")]
    pub wait_position_timeout: Duration,
    pub read_only: bool,
    #[serde(with = "secs")]
    pub master_connect_retry: Duration,
    pub pre_failover_script: Option<String>,
    pub post_failover_script: Option<String>,
    pub rejoin_script: Option<String>,
    #[serde(with = "secs")]
    pub hook_timeout: Duration,

    pub autorejoin: bool,
    pub autorejoin_flashback: bool,
    pub autorejoin_dump: bool,
    pub autorejoin_backup_binlog: bool,
    pub rejoin_max_attempts: u32,
    #[serde(with = "secs")]
    pub rejoin_backoff: Duration,
    pub mysqlbinlog_path: String,
    pub mysql_client_path: String,
    pub mysqldump_path: String,
    pub working_dir: String,

    pub arbitration: ArbitrationConfig,
    pub alert_webhook: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            hosts: Vec::new(),
            db_credentials: String::new(),
            replication_credentials: String::new(),
            connect_timeout: Duration::from_secs(5),
            monitoring_ticker: Duration::from_secs(2),
            max_fail: 5,
            failover_mode: FailoverMode::Manual,
            failover_limit: 0,
            failover_time_limit: Duration::ZERO,
            multi_master: false,
            max_delay: Duration::from_secs(30),
            gtid_check: false,
            rpl_checks: true,
            fail_sync: false,
            preferred_master: None,
            ignore_servers: Vec::new(),
            switchover_busy_threshold: Duration::from_secs(10),
            wait_kill: Duration::from_millis(5000),
            wait_position_timeout: Duration::from_secs(30),
            read_only: true,
            master_connect_retry: Duration::from_secs(10),
            pre_failover_script: None,
            post_failover_script: None,
            rejoin_script: None,
            hook_timeout: Duration::from_secs(60),
            autorejoin: true,
            autorejoin_flashback: false,
            autorejoin_dump: false,
            autorejoin_backup_binlog: true,
            rejoin_max_attempts: 5,
            rejoin_backoff: Duration::from_secs(2),
            mysqlbinlog_path: "mysqlbinlog".to_string(),
            mysql_client_path: "mysql".to_string(),
            mysqldump_path: "mysqldump".to_string(),
            working_dir: "/tmp".to_string(),
            arbitration: ArbitrationConfig::default(),
            alert_webhook: None,
        }
    }
}

/// `user:password` split into its parts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn parse(value: &str) -> Self {
        match value.split_once(':') {
            Some((user, password)) => Self {
                user: user.to_string(),
                password: password.to_string(),
            },
            None => Self {
                user: value.to_string(),
                password: String::new(),
            },
        }
    }
}

impl ClusterConfig {
    pub fn server_urls(&self) -> Result<Vec<ServerUrl>, ConfigError> {
        self.hosts
            .iter()
            .map(|host| {
                host.parse().map_err(|source| ConfigError::Host {
                    host: host.clone(),
                    source,
                })
            })
            .collect()
    }

    pub fn db_credentials(&self) -> Credentials {
        Credentials::parse(&self.db_credentials)
    }

    pub fn replication_credentials(&self) -> Credentials {
        Credentials::parse(&self.replication_credentials)
    }

    pub fn preferred_master_url(&self) -> Option<ServerUrl> {
        self.preferred_master
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .and_then(|value| value.parse().ok())
    }

    pub fn is_ignored(&self, url: &ServerUrl) -> bool {
        self.ignore_servers
            .iter()
            .filter_map(|value| value.parse::<ServerUrl>().ok())
            .any(|ignored| &ignored == url)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "cluster {} has no hosts configured",
                self.name
            )));
        }
        let urls = self.server_urls()?;
        if self.db_credentials().user.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "cluster {} has no database user configured",
                self.name
            )));
        }
        if self.replication_credentials().user.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "cluster {} has no replication user configured",
                self.name
            )));
        }
        if let Some(preferred) = self.preferred_master.as_deref() {
            let preferred: ServerUrl = preferred.parse().map_err(|source| ConfigError::Host {
                host: preferred.to_string(),
                source,
            })?;
            if !urls.contains(&preferred) {
                return Err(ConfigError::Invalid(format!(
                    "preferred master {preferred} is not in the host list"
                )));
            }
        }
        if self.max_fail == 0 {
            return Err(ConfigError::Invalid("max_fail must be at least 1".into()));
        }
        if self.monitoring_ticker.is_zero() {
            return Err(ConfigError::Invalid("monitoring_ticker must be positive".into()));
        }
        if self.arbitration.enabled && self.arbitration.secret.is_empty() {
            return Err(ConfigError::Invalid(
                "arbitration is enabled without a shared secret".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub clusters: Vec<ClusterConfig>,
}

impl MonitorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies `REPMAN_*` overrides to the first cluster, creating it when
    /// the file declared none.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        if self.clusters.is_empty() {
            self.clusters.push(ClusterConfig::default());
        }
        let cluster = &mut self.clusters[0];
        if let Some(hosts) = lookup("REPMAN_HOSTS") {
            cluster.hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(user) = lookup("REPMAN_USER") {
            cluster.db_credentials = user;
        }
        if let Some(user) = lookup("REPMAN_RPLUSER") {
            cluster.replication_credentials = user;
        }
        if let Some(preferred) = lookup("REPMAN_PREF_MASTER") {
            cluster.preferred_master = Some(preferred);
        }
        if let Some(mode) = lookup("REPMAN_FAILOVER_MODE") {
            cluster.failover_mode = match mode.to_ascii_lowercase().as_str() {
                "manual" => FailoverMode::Manual,
                "automatic" | "auto" => FailoverMode::Automatic,
                _ => {
                    return Err(ConfigError::Env {
                        name: "REPMAN_FAILOVER_MODE".into(),
                        value: mode,
                    })
                }
            };
        }
        if let Some(delay) = lookup("REPMAN_MAX_DELAY") {
            let secs = delay.parse().map_err(|_| ConfigError::Env {
                name: "REPMAN_MAX_DELAY".into(),
                value: delay.clone(),
            })?;
            cluster.max_delay = Duration::from_secs(secs);
        }
        if let Some(url) = lookup("REPMAN_ARBITRATION_URL") {
            cluster.arbitration.url = url;
            cluster.arbitration.enabled = true;
        }
        if let Some(secret) = lookup("REPMAN_ARBITRATION_SECRET") {
            cluster.arbitration.secret = secret;
        }
        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
