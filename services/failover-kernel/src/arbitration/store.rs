use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{mysql::MySqlPoolOptions, Executor, MySql, Pool};
use tracing::{debug, info};

use super::{ArbitrationError, HeartbeatRecord, FRESHNESS_SECS};

/// Backing storage of the arbitrator.
#[async_trait]
pub trait ArbitrationStore: Send + Sync {
    /// Upserts the monitor's heartbeat. When every live monitor agrees on a
    /// single master, elected flags are cleared so a later failure can be
    /// arbitrated afresh.
    async fn write_heartbeat(&self, record: &HeartbeatRecord) -> Result<(), ArbitrationError>;
    /// Returns true when `record`'s monitor wins and is now the elected one.
    async fn request_arbitration(&self, record: &HeartbeatRecord)
        -> Result<bool, ArbitrationError>;
    async fn elected_master(
        &self,
        secret: &str,
        cluster: &str,
    ) -> Result<Option<String>, ArbitrationError>;
    async fn forget(&self, secret: &str) -> Result<(), ArbitrationError>;
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RowStatus {
    Undecided,
    Elected,
}

#[derive(Clone, Debug)]
struct HeartbeatRow {
    master: String,
    date: DateTime<Utc>,
    status: RowStatus,
    failed: u32,
}

/// (secret, cluster, uuid)
type RowKey = (String, String, String);

/// Process-local arbitration store.
pub struct MemoryArbitrationStore {
    rows: Mutex<HashMap<RowKey, HeartbeatRow>>,
    clock: Clock,
}

impl Default for MemoryArbitrationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryArbitrationStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl ArbitrationStore for MemoryArbitrationStore {
    async fn write_heartbeat(&self, record: &HeartbeatRecord) -> Result<(), ArbitrationError> {
        let now = (self.clock)();
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (record.secret.clone(), record.cluster.clone(), record.uuid.clone());
        let row = rows.entry(key).or_insert_with(|| HeartbeatRow {
            master: String::new(),
            date: now,
            status: RowStatus::Undecided,
            failed: 0,
        });
        row.master = record.master.clone();
        row.date = now;
        row.failed = record.failed;

        let fresh_after = now - Duration::seconds(FRESHNESS_SECS);
        let mut masters: Vec<&str> = rows
            .iter()
            .filter(|((secret, cluster, _), row)| {
                secret == &record.secret && cluster == &record.cluster && row.date > fresh_after
            })
            .map(|(_, row)| row.master.as_str())
            .collect();
        masters.sort_unstable();
        masters.dedup();
        if masters.len() == 1 {
            for ((secret, cluster, _), row) in rows.iter_mut() {
                if secret == &record.secret
                    && cluster == &record.cluster
                    && row.status == RowStatus::Elected
                {
                    row.status = RowStatus::Undecided;
                }
            }
        }
        Ok(())
    }

    async fn request_arbitration(
        &self,
        record: &HeartbeatRecord,
    ) -> Result<bool, ArbitrationError> {
        let now = (self.clock)();
        let fresh_after = now - Duration::seconds(FRESHNESS_SECS);
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let peers = || {
            rows.iter().filter(|((secret, cluster, uuid), _)| {
                secret == &record.secret && cluster == &record.cluster && uuid != &record.uuid
            })
        };
        if peers().any(|(_, row)| row.status == RowStatus::Elected) {
            return Ok(false);
        }
        if peers().any(|(_, row)| {
            row.status == RowStatus::Undecided && row.date > fresh_after && row.failed < record.failed
        }) {
            return Ok(false);
        }
        rows.insert(
            (record.secret.clone(), record.cluster.clone(), record.uuid.clone()),
            HeartbeatRow {
                master: record.master.clone(),
                date: now,
                status: RowStatus::Elected,
                failed: record.failed,
            },
        );
        Ok(true)
    }

    async fn elected_master(
        &self,
        secret: &str,
        cluster: &str,
    ) -> Result<Option<String>, ArbitrationError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .iter()
            .find(|((row_secret, row_cluster, _), row)| {
                row_secret == secret && row_cluster == cluster && row.status == RowStatus::Elected
            })
            .map(|(_, row)| row.master.clone()))
    }

    async fn forget(&self, secret: &str) -> Result<(), ArbitrationError> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(row_secret, _, _), _| row_secret != secret);
        Ok(())
    }
}

const ARBITRATION_LOCK: &str = "replication_manager_arbitration";

/// Arbitration store in `replication_manager_schema.heartbeat` on a MariaDB
/// backend, so several arbitrator processes can share one decision table.
#[derive(Clone)]
pub struct MySqlArbitrationStore {
    pool: Pool<MySql>,
}

impl MySqlArbitrationStore {
    pub async fn connect(database_url: &str) -> Result<Self, ArbitrationError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(
                std::env::var("REPMAN_ARBITRATOR_POOL_MAX")
                    .ok()
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(5),
            )
            .connect(database_url)
            .await?;
        info!("connected to mysql for arbitration store");
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), ArbitrationError> {
        self.pool
            .execute("CREATE DATABASE IF NOT EXISTS replication_manager_schema")
            .await?;
        self.pool
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS replication_manager_schema.heartbeat (
                    secret VARCHAR(64),
                    cluster VARCHAR(128),
                    uid BIGINT UNSIGNED,
                    uuid VARCHAR(128) NOT NULL,
                    master VARCHAR(128),
                    date TIMESTAMP NULL,
                    arbitration_date TIMESTAMP NULL,
                    status CHAR(1) DEFAULT 'U',
                    hosts INT DEFAULT 0,
                    failed INT DEFAULT 0,
                    PRIMARY KEY (secret, cluster, uuid)
                ) ENGINE=InnoDB
                "#,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ArbitrationStore for MySqlArbitrationStore {
    async fn write_heartbeat(&self, record: &HeartbeatRecord) -> Result<(), ArbitrationError> {
        sqlx::query(
            r#"
            INSERT INTO replication_manager_schema.heartbeat
                (secret, uuid, uid, master, date, cluster, hosts, failed)
            VALUES (?, ?, ?, ?, NOW(), ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                uid = VALUES(uid),
                master = VALUES(master),
                date = NOW(),
                hosts = VALUES(hosts),
                failed = VALUES(failed)
            "#,
        )
        .bind(&record.secret)
        .bind(&record.uuid)
        .bind(record.uid)
        .bind(&record.master)
        .bind(&record.cluster)
        .bind(record.hosts)
        .bind(record.failed)
        .execute(&self.pool)
        .await?;

        let masters: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT master) FROM replication_manager_schema.heartbeat \
             WHERE cluster = ? AND secret = ? AND date > NOW() - INTERVAL ? SECOND",
        )
        .bind(&record.cluster)
        .bind(&record.secret)
        .bind(FRESHNESS_SECS)
        .fetch_one(&self.pool)
        .await?;
        if masters == 1 {
            sqlx::query(
                "UPDATE replication_manager_schema.heartbeat SET status = 'U' \
                 WHERE status = 'E' AND cluster = ? AND secret = ?",
            )
            .bind(&record.cluster)
            .bind(&record.secret)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn request_arbitration(
        &self,
        record: &HeartbeatRecord,
    ) -> Result<bool, ArbitrationError> {
        // concurrent requests serialize on a named lock held by one session
        let mut conn = self.pool.acquire().await?;
        let locked: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, 5)")
            .bind(ARBITRATION_LOCK)
            .fetch_one(conn.as_mut())
            .await?;
        if locked != Some(1) {
            return Err(ArbitrationError::Store(
                "could not acquire arbitration lock".into(),
            ));
        }

        let outcome = async {
            let elected: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM replication_manager_schema.heartbeat \
                 WHERE cluster = ? AND secret = ? AND status = 'E' AND uuid <> ?",
            )
            .bind(&record.cluster)
            .bind(&record.secret)
            .bind(&record.uuid)
            .fetch_one(conn.as_mut())
            .await?;
            if elected > 0 {
                return Ok::<bool, sqlx::Error>(false);
            }
            let better: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM replication_manager_schema.heartbeat \
                 WHERE cluster = ? AND secret = ? AND status = 'U' AND uuid <> ? \
                 AND failed < ? AND date > NOW() - INTERVAL ? SECOND",
            )
            .bind(&record.cluster)
            .bind(&record.secret)
            .bind(&record.uuid)
            .bind(record.failed)
            .bind(FRESHNESS_SECS)
            .fetch_one(conn.as_mut())
            .await?;
            if better > 0 {
                return Ok(false);
            }
            sqlx::query(
                r#"
                INSERT INTO replication_manager_schema.heartbeat
                    (secret, uuid, uid, master, date, arbitration_date, cluster, hosts, failed, status)
                VALUES (?, ?, ?, ?, NOW(), NOW(), ?, ?, ?, 'E')
                ON DUPLICATE KEY UPDATE
                    uid = VALUES(uid),
                    master = VALUES(master),
                    date = NOW(),
                    arbitration_date = NOW(),
                    hosts = VALUES(hosts),
                    failed = VALUES(failed),
                    status = 'E'
                "#,
            )
            .bind(&record.secret)
            .bind(&record.uuid)
            .bind(record.uid)
            .bind(&record.master)
            .bind(&record.cluster)
            .bind(record.hosts)
            .bind(record.failed)
            .execute(conn.as_mut())
            .await?;
            Ok(true)
        }
        .await;

        if let Err(error) = sqlx::query("SELECT RELEASE_LOCK(?)")
            .bind(ARBITRATION_LOCK)
            .execute(conn.as_mut())
            .await
        {
            debug!(?error, "failed to release arbitration lock");
        }
        Ok(outcome?)
    }

    async fn elected_master(
        &self,
        secret: &str,
        cluster: &str,
    ) -> Result<Option<String>, ArbitrationError> {
        Ok(sqlx::query_scalar(
            "SELECT master FROM replication_manager_schema.heartbeat \
             WHERE cluster = ? AND secret = ? AND status = 'E' LIMIT 1",
        )
        .bind(cluster)
        .bind(secret)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn forget(&self, secret: &str) -> Result<(), ArbitrationError> {
        sqlx::query("DELETE FROM replication_manager_schema.heartbeat WHERE secret = ?")
            .bind(secret)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn record(uid: u64, master: &str, failed: u32) -> HeartbeatRecord {
        HeartbeatRecord {
            uuid: format!("monitor-{uid}"),
            secret: "s3cr3t".into(),
            cluster: "east".into(),
            master: master.into(),
            uid,
            hosts: 3,
            failed,
        }
    }

    fn manual_clock() -> (Clock, Arc<AtomicI64>) {
        let offset = Arc::new(AtomicI64::new(0));
        let base = Utc::now();
        let handle = offset.clone();
        let clock: Clock =
            Arc::new(move || base + Duration::seconds(handle.load(Ordering::SeqCst)));
        (clock, offset)
    }

    #[tokio::test]
    async fn first_requester_wins_and_others_lose() {
        let store = MemoryArbitrationStore::new();
        store.write_heartbeat(&record(1, "db1:3306", 1)).await.unwrap();
        store.write_heartbeat(&record(2, "db1:3306", 1)).await.unwrap();

        assert!(store.request_arbitration(&record(1, "db2:3306", 1)).await.unwrap());
        assert!(!store.request_arbitration(&record(2, "db3:3306", 1)).await.unwrap());
        assert!(store.request_arbitration(&record(1, "db2:3306", 1)).await.unwrap());
        assert_eq!(
            store.elected_master("s3cr3t", "east").await.unwrap().as_deref(),
            Some("db2:3306")
        );
    }

    #[tokio::test]
    async fn monitors_without_numeric_id_are_distinct() {
        let store = MemoryArbitrationStore::new();
        let mut left = record(0, "db2:3306", 1);
        let mut right = record(0, "db3:3306", 1);
        left.uuid = "monitor-a".into();
        right.uuid = "monitor-b".into();

        assert!(store.request_arbitration(&left).await.unwrap());
        assert!(!store.request_arbitration(&right).await.unwrap());
    }

    #[tokio::test]
    async fn monitor_seeing_fewer_failures_takes_precedence() {
        let store = MemoryArbitrationStore::new();
        store.write_heartbeat(&record(2, "db1:3306", 0)).await.unwrap();
        assert!(!store.request_arbitration(&record(1, "db2:3306", 1)).await.unwrap());
    }

    #[tokio::test]
    async fn stale_peers_do_not_block_arbitration() {
        let (clock, offset) = manual_clock();
        let store = MemoryArbitrationStore::with_clock(clock);
        store.write_heartbeat(&record(2, "db1:3306", 0)).await.unwrap();
        offset.store(FRESHNESS_SECS + 5, Ordering::SeqCst);
        assert!(store.request_arbitration(&record(1, "db2:3306", 1)).await.unwrap());
    }

    #[tokio::test]
    async fn agreeing_heartbeats_clear_the_elected_flag() {
        let (clock, offset) = manual_clock();
        let store = MemoryArbitrationStore::with_clock(clock);
        assert!(store.request_arbitration(&record(1, "db2:3306", 1)).await.unwrap());
        assert!(!store.request_arbitration(&record(2, "db1:3306", 1)).await.unwrap());

        // monitor 2 still claims the old master: no agreement yet
        store.write_heartbeat(&record(2, "db1:3306", 1)).await.unwrap();
        assert!(store.elected_master("s3cr3t", "east").await.unwrap().is_some());

        offset.store(1, Ordering::SeqCst);
        store.write_heartbeat(&record(1, "db2:3306", 0)).await.unwrap();
        store.write_heartbeat(&record(2, "db2:3306", 0)).await.unwrap();
        assert!(store.elected_master("s3cr3t", "east").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn forget_drops_rows_for_secret() {
        let store = MemoryArbitrationStore::new();
        assert!(store.request_arbitration(&record(1, "db2:3306", 0)).await.unwrap());
        store.forget("s3cr3t").await.unwrap();
        assert!(store.elected_master("s3cr3t", "east").await.unwrap().is_none());
        assert!(store.request_arbitration(&record(2, "db3:3306", 0)).await.unwrap());
    }

    #[tokio::test]
    async fn mysql_store_grants_single_winner() {
        let Ok(url) = std::env::var("TEST_MYSQL_URL") else {
            eprintln!("[arbitration-tests] skipping - TEST_MYSQL_URL not configured");
            return;
        };
        let store = MySqlArbitrationStore::connect(&url)
            .await
            .expect("connect arbitration store");
        let secret = format!("test-{}", uuid::Uuid::new_v4());
        let mut first = record(1, "db2:3306", 0);
        let mut second = record(2, "db3:3306", 0);
        first.secret = secret.clone();
        second.secret = secret.clone();

        assert!(store.request_arbitration(&first).await.expect("first request"));
        assert!(!store.request_arbitration(&second).await.expect("second request"));
        store.forget(&secret).await.expect("forget");
    }
}
