use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use sqlx::{
    mysql::{MySqlConnectOptions, MySqlDatabaseError, MySqlPoolOptions, MySqlRow},
    pool::PoolConnection,
    ColumnIndex, Executor, MySql, Pool, Row,
};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    AdminConnector, AdminError, ChangeSourceOptions, DbAdmin, FlushMode, MasterStatus,
    Privileges, ReplicationStatus, WaitOutcome,
};
use crate::{gtid::GtidList, server::ServerUrl};

const ER_ACCESS_DENIED: u16 = 1045;
const ER_SPECIFIC_ACCESS_DENIED: u16 = 1227;
const ER_DBACCESS_DENIED: u16 = 1044;

/// Opens lazily-connected sqlx pools against MariaDB/MySQL nodes.
#[derive(Clone, Debug)]
pub struct MySqlConnector {
    user: String,
    password: String,
    connect_timeout: Duration,
}

impl MySqlConnector {
    pub fn new(user: impl Into<String>, password: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl AdminConnector for MySqlConnector {
    async fn connect(&self, url: &ServerUrl) -> Result<Arc<dyn DbAdmin>, AdminError> {
        let options = MySqlConnectOptions::new()
            .host(&url.host)
            .port(url.port)
            .username(&self.user)
            .password(&self.password);
        let pool = MySqlPoolOptions::new()
            .max_connections(3)
            .acquire_timeout(self.connect_timeout)
            .connect_lazy_with(options);
        debug!(server = %url, "opened lazy admin pool");
        Ok(Arc::new(MySqlAdmin {
            server: url.to_string(),
            user: self.user.clone(),
            pool,
            timeout: self.connect_timeout,
            held_lock: Mutex::new(None),
        }))
    }
}

/// Client sessions a switchover freeze kills: everything except replication
/// dump threads, server threads and the monitor's own account.
const CLIENT_THREADS: &str = "SELECT Id FROM information_schema.PROCESSLIST \
     WHERE Command != 'Binlog Dump' AND User != 'system user' AND User <> ? AND Id != CONNECTION_ID()";

/// [`DbAdmin`] over a small sqlx pool. `FLUSH TABLES WITH READ LOCK` is
/// taken on a dedicated pooled connection that is kept out of the pool until
/// `UNLOCK TABLES`, since the lock lives and dies with its session.
pub struct MySqlAdmin {
    server: String,
    /// Account the monitor logs in with; its sessions survive a freeze.
    user: String,
    pool: Pool<MySql>,
    timeout: Duration,
    held_lock: Mutex<Option<PoolConnection<MySql>>>,
}

impl MySqlAdmin {
    fn error(&self, statement: &str, error: sqlx::Error) -> AdminError {
        map_error(&self.server, statement, error)
    }

    async fn execute(&self, statement: &str) -> Result<(), AdminError> {
        self.pool
            .execute(statement)
            .await
            .map(|_| ())
            .map_err(|error| self.error(statement, error))
    }

    async fn fetch_all(&self, statement: &str) -> Result<Vec<MySqlRow>, AdminError> {
        self.pool
            .fetch_all(statement)
            .await
            .map_err(|error| self.error(statement, error))
    }

    async fn name_value_map(&self, statement: &str) -> Result<HashMap<String, String>, AdminError> {
        let rows = self.fetch_all(statement).await?;
        let mut values = HashMap::with_capacity(rows.len());
        for row in rows {
            if let Some(name) = column_text(&row, 0usize) {
                values.insert(name.to_ascii_uppercase(), column_text(&row, 1usize).unwrap_or_default());
            }
        }
        Ok(values)
    }
}

#[async_trait]
impl DbAdmin for MySqlAdmin {
    async fn ping(&self) -> Result<(), AdminError> {
        match tokio::time::timeout(self.timeout, self.execute("SELECT 1")).await {
            Ok(result) => result,
            Err(_) => Err(AdminError::Timeout {
                server: self.server.clone(),
                elapsed: self.timeout,
            }),
        }
    }

    async fn replication_status(&self) -> Result<Option<ReplicationStatus>, AdminError> {
        let rows = self.fetch_all("SHOW SLAVE STATUS").await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let text = |name: &str| column_text(row, name).unwrap_or_default();
        let number = |name: &str| text(name).parse::<u64>().unwrap_or(0);
        Ok(Some(ReplicationStatus {
            master_host: text("Master_Host"),
            master_port: text("Master_Port").parse().unwrap_or(3306),
            master_server_id: number("Master_Server_Id"),
            io_running: text("Slave_IO_Running").eq_ignore_ascii_case("Yes"),
            sql_running: text("Slave_SQL_Running").eq_ignore_ascii_case("Yes"),
            seconds_behind_master: column_text(row, "Seconds_Behind_Master")
                .and_then(|value| value.parse().ok()),
            using_gtid: text("Using_Gtid"),
            gtid_io_pos: GtidList::parse_lossy(&text("Gtid_IO_Pos")),
            master_log_file: text("Master_Log_File"),
            read_master_log_pos: number("Read_Master_Log_Pos"),
            relay_master_log_file: text("Relay_Master_Log_File"),
            exec_master_log_pos: number("Exec_Master_Log_Pos"),
            last_io_errno: number("Last_IO_Errno") as u32,
            last_io_error: text("Last_IO_Error"),
            last_sql_errno: number("Last_SQL_Errno") as u32,
            last_sql_error: text("Last_SQL_Error"),
        }))
    }

    async fn variables(&self) -> Result<HashMap<String, String>, AdminError> {
        self.name_value_map("SHOW GLOBAL VARIABLES").await
    }

    async fn status(&self) -> Result<HashMap<String, String>, AdminError> {
        self.name_value_map("SHOW GLOBAL STATUS").await
    }

    async fn master_status(&self) -> Result<Option<MasterStatus>, AdminError> {
        let rows = self.fetch_all("SHOW MASTER STATUS").await?;
        Ok(rows.first().map(|row| MasterStatus {
            file: column_text(row, "File").unwrap_or_default(),
            position: column_text(row, "Position")
                .and_then(|value| value.parse().ok())
                .unwrap_or(0),
            binlog_do_db: column_text(row, "Binlog_Do_DB").unwrap_or_default(),
            binlog_ignore_db: column_text(row, "Binlog_Ignore_DB").unwrap_or_default(),
        }))
    }

    async fn privileges(&self, user: &str, host: &str) -> Result<Privileges, AdminError> {
        let statement = "SELECT MAX(Super_priv) AS super_priv, MAX(Reload_priv) AS reload_priv, \
             MAX(Repl_client_priv) AS repl_client_priv, MAX(Repl_slave_priv) AS repl_slave_priv \
             FROM mysql.user WHERE user = ? AND host IN (?, '%')";
        let row = sqlx::query(statement)
            .bind(user)
            .bind(host)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| self.error(statement, error))?;
        let granted = |name: &str| column_text(&row, name).as_deref() == Some("Y");
        Ok(Privileges {
            super_priv: granted("super_priv"),
            reload_priv: granted("reload_priv"),
            repl_client_priv: granted("repl_client_priv"),
            repl_slave_priv: granted("repl_slave_priv"),
        })
    }

    async fn binlog_dump_count(&self) -> Result<u64, AdminError> {
        let statement =
            "SELECT COUNT(*) FROM information_schema.PROCESSLIST WHERE COMMAND = 'Binlog Dump'";
        let count: i64 = sqlx::query_scalar(statement)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| self.error(statement, error))?;
        Ok(count.max(0) as u64)
    }

    async fn stop_replica(&self) -> Result<(), AdminError> {
        self.execute("STOP SLAVE").await
    }

    async fn start_replica(&self) -> Result<(), AdminError> {
        self.execute("START SLAVE").await
    }

    async fn reset_replica(&self, all: bool) -> Result<(), AdminError> {
        self.execute(if all { "RESET SLAVE ALL" } else { "RESET SLAVE" })
            .await
    }

    async fn change_replication_source(
        &self,
        options: &ChangeSourceOptions,
    ) -> Result<(), AdminError> {
        self.execute(&change_master_statement(options)).await
    }

    async fn set_read_only(&self, read_only: bool) -> Result<(), AdminError> {
        self.execute(if read_only {
            "SET GLOBAL read_only=1"
        } else {
            "SET GLOBAL read_only=0"
        })
        .await
    }

    async fn flush_tables(&self, mode: FlushMode) -> Result<(), AdminError> {
        match mode {
            FlushMode::NoLog => self.execute("FLUSH NO_WRITE_TO_BINLOG TABLES").await,
            FlushMode::Plain => self.execute("FLUSH TABLES").await,
            FlushMode::WithReadLock => {
                let statement = "FLUSH TABLES WITH READ LOCK";
                let mut held = self.held_lock.lock().await;
                if held.is_some() {
                    return Ok(());
                }
                let mut conn = self
                    .pool
                    .acquire()
                    .await
                    .map_err(|error| self.error(statement, error))?;
                conn.as_mut()
                    .execute(statement)
                    .await
                    .map_err(|error| self.error(statement, error))?;
                *held = Some(conn);
                Ok(())
            }
        }
    }

    async fn unlock_tables(&self) -> Result<(), AdminError> {
        let statement = "UNLOCK TABLES";
        let held = self.held_lock.lock().await.take();
        match held {
            Some(mut conn) => conn
                .as_mut()
                .execute(statement)
                .await
                .map(|_| ())
                .map_err(|error| self.error(statement, error)),
            None => self.execute(statement).await,
        }
    }

    async fn kill_client_threads(&self) -> Result<u64, AdminError> {
        let statement = CLIENT_THREADS;
        let ids: Vec<u64> = sqlx::query_scalar(statement)
            .bind(&self.user)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| self.error(statement, error))?;
        let mut killed = 0;
        for id in ids {
            // threads may exit between the scan and the kill
            if self.execute(&format!("KILL {id}")).await.is_ok() {
                killed += 1;
            }
        }
        Ok(killed)
    }

    async fn wait_for_position(
        &self,
        position: &GtidList,
        timeout: Duration,
    ) -> Result<WaitOutcome, AdminError> {
        let statement = "SELECT MASTER_GTID_WAIT(?, ?)";
        let query = sqlx::query(statement)
            .bind(position.to_string())
            .bind(timeout.as_secs_f64())
            .fetch_one(&self.pool);
        let row = match tokio::time::timeout(timeout + self.timeout, query).await {
            Ok(result) => result.map_err(|error| self.error(statement, error))?,
            Err(_) => {
                return Err(AdminError::Timeout {
                    server: self.server.clone(),
                    elapsed: timeout + self.timeout,
                })
            }
        };
        let code = column_text(&row, 0usize)
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(-1);
        Ok(if code == 0 {
            WaitOutcome::Reached
        } else {
            WaitOutcome::TimedOut
        })
    }

    async fn check_long_running_writes(&self, threshold: Duration) -> Result<u64, AdminError> {
        let statement = "SELECT COUNT(*) FROM information_schema.PROCESSLIST \
             WHERE COMMAND = 'Query' AND TIME >= ? AND INFO NOT LIKE 'select%'";
        let count: i64 = sqlx::query_scalar(statement)
            .bind(threshold.as_secs() as i64)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| self.error(statement, error))?;
        Ok(count.max(0) as u64)
    }

    async fn set_max_connections(&self, value: u64) -> Result<(), AdminError> {
        self.execute(&format!("SET GLOBAL max_connections={value}"))
            .await
    }

    async fn set_gtid_slave_pos(&self, position: &GtidList) -> Result<(), AdminError> {
        self.execute(&format!(
            "SET GLOBAL gtid_slave_pos={}",
            quote_literal(&position.to_string())
        ))
        .await
    }
}

pub(crate) fn change_master_statement(options: &ChangeSourceOptions) -> String {
    let mut statement = format!(
        "CHANGE MASTER TO master_host={}, master_port={}, master_user={}, master_password={}, master_connect_retry={}",
        quote_literal(&options.host),
        options.port,
        quote_literal(&options.user),
        quote_literal(&options.password),
        options.connect_retry.as_secs().max(1),
    );
    if let Some(mode) = options.mode {
        statement.push_str(", master_use_gtid=");
        statement.push_str(mode.as_sql());
    }
    statement
}

fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => quoted.push_str("\\'"),
            '\\' => quoted.push_str("\\\\"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('\'');
    quoted
}

/// Reads a column as text whatever its wire type; SHOW statements mix
/// strings and unsigned integers freely.
fn column_text<I>(row: &MySqlRow, index: I) -> Option<String>
where
    I: ColumnIndex<MySqlRow> + Copy,
{
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value;
    }
    if let Ok(value) = row.try_get::<Option<u64>, _>(index) {
        return value.map(|value| value.to_string());
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(|value| value.to_string());
    }
    row.try_get::<Option<Vec<u8>>, _>(index)
        .ok()
        .flatten()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn map_error(server: &str, statement: &str, error: sqlx::Error) -> AdminError {
    match &error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => AdminError::Connectivity {
            server: server.to_string(),
            reason: error.to_string(),
        },
        sqlx::Error::Database(database) => {
            let number = database
                .try_downcast_ref::<MySqlDatabaseError>()
                .map(MySqlDatabaseError::number);
            match number {
                Some(ER_ACCESS_DENIED | ER_SPECIFIC_ACCESS_DENIED | ER_DBACCESS_DENIED) => {
                    AdminError::AccessDenied {
                        server: server.to_string(),
                        reason: database.message().to_string(),
                    }
                }
                _ => AdminError::Query {
                    server: server.to_string(),
                    statement: statement.to_string(),
                    reason: database.message().to_string(),
                },
            }
        }
        _ => AdminError::Query {
            server: server.to_string(),
            statement: statement.to_string(),
            reason: error.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::GtidMode;

    #[test]
    fn change_master_escapes_credentials() {
        let statement = change_master_statement(&ChangeSourceOptions {
            host: "db2".into(),
            port: 3307,
            user: "repl".into(),
            password: "it's\\secret".into(),
            connect_retry: Duration::from_secs(10),
            mode: Some(GtidMode::SlavePos),
        });
        assert_eq!(
            statement,
            "CHANGE MASTER TO master_host='db2', master_port=3307, master_user='repl', \
             master_password='it\\'s\\\\secret', master_connect_retry=10, master_use_gtid=slave_pos"
        );
    }

    #[test]
    fn change_master_keeps_existing_mode_when_unset() {
        let statement = change_master_statement(&ChangeSourceOptions {
            host: "db2".into(),
            port: 3306,
            user: "repl".into(),
            password: "pw".into(),
            connect_retry: Duration::from_secs(0),
            mode: None,
        });
        assert!(statement.ends_with("master_connect_retry=1"));
        assert!(!statement.contains("master_use_gtid"));
    }

    #[test]
    fn pool_failures_are_connectivity_errors() {
        let error = map_error("db1:3306", "SELECT 1", sqlx::Error::PoolTimedOut);
        assert!(error.is_connectivity());
    }

    #[test]
    fn freeze_spares_monitor_sessions() {
        assert!(CLIENT_THREADS.contains("User <> ?"));
        assert!(CLIENT_THREADS.contains("Id != CONNECTION_ID()"));
        assert!(CLIENT_THREADS.contains("Command != 'Binlog Dump'"));
    }

    #[tokio::test]
    async fn killing_clients_keeps_monitor_pool_alive() {
        let Ok(url) = std::env::var("TEST_MYSQL_URL") else {
            eprintln!("[admin-tests] skipping - TEST_MYSQL_URL not configured");
            return;
        };
        let Ok(options) = url.parse::<MySqlConnectOptions>() else {
            eprintln!("[admin-tests] skipping - TEST_MYSQL_URL is not a mysql url");
            return;
        };
        let admin = MySqlAdmin {
            server: url.clone(),
            user: options.get_username().to_string(),
            pool: MySqlPoolOptions::new()
                .min_connections(2)
                .max_connections(2)
                .acquire_timeout(Duration::from_secs(5))
                .connect_lazy_with(options),
            timeout: Duration::from_secs(5),
            held_lock: Mutex::new(None),
        };
        admin.ping().await.expect("ping");
        admin.kill_client_threads().await.expect("kill");
        for _ in 0..2 {
            admin.ping().await.expect("pool survived");
        }
    }

    #[tokio::test]
    async fn reads_variables_from_live_server() {
        let Ok(url) = std::env::var("TEST_MYSQL_URL") else {
            eprintln!("[admin-tests] skipping - TEST_MYSQL_URL not configured");
            return;
        };
        let Ok(options) = url.parse::<MySqlConnectOptions>() else {
            eprintln!("[admin-tests] skipping - TEST_MYSQL_URL is not a mysql url");
            return;
        };
        let admin = MySqlAdmin {
            server: url.clone(),
            user: options.get_username().to_string(),
            pool: MySqlPoolOptions::new()
                .max_connections(2)
                .acquire_timeout(Duration::from_secs(5))
                .connect_lazy_with(options),
            timeout: Duration::from_secs(5),
            held_lock: Mutex::new(None),
        };
        admin.ping().await.expect("ping");
        let variables = admin.variables().await.expect("variables");
        assert!(variables.contains_key("SERVER_ID"));
        assert!(admin.replication_status().await.is_ok());
    }
}
