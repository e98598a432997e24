use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use super::{ArbitrationError, ArbitrationResponse, Arbitrator, HeartbeatRecord};

/// Talks to a remote arbitrator over HTTP.
#[derive(Clone)]
pub struct HttpArbitrator {
    client: reqwest::Client,
    base: String,
}

impl HttpArbitrator {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, ArbitrationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ArbitrationError::Transport(error.to_string()))?;
        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post(
        &self,
        path: &str,
        record: &HeartbeatRecord,
    ) -> Result<(StatusCode, String), ArbitrationError> {
        let url = format!("{}/{path}/", self.base);
        debug!(%url, cluster = %record.cluster, "posting to arbitrator");
        let response = self
            .client
            .post(&url)
            .json(record)
            .send()
            .await
            .map_err(|error| ArbitrationError::Transport(error.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| ArbitrationError::Transport(error.to_string()))?;
        Ok((status, body))
    }
}

#[async_trait]
impl Arbitrator for HttpArbitrator {
    async fn heartbeat(&self, record: &HeartbeatRecord) -> Result<(), ArbitrationError> {
        let (status, body) = self.post("heartbeat", record).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(ArbitrationError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn arbitrate(
        &self,
        record: &HeartbeatRecord,
    ) -> Result<ArbitrationResponse, ArbitrationError> {
        let (status, body) = self.post("abritrator", record).await?;
        if !status.is_success() {
            return Err(ArbitrationError::Status {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|error| ArbitrationError::Decode(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::{router, MemoryArbitrationStore, Verdict};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn spawn_arbitrator() -> String {
        let app = router(Arc::new(MemoryArbitrationStore::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        format!("http://{addr}")
    }

    fn record(uid: u64) -> HeartbeatRecord {
        HeartbeatRecord {
            uuid: format!("monitor-{uid}"),
            secret: "s3cr3t".into(),
            cluster: "east".into(),
            master: "db2:3306".into(),
            uid,
            hosts: 3,
            failed: 1,
        }
    }

    #[tokio::test]
    async fn round_trips_with_arbitrator_service() {
        let base = spawn_arbitrator().await;
        let client = HttpArbitrator::new(base, Duration::from_secs(2)).expect("client");

        client.heartbeat(&record(1)).await.expect("heartbeat");
        let first = client.arbitrate(&record(1)).await.expect("first");
        assert_eq!(first.arbitration, Verdict::Winner);
        assert_eq!(first.master, "db2:3306");

        let second = client.arbitrate(&record(2)).await.expect("second");
        assert_eq!(second.arbitration, Verdict::Loser);
    }

    #[tokio::test]
    async fn unreachable_arbitrator_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let client =
            HttpArbitrator::new(format!("http://{addr}"), Duration::from_millis(500)).expect("client");
        let error = client.arbitrate(&record(1)).await.expect_err("nothing listening");
        assert!(matches!(error, ArbitrationError::Transport(_)));
    }
}
