use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use failover_kernel::arbitration::{
    router, Arbitrator, HeartbeatRecord, HttpArbitrator, MemoryArbitrationStore, Verdict,
};
use serde_json::json;
use tokio::net::TcpListener;

async fn spawn_arbitrator() -> Result<String> {
    let app = router(Arc::new(MemoryArbitrationStore::new()));
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    Ok(format!("http://{addr}"))
}

fn record(uid: u64, master: &str) -> HeartbeatRecord {
    HeartbeatRecord {
        uuid: format!("monitor-{uid}"),
        secret: "s3cr3t".into(),
        cluster: "east".into(),
        master: master.into(),
        uid,
        hosts: 3,
        failed: 1,
    }
}

#[tokio::test]
async fn elected_flag_clears_once_monitors_agree() -> Result<()> {
    let base = spawn_arbitrator().await?;
    let left = HttpArbitrator::new(base.clone(), Duration::from_secs(2))?;
    let right = HttpArbitrator::new(base, Duration::from_secs(2))?;

    left.heartbeat(&record(1, "db1:3306")).await?;
    right.heartbeat(&record(2, "db1:3306")).await?;

    let won = left.arbitrate(&record(1, "db2:3306")).await?;
    assert_eq!(won.arbitration, Verdict::Winner);
    let lost = right.arbitrate(&record(2, "db3:3306")).await?;
    assert_eq!(lost.arbitration, Verdict::Loser);
    assert_eq!(lost.master, "db2:3306");

    // both monitors now report the promoted master
    left.heartbeat(&record(1, "db2:3306")).await?;
    right.heartbeat(&record(2, "db2:3306")).await?;

    let next = right.arbitrate(&record(2, "db3:3306")).await?;
    assert_eq!(next.arbitration, Verdict::Winner);
    Ok(())
}

#[tokio::test]
async fn forget_releases_a_secret() -> Result<()> {
    let base = spawn_arbitrator().await?;
    let monitor = HttpArbitrator::new(base.clone(), Duration::from_secs(2))?;
    let other = HttpArbitrator::new(base.clone(), Duration::from_secs(2))?;

    assert_eq!(
        monitor.arbitrate(&record(1, "db2:3306")).await?.arbitration,
        Verdict::Winner
    );
    assert_eq!(
        other.arbitrate(&record(2, "db2:3306")).await?.arbitration,
        Verdict::Loser
    );

    let status = reqwest::Client::new()
        .post(format!("{base}/forget"))
        .json(&json!({ "secret": "s3cr3t" }))
        .send()
        .await?
        .status();
    assert!(status.is_success());

    assert_eq!(
        other.arbitrate(&record(2, "db2:3306")).await?.arbitration,
        Verdict::Winner
    );
    Ok(())
}

#[tokio::test]
async fn malformed_requests_are_rejected() -> Result<()> {
    let base = spawn_arbitrator().await?;
    let status = reqwest::Client::new()
        .post(format!("{base}/abritrator/"))
        .header("content-type", "application/json")
        .body("{\"uuid\":")
        .send()
        .await?
        .status();
    assert_eq!(status.as_u16(), 422);
    Ok(())
}
