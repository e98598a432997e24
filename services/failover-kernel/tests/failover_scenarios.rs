use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use failover_kernel::{
    arbitration::{router, ArbitrationStore, HttpArbitrator, MemoryArbitrationStore},
    config::{ClusterConfig, FailoverMode},
    failover::master_failover,
    test_support::{url, RecordingLogTools, SimulatedFleet},
    topology::discover,
    Cluster, ClusterMonitor, ServerState,
};
use tokio::net::TcpListener;

fn cluster(fleet: &SimulatedFleet, configure: impl FnOnce(&mut ClusterConfig)) -> Cluster {
    let mut config = fleet.cluster_config("east");
    configure(&mut config);
    Cluster::new(
        config,
        fleet.connector(),
        Arc::new(RecordingLogTools::default()),
    )
    .expect("cluster")
}

fn writable(fleet: &SimulatedFleet) -> Vec<String> {
    (1..=3)
        .map(url)
        .filter(|server| {
            fleet
                .node(server)
                .is_some_and(|node| node.alive && !node.read_only)
        })
        .map(|server| server.to_string())
        .collect()
}

async fn spawn_arbitrator(store: Arc<MemoryArbitrationStore>) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(store).into_make_service()).await;
    });
    Ok(format!("http://{addr}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_monitors_promote_only_once() -> Result<()> {
    let fleet = SimulatedFleet::standard(3);
    let store = Arc::new(MemoryArbitrationStore::new());
    let base = spawn_arbitrator(store.clone()).await?;

    let guarded = |uid: u64| -> Result<ClusterMonitor> {
        let arbitrator = HttpArbitrator::new(base.clone(), Duration::from_secs(2))?;
        let cluster = cluster(&fleet, |config| {
            config.failover_mode = FailoverMode::Automatic;
            config.arbitration.enabled = true;
            config.arbitration.url = base.clone();
            config.arbitration.secret = "s3cr3t".into();
            config.arbitration.unique_id = Some(uid);
        })
        .with_arbitrator(Arc::new(arbitrator));
        Ok(ClusterMonitor::new(cluster))
    };
    let mut first = guarded(1)?;
    let mut second = guarded(2)?;

    first.tick().await;
    second.tick().await;
    fleet.kill(&url(1));

    for _ in 0..2 {
        first.tick().await;
        second.tick().await;
    }
    let promotions = first.cluster().snapshot().failover_count
        + second.cluster().snapshot().failover_count;
    assert_eq!(promotions, 1);
    assert_eq!(writable(&fleet), vec![url(2).to_string()]);
    assert_eq!(
        fleet.node(&url(3)).expect("db3").link.expect("linked").master,
        url(2)
    );

    // the monitor that stood down follows the promoted master
    first.tick().await;
    second.tick().await;
    assert_eq!(first.cluster().snapshot().master, Some(url(2)));
    assert_eq!(second.cluster().snapshot().master, Some(url(2)));
    assert_eq!(
        fleet.node(&url(3)).expect("db3").link.expect("linked").master,
        url(2)
    );
    assert_eq!(store.elected_master("s3cr3t", "east").await?, None);
    Ok(())
}

#[tokio::test]
async fn switchover_round_trip_restores_original_master() {
    let fleet = SimulatedFleet::standard(3);
    let mut cluster = cluster(&fleet, |_| {});
    discover(&mut cluster).await.expect("discover");

    let there = master_failover(&mut cluster, false).await.expect("first switchover");
    assert_eq!(there.new_master, url(2));
    let back = master_failover(&mut cluster, false).await.expect("second switchover");
    assert_eq!(back.old_master, url(2));
    assert_eq!(back.new_master, url(1));

    assert_eq!(writable(&fleet), vec![url(1).to_string()]);
    for replica in [url(2), url(3)] {
        let node = fleet.node(&replica).expect("replica");
        assert!(node.read_only);
        assert_eq!(node.link.expect("linked").master, url(1));
    }
    assert_eq!(cluster.snapshot().failover_count, 0);
}

#[tokio::test]
async fn operator_requests_are_served_one_at_a_time() {
    let fleet = SimulatedFleet::standard(3);
    let monitor = ClusterMonitor::new(cluster(&fleet, |config| {
        config.monitoring_ticker = Duration::from_millis(20);
    }));
    let (handle, task) = monitor.spawn();
    handle.discover().await.expect("discover");

    let (first, second) = tokio::join!(handle.switchover(), handle.switchover());
    let first = first.expect("first switchover");
    let second = second.expect("second switchover");
    assert_ne!(first.new_master, second.new_master);
    assert_eq!(writable(&fleet).len(), 1);

    handle.shutdown();
    task.await.expect("monitor task");
}

#[tokio::test]
async fn dead_master_comes_back_as_replica() {
    let fleet = SimulatedFleet::standard(3);
    let mut monitor = ClusterMonitor::new(cluster(&fleet, |config| {
        config.failover_mode = FailoverMode::Automatic;
    }));
    monitor.tick().await;
    fleet.kill(&url(1));
    for _ in 0..2 {
        monitor.tick().await;
    }
    assert_eq!(monitor.cluster().snapshot().master, Some(url(2)));
    assert_eq!(monitor.cluster().crashes().len(), 1);

    fleet.revive(&url(1));
    for _ in 0..2 {
        monitor.tick().await;
    }
    let snapshot = monitor.cluster().snapshot();
    assert_eq!(
        snapshot.server(&url(1)).map(|server| server.state),
        Some(ServerState::Slave)
    );
    let old = fleet.node(&url(1)).expect("db1");
    assert!(old.read_only);
    assert_eq!(old.link.expect("rejoined").master, url(2));
    assert_eq!(writable(&fleet), vec![url(2).to_string()]);
}
