mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::test_config;
use fixtures::voters;
use fixtures::RaftRouter;

/// Cluster initialization test.
///
/// What does this test do?
///
/// - brings 3 nodes online, all booting with the same three-voter config.
/// - asserts that exactly one leader is elected and that all nodes agree on
///   it.
///
/// RUST_LOG=groupraft,memstore,initialization=trace cargo test -p groupraft --test initialization
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initialization() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(Arc::new(test_config()));
    for id in 1..=3 {
        router.new_raft_node(id, voters(&[1, 2, 3])).await;
    }

    let leader = router.wait_for_leader(Duration::from_secs(5), "initial election").await;
    for id in 1..=3 {
        router
            .wait_for_metrics(id, |m| m.current_leader == Some(leader), "all nodes observe the leader")
            .await;
    }

    let stable_leader = router.assert_stable_cluster().await;
    assert_eq!(stable_leader, leader);
    for metrics in router.latest_metrics().await {
        assert!(metrics.current_term >= 1, "expected a real election to have happened");
        assert!(!metrics.removed);
    }
    Ok(())
}
