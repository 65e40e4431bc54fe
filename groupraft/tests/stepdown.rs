mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::test_config;
use fixtures::voters;
use fixtures::RaftRouter;
use groupraft::RaftError;
use groupraft::State;

/// Leader step-down on self-removal test.
///
/// What does this test do?
///
/// - brings a three-voter cluster online and removes the leader itself.
/// - asserts that once the removal commits, the old leader becomes a
///   follower with `removed` set, rejects client traffic with `NotLeader`,
///   and the remaining voters elect a new leader that still serves writes.
///
/// RUST_LOG=groupraft,memstore,stepdown=trace cargo test -p groupraft --test stepdown
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stepdown() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(Arc::new(test_config()));
    for id in 1..=3 {
        router.new_raft_node(id, voters(&[1, 2, 3])).await;
    }
    let old_leader = router.wait_for_leader(Duration::from_secs(5), "initial election").await;
    router.client_write(old_leader, b"a").await?;

    router.raft(old_leader).await.remove(old_leader).await?;

    let metrics = router
        .wait_for_metrics(
            old_leader,
            |m| m.removed && m.state != State::Leader,
            "old leader steps down",
        )
        .await;
    assert!(!metrics.configuration.contains(old_leader));

    // Client traffic at the old leader is now rejected.
    let res = router.client_write(old_leader, b"rejected").await;
    match res {
        Err(RaftError::NotLeader { .. }) => {}
        other => panic!("expected NotLeader, got {:?}", other.map(|r| r.index)),
    }

    // The surviving pair elects a new leader and keeps serving writes.
    let new_leader = router.wait_for_leader(Duration::from_secs(5), "election after step-down").await;
    assert_ne!(new_leader, old_leader);
    router.client_write(new_leader, b"b").await?;
    Ok(())
}
