mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::test_config;
use fixtures::voters;
use fixtures::RaftRouter;
use groupraft::State;

/// Pre-vote partition test.
///
/// What does this test do?
///
/// - brings a four-voter cluster online and partitions server 4 away.
/// - lets 4 run through several election timeouts: its pre-vote probes go
///   nowhere and, crucially, never bump its own or anybody else's term.
/// - asserts the original leader and every term are undisturbed, and that 4
///   slots back in as a follower once the partition heals.
///
/// RUST_LOG=groupraft,memstore,pre_vote=trace cargo test -p groupraft --test pre_vote
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pre_vote_ignores_partitioned_disruptor() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(Arc::new(test_config()));
    for id in 1..=4 {
        router.new_raft_node(id, voters(&[1, 2, 3, 4])).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(5), "initial election").await;
    router.client_write(leader, b"a").await?;
    router.wait_for_applied(&[1, 2, 3, 4], 1, "initial write").await;

    let terms_before: Vec<(u64, u64)> = router.latest_metrics().await.iter().map(|m| (m.id, m.current_term)).collect();

    router.isolate_node(4).await;
    // Several election timeouts worth of time for 4 to campaign into the
    // void.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // The disruptor is stuck in its pre-vote phase with its term unchanged.
    let disruptor = router.raft(4).await.metrics().borrow().clone();
    assert_eq!(disruptor.state, State::Candidate);
    let old_term = terms_before.iter().find(|(id, _)| *id == 4).map(|(_, term)| *term).expect("term of node 4");
    assert_eq!(disruptor.current_term, old_term, "pre-vote must not bump the candidate's term");

    // The rest of the cluster never noticed.
    assert_eq!(router.leader().await, Some(leader));
    for metrics in router.latest_metrics().await {
        if metrics.id == 4 {
            continue;
        }
        let before = terms_before.iter().find(|(id, _)| *id == metrics.id).map(|(_, term)| *term);
        assert_eq!(Some(metrics.current_term), before, "term of node {} moved", metrics.id);
    }

    // Once healed, the old leader's heartbeats bring 4 straight back.
    router.restore_node(4).await;
    router
        .wait_for_metrics(4, |m| m.state == State::Follower, "disruptor rejoins as follower")
        .await;
    assert_eq!(router.leader().await, Some(leader));
    router.client_write(leader, b"b").await?;
    router.wait_for_applied(&[1, 2, 3, 4], 2, "write after heal").await;
    Ok(())
}
