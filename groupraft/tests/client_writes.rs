mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::test_config;
use fixtures::voters;
use fixtures::RaftRouter;

/// Three-voter replication test.
///
/// What does this test do?
///
/// - brings a three-voter cluster online and writes three commands.
/// - asserts that every node commits and applies all three, in order, with
///   matching state machines.
///
/// RUST_LOG=groupraft,memstore,client_writes=trace cargo test -p groupraft --test client_writes
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_writes() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(Arc::new(test_config()));
    for id in 1..=3 {
        router.new_raft_node(id, voters(&[1, 2, 3])).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(5), "initial election").await;

    let res = router.client_write_many(leader, &[b"a", b"b", b"c"]).await;
    assert_eq!(res.index, 3);

    router.wait_for_applied(&[1, 2, 3], 3, "three-voter replication").await;
    for id in 1..=3 {
        let metrics = router.wait_for_metrics(id, |m| m.commit_index == 3, "commit index everywhere").await;
        assert_eq!(metrics.last_log_index, 3, "node {} has unexpected log length", id);

        let applied = router.fsm(id).await.applied().await;
        let data: Vec<(u64, &[u8])> = applied.iter().map(|(index, buf)| (*index, &buf[..])).collect();
        assert_eq!(
            data,
            vec![(1, b"a".as_ref()), (2, b"b".as_ref()), (3, b"c".as_ref())],
            "node {} applied commands out of order",
            id
        );
    }

    // A barrier fences the previous writes and resolves with its own index.
    let barrier_index = router.raft(leader).await.barrier().await?;
    assert_eq!(barrier_index, 4);
    router.wait_for_applied(&[1, 2, 3], 4, "barrier replication").await;
    Ok(())
}
