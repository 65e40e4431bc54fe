mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::voters;
use fixtures::RaftRouter;
use groupraft::Config;

/// Single-voter cluster test.
///
/// What does this test do?
///
/// - brings one node online as the only voter; it elects itself.
/// - writes a single command; the write commits on the local append alone.
/// - asserts that the command was applied and that crossing the snapshot
///   threshold produced a snapshot at index 1.
///
/// RUST_LOG=groupraft,memstore,singlenode=trace cargo test -p groupraft --test singlenode
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn singlenode() -> Result<()> {
    fixtures::init_tracing();

    let config = Config::build("test".into())
        .election_timeout_min(150)
        .election_timeout_max(300)
        .heartbeat_interval(30)
        .snapshot_threshold(1)
        .snapshot_trailing(0)
        .validate()?;
    let router = RaftRouter::new(Arc::new(config));
    router.new_raft_node(1, voters(&[1])).await;

    let leader = router.wait_for_leader(Duration::from_secs(5), "single-voter election").await;
    assert_eq!(leader, 1);

    let res = router.client_write(1, b"x").await?;
    assert_eq!(res.index, 1);

    router.wait_for_applied(&[1], 1, "single-voter commit").await;
    let metrics = router.wait_for_metrics(1, |m| m.snapshot_index == 1, "snapshot at index 1").await;
    assert_eq!(metrics.commit_index, 1);
    assert_eq!(metrics.last_applied, 1);

    let fsm = router.fsm(1).await;
    let applied = fsm.applied().await;
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].0, 1);
    assert_eq!(&applied[0].1[..], b"x");

    let snapshot = router.store(1).await.read_snapshot().await.expect("expected a snapshot");
    assert_eq!(snapshot.index, 1);
    assert_eq!(snapshot.configuration, voters(&[1]));
    Ok(())
}
