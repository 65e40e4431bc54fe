mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use groupraft::membership::Configuration;
use groupraft::membership::Group;
use groupraft::membership::Role;
use groupraft::Config;

/// Log compaction and snapshot installation test.
///
/// What does this test do?
///
/// - brings up a single voter plus a standby, with the standby partitioned
///   away, and writes past the snapshot threshold so the leader compacts.
/// - heals the partition; the standby's log starts before the leader's
///   compacted log, so it must be caught up through InstallSnapshot.
/// - asserts the standby restored the snapshot's boundary, configuration and
///   state machine.
///
/// RUST_LOG=groupraft,memstore,compaction=trace cargo test -p groupraft --test compaction
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction() -> Result<()> {
    fixtures::init_tracing();

    let config = Config::build("test".into())
        .election_timeout_min(150)
        .election_timeout_max(300)
        .heartbeat_interval(30)
        .snapshot_threshold(5)
        .snapshot_trailing(0)
        .validate()?;
    let mut cluster = Configuration::new();
    cluster.add(1, Role::Voter, Role::Voter, Group::OLD).expect("config");
    cluster.add(2, Role::Standby, Role::Standby, Group::OLD).expect("config");

    let router = RaftRouter::new(Arc::new(config));
    router.new_raft_node(1, cluster.clone()).await;
    router.new_raft_node(2, cluster.clone()).await;
    let leader = router.wait_for_leader(Duration::from_secs(5), "single-voter election").await;
    assert_eq!(leader, 1);

    // With the standby cut off, the single voter keeps committing alone and
    // eventually compacts its log.
    router.isolate_node(2).await;
    let payloads: Vec<&[u8]> = (0..10).map(|_| b"x".as_ref()).collect();
    let res = router.client_write_many(1, &payloads).await;
    assert_eq!(res.index, 10);
    router.wait_for_applied(&[1], 10, "writes committed alone").await;
    router.wait_for_metrics(1, |m| m.snapshot_index == 10, "leader compacted").await;

    // Healing the partition forces a snapshot installation: the entries the
    // standby needs are gone from the leader's log.
    router.restore_node(2).await;
    router.wait_for_applied(&[2], 10, "standby caught up via snapshot").await;

    let metrics = router.wait_for_metrics(2, |m| m.snapshot_index == 10, "standby adopted the snapshot").await;
    assert_eq!(metrics.configuration, cluster);

    let leader_snapshot = router.store(1).await.read_snapshot().await.expect("leader snapshot");
    let standby_snapshot = router.store(2).await.read_snapshot().await.expect("standby snapshot");
    assert_eq!(standby_snapshot.index, leader_snapshot.index);
    assert_eq!(standby_snapshot.term, leader_snapshot.term);
    assert_eq!(standby_snapshot.configuration, leader_snapshot.configuration);

    let leader_state = router.fsm(1).await.applied().await;
    let standby_state = router.fsm(2).await.applied().await;
    assert_eq!(leader_state, standby_state);
    Ok(())
}
