mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::test_config;
use fixtures::voters;
use fixtures::RaftRouter;
use groupraft::membership::Configuration;
use groupraft::membership::Group;
use groupraft::membership::Phase;
use groupraft::membership::Role;

/// Joint-consensus membership change test.
///
/// What does this test do?
///
/// - brings a three-voter cluster online and writes an entry.
/// - adds server 4 as a spare, then atomically promotes it to voter while
///   removing one of the original followers through joint consensus.
/// - asserts that the final configuration is the uniform `{1, 2, 4}`-shaped
///   set, that the promotee ends up a voter, and that the removed server
///   observes its own removal.
///
/// RUST_LOG=groupraft,memstore,dynamic_membership=trace cargo test -p groupraft --test dynamic_membership
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dynamic_membership() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(Arc::new(test_config()));
    for id in 1..=3 {
        router.new_raft_node(id, voters(&[1, 2, 3])).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(5), "initial election").await;
    router.client_write(leader, b"a").await?;
    router.wait_for_applied(&[1, 2, 3], 1, "initial write").await;

    // The new server boots knowing the current cluster; it is not a member
    // of it until added.
    router.new_raft_node(4, voters(&[1, 2, 3])).await;
    router.raft(leader).await.add(4).await?;
    router
        .wait_for_metrics(
            leader,
            |m| m.configuration.get(4).map(|s| s.role == Role::Spare).unwrap_or(false),
            "spare added",
        )
        .await;

    // Promote 4 and drop one of the original followers in a single joint
    // change.
    let removed = (1..=3).find(|id| *id != leader).expect("expected a follower to remove");
    router.raft(leader).await.joint_promote(4, Role::Voter, removed).await?;

    let metrics = router
        .wait_for_metrics(
            leader,
            move |m| {
                m.configuration.phase == Phase::Normal
                    && !m.configuration.contains(removed)
                    && m.configuration.get(4).map(|s| s.role == Role::Voter).unwrap_or(false)
            },
            "final uniform configuration",
        )
        .await;
    assert_eq!(metrics.configuration.len(), 3);
    for server in &metrics.configuration.servers {
        assert_eq!(server.role, Role::Voter, "server {} should be a voter", server.id);
    }

    // The promotee converges on the same configuration.
    router
        .wait_for_metrics(
            4,
            |m| m.configuration.get(4).map(|s| s.role == Role::Voter).unwrap_or(false),
            "promotee sees itself as voter",
        )
        .await;

    // The removed server keeps receiving entries until it learns of its
    // removal.
    router.wait_for_metrics(removed, |m| m.removed, "removed server observes removal").await;

    // The reshaped cluster keeps serving writes.
    let leader = router.wait_for_leader(Duration::from_secs(5), "leader after membership change").await;
    router.client_write(leader, b"b").await?;
    router.wait_for_applied(&[leader, 4], metrics.last_log_index + 1, "write after membership change").await;
    Ok(())
}

/// Remove-during-joint test.
///
/// What does this test do?
///
/// - boots a cluster whose stored configuration is still in joint phase, as
///   left behind by a leader lost between the two phases of a joint change:
///   servers 1-3 in both views, server 4 leaving (old view only).
/// - asserts the joint phase persists until a client acts, then issues a
///   `remove` of the leaving server.
/// - asserts the removal resolves the transition by collapsing to the
///   surviving view rather than being rejected, and that the removed server
///   observes its removal.
///
/// RUST_LOG=groupraft,memstore,dynamic_membership=trace cargo test -p groupraft --test dynamic_membership
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_resolves_joint_phase() -> Result<()> {
    fixtures::init_tracing();

    let both = Group::OLD | Group::NEW;
    let mut cluster = Configuration::new();
    cluster.add(1, Role::Voter, Role::Voter, both)?;
    cluster.add(2, Role::Voter, Role::Voter, both)?;
    cluster.add(3, Role::Voter, Role::Voter, both)?;
    cluster.add(4, Role::Voter, Role::Voter, Group::OLD)?;
    cluster.phase = Phase::Joint;

    let router = RaftRouter::new(Arc::new(test_config()));
    for id in 1..=4 {
        router.new_raft_node(id, cluster.clone()).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(5), "election in joint phase").await;

    // Nothing moves the cluster out of joint phase on its own.
    let metrics = router.raft(leader).await.metrics().borrow().clone();
    assert_eq!(metrics.configuration.phase, Phase::Joint);

    router.raft(leader).await.remove(4).await?;

    // The removal resolved the transition: uniform survivors, no server 4.
    let metrics = router
        .wait_for_metrics(
            1,
            |m| m.configuration.phase == Phase::Normal && !m.configuration.contains(4),
            "configuration collapsed to the surviving view",
        )
        .await;
    assert_eq!(metrics.configuration.len(), 3);
    for server in &metrics.configuration.servers {
        assert_eq!(server.group, Group::OLD);
    }
    router.wait_for_metrics(4, |m| m.removed, "leaving server observes removal").await;

    // The resolved cluster keeps serving writes.
    let leader = router.wait_for_leader(Duration::from_secs(5), "leader after joint removal").await;
    router.client_write(leader, b"a").await?;
    Ok(())
}
