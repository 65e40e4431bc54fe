mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::test_config;
use fixtures::voters;
use fixtures::RaftRouter;
use groupraft::RaftError;

/// Leadership transfer test.
///
/// What does this test do?
///
/// - brings a three-voter cluster online and writes a few entries.
/// - asks the leader to hand leadership to the most up-to-date voter.
/// - asserts the transfer resolves once the new leader is in place, and
///   that the old leader redirects clients to it.
///
/// RUST_LOG=groupraft,memstore,leadership_transfer=trace cargo test -p groupraft --test leadership_transfer
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leadership_transfer() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(Arc::new(test_config()));
    for id in 1..=3 {
        router.new_raft_node(id, voters(&[1, 2, 3])).await;
    }
    let old_leader = router.wait_for_leader(Duration::from_secs(5), "initial election").await;
    router.client_write_many(old_leader, &[b"a", b"b"]).await;
    router.wait_for_applied(&[1, 2, 3], 2, "writes before transfer").await;

    router.raft(old_leader).await.transfer(None).await?;

    let new_leader = router.wait_for_leader(Duration::from_secs(5), "leader after transfer").await;
    assert_ne!(new_leader, old_leader, "leadership did not move");

    // The old leader redirects clients to the new one.
    let res = router.client_write(old_leader, b"c").await;
    match res {
        Err(RaftError::NotLeader { leader }) => assert_eq!(leader, Some(new_leader)),
        other => panic!("expected NotLeader redirect, got {:?}", other.map(|r| r.index)),
    }

    router.client_write(new_leader, b"c").await?;
    router.wait_for_applied(&[1, 2, 3], 3, "write after transfer").await;
    Ok(())
}
