mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use fixtures::voters;
use fixtures::RaftRouter;
use groupraft::log::Entry;
use groupraft::log::EntryPayload;
use groupraft::raft::AppendEntriesRequest;
use groupraft::Config;

fn entry(term: u64, data: &'static [u8]) -> Entry {
    Entry {
        term,
        payload: EntryPayload::Command(Bytes::from_static(data)),
    }
}

fn request(term: u64, prev_log_index: u64, prev_log_term: u64, entries: Vec<Entry>, leader_commit: u64) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term,
        leader_id: 1,
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit,
        pgrep: Default::default(),
    }
}

/// Log mismatch repair test, driving a single follower directly with
/// AppendEntries RPCs.
///
/// What does this test do?
///
/// - seeds a follower with `[t1:a, t1:b]` and a stale `t2:bad` tail.
/// - sends the repairing AppendEntries of a term-3 leader with
///   `prev=(2, t1)` carrying `t3:c`.
/// - asserts the stale entry was truncated and replaced, and that replaying
///   the same request is a no-op.
///
/// RUST_LOG=groupraft,memstore,append_conflicts=trace cargo test -p groupraft --test append_conflicts
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn append_conflicts() -> Result<()> {
    fixtures::init_tracing();

    // Election timeouts far beyond the test duration keep the node a
    // passive follower.
    let config = Config::build("test".into())
        .election_timeout_min(60_000)
        .election_timeout_max(120_000)
        .heartbeat_interval(50)
        .validate()?;
    let router = RaftRouter::new(Arc::new(config));
    router.new_raft_node(2, voters(&[1, 2])).await;
    let raft = router.raft(2).await;

    // An empty log accepts a payload starting at prev_log_index 0.
    let res = raft.append_entries(request(1, 0, 0, vec![entry(1, b"a"), entry(1, b"b")], 0)).await?;
    assert_eq!(res.rejected, 0);
    assert_eq!(res.last_log_index, 2);

    // A stale tail from a term-2 leader that never got committed.
    let res = raft.append_entries(request(2, 2, 1, vec![entry(2, b"bad")], 0)).await?;
    assert_eq!(res.rejected, 0);
    assert_eq!(res.last_log_index, 3);

    // The term-3 leader repairs the log: index 3 is truncated and replaced.
    let repair = request(3, 2, 1, vec![entry(3, b"c")], 0);
    let res = raft.append_entries(repair.clone()).await?;
    assert_eq!(res.rejected, 0);
    assert_eq!(res.last_log_index, 3);

    let log = router.store(2).await.get_log().await;
    assert_eq!(log.len(), 3);
    assert_eq!(log[&3].term, 3);
    assert_eq!(log[&3].payload, EntryPayload::Command(Bytes::from_static(b"c")));

    // Replaying the duplicate is idempotent.
    let res = raft.append_entries(repair).await?;
    assert_eq!(res.rejected, 0);
    assert_eq!(res.last_log_index, 3);
    assert_eq!(router.store(2).await.get_log().await.len(), 3);

    // A probe beyond the end of the log is rejected with the probed index.
    let res = raft.append_entries(request(3, 5, 3, vec![], 0)).await?;
    assert_eq!(res.rejected, 5);
    assert_eq!(res.last_log_index, 3);

    // A heartbeat carrying the leader commit drives the apply loop.
    let res = raft.append_entries(request(3, 3, 3, vec![], 3)).await?;
    assert_eq!(res.rejected, 0);
    router.wait_for_applied(&[2], 3, "commit via heartbeat").await;
    let applied = router.fsm(2).await.applied().await;
    let data: Vec<&[u8]> = applied.iter().map(|(_, buf)| &buf[..]).collect();
    assert_eq!(data, vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]);

    // Give the node a moment to prove it stays a quiet follower.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let metrics = router.latest_metrics().await;
    assert_eq!(metrics[0].current_term, 3);
    Ok(())
}
