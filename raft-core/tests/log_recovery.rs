mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use raft_core::raft::AppendEntriesRequest;
use raft_core::raft::AppendResult;
use raft_core::Config;
use raft_core::LogId;

use fixtures::RaftRouter;

/// Lagging-follower recovery test.
///
/// What does this test do?
///
/// - brings a 3 node cluster online and commits a batch of writes.
/// - isolates one follower, commits another batch on the remaining majority.
/// - heals the partition and asserts the lagging follower converges on the full log and
///   commit index, with every entry applied exactly once.
/// - separately pokes the follower with an AppendEntries whose previous entry it cannot
///   have, asserting the inconsistency reply points the leader at the divergence.
///
/// RUST_LOG=raft_core,memstore,log_recovery=trace cargo test -p raft-core --test log_recovery
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_follower_catches_up() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    tracing::info!("--- initializing cluster of 3");
    router.initialize_all().await?;
    let leader = router.wait_for_leader(Duration::from_secs(5), "initial election").await?;
    router.wait_for_log(&btreeset![0, 1, 2], 1, Some(Duration::from_secs(2)), "initial conf entry").await?;

    tracing::info!("--- writing first batch");
    router.client_write_many(leader, "c0", 10).await;
    let mut want = 1 + 10;
    router.wait_for_log(&btreeset![0, 1, 2], want, Some(Duration::from_secs(2)), "first batch").await?;

    let lagging = (0..3).find(|id| *id != leader).unwrap();
    tracing::info!(lagging, "--- isolating follower");
    router.isolate_node(lagging).await;

    tracing::info!("--- writing second batch on the majority");
    router.client_write_many(leader, "c1", 10).await;
    want += 10;
    let live: std::collections::BTreeSet<u64> = (0..3).filter(|id| *id != lagging).collect();
    router.wait_for_log(&live, want, Some(Duration::from_secs(2)), "second batch").await?;

    tracing::info!(lagging, "--- healing follower");
    router.restore_node(lagging).await;
    router.wait_for_log(&btreeset![lagging], want, Some(Duration::from_secs(5)), "follower caught up").await?;

    let sto = router.get_storage_handle(&lagging).await?;
    let sm = sto.get_state_machine().await;
    assert_eq!(want, sm.last_applied_log.index);
    for idx in 0..10u64 {
        assert_eq!(1, sto.apply_count("c0", idx).await);
        assert_eq!(1, sto.apply_count("c1", idx).await);
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn append_entries_gap_reports_inconsistency() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    router.initialize_all().await?;
    let leader = router.wait_for_leader(Duration::from_secs(5), "initial election").await?;
    router.wait_for_log(&btreeset![0, 1, 2], 1, Some(Duration::from_secs(2)), "initial conf entry").await?;

    router.client_write_many(leader, "c0", 5).await;
    let want = 1 + 5;
    router.wait_for_log(&btreeset![0, 1, 2], want, Some(Duration::from_secs(2)), "writes").await?;

    let follower = (0..3).find(|id| *id != leader).unwrap();
    let metrics = router.wait(&leader, None).await?.metrics(|_| true, "leader metrics").await?;

    // A frame whose previous entry lies beyond the follower's log must be answered with
    // the index the leader has to resume from.
    let rpc = AppendEntriesRequest {
        term: metrics.current_term,
        leader_id: leader,
        group_id: "test".into(),
        prev_log_id: LogId {
            term: metrics.current_term,
            index: want + 5,
        },
        entries: vec![],
        leader_commit: want,
        commit_infos: vec![],
        initializing: false,
    };
    let resp = router.send_append_entries_to(follower, rpc).await?;
    assert_eq!(AppendResult::Inconsistency, resp.result);
    assert_eq!(
        want + 1,
        resp.next_index,
        "the follower should point the leader at its own next index"
    );

    Ok(())
}
