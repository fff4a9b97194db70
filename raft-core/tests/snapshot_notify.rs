mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use raft_core::Config;
use raft_core::SnapshotPolicy;

use fixtures::RaftRouter;

/// Notify-mode snapshot install test.
///
/// What does this test do?
///
/// - with chunked snapshot transfer disabled, builds a single-node cluster and writes
///   far enough past the snapshot threshold that the log below the snapshot is purged.
/// - brings an empty second node into the configuration; the leader cannot replicate the
///   purged prefix, so the follower's state machine is notified to obtain a snapshot.
/// - asserts the state machine was notified exactly once, that the follower converges on
///   the leader's log and commit index, and that the snapshot-covered calls were never
///   re-applied on the follower.
///
/// RUST_LOG=raft_core,memstore,snapshot_notify=trace cargo test -p raft-core --test snapshot_notify
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notified_snapshot_install() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(
        Config::build("test".into())
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(300))
            .install_snapshot_enabled(false)
            .validate()
            .expect("failed to build config"),
    );
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;

    tracing::info!("--- initializing single node cluster");
    router.initialize_with(0, btreeset![0]).await?;
    router.wait_for_log(&btreeset![0], 1, Some(Duration::from_secs(2)), "initial conf entry").await?;

    tracing::info!("--- writing past the snapshot threshold");
    router.client_write_many(0, "c0", 400).await;
    let want = 1 + 400;
    router.wait_for_log(&btreeset![0], want, Some(Duration::from_secs(5)), "writes applied").await?;

    // Compaction runs in the background once the threshold is crossed.
    let sto0 = router.get_storage_handle(&0).await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let (snapshot_id, snapshot_kv) = loop {
        if let Some(contents) = sto0.current_snapshot_contents().await {
            break contents;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("leader never built a snapshot");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    tracing::info!(snapshot=%snapshot_id, "--- leader snapshot built");

    tracing::info!("--- bringing an empty follower into the configuration");
    router.new_raft_node(1).await;
    let sto1 = router.get_storage_handle(&1).await?;
    // Stand in for the out-of-band channel the follower's state machine obtains its
    // snapshot from.
    sto1.set_obtainable_snapshot(snapshot_id, snapshot_kv.clone()).await;

    router.set_configuration(0, btreeset![0, 1]).await.expect("config change failed");

    router.wait_for_log(&btreeset![1], want, Some(Duration::from_secs(10)), "follower converged").await?;

    assert_eq!(1, sto1.notify_install_count(), "the state machine must be notified exactly once");

    let metrics1 = router.wait(&1, None).await?.metrics(|_| true, "follower metrics").await?;
    assert!(
        metrics1.last_applied >= snapshot_id.index,
        "follower applied {} but the snapshot covers {}",
        metrics1.last_applied,
        snapshot_id.index
    );
    assert_eq!(snapshot_id, metrics1.snapshot);

    let sm1 = sto1.get_state_machine().await;
    for (key, value) in snapshot_kv.iter() {
        assert_eq!(Some(value), sm1.kv.get(key), "follower is missing snapshot key {}", key);
    }
    // Calls covered by the snapshot arrived in the follower's state via the snapshot,
    // never through apply.
    assert_eq!(0, sto1.apply_count("c0", 0).await);

    tracing::info!("--- writes after the install replicate normally");
    router.client_write_many(0, "c1", 5).await;
    router.wait_for_log(&btreeset![0, 1], want + 5, Some(Duration::from_secs(5)), "post-install writes").await?;
    assert_eq!(1, sto1.apply_count("c1", 4).await);

    Ok(())
}
