mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use raft_core::Config;
use raft_core::LifeCycleState;
use raft_core::Role;

use fixtures::RaftRouter;

/// Cluster formation test.
///
/// What does this test do?
///
/// - brings 3 pristine nodes online and initializes them as one group.
/// - asserts that exactly one of them becomes leader within the election window and that
///   the other two become followers pointing at it.
/// - asserts the leader committed its initial configuration entry on every node.
///
/// RUST_LOG=raft_core,memstore,initialization=trace cargo test -p raft-core --test initialization
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initialization() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    tracing::info!("--- initializing cluster of 3");
    router.initialize_all().await?;

    for id in 0..3 {
        let node = router.get_node_handle(&id).await?;
        assert_eq!(LifeCycleState::Running, node.lifecycle_state());
    }

    // The election window is one randomized timeout plus the campaign round-trips; give
    // it a couple of full windows before declaring failure.
    let election_window = Duration::from_millis(2 * config.election_timeout_max);
    let leader = router.wait_for_leader(election_window * 4, "initial election").await?;

    tracing::info!(leader, "--- leader elected");

    // The initial configuration entry commits at index 1 on every node.
    router.wait_for_log(&btreeset![0, 1, 2], 1, Some(Duration::from_secs(2)), "initial conf entry").await?;

    let metrics = router.latest_metrics().await;
    let leaders: Vec<_> = metrics.iter().filter(|m| m.role == Role::Leader).collect();
    assert_eq!(1, leaders.len(), "expected exactly one leader, got {:?}", leaders);
    assert_eq!(leader, leaders[0].id);

    for m in metrics.iter().filter(|m| m.id != leader) {
        assert_eq!(Role::Follower, m.role, "node {} should be a follower", m.id);
        assert_eq!(Some(leader), m.current_leader, "node {} should know the leader", m.id);
    }

    router.assert_stable_cluster(None, Some(1)).await;

    // Every node has durably recorded the election term, and the leader its own vote.
    let leader_term = leaders[0].current_term;
    for id in 0..3 {
        let sto = router.get_storage_handle(&id).await?;
        let md = raft_core::RaftLogDebug::read_metadata(sto.as_ref()).await.expect("metadata never persisted");
        assert_eq!(leader_term, md.current_term, "node {} has a stale persisted term", id);
    }
    let leader_sto = router.get_storage_handle(&leader).await?;
    let md = raft_core::RaftLogDebug::read_metadata(leader_sto.as_ref()).await.unwrap();
    assert_eq!(Some(leader), md.voted_for, "the leader must have voted for itself");

    Ok(())
}
