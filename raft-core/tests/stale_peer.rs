mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use raft_core::raft::VoteRequest;
use raft_core::Config;
use raft_core::LifeCycleState;
use raft_core::LogId;

use fixtures::RaftRouter;

/// Stale-peer shutdown hint test.
///
/// What does this test do?
///
/// - brings a 3 node cluster online with its configuration entry committed.
/// - has a peer outside the configuration, with an empty log, request a vote from the
///   leader; asserts the vote is refused with the shutdown hint set.
/// - starts a real fourth node outside the configuration and asserts the hint drives it
///   to shut itself down.
///
/// RUST_LOG=raft_core,memstore,stale_peer=trace cargo test -p raft-core --test stale_peer
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_peer_gets_shutdown_hint() -> Result<()> {
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

    let leader_term = router.wait(&leader, None).await?.metrics(|_| true, "leader metrics").await?.current_term;

    tracing::info!("--- requesting a vote as a peer outside the configuration");
    let resp = router
        .send_vote_to(leader, VoteRequest {
            term: leader_term,
            candidate_id: 99,
            group_id: "test".into(),
            last_log_id: LogId { term: 0, index: 0 },
        })
        .await?;
    assert!(!resp.vote_granted, "a stale peer must not receive a vote");
    assert!(resp.should_shutdown, "the leader should hint the stale peer to shut down");

    tracing::info!("--- starting a real stale peer");
    router.new_raft_node(3).await;
    router.initialize_with(3, btreeset![0, 1, 2, 3]).await?;

    let node3 = router.get_node_handle(&3).await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if node3.lifecycle_state() == LifeCycleState::Closed {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("stale peer did not shut down, lifecycle: {:?}", node3.lifecycle_state());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    Ok(())
}
