mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use raft_core::Config;

use fixtures::RaftRouter;

/// Client write, commit and retry-dedup test.
///
/// What does this test do?
///
/// - brings a 3 node cluster online and writes one entry through the leader.
/// - asserts the reply is successful with a log index, and that every peer's state
///   machine applied the transaction exactly once.
/// - resubmits the identical (client, call) request and asserts the very same reply
///   object is replayed, no new log entry is appended, and no peer re-applies.
///
/// RUST_LOG=raft_core,memstore,client_writes=trace cargo test -p raft-core --test client_writes
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_writes_commit_and_dedup() -> Result<()> {
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

    tracing::info!(leader, "--- submitting write X/7");
    let first = router.client_write(leader, "X", 7, "k", "1").await?;
    assert!(first.success, "write was refused: {:?}", first.exception);
    assert!(first.log_index >= 1, "expected a log index, got {}", first.log_index);
    assert_eq!(Some(&memstore::StoreResponse(None)), first.result.as_ref());

    let want = first.log_index;
    router.wait_for_log(&btreeset![0, 1, 2], want, Some(Duration::from_secs(2)), "write applied").await?;

    for id in 0..3 {
        let sto = router.get_storage_handle(&id).await?;
        assert_eq!(1, sto.apply_count("X", 7).await, "node {} should have applied X/7 exactly once", id);
        let sm = sto.get_state_machine().await;
        assert_eq!(Some(&"1".to_string()), sm.kv.get("k"), "node {} missing the written value", id);
    }

    tracing::info!("--- resubmitting the identical request");
    let last_log_before = router.wait(&leader, None).await?.metrics(|_| true, "snapshot metrics").await?.last_log_index;

    let second = router.client_write(leader, "X", 7, "k", "1").await?;
    assert!(
        Arc::ptr_eq(&first, &second),
        "expected the cached reply object to be replayed"
    );

    // Give any erroneous append a chance to replicate before checking.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let metrics = router.wait(&leader, None).await?.metrics(|_| true, "snapshot metrics").await?;
    assert_eq!(last_log_before, metrics.last_log_index, "a duplicate write must not append");

    for id in 0..3 {
        let sto = router.get_storage_handle(&id).await?;
        assert_eq!(1, sto.apply_count("X", 7).await, "node {} re-applied a deduped write", id);
    }

    Ok(())
}

/// Watches resolve once their index reaches the requested replication level, and group
/// info reflects the commit progress of every peer.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn watch_and_group_info() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    router.initialize_all().await?;
    let leader = router.wait_for_leader(Duration::from_secs(5), "initial election").await?;
    router.wait_for_log(&btreeset![0, 1, 2], 1, Some(Duration::from_secs(2)), "initial conf entry").await?;

    let node = router.get_node_handle(&leader).await?;

    // Register a watch one index past the current log, then write to satisfy it.
    let watch_index = node.metrics().borrow().last_log_index + 1;
    let watcher = {
        let node = node.clone();
        let group = config.group_id.clone();
        tokio::spawn(async move {
            node.submit_client_request(raft_core::raft::ClientRequest::watch(
                "w0".into(),
                1,
                group,
                watch_index,
                raft_core::raft::ReplicationLevel::Committed,
            ))
            .await
        })
    };

    let reply = router.client_write(leader, "X", 1, "k", "1").await?;
    assert!(reply.success);
    assert_eq!(watch_index, reply.log_index);

    let watch_reply = watcher.await??;
    assert!(watch_reply.success, "watch failed: {:?}", watch_reply.exception);
    assert_eq!(watch_index, watch_reply.log_index);

    router.wait_for_log(&btreeset![0, 1, 2], watch_index, Some(Duration::from_secs(2)), "write applied").await?;

    let info = node.get_group_info().await?;
    assert_eq!(raft_core::Role::Leader, info.role);
    assert_eq!(Some(leader), info.leader);
    assert_eq!(btreeset![0, 1, 2], info.membership.members);
    let own = info.commit_infos.iter().find(|ci| ci.peer == leader).expect("missing own commit info");
    assert!(own.commit_index >= watch_index);

    Ok(())
}

/// A write against a follower is refused with a leader hint.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_write_to_follower_is_redirected() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    router.initialize_all().await?;
    let leader = router.wait_for_leader(Duration::from_secs(5), "initial election").await?;
    router.wait_for_log(&btreeset![0, 1, 2], 1, Some(Duration::from_secs(2)), "initial conf entry").await?;

    let follower = (0..3).find(|id| *id != leader).unwrap();
    let reply = router.client_write(follower, "X", 1, "k", "1").await?;
    assert!(!reply.success);
    match &reply.exception {
        Some(raft_core::ClientException::NotLeader { leader_hint, peers }) => {
            assert_eq!(&Some(leader), leader_hint, "hint should carry the known leader");
            assert!(peers.contains(&leader));
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }

    Ok(())
}
