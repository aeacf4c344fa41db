//! End-to-end scenarios over in-memory networks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use covalue::store::{MemoryStore, SqliteStore, Storage};
use covalue::sync::{duplex, PeerId, PeerRole, SyncMessage};
use covalue::{LoadOutcome, LocalNode, MapEdit, NodeEvent, Privacy, Role};
use covalue_testkit::fixtures::{now_millis, tamper, SETTLE};
use covalue_testkit::{converged, eventually, init_tracing, test_config, RawPeer, Signer, TestNetwork};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writer_added_via_add_member_syncs_back() -> anyhow::Result<()> {
    let network = TestNetwork::new(2);
    network.connect(1, 0);
    let (a, b) = (network.node(0), network.node(1));

    let group = a.create_group()?;
    a.add_member(&group, *b.agent_id(), Role::Writer)?;
    let map = a.create_map(&group)?;

    assert_eq!(b.load(&map.to_string()).await?, LoadOutcome::Available);
    eventually(SETTLE, || {
        b.role_of(&group, b.agent_id()).ok().flatten() == Some(Role::Writer)
    })
    .await?;

    assert!(b.edit_map(&map, MapEdit::new().set("key1", "value1"), Privacy::Trusting)?);
    network.converged(&map, SETTLE).await?;
    assert_eq!(a.content(&map)?.to_json(), json!({"key1": "value1"}));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn triangle_converges_to_union() -> anyhow::Result<()> {
    let network = TestNetwork::new(3);
    network.connect(0, 1);
    network.connect(1, 2);
    network.connect(2, 0);
    let a = network.node(0);

    let group = a.create_group()?;
    for i in 1..3 {
        a.add_member(&group, *network.node(i).agent_id(), Role::Writer)?;
    }
    let map = a.create_map(&group)?;
    for i in 1..3 {
        assert_eq!(
            network.node(i).load(&map.to_string()).await?,
            LoadOutcome::Available
        );
    }
    network.converged(&group, SETTLE).await?;

    let writes: Vec<_> = (0..3)
        .map(|i| {
            let node = network.node(i).clone();
            tokio::spawn(async move {
                node.edit_map(
                    &map,
                    MapEdit::new().set(format!("key{}", i + 1), format!("value{}", i + 1)),
                    Privacy::Private,
                )
            })
        })
        .collect();
    for write in writes {
        assert!(write.await??);
    }

    network.converged(&map, SETTLE).await?;
    let expected = json!({"key1": "value1", "key2": "value2", "key3": "value3"});
    for node in network.nodes() {
        assert_eq!(node.content(&map)?.to_json(), expected);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partition_and_heal() -> anyhow::Result<()> {
    let network = TestNetwork::new(3);
    network.connect(0, 1);
    network.connect(2, 0);
    network.connect(2, 1);
    let (a, b, c) = (network.node(0), network.node(1), network.node(2));

    let group = a.create_group()?;
    a.add_member(&group, *b.agent_id(), Role::Writer)?;
    a.add_member(&group, *c.agent_id(), Role::Writer)?;
    let map = a.create_map(&group)?;
    b.load(&map.to_string()).await?;
    c.load(&map.to_string()).await?;
    network.converged(&group, SETTLE).await?;
    network.converged(&map, SETTLE).await?;

    network.disconnect(2, 0);
    network.disconnect(2, 1);

    assert!(a.edit_map(&map, MapEdit::new().set("a", 1), Privacy::Private)?);
    assert!(b.edit_map(&map, MapEdit::new().set("b", 2), Privacy::Private)?);
    converged(&network.nodes()[..2], &map, SETTLE).await?;

    assert!(c.edit_map(&map, MapEdit::new().set("c", 3), Privacy::Private)?);
    assert_eq!(c.content(&map)?.to_json(), json!({"c": 3}));
    assert_eq!(a.content(&map)?.to_json(), json!({"a": 1, "b": 2}));

    network.connect(2, 0);
    network.connect(2, 1);
    network.converged(&map, SETTLE).await?;
    for node in network.nodes() {
        assert_eq!(node.content(&map)?.to_json(), json!({"a": 1, "b": 2, "c": 3}));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_peer_id_resumes_new_id_starts_empty() -> anyhow::Result<()> {
    let network = TestNetwork::new(2);
    network.connect(1, 0);
    let (a, b) = (network.node(0), network.node(1));

    let group = a.create_group()?;
    let map = a.create_map(&group)?;
    a.edit_map(&map, MapEdit::new().set("k", "v"), Privacy::Trusting)?;
    b.load(&map.to_string()).await?;
    network.converged(&map, SETTLE).await?;

    let peer = TestNetwork::peer_id(1);
    a.wait_for_sync_with_peer(&peer, &map, SETTLE).await?;
    let before = a
        .peer_known_state(&peer, &map)
        .context("peer acknowledged the map")?;

    assert!(a.remove_peer(&peer));
    assert!(!a.remove_peer(&peer), "closing twice is a no-op");
    assert_eq!(a.is_peer_closed(&peer), Some(true));

    // Same id: acknowledged known states carry over.
    let (same, _same_far) = duplex(16);
    a.add_peer(peer.clone(), PeerRole::Client, same);
    assert_eq!(a.peer_known_state(&peer, &map), Some(before));
    assert_eq!(a.is_peer_closed(&peer), Some(false));

    // New id: nothing known.
    let fresh = PeerId::from("fresh");
    let (other, _other_far) = duplex(16);
    a.add_peer(fresh.clone(), PeerRole::Client, other);
    assert_eq!(a.peer_known_state(&fresh, &map), None);
    assert_eq!(a.peer_optimistic_known_state(&fresh, &map), None);

    assert_eq!(a.metrics().connected(PeerRole::Client), 2);
    Ok(())
}

#[tokio::test]
async fn deleted_peer_state_starts_empty_on_return() -> anyhow::Result<()> {
    init_tracing();
    let node = LocalNode::new(test_config().with_delete_peer_state_on_close(true));
    let group = node.create_group()?;
    let peer = PeerId::from("raw");

    let raw = RawPeer::connect(&node, "raw", PeerRole::Client);
    let known = node.known_state(&group).context("group")?;
    raw.send(&SyncMessage::known(known)).await?;
    eventually(SETTLE, || node.peer_known_state(&peer, &group).is_some()).await?;

    assert!(node.remove_peer(&peer));
    assert!(node.peers().is_empty());

    let _raw = RawPeer::connect(&node, "raw", PeerRole::Client);
    assert_eq!(node.peer_known_state(&peer, &group), None);
    Ok(())
}

async fn invalid_batch_with_storage(storage: Arc<dyn Storage>) -> anyhow::Result<()> {
    init_tracing();
    let origin = LocalNode::new(test_config());
    origin.add_storage("storage", storage.clone());
    let mut events = origin.subscribe();

    let writer = Signer::new();
    let forger = Signer::new();
    let group = origin.create_group()?;
    origin.add_member(&group, writer.id, Role::Writer)?;
    origin.add_member(&group, forger.id, Role::Writer)?;
    let map = origin.create_map(&group)?;
    let raw = RawPeer::connect(&origin, "raw", PeerRole::Client);
    let made_at = now_millis();

    // A batch whose transaction was altered after signing.
    let (forger_log, _) = forger.log(
        forger.session(1),
        made_at,
        &[MapEdit::new().set("evil", 1).into_changes()],
    )?;
    let mut forged = forger.content(map, &forger_log, 0)?;
    for batch in forged.new.values_mut() {
        batch.new_transactions[0] = tamper(
            &batch.new_transactions[0],
            &MapEdit::new().set("evil", 2).into_changes(),
        )?;
    }
    raw.send(&SyncMessage::Content(forged)).await?;

    // A later, valid batch from another session.
    let (log, _) = writer.log(
        writer.session(1),
        made_at + 1,
        &[MapEdit::new().set("key", "good").into_changes()],
    )?;
    raw.send(&SyncMessage::Content(writer.content(map, &log, 0)?))
        .await?;

    eventually(SETTLE, || {
        origin
            .known_state(&map)
            .is_some_and(|known| known.count(&writer.session(1)) == 1)
    })
    .await?;
    let known = origin.known_state(&map).context("map")?;
    assert_eq!(known.count(&forger.session(1)), 0);
    let from_raw = origin
        .peer_known_state(&"raw".into(), &map)
        .context("raw peer state")?;
    assert_eq!(from_raw.count(&forger.session(1)), 0);
    assert_eq!(from_raw.count(&writer.session(1)), 1);
    assert_eq!(origin.rejected_batches(&map)?.len(), 1);
    assert_eq!(origin.content(&map)?.to_json(), json!({"key": "good"}));

    let mut rejected = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, NodeEvent::TransactionRejected { id, transaction: None, .. } if id == map) {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 1);

    origin
        .wait_for_sync_with_peer(&"storage".into(), &map, SETTLE)
        .await?;
    assert_eq!(storage.known_state(&map).await?, known);

    let replica = LocalNode::new(test_config());
    replica.add_storage("storage", storage);
    assert_eq!(replica.load(&map.to_string()).await?, LoadOutcome::Available);
    eventually(SETTLE, || replica.known_state(&map).as_ref() == Some(&known)).await?;
    eventually(SETTLE, || {
        replica
            .content(&map)
            .is_ok_and(|content| content.to_json() == json!({"key": "good"}))
    })
    .await?;

    // The untampered batch for the refused session still goes through.
    raw.send(&SyncMessage::Content(forger.content(map, &forger_log, 0)?))
        .await?;
    eventually(SETTLE, || {
        origin
            .known_state(&map)
            .is_some_and(|known| known.count(&forger.session(1)) == 1)
    })
    .await?;
    let from_raw = origin
        .peer_known_state(&"raw".into(), &map)
        .context("raw peer state")?;
    assert_eq!(from_raw.count(&forger.session(1)), 1);
    assert_eq!(origin.rejected_batches(&map)?.len(), 1);
    assert_eq!(
        origin.content(&map)?.to_json(),
        json!({"key": "good", "evil": 1})
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_batch_does_not_block_valid_one_memory_store() -> anyhow::Result<()> {
    invalid_batch_with_storage(Arc::new(MemoryStore::new())).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_batch_does_not_block_valid_one_sqlite_store() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let storage = SqliteStore::open(dir.path().join("replica.db"))?;
    invalid_batch_with_storage(Arc::new(storage)).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unavailable_load_retries_when_peer_added() -> anyhow::Result<()> {
    let network = TestNetwork::new(2);
    let (a, b) = (network.node(0), network.node(1));
    let group = a.create_group()?;
    let map = a.create_map(&group)?;

    assert_eq!(b.load(&map.to_string()).await?, LoadOutcome::Unavailable);
    // Cached until a peer shows up.
    assert_eq!(b.load(&map.to_string()).await?, LoadOutcome::Unavailable);

    network.connect(1, 0);
    eventually(SETTLE, || b.known_state(&map).is_some()).await?;
    assert_eq!(b.load(&map.to_string()).await?, LoadOutcome::Available);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_loads_share_one_request() -> anyhow::Result<()> {
    let network = TestNetwork::new(2);
    network.connect(1, 0);
    let (a, b) = (network.node(0), network.node(1));
    let group = a.create_group()?;
    let map = a.create_map(&group)?;

    let id = map.to_string();
    let (first, second) = tokio::join!(b.load(&id), b.load(&id));
    assert_eq!(first?, LoadOutcome::Available);
    assert_eq!(second?, LoadOutcome::Available);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closing_peer_fails_waiters() -> anyhow::Result<()> {
    init_tracing();
    let node = LocalNode::new(test_config());
    let group = node.create_group()?;
    // Nobody on the far side acknowledges anything.
    let (ours, _far) = duplex(16);
    node.add_peer("silent", PeerRole::Server, ours);
    let peer = PeerId::from("silent");

    let waiter = {
        let node = node.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            node.wait_for_sync_with_peer(&peer, &group, Duration::from_secs(30))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(node.remove_peer(&peer));

    let result = tokio::time::timeout(SETTLE, waiter).await??;
    assert!(matches!(
        result,
        Err(covalue::NodeError::Sync(covalue::sync::SyncError::PeerClosed(_)))
    ));
    assert_eq!(node.metrics().connected(PeerRole::Server), 0);
    Ok(())
}

#[tokio::test]
async fn wait_for_sync_times_out() -> anyhow::Result<()> {
    init_tracing();
    let node = LocalNode::new(test_config());
    let group = node.create_group()?;
    let (ours, _far) = duplex(16);
    node.add_peer("silent", PeerRole::Server, ours);

    let result = node
        .wait_for_sync(&group, Duration::from_millis(100))
        .await;
    assert!(matches!(
        result,
        Err(covalue::NodeError::Sync(covalue::sync::SyncError::Timeout(_)))
    ));
    Ok(())
}
