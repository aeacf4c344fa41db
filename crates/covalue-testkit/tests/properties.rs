//! Convergence and protocol properties.

use serde_json::json;
use proptest::prelude::*;

use covalue::sync::{ContentMessage, PeerRole, SessionContent, SyncMessage};
use covalue::{CoId, LocalNode, MapEdit, Privacy, Role};
use covalue_testkit::fixtures::{now_millis, tamper, SETTLE};
use covalue_testkit::{eventually, init_tracing, list_ops, map_ops, test_config, ListOp, MapOp, RawPeer, Signer, TestNetwork};

/// Star around node 0 with every node a writer, all holding the value
/// returned by `create`.
async fn star<F>(count: usize, create: F) -> anyhow::Result<(TestNetwork, CoId)>
where
    F: FnOnce(&LocalNode, &CoId) -> covalue::Result<CoId>,
{
    let network = TestNetwork::new(count);
    for client in 1..count {
        network.connect(client, 0);
    }
    let hub = network.node(0);
    let group = hub.create_group()?;
    for i in 1..count {
        hub.add_member(&group, *network.node(i).agent_id(), Role::Writer)?;
    }
    let id = create(hub, &group)?;
    for node in &network.nodes()[1..] {
        node.load(&id.to_string()).await?;
    }
    network.converged(&group, SETTLE).await?;
    network.converged(&id, SETTLE).await?;
    Ok((network, id))
}

async fn map_converges(ops: Vec<MapOp>) -> anyhow::Result<()> {
    let (network, map) = star(3, |node, group| node.create_map(group)).await?;
    for op in &ops {
        network
            .node(op.node())
            .edit_map(&map, op.edit(), Privacy::Private)?;
    }
    network.converged(&map, SETTLE).await?;

    let expected = network.node(0).content(&map)?.to_json();
    for node in network.nodes() {
        anyhow::ensure!(node.content(&map)?.to_json() == expected, "content diverged");
    }
    Ok(())
}

async fn list_converges(ops: Vec<ListOp>) -> anyhow::Result<()> {
    let (network, list) = star(3, |node, group| node.create_list(group)).await?;
    for op in &ops {
        network
            .node(op.node())
            .edit_list(&list, Privacy::Trusting, |edit| op.apply(edit))?;
    }
    network.converged(&list, SETTLE).await?;

    let expected = network.node(0).content(&list)?.to_json();
    for node in network.nodes() {
        anyhow::ensure!(node.content(&list)?.to_json() == expected, "content diverged");
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn concurrent_map_edits_converge(ops in map_ops(3, 12)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let result = runtime.block_on(map_converges(ops));
        prop_assert!(result.is_ok(), "{:?}", result);
    }

    #[test]
    fn concurrent_list_edits_converge(ops in list_ops(3, 12)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let result = runtime.block_on(list_converges(ops));
        prop_assert!(result.is_ok(), "{:?}", result);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_known_states_only_grow() -> anyhow::Result<()> {
    let (network, map) = star(2, |node, group| node.create_map(group)).await?;
    let (hub, peer) = (network.node(0), TestNetwork::peer_id(1));

    let mut last_known = hub.peer_known_state(&peer, &map);
    for i in 0..20 {
        hub.edit_map(&map, MapEdit::new().set("n", i), Privacy::Private)?;
        let known = hub.peer_known_state(&peer, &map);
        let optimistic = hub.peer_optimistic_known_state(&peer, &map);
        if let (Some(known), Some(optimistic)) = (&known, &optimistic) {
            assert!(known.is_subset_of(optimistic), "acknowledged ahead of optimistic");
        }
        if let (Some(before), Some(after)) = (&last_known, &known) {
            assert!(before.is_subset_of(after), "acknowledged state went backwards");
        }
        last_known = known;
        tokio::task::yield_now().await;
    }

    network.converged(&map, SETTLE).await?;
    hub.wait_for_sync_with_peer(&peer, &map, SETTLE).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_content_applies_once() -> anyhow::Result<()> {
    init_tracing();
    let node = LocalNode::new(test_config());
    let signer = Signer::new();
    let group = node.create_group()?;
    node.add_member(&group, signer.id, Role::Writer)?;
    let map = node.create_map(&group)?;
    let mut events = node.subscribe();

    let session = signer.session(1);
    let (log, signatures) = signer.log(
        session,
        now_millis(),
        &[
            MapEdit::new().set("x", 1).into_changes(),
            MapEdit::new().set("y", 2).into_changes(),
        ],
    )?;
    let mut first = ContentMessage::new(map);
    first.new.insert(
        session,
        SessionContent {
            after: 0,
            new_transactions: log.transactions_since(0)[..1].to_vec(),
            last_signature: signatures[0],
        },
    );
    let raw = RawPeer::connect(&node, "raw", PeerRole::Client);
    raw.send(&SyncMessage::Content(first.clone())).await?;
    raw.send(&SyncMessage::Content(first)).await?;

    // The rest arrives after the duplicate on the same connection.
    raw.send(&SyncMessage::Content(signer.content(map, &log, 1)?))
        .await?;
    eventually(SETTLE, || {
        node.known_state(&map)
            .is_some_and(|known| known.count(&signer.session(1)) == 2)
    })
    .await?;

    assert_eq!(node.valid_transactions(&map)?.len(), 2);
    assert!(node.rejected_batches(&map)?.is_empty());
    assert_eq!(node.content(&map)?.to_json(), json!({"x": 1, "y": 2}));
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, covalue::NodeEvent::TransactionRejected { .. }),
            "duplicate reported as rejected"
        );
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signature_chain_guards_history() -> anyhow::Result<()> {
    init_tracing();
    let node = LocalNode::new(test_config());
    let signer = Signer::new();
    let group = node.create_group()?;
    node.add_member(&group, signer.id, Role::Writer)?;
    let map = node.create_map(&group)?;
    let session = signer.session(1);
    let raw = RawPeer::connect(&node, "raw", PeerRole::Client);

    let changes: Vec<_> = (0..3)
        .map(|i| MapEdit::new().set("n", i).into_changes())
        .collect();
    let (log, signatures) = signer.log(session, now_millis(), &changes)?;

    // Altering an early transaction breaks the signature over the batch.
    let mut forged = signer.content(map, &log, 0)?;
    for batch in forged.new.values_mut() {
        batch.new_transactions[0] =
            tamper(&batch.new_transactions[0], &MapEdit::new().set("n", 99).into_changes())?;
    }
    raw.send(&SyncMessage::Content(forged)).await?;
    eventually(SETTLE, || {
        node.rejected_batches(&map).is_ok_and(|rejected| rejected.len() == 1)
    })
    .await?;
    let count = |node: &LocalNode| node.known_state(&map).map_or(0, |k| k.count(&session));
    assert_eq!(count(&node), 0);

    // The first transaction alone, with the signature it had at the time.
    let mut head = ContentMessage::new(map);
    head.new.insert(
        session,
        SessionContent {
            after: 0,
            new_transactions: log.transactions_since(0)[..1].to_vec(),
            last_signature: signatures[0],
        },
    );
    raw.send(&SyncMessage::Content(head)).await?;
    eventually(SETTLE, || count(&node) == 1).await?;

    // A tampered suffix is refused without disturbing the prefix.
    let mut forged = signer.content(map, &log, 1)?;
    for batch in forged.new.values_mut() {
        batch.new_transactions[1] =
            tamper(&batch.new_transactions[1], &MapEdit::new().set("n", 99).into_changes())?;
    }
    raw.send(&SyncMessage::Content(forged)).await?;
    eventually(SETTLE, || {
        node.rejected_batches(&map).is_ok_and(|rejected| rejected.len() == 2)
    })
    .await?;
    assert_eq!(count(&node), 1);

    // The genuine suffix extends the chain.
    raw.send(&SyncMessage::Content(signer.content(map, &log, 1)?))
        .await?;
    eventually(SETTLE, || count(&node) == 3).await?;
    assert_eq!(node.content(&map)?.to_json(), json!({"n": 2}));
    Ok(())
}
