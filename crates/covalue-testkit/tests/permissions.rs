//! Group roles, read keys and their effect on synced content.

use serde_json::json;

use covalue::sync::{PeerRole, SyncMessage};
use covalue::{LoadOutcome, LocalNode, MapEdit, MemberId, NodeError, NodeEvent, Privacy, Role};
use covalue_testkit::fixtures::{now_millis, SETTLE};
use covalue_testkit::{eventually, init_tracing, test_config, RawPeer, Signer, TestNetwork};

/// Node 1 connected to node 0 as its server.
fn pair() -> TestNetwork {
    let network = TestNetwork::new(2);
    network.connect(1, 0);
    network
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revoked_reader_keeps_old_content_only() -> anyhow::Result<()> {
    let network = pair();
    let (a, b) = (network.node(0), network.node(1));

    let group = a.create_group()?;
    a.add_member(&group, *b.agent_id(), Role::Reader)?;
    let map = a.create_map(&group)?;
    a.edit_map(&map, MapEdit::new().set("old", "visible"), Privacy::Private)?;

    assert_eq!(b.load(&map.to_string()).await?, LoadOutcome::Available);
    network.converged(&map, SETTLE).await?;
    assert_eq!(b.content(&map)?.to_json(), json!({"old": "visible"}));

    a.remove_member(&group, *b.agent_id())?;
    a.edit_map(&map, MapEdit::new().set("new", "hidden"), Privacy::Private)?;
    network.converged(&group, SETTLE).await?;
    network.converged(&map, SETTLE).await?;

    assert_eq!(b.role_of(&group, b.agent_id())?, None);
    assert_eq!(
        a.content(&map)?.to_json(),
        json!({"old": "visible", "new": "hidden"})
    );
    assert_eq!(b.content(&map)?.to_json(), json!({"old": "visible"}));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reader_cannot_write() -> anyhow::Result<()> {
    let network = pair();
    let (a, b) = (network.node(0), network.node(1));

    let group = a.create_group()?;
    a.add_member(&group, *b.agent_id(), Role::Reader)?;
    let map = a.create_map(&group)?;
    b.load(&map.to_string()).await?;
    eventually(SETTLE, || {
        b.role_of(&group, b.agent_id()).ok().flatten() == Some(Role::Reader)
    })
    .await?;

    assert!(!b.edit_map(&map, MapEdit::new().set("k", 1), Privacy::Trusting)?);
    assert!(!b.edit_map(&map, MapEdit::new().delete("k"), Privacy::Private)?);
    assert!(b.known_state(&map).is_some_and(|known| known.count(b.session_id()) == 0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_member_writes_are_ignored_and_reported() -> anyhow::Result<()> {
    init_tracing();
    let node = LocalNode::new(test_config());
    let group = node.create_group()?;
    let map = node.create_map(&group)?;
    node.edit_map(&map, MapEdit::new().set("k", "owner"), Privacy::Trusting)?;
    let mut events = node.subscribe();

    let stranger = Signer::new();
    let session = stranger.session(1);
    let (log, _) = stranger.log(
        session,
        now_millis() + 1,
        &[MapEdit::new().set("k", "stranger").into_changes()],
    )?;
    let raw = RawPeer::connect(&node, "raw", PeerRole::Client);
    raw.send(&SyncMessage::Content(stranger.content(map, &log, 0)?))
        .await?;

    // Validly signed, so it is stored, but it does not count.
    eventually(SETTLE, || {
        node.known_state(&map)
            .is_some_and(|known| known.count(&session) == 1)
    })
    .await?;
    assert_eq!(node.content(&map)?.to_json(), json!({"k": "owner"}));

    let invalid = node.invalid_transactions(&map)?;
    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0].id.session, session);

    let mut reported = false;
    while let Ok(event) = events.try_recv() {
        if let NodeEvent::TransactionRejected { id, transaction, .. } = event {
            assert_eq!(id, map);
            assert_eq!(transaction, Some(invalid[0].id));
            reported = true;
        }
    }
    assert!(reported);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn everyone_reader_opens_private_content() -> anyhow::Result<()> {
    let network = pair();
    let (a, b) = (network.node(0), network.node(1));

    let group = a.create_group()?;
    a.add_member(&group, MemberId::Everyone, Role::Reader)?;
    let map = a.create_map(&group)?;
    a.edit_map(&map, MapEdit::new().set("hello", "world"), Privacy::Private)?;

    b.load(&map.to_string()).await?;
    network.converged(&map, SETTLE).await?;
    assert_eq!(b.role_of(&group, b.agent_id())?, Some(Role::Reader));
    assert_eq!(b.content(&map)?.to_json(), json!({"hello": "world"}));
    assert!(!b.edit_map(&map, MapEdit::new().set("hello", "b"), Privacy::Private)?);
    Ok(())
}

#[tokio::test]
async fn everyone_cannot_be_made_admin() -> anyhow::Result<()> {
    init_tracing();
    let node = LocalNode::new(test_config());
    let group = node.create_group()?;
    let result = node.add_member(&group, MemberId::Everyone, Role::Admin);
    assert!(matches!(result, Err(NodeError::PermissionDenied(_))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parent_readers_read_extended_child() -> anyhow::Result<()> {
    let network = pair();
    let (a, b) = (network.node(0), network.node(1));

    let parent = a.create_group()?;
    a.add_member(&parent, *b.agent_id(), Role::Reader)?;
    let child = a.create_group()?;
    a.extend_group(&child, &parent)?;
    let map = a.create_map(&child)?;
    a.edit_map(&map, MapEdit::new().set("from", "child"), Privacy::Private)?;

    b.load(&map.to_string()).await?;
    eventually(SETTLE, || {
        b.content(&map)
            .is_ok_and(|content| content.to_json() == json!({"from": "child"}))
    })
    .await?;
    assert_eq!(b.role_of(&child, b.agent_id())?, Some(Role::Reader));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deep_load_names_the_failing_path() -> anyhow::Result<()> {
    let network = pair();
    let (a, b) = (network.node(0), network.node(1));

    // Not a member at all.
    let closed = a.create_group()?;
    let secret = a.create_map(&closed)?;
    let err = b.load_deep(&secret.to_string(), 2).await.unwrap_err();
    assert!(
        matches!(&err, NodeError::Unauthorized { id, path } if *id == secret && path.is_empty()),
        "{err}"
    );

    // Readable, but referencing something nobody has.
    let open = a.create_group()?;
    a.add_member(&open, *b.agent_id(), Role::Reader)?;
    let elsewhere = LocalNode::new(test_config());
    let missing = elsewhere.create_group()?;
    let root = a.create_map(&open)?;
    a.edit_map(
        &root,
        MapEdit::new().set("child", missing.to_string()),
        Privacy::Trusting,
    )?;

    let err = b.load_deep(&root.to_string(), 2).await.unwrap_err();
    assert!(
        matches!(&err, NodeError::Unavailable { id, path } if *id == missing && path == &["child"]),
        "{err}"
    );

    // Depth zero stops before the reference.
    assert_eq!(b.load_deep(&root.to_string(), 0).await?, vec![root]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manager_cannot_remove_admin() -> anyhow::Result<()> {
    let network = pair();
    let (a, b) = (network.node(0), network.node(1));

    let group = a.create_group()?;
    a.add_member(&group, *b.agent_id(), Role::Manager)?;
    b.load(&group.to_string()).await?;
    eventually(SETTLE, || {
        b.role_of(&group, b.agent_id()).ok().flatten() == Some(Role::Manager)
    })
    .await?;

    let result = b.remove_member(&group, *a.agent_id());
    assert!(matches!(result, Err(NodeError::PermissionDenied(_))), "{result:?}");
    assert_eq!(b.role_of(&group, a.agent_id())?, Some(Role::Admin));

    // Below admin is fine.
    let writer = Signer::new();
    b.add_member(&group, writer.id, Role::Writer)?;
    network.converged(&group, SETTLE).await?;
    assert_eq!(a.role_of(&group, &writer.id)?, Some(Role::Writer));
    Ok(())
}
