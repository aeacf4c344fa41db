//! Peer bookkeeping and the load / known / content protocol.
//!
//! Handlers run under the node lock and only enqueue outgoing messages; the
//! per-peer writer task does the actual sending. Each CoValue is pushed to
//! a peer after its dependencies (owning group, parent groups), so a peer
//! can always validate what it receives.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use covalue_core::{AddOutcome, CoId, KnownState, TransactionId};
use covalue_sync::{
    decode, encode, ContentMessage, KnownMessage, PeerConnection, PeerId, PeerRole, PeerState,
    SyncMessage,
};

use crate::value::CoValueCore;
use crate::events::NodeEvent;
use crate::load::LoadOutcome;
use crate::node::{NodeInner, NodeState};
use crate::registry::Registry;

/// Work for the inbound task.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message {
        peer: PeerId,
        generation: u64,
        message: SyncMessage,
    },
    /// The peer's connection reached end-of-stream.
    Closed { peer: PeerId, generation: u64 },
}

pub(crate) struct PeerEntry {
    pub state: PeerState,
    /// Stops this connection's reader.
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub(crate) struct SyncManager {
    pub peers: HashMap<PeerId, PeerEntry>,
    next_generation: u64,
}

impl SyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn send(&self, peer: &PeerId, message: SyncMessage) {
        if let Some(entry) = self.peers.get(peer) {
            entry.state.send(message);
        }
    }

    /// Forget the oldest closed peers beyond `max`. Returns the evicted ids.
    fn evict_closed(&mut self, max: usize) -> Vec<PeerId> {
        let mut closed: Vec<(u64, PeerId)> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.state.is_closed())
            .map(|(id, entry)| (entry.state.generation(), id.clone()))
            .collect();
        if closed.len() <= max {
            return Vec::new();
        }
        closed.sort();
        let excess = closed.len() - max;
        closed
            .into_iter()
            .take(excess)
            .map(|(_, id)| {
                self.peers.remove(&id);
                id
            })
            .collect()
    }
}

/// Bring `peer` up to date on `id`, dependencies first.
fn push_to_peer(registry: &Registry, peer: &mut PeerState, id: CoId, visited: &mut HashSet<CoId>) {
    if !visited.insert(id) || peer.is_closed() || peer.is_errored(&id) {
        return;
    }
    let Some(core) = registry.get(&id) else {
        return;
    };
    for dependency in core.dependencies(&registry.resolver()) {
        push_to_peer(registry, peer, dependency, visited);
    }

    if peer.track(id) {
        peer.send(SyncMessage::Load(core.known_state()));
    }
    if let Some(content) = core.content_since(peer.optimistic_known_state(&id)) {
        peer.expect(&content.implied_known_state());
        peer.send(SyncMessage::Content(content));
    }
}

impl NodeInner {
    // ─────────────────────────────────────────────────────────────────────────
    // Peer Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn add_peer(self: &Arc<Self>, id: PeerId, role: PeerRole, connection: PeerConnection) {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let generation = state.sync.next_generation();

        let peer_state = match state.sync.peers.remove(&id) {
            Some(mut previous) => {
                previous.cancel.cancel();
                if previous.state.close() {
                    self.disconnected(&id, previous.state.role(), "replaced");
                }
                PeerState::replacing(&previous.state, role, generation, outbox_tx)
            }
            None => PeerState::new(id.clone(), role, generation, outbox_tx),
        };
        state.sync.peers.insert(
            id.clone(),
            PeerEntry {
                state: peer_state,
                cancel: cancel.clone(),
            },
        );
        self.metrics.peer_connected(role);
        self.emit(NodeEvent::PeerConnected {
            peer: id.clone(),
            role,
        });
        tracing::info!(peer = %id, %role, generation, "peer connected");

        // Resume everything this peer syncs.
        let NodeState { registry, sync, .. } = &mut *state;
        if let Some(entry) = sync.peers.get_mut(&id) {
            let mut visited = HashSet::new();
            for covalue in registry.ids() {
                if entry.state.wants(&covalue) {
                    push_to_peer(registry, &mut entry.state, covalue, &mut visited);
                }
            }
        }

        // A new peer may have what earlier loads could not find.
        let retry: Vec<CoId> = state.loads.unavailable.drain().collect();
        for covalue in retry {
            self.start_load(state, covalue);
        }
        drop(guard);

        let (outgoing, incoming) = connection.split();
        tokio::spawn(read_loop(
            self.inbound.clone(),
            incoming,
            id.clone(),
            generation,
            cancel,
        ));
        tokio::spawn(write_loop(outbox_rx, outgoing, id, self.shutdown.clone()));
    }

    /// Close `peer`. Returns `true` if it was open.
    pub(crate) fn close_peer(&self, state: &mut NodeState, peer: &PeerId, reason: &str) -> bool {
        let Some(entry) = state.sync.peers.get_mut(peer) else {
            return false;
        };
        entry.cancel.cancel();
        let role = entry.state.role();
        let closed = entry.state.close();
        if closed {
            self.disconnected(peer, role, reason);
        }
        if self.config.delete_peer_state_on_close {
            state.sync.peers.remove(peer);
        } else {
            for evicted in state.sync.evict_closed(self.config.max_closed_peers) {
                tracing::debug!(peer = %evicted, "forgot closed peer");
            }
        }

        for covalue in state.loads.peer_gone(peer) {
            self.finish_load(state, covalue, LoadOutcome::Unavailable);
        }
        self.bump_progress();
        closed
    }

    fn disconnected(&self, peer: &PeerId, role: PeerRole, reason: &str) {
        self.metrics.peer_disconnected(role);
        self.emit(NodeEvent::PeerDisconnected {
            peer: peer.clone(),
            role,
        });
        tracing::info!(peer = %peer, %role, reason, "peer disconnected");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound Messages
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn handle_inbound(self: &Arc<Self>, item: Inbound) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        match item {
            Inbound::Message {
                peer,
                generation,
                message,
            } => {
                let Some(entry) = state.sync.peers.get(&peer) else {
                    return;
                };
                if entry.state.generation() != generation || entry.state.is_closed() {
                    tracing::trace!(peer = %peer, generation, "dropping message from old connection");
                    return;
                }
                let id = *message.id();
                if entry.state.is_errored(&id) {
                    tracing::debug!(peer = %peer, covalue = %id, "ignoring errored CoValue");
                    return;
                }
                tracing::trace!(peer = %peer, action = message.action(), covalue = %id, "received");

                match message {
                    SyncMessage::Load(known) => self.handle_load(state, &peer, known),
                    SyncMessage::Known(known) => self.handle_known(state, &peer, known),
                    SyncMessage::Content(content) => self.handle_content(state, &peer, content),
                }
                self.bump_progress();
            }
            Inbound::Closed { peer, generation } => {
                let current = state
                    .sync
                    .peers
                    .get(&peer)
                    .is_some_and(|entry| entry.state.generation() == generation);
                if current {
                    self.close_peer(state, &peer, "connection closed");
                }
            }
        }
    }

    /// The peer wants `known.id` and reports holding `known`.
    fn handle_load(self: &Arc<Self>, state: &mut NodeState, peer: &PeerId, known: KnownState) {
        let id = known.id;
        let Some(entry) = state.sync.peers.get_mut(peer) else {
            return;
        };
        entry.state.subscribe(id);
        entry.state.correct(known.clone());

        if state.registry.contains(&id) {
            self.answer_load(state, peer, id);
            return;
        }

        if state.loads.is_pending(&id) {
            if state.loads.was_asked(&id, peer) {
                // Both sides are looking for it.
                state.sync.send(peer, SyncMessage::known(KnownState::empty(id)));
            } else {
                state.loads.defer(&id, peer.clone());
            }
            return;
        }

        let relay = !known.header
            && state.sync.peers.iter().any(|(other, entry)| {
                other != peer && entry.state.role() == PeerRole::Server && !entry.state.is_closed()
            });
        if relay {
            tracing::debug!(peer = %peer, covalue = %id, "relaying load");
            self.start_load(state, id);
            state.loads.defer(&id, peer.clone());
            return;
        }

        state.sync.send(peer, SyncMessage::known(KnownState::empty(id)));
    }

    /// Reply to a load of `id` with what this node holds.
    pub(crate) fn answer_load(&self, state: &mut NodeState, peer: &PeerId, id: CoId) {
        let NodeState { registry, sync, .. } = state;
        let Some(entry) = sync.peers.get_mut(peer) else {
            return;
        };
        match registry.get(&id) {
            Some(core) => {
                entry.state.send(SyncMessage::known(core.known_state()));
                push_to_peer(registry, &mut entry.state, id, &mut HashSet::new());
            }
            None => {
                entry.state.send(SyncMessage::known(KnownState::empty(id)));
            }
        }
    }

    fn handle_known(self: &Arc<Self>, state: &mut NodeState, peer: &PeerId, message: KnownMessage) {
        let KnownMessage {
            known,
            is_correction,
        } = message;
        let id = known.id;
        let Some(entry) = state.sync.peers.get_mut(peer) else {
            return;
        };
        if is_correction {
            tracing::debug!(peer = %peer, covalue = %id, "known state corrected");
            entry.state.correct(known.clone());
        } else {
            entry.state.acknowledge(&known);
        }

        if !known.header && state.loads.decline(&id, peer) {
            self.finish_load(state, id, LoadOutcome::Unavailable);
            return;
        }

        let NodeState { registry, sync, .. } = state;
        if let Some(entry) = sync.peers.get_mut(peer) {
            push_to_peer(registry, &mut entry.state, id, &mut HashSet::new());
        }
    }

    fn handle_content(self: &Arc<Self>, state: &mut NodeState, peer: &PeerId, content: ContentMessage) {
        let id = content.id;
        let mut implied = content.implied_known_state();
        if let Some(entry) = state.sync.peers.get_mut(peer) {
            entry.state.subscribe(id);
        }

        let mut created = false;
        match (state.registry.contains(&id), content.header) {
            (true, Some(header)) => {
                if !header.matches(&id, self.crypto.as_ref()) {
                    self.header_mismatch(state, peer, id);
                    return;
                }
            }
            (true, None) => {}
            (false, Some(header)) => match CoValueCore::verified(id, header, self.crypto.clone()) {
                Ok(core) => {
                    state.registry.insert(core);
                    created = true;
                }
                Err(_) => {
                    self.header_mismatch(state, peer, id);
                    return;
                }
            },
            (false, None) => {
                tracing::debug!(peer = %peer, covalue = %id, "content without header");
                state
                    .sync
                    .send(peer, SyncMessage::correction(KnownState::empty(id)));
                return;
            }
        }

        let invalid_before = self.invalid_ids(&state.registry, &id);
        let mut applied = created;
        let mut need_correction = false;
        let mut rejected = Vec::new();
        if let Some(core) = state.registry.get_mut(&id) {
            for (session, batch) in content.new {
                match core.try_add_transactions(
                    session,
                    batch.after,
                    batch.new_transactions,
                    batch.last_signature,
                ) {
                    Ok(AddOutcome::Applied { .. }) => applied = true,
                    Ok(AddOutcome::AlreadyKnown) => {}
                    Ok(AddOutcome::Buffered { tip, after }) => {
                        tracing::debug!(peer = %peer, covalue = %id, %session, tip, after, "gap, buffered");
                        need_correction = true;
                    }
                    Err(e) => {
                        // The peer's cursor for this session stays where it was.
                        implied.sessions.remove(&session);
                        rejected.push(e.to_string());
                    }
                }
            }
        }

        let Some(ours) = state.registry.get(&id).map(|core| core.known_state()) else {
            return;
        };
        if let Some(entry) = state.sync.peers.get_mut(peer) {
            entry.state.acknowledge(&implied);
            entry.state.send(if need_correction {
                SyncMessage::correction(ours)
            } else {
                SyncMessage::known(ours)
            });
        }

        for reason in rejected {
            self.emit(NodeEvent::TransactionRejected {
                id,
                transaction: None,
                reason,
            });
        }
        if !applied {
            return;
        }

        state.registry.changed(&id);
        self.emit(NodeEvent::CoValueUpdated { id });
        for invalid in self.invalid_ids_detailed(&state.registry, &id) {
            if invalid_before.contains(&invalid.id) {
                continue;
            }
            tracing::warn!(covalue = %id, transaction = ?invalid.id, reason = %invalid.reason, "transaction not permitted");
            self.emit(NodeEvent::TransactionRejected {
                id,
                transaction: Some(invalid.id),
                reason: invalid.reason,
            });
        }

        if created {
            state.loads.unavailable.remove(&id);
            self.finish_load(state, id, LoadOutcome::Available);
            let missing: Vec<CoId> = state
                .registry
                .get(&id)
                .map(|core| core.dependencies(&state.registry.resolver()))
                .unwrap_or_default()
                .into_iter()
                .filter(|dependency| !state.registry.contains(dependency))
                .collect();
            for dependency in missing {
                self.start_load(state, dependency);
            }
        }
        self.sync_covalue(state, id);
    }

    fn header_mismatch(&self, state: &mut NodeState, peer: &PeerId, id: CoId) {
        tracing::warn!(peer = %peer, covalue = %id, "header does not hash to id");
        if let Some(entry) = state.sync.peers.get_mut(peer) {
            entry.state.mark_errored(id);
        }
    }

    fn invalid_ids(&self, registry: &Registry, id: &CoId) -> HashSet<TransactionId> {
        self.invalid_ids_detailed(registry, id)
            .into_iter()
            .map(|invalid| invalid.id)
            .collect()
    }

    fn invalid_ids_detailed(
        &self,
        registry: &Registry,
        id: &CoId,
    ) -> Vec<covalue_perms::InvalidTransaction> {
        registry
            .get(id)
            .map(|core| core.invalid_transactions(&registry.resolver()))
            .unwrap_or_default()
    }

    /// Push `id` to every peer that syncs it.
    pub(crate) fn sync_covalue(&self, state: &mut NodeState, id: CoId) {
        let NodeState { registry, sync, .. } = state;
        for entry in sync.peers.values_mut() {
            if entry.state.wants(&id) {
                push_to_peer(registry, &mut entry.state, id, &mut HashSet::new());
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection Tasks
// ─────────────────────────────────────────────────────────────────────────────

async fn read_loop(
    inbound: mpsc::Sender<Inbound>,
    mut incoming: mpsc::Receiver<String>,
    peer: PeerId,
    generation: u64,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = incoming.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        match decode(&frame) {
            Ok(message) => {
                let item = Inbound::Message {
                    peer: peer.clone(),
                    generation,
                    message,
                };
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = inbound.send(item) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => tracing::debug!(peer = %peer, error = %e, "dropping malformed frame"),
        }
    }
    let _ = inbound.send(Inbound::Closed { peer, generation }).await;
}

async fn write_loop(
    mut outbox: mpsc::UnboundedReceiver<SyncMessage>,
    outgoing: mpsc::Sender<String>,
    peer: PeerId,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = outbox.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let frame = match encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "failed to encode message");
                continue;
            }
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = outgoing.send(frame) => {
                if sent.is_err() {
                    tracing::debug!(peer = %peer, "remote end closed");
                    break;
                }
            }
        }
    }
    tracing::debug!(peer = %peer, "writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use covalue_core::{MapEdit, Privacy, SessionId, SessionLog, Signature, Transaction};
    use covalue_sync::{duplex, SessionContent};

    use crate::{LocalNode, NodeConfig};

    async fn recv(conn: &mut PeerConnection) -> SyncMessage {
        let frame = tokio::time::timeout(Duration::from_secs(5), conn.recv())
            .await
            .expect("timed out")
            .expect("closed");
        decode(&frame).unwrap()
    }

    /// Skip pushes until the node answers about `id`.
    async fn recv_known(conn: &mut PeerConnection, id: CoId) -> KnownMessage {
        loop {
            if let SyncMessage::Known(known) = recv(conn).await {
                if known.known.id == id {
                    return known;
                }
            }
        }
    }

    fn batch(log: &SessionLog, after: usize, last_signature: Signature) -> SessionContent {
        SessionContent {
            after,
            new_transactions: log.transactions_since(after).to_vec(),
            last_signature,
        }
    }

    #[tokio::test]
    async fn test_rejected_batch_not_acknowledged_for_peer() {
        let node = LocalNode::new(NodeConfig::default());
        let group = node.create_group().unwrap();
        let map = node.create_map(&group).unwrap();
        let (ours, mut theirs) = duplex(64);
        node.add_peer("raw", PeerRole::Client, ours);
        let peer = PeerId::from("raw");

        let crypto = node.crypto().clone();
        let secret = crypto.new_agent_secret();
        let session = SessionId::new(crypto.agent_id(&secret), [3; 8]);
        let mut log = SessionLog::new(session);
        let tx = Transaction::trusting(1, &MapEdit::new().set("k", 1).into_changes()).unwrap();
        let signature = log.append_local(tx, &secret.signer, crypto.as_ref()).unwrap();

        let mut forged = ContentMessage::new(map);
        forged.new.insert(session, batch(&log, 0, Signature([0; 64])));
        theirs.send(encode(&SyncMessage::Content(forged)).unwrap()).await.unwrap();
        let reply = recv_known(&mut theirs, map).await;
        assert_eq!(reply.known.count(&session), 0);

        assert_eq!(node.known_state(&map).unwrap().count(&session), 0);
        assert_eq!(node.peer_known_state(&peer, &map).unwrap().count(&session), 0);

        // The same session from the same peer is still accepted once signed.
        let mut valid = ContentMessage::new(map);
        valid.new.insert(session, batch(&log, 0, signature));
        theirs.send(encode(&SyncMessage::Content(valid)).unwrap()).await.unwrap();
        let reply = recv_known(&mut theirs, map).await;
        assert_eq!(reply.known.count(&session), 1);

        assert_eq!(node.known_state(&map).unwrap().count(&session), 1);
        assert_eq!(node.peer_known_state(&peer, &map).unwrap().count(&session), 1);
    }

    #[tokio::test]
    async fn test_server_peer_receives_group_before_map() {
        let node = LocalNode::new(NodeConfig::default());
        let group = node.create_group().unwrap();
        let map = node.create_map(&group).unwrap();
        node.edit_map(&map, MapEdit::new().set("k", "v"), Privacy::Trusting)
            .unwrap();

        let (ours, mut theirs) = duplex(64);
        node.add_peer("raw", PeerRole::Server, ours);

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(recv(&mut theirs).await);
        }
        assert_eq!(order[0].action(), "load");
        assert_eq!(*order[0].id(), group);
        assert_eq!(order[1].action(), "content");
        assert_eq!(*order[1].id(), group);
        assert_eq!(*order[2].id(), map);
        assert_eq!(*order[3].id(), map);
    }

    #[tokio::test]
    async fn test_unknown_load_answered_with_empty_known() {
        let node = LocalNode::new(NodeConfig::default());
        let (ours, mut theirs) = duplex(64);
        node.add_peer("raw", PeerRole::Client, ours);

        let missing = CoId([9; 32]);
        theirs
            .send(encode(&SyncMessage::Load(KnownState::empty(missing))).unwrap())
            .await
            .unwrap();
        match recv(&mut theirs).await {
            SyncMessage::Known(known) => {
                assert_eq!(known.known, KnownState::empty(missing));
                assert!(!known.is_correction);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_content_without_header_gets_correction() {
        let node = LocalNode::new(NodeConfig::default());
        let (ours, mut theirs) = duplex(64);
        node.add_peer("raw", PeerRole::Client, ours);

        let id = CoId([5; 32]);
        theirs
            .send(encode(&SyncMessage::Content(ContentMessage::new(id))).unwrap())
            .await
            .unwrap();
        match recv(&mut theirs).await {
            SyncMessage::Known(known) => assert!(known.is_correction),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let node = LocalNode::new(NodeConfig::default());
        let (ours, mut theirs) = duplex(64);
        node.add_peer("raw", PeerRole::Client, ours);

        theirs.send("not json".into()).await.unwrap();
        theirs
            .send(r#"{"action":"load","id":"","header":false,"sessions":{}}"#.into())
            .await
            .unwrap();
        let missing = CoId([9; 32]);
        theirs
            .send(encode(&SyncMessage::Load(KnownState::empty(missing))).unwrap())
            .await
            .unwrap();

        // Only the well-formed load is answered.
        assert_eq!(*recv(&mut theirs).await.id(), missing);
        assert_eq!(node.is_peer_closed(&PeerId::from("raw")), Some(false));
    }

    #[tokio::test]
    async fn test_closed_peers_beyond_limit_are_forgotten() {
        let node = LocalNode::new(NodeConfig::default().with_max_closed_peers(1));
        let mut ends = Vec::new();
        for id in ["a", "b", "c", "d"] {
            let (ours, theirs) = duplex(64);
            node.add_peer(id, PeerRole::Client, ours);
            ends.push(theirs);
        }

        assert!(node.remove_peer(&PeerId::from("a")));
        assert_eq!(node.peers().len(), 4);
        assert!(node.remove_peer(&PeerId::from("b")));
        assert!(node.remove_peer(&PeerId::from("c")));

        let peers: Vec<String> = node.peers().iter().map(|p| p.to_string()).collect();
        assert_eq!(peers, vec!["c", "d"]);
        assert_eq!(node.is_peer_closed(&PeerId::from("c")), Some(true));
        assert_eq!(node.is_peer_closed(&PeerId::from("a")), None);
    }

    #[tokio::test]
    async fn test_dropped_connection_closes_peer() {
        let node = LocalNode::new(NodeConfig::default());
        let metrics = node.metrics();
        let (ours, theirs) = duplex(64);
        node.add_peer("raw", PeerRole::Client, ours);
        assert_eq!(metrics.connected(PeerRole::Client), 1);

        drop(theirs);
        let peer = PeerId::from("raw");
        for _ in 0..100 {
            if node.is_peer_closed(&peer) == Some(true) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(node.is_peer_closed(&peer), Some(true));
        assert_eq!(metrics.connected(PeerRole::Client), 0);
    }
}
