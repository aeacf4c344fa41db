//! The LocalNode: identity, resident CoValues and peers behind one lock.
//!
//! Every mutation, local or from a peer, happens under the node's state lock
//! and never awaits while holding it. Peer I/O runs in per-peer reader and
//! writer tasks; one inbound task applies everything peers send, in arrival
//! order.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use covalue_core::{
    AgentId, AgentSecret, CoId, CoValueContent, CoValueKind, CryptoProvider, DalekCrypto,
    DecodedTransaction, Header, KnownState, ListEdit, MapEdit, Privacy, SessionId, StreamEdit,
};
use covalue_core::types::SESSION_NONCE_LEN;
use covalue_perms::{
    add_member_changes, can_read_owned, extend_group_changes, remove_member_changes,
    rotate_read_key_changes, GroupResolver, GroupState, InvalidTransaction, MemberId, Role,
};
use covalue_store::Storage;
use covalue_sync::{duplex, PeerConnection, PeerId, PeerMetrics, PeerRole, SyncError};

use crate::config::NodeConfig;
use crate::value::{Author, RejectedBatch};
use crate::error::{NodeError, Result};
use crate::events::{NodeEvent, EVENT_CAPACITY};
use crate::load::{LoadOutcome, Loads};
use crate::registry::Registry;
use crate::storage_peer::StoragePeer;
use crate::sync_manager::{Inbound, SyncManager};

/// Everything guarded by the node lock.
pub(crate) struct NodeState {
    pub registry: Registry,
    pub sync: SyncManager,
    pub loads: Loads,
}

pub(crate) struct NodeInner {
    pub agent: AgentSecret,
    pub agent_id: AgentId,
    pub session: SessionId,
    pub crypto: Arc<dyn CryptoProvider>,
    pub config: NodeConfig,
    pub state: Mutex<NodeState>,
    pub inbound: mpsc::Sender<Inbound>,
    pub events: broadcast::Sender<NodeEvent>,
    /// Bumped after every change a waiter could be waiting for.
    pub progress: watch::Sender<u64>,
    pub metrics: Arc<PeerMetrics>,
    pub shutdown: CancellationToken,
}

impl NodeInner {
    pub(crate) fn author(&self) -> Author<'_> {
        Author {
            secret: &self.agent,
            id: self.agent_id,
            session: self.session,
        }
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn bump_progress(&self) {
        self.progress.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Author a transaction on a resident CoValue and sync it out.
    fn commit(
        &self,
        state: &mut NodeState,
        id: &CoId,
        changes: &[Value],
        privacy: Privacy,
    ) -> Result<bool> {
        let author = self.author();
        let (core, snapshot) = state
            .registry
            .split_mut(id)
            .ok_or(NodeError::NotFound(*id))?;
        if !core.make_transaction(changes, privacy, now_millis(), &author, &snapshot) {
            return Ok(false);
        }
        self.local_change(state, *id);
        Ok(true)
    }

    /// Propagate a change made on this node.
    fn local_change(&self, state: &mut NodeState, id: CoId) {
        state.registry.changed(&id);
        self.emit(NodeEvent::CoValueUpdated { id });
        self.sync_covalue(state, id);
        self.bump_progress();
    }

    /// A resident core of `kind`.
    fn expect_kind(state: &NodeState, id: &CoId, kind: CoValueKind) -> Result<()> {
        let core = state.registry.get(id).ok_or(NodeError::NotFound(*id))?;
        if core.kind() != kind {
            return Err(NodeError::WrongKind {
                id: *id,
                expected: kind,
                actual: core.kind(),
            });
        }
        Ok(())
    }

    fn insert_local(&self, state: &mut NodeState, header: Header) -> Result<CoId> {
        let core = crate::value::CoValueCore::new(header, self.crypto.clone())?;
        let id = *core.id();
        if !state.registry.contains(&id) {
            state.registry.insert(core);
            state.loads.unavailable.remove(&id);
            tracing::debug!(covalue = %id, "created");
        }
        Ok(id)
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A local-first node.
///
/// Cheap to clone; clones share the same node. Must be created inside a
/// Tokio runtime.
#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<NodeInner>,
}

impl LocalNode {
    /// A node with a fresh agent and the default crypto provider.
    pub fn new(config: NodeConfig) -> Self {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(DalekCrypto::new());
        let agent = crypto.new_agent_secret();
        Self::with_agent(agent, crypto, config)
    }

    /// A node acting as `agent`, in a new session.
    pub fn with_agent(
        agent: AgentSecret,
        crypto: Arc<dyn CryptoProvider>,
        config: NodeConfig,
    ) -> Self {
        let agent_id = crypto.agent_id(&agent);
        let mut nonce = [0u8; SESSION_NONCE_LEN];
        for (slot, byte) in nonce.iter_mut().zip(crypto.random_bytes(SESSION_NONCE_LEN)) {
            *slot = byte;
        }
        let session = SessionId::new(agent_id, nonce);

        let (inbound_tx, inbound_rx) = mpsc::channel(config.sync.inbound_capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (progress, _) = watch::channel(0);
        let shutdown = CancellationToken::new();

        let inner = Arc::new(NodeInner {
            agent,
            agent_id,
            session,
            crypto,
            config,
            state: Mutex::new(NodeState {
                registry: Registry::new(),
                sync: SyncManager::new(),
                loads: Loads::new(),
            }),
            inbound: inbound_tx,
            events,
            progress,
            metrics: Arc::new(PeerMetrics::new()),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(run_inbound(Arc::downgrade(&inner), inbound_rx, shutdown));
        tracing::info!(agent = %agent_id, session = %session, "node started");
        Self { inner }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.inner.agent_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.inner.crypto
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Peer-count gauges.
    pub fn metrics(&self) -> Arc<PeerMetrics> {
        self.inner.metrics.clone()
    }

    /// Subscribe to node events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    fn uniqueness(&self) -> String {
        hex::encode(self.inner.crypto.random_bytes(12))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creating CoValues
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a group with this node's agent as its admin.
    pub fn create_group(&self) -> Result<CoId> {
        let header = Header::group(self.inner.agent_id, self.uniqueness(), now_millis());
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let id = self.inner.insert_local(state, header)?;

        let changes =
            covalue_perms::initial_group_changes(&id, &self.inner.agent, self.inner.crypto.as_ref())?;
        if !self.inner.commit(state, &id, &changes, Privacy::Trusting)? {
            return Err(NodeError::PermissionDenied(format!("could not bootstrap {id}")));
        }
        tracing::info!(group = %id, "group created");
        Ok(id)
    }

    pub fn create_map(&self, group: &CoId) -> Result<CoId> {
        self.create_owned(CoValueKind::Map, group)
    }

    pub fn create_list(&self, group: &CoId) -> Result<CoId> {
        self.create_owned(CoValueKind::List, group)
    }

    pub fn create_stream(&self, group: &CoId) -> Result<CoId> {
        self.create_owned(CoValueKind::Stream, group)
    }

    fn create_owned(&self, kind: CoValueKind, group: &CoId) -> Result<CoId> {
        let header = Header::owned_by(kind, *group, self.uniqueness(), now_millis());
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        NodeInner::expect_kind(state, group, CoValueKind::Group)?;
        let id = self.inner.insert_local(state, header)?;
        self.inner.local_change(state, id);
        Ok(id)
    }

    /// Make a CoValue resident from an explicit header.
    pub fn create_covalue(&self, header: Header) -> Result<CoId> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let id = self.inner.insert_local(state, header)?;
        self.inner.local_change(state, id);
        Ok(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writing
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a transaction with `changes` in this node's session.
    ///
    /// Returns `Ok(false)` if this agent may not write to `id`, or if a
    /// private transaction has no usable read key.
    pub fn make_transaction(&self, id: &CoId, changes: &[Value], privacy: Privacy) -> Result<bool> {
        let mut guard = self.inner.state.lock();
        self.inner.commit(&mut guard, id, changes, privacy)
    }

    pub fn edit_map(&self, id: &CoId, edit: MapEdit, privacy: Privacy) -> Result<bool> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        NodeInner::expect_kind(state, id, CoValueKind::Map)?;
        self.inner.commit(state, id, &edit.into_changes(), privacy)
    }

    /// Edit a list against its current content.
    pub fn edit_list<F>(&self, id: &CoId, privacy: Privacy, build: F) -> Result<bool>
    where
        F: FnOnce(&mut ListEdit) -> std::result::Result<(), covalue_core::CoreError>,
    {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        NodeInner::expect_kind(state, id, CoValueKind::List)?;

        let epoch = state.registry.epoch();
        let (core, snapshot) = state
            .registry
            .split_mut(id)
            .ok_or(NodeError::NotFound(*id))?;
        let content = core.current_content(epoch, &self.inner.agent, &snapshot);
        let mut edit = match content.as_list() {
            Some(list) => ListEdit::new(list),
            None => ListEdit::empty(),
        };
        build(&mut edit)?;
        self.inner.commit(state, id, &edit.into_changes(), privacy)
    }

    pub fn push_stream(&self, id: &CoId, value: impl Into<Value>, privacy: Privacy) -> Result<bool> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        NodeInner::expect_kind(state, id, CoValueKind::Stream)?;
        let changes = StreamEdit::new().push(value).into_changes();
        self.inner.commit(state, id, &changes, privacy)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    fn edit_group<F>(&self, group: &CoId, build: F) -> Result<()>
    where
        F: FnOnce(&GroupState, &dyn GroupResolver) -> covalue_perms::Result<Vec<Value>>,
    {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        NodeInner::expect_kind(state, group, CoValueKind::Group)?;

        let changes = {
            let resolver = state.registry.resolver();
            let current = resolver
                .group(group)
                .ok_or_else(|| NodeError::PermissionDenied(format!("{group} does not replay")))?;
            build(&current, &resolver).map_err(|e| match e {
                covalue_perms::PermsError::PermissionDenied(msg) => NodeError::PermissionDenied(msg),
                other => NodeError::Perms(other),
            })?
        };
        if !self.inner.commit(state, group, &changes, Privacy::Trusting)? {
            return Err(NodeError::PermissionDenied(format!(
                "ledger change refused in {group}"
            )));
        }
        Ok(())
    }

    /// Give `member` a role in `group`, sealing the current read key for it
    /// if the role can read.
    pub fn add_member(&self, group: &CoId, member: impl Into<MemberId>, role: Role) -> Result<()> {
        let member = member.into();
        let inner = &self.inner;
        self.edit_group(group, |state, resolver| {
            add_member_changes(state, member, role, &inner.agent, inner.crypto.as_ref(), resolver)
        })
    }

    /// Revoke `member` and rotate the group's read key.
    pub fn remove_member(&self, group: &CoId, member: impl Into<MemberId>) -> Result<()> {
        let member = member.into();
        let inner = &self.inner;
        self.edit_group(group, |state, resolver| {
            remove_member_changes(state, member, &inner.agent, inner.crypto.as_ref(), resolver)
        })
    }

    /// Rotate the group's read key without changing membership.
    pub fn rotate_read_key(&self, group: &CoId) -> Result<()> {
        let inner = &self.inner;
        self.edit_group(group, |state, resolver| {
            rotate_read_key_changes(state, &inner.agent, inner.crypto.as_ref(), resolver)
        })
    }

    /// Make `child` inherit the members of `parent`.
    pub fn extend_group(&self, child: &CoId, parent: &CoId) -> Result<()> {
        {
            let state = self.inner.state.lock();
            NodeInner::expect_kind(&state, parent, CoValueKind::Group)?;
        }
        let inner = &self.inner;
        let parent_id = *parent;
        self.edit_group(child, |state, resolver| {
            let parent = resolver.group(&parent_id).ok_or_else(|| {
                covalue_perms::PermsError::NotAGroup(parent_id.to_string())
            })?;
            extend_group_changes(state, &parent, &inner.agent, inner.crypto.as_ref(), resolver)
        })
    }

    /// The current role of `agent` in `group`.
    pub fn role_of(&self, group: &CoId, agent: &AgentId) -> Result<Option<Role>> {
        let state = self.inner.state.lock();
        NodeInner::expect_kind(&state, group, CoValueKind::Group)?;
        let resolver = state.registry.resolver();
        Ok(resolver
            .group(group)
            .and_then(|g| g.role_of(agent, i64::MAX, &resolver)))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reading
    // ─────────────────────────────────────────────────────────────────────────

    /// Merged content of a resident CoValue.
    pub fn content(&self, id: &CoId) -> Result<CoValueContent> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let epoch = state.registry.epoch();
        let (core, snapshot) = state
            .registry
            .split_mut(id)
            .ok_or(NodeError::NotFound(*id))?;
        Ok(core.current_content(epoch, &self.inner.agent, &snapshot))
    }

    pub fn known_state(&self, id: &CoId) -> Option<KnownState> {
        self.inner
            .state
            .lock()
            .registry
            .get(id)
            .map(|core| core.known_state())
    }

    pub fn header(&self, id: &CoId) -> Option<Header> {
        self.inner
            .state
            .lock()
            .registry
            .get(id)
            .map(|core| core.header().clone())
    }

    /// Resident ids, sorted.
    pub fn resident(&self) -> Vec<CoId> {
        self.inner.state.lock().registry.ids()
    }

    /// Permission-filtered, decrypted transactions in merge order.
    pub fn valid_transactions(&self, id: &CoId) -> Result<Vec<DecodedTransaction>> {
        let state = self.inner.state.lock();
        let core = state.registry.get(id).ok_or(NodeError::NotFound(*id))?;
        Ok(core.valid_transactions(&self.inner.agent, &state.registry.resolver()))
    }

    /// Held transactions excluded by permissions.
    pub fn invalid_transactions(&self, id: &CoId) -> Result<Vec<InvalidTransaction>> {
        let state = self.inner.state.lock();
        let core = state.registry.get(id).ok_or(NodeError::NotFound(*id))?;
        Ok(core.invalid_transactions(&state.registry.resolver()))
    }

    /// Batches refused for bad signatures.
    pub fn rejected_batches(&self, id: &CoId) -> Result<Vec<RejectedBatch>> {
        let state = self.inner.state.lock();
        let core = state.registry.get(id).ok_or(NodeError::NotFound(*id))?;
        Ok(core.rejected().to_vec())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────────

    /// Load a CoValue by id, from peers if it is not resident.
    ///
    /// Malformed ids fail before any peer is contacted. Concurrent loads of
    /// the same id share one request. The owning group and its parents are
    /// loaded too.
    pub async fn load(&self, id: &str) -> Result<LoadOutcome> {
        let id = parse_id(id)?;
        self.load_id(id, &CancellationToken::new()).await
    }

    /// [`load`](Self::load), abandoned when `cancel` fires.
    pub async fn load_with_cancel(&self, id: &str, cancel: CancellationToken) -> Result<LoadOutcome> {
        let id = parse_id(id)?;
        self.load_id(id, &cancel).await
    }

    async fn load_id(&self, id: CoId, cancel: &CancellationToken) -> Result<LoadOutcome> {
        let outcome = self.load_one(id, cancel).await?;
        if outcome == LoadOutcome::Unavailable {
            return Ok(outcome);
        }

        let mut seen = HashSet::from([id]);
        let mut pending = self.dependencies(&id);
        while let Some(dep) = pending.pop() {
            if !seen.insert(dep) {
                continue;
            }
            if self.load_one(dep, cancel).await? == LoadOutcome::Unavailable {
                tracing::debug!(covalue = %id, dependency = %dep, "dependency unavailable");
                continue;
            }
            pending.extend(self.dependencies(&dep));
        }
        Ok(outcome)
    }

    fn dependencies(&self, id: &CoId) -> Vec<CoId> {
        let state = self.inner.state.lock();
        state
            .registry
            .get(id)
            .map(|core| core.dependencies(&state.registry.resolver()))
            .unwrap_or_default()
    }

    async fn load_one(&self, id: CoId, cancel: &CancellationToken) -> Result<LoadOutcome> {
        let mut rx = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.registry.contains(&id) {
                return Ok(LoadOutcome::Available);
            }
            if state.loads.unavailable.contains(&id) && !state.loads.is_pending(&id) {
                return Ok(LoadOutcome::Unavailable);
            }
            self.inner.start_load(state, id)
        };

        loop {
            if let Some(outcome) = *rx.borrow_and_update() {
                return Ok(outcome);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                _ = self.inner.shutdown.cancelled() => return Err(NodeError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return (*rx.borrow()).ok_or(NodeError::Cancelled);
                    }
                }
            }
        }
    }

    /// Load `id` and everything it references, `depth` levels deep.
    ///
    /// References are string values that parse as CoValue ids, in map
    /// values, list items and stream items. Fails with the first CoValue on
    /// the way that is unavailable or unreadable, naming the path to it.
    pub async fn load_deep(&self, id: &str, depth: usize) -> Result<Vec<CoId>> {
        let root = parse_id(id)?;
        let cancel = CancellationToken::new();
        let mut loaded = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([(root, Vec::<String>::new(), 0usize)]);

        while let Some((id, path, level)) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if self.load_id(id, &cancel).await? == LoadOutcome::Unavailable {
                return Err(NodeError::Unavailable { id, path });
            }

            let children = {
                let mut guard = self.inner.state.lock();
                let state = &mut *guard;
                let readable = {
                    let core = state.registry.get(&id).ok_or(NodeError::NotFound(id))?;
                    can_read_owned(
                        &core.header().ruleset,
                        &self.inner.agent_id,
                        i64::MAX,
                        &state.registry.resolver(),
                    )
                };
                if !readable {
                    return Err(NodeError::Unauthorized { id, path });
                }
                if level < depth {
                    let epoch = state.registry.epoch();
                    let (core, snapshot) = state
                        .registry
                        .split_mut(&id)
                        .ok_or(NodeError::NotFound(id))?;
                    references(&core.current_content(epoch, &self.inner.agent, &snapshot))
                } else {
                    Vec::new()
                }
            };

            loaded.push(id);
            for (segment, child) in children {
                let mut child_path = path.clone();
                child_path.push(segment);
                queue.push_back((child, child_path, level + 1));
            }
        }
        Ok(loaded)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Connect a peer over `connection`.
    ///
    /// A live peer with the same id is closed first and its acknowledged
    /// known states carry over; a new id starts from nothing.
    pub fn add_peer(&self, id: impl Into<PeerId>, role: PeerRole, connection: PeerConnection) {
        self.inner.add_peer(id.into(), role, connection);
    }

    /// Close a peer. Returns `false` if it was unknown or already closed.
    pub fn remove_peer(&self, id: &PeerId) -> bool {
        let mut guard = self.inner.state.lock();
        self.inner.close_peer(&mut guard, id, "removed")
    }

    /// Persist everything through `storage`, which also answers loads.
    pub fn add_storage(&self, id: impl Into<PeerId>, storage: Arc<dyn Storage>) {
        let (ours, theirs) = duplex(self.inner.config.sync.outgoing_capacity);
        let peer = StoragePeer::new(storage, theirs, self.inner.crypto.clone());
        tokio::spawn(peer.run(self.inner.shutdown.child_token()));
        self.add_peer(id, PeerRole::Server, ours);
    }

    /// Ids of peers known to the node, open or closed, sorted.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.inner.state.lock().sync.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_peer_closed(&self, peer: &PeerId) -> Option<bool> {
        self.inner
            .state
            .lock()
            .sync
            .peers
            .get(peer)
            .map(|entry| entry.state.is_closed())
    }

    /// What `peer` has acknowledged holding of `id`.
    pub fn peer_known_state(&self, peer: &PeerId, id: &CoId) -> Option<KnownState> {
        self.inner
            .state
            .lock()
            .sync
            .peers
            .get(peer)
            .and_then(|entry| entry.state.known_state(id).cloned())
    }

    /// What `peer` will hold of `id` once in-flight content arrives.
    pub fn peer_optimistic_known_state(&self, peer: &PeerId, id: &CoId) -> Option<KnownState> {
        self.inner
            .state
            .lock()
            .sync
            .peers
            .get(peer)
            .and_then(|entry| entry.state.optimistic_known_state(id).cloned())
    }

    /// Wait until `peer` has acknowledged everything this node holds of `id`.
    pub async fn wait_for_sync_with_peer(
        &self,
        peer: &PeerId,
        id: &CoId,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut progress = self.inner.progress.subscribe();
        loop {
            {
                let state = self.inner.state.lock();
                let entry = state
                    .sync
                    .peers
                    .get(peer)
                    .ok_or_else(|| SyncError::PeerNotConnected(peer.to_string()))?;
                if entry.state.is_closed() {
                    return Err(SyncError::PeerClosed(peer.to_string()).into());
                }
                let ours = state
                    .registry
                    .get(id)
                    .ok_or(NodeError::NotFound(*id))?
                    .known_state();
                if entry
                    .state
                    .known_state(id)
                    .is_some_and(|theirs| ours.is_subset_of(theirs))
                {
                    return Ok(());
                }
            }
            self.wait_progress(&mut progress, deadline, || format!("{peer} on {id}"))
                .await?;
        }
    }

    /// Wait until every open peer that syncs `id` has acknowledged it.
    pub async fn wait_for_sync(&self, id: &CoId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut progress = self.inner.progress.subscribe();
        loop {
            {
                let state = self.inner.state.lock();
                let ours = state
                    .registry
                    .get(id)
                    .ok_or(NodeError::NotFound(*id))?
                    .known_state();
                let synced = state
                    .sync
                    .peers
                    .values()
                    .filter(|entry| entry.state.wants(id))
                    .all(|entry| {
                        entry
                            .state
                            .known_state(id)
                            .is_some_and(|theirs| ours.is_subset_of(theirs))
                    });
                if synced {
                    return Ok(());
                }
            }
            self.wait_progress(&mut progress, deadline, || id.to_string())
                .await?;
        }
    }

    async fn wait_progress(
        &self,
        progress: &mut watch::Receiver<u64>,
        deadline: Instant,
        what: impl FnOnce() -> String,
    ) -> Result<()> {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(NodeError::Cancelled),
            changed = tokio::time::timeout_at(deadline, progress.changed()) => match changed {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(NodeError::Cancelled),
                Err(_) => Err(SyncError::Timeout(what()).into()),
            },
        }
    }

    /// Stop every task of this node. Clones become inert.
    pub fn shutdown(&self) {
        let mut guard = self.inner.state.lock();
        let peers: Vec<PeerId> = guard.sync.peers.keys().cloned().collect();
        for peer in peers {
            self.inner.close_peer(&mut guard, &peer, "shutdown");
        }
        drop(guard);
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("agent", &self.inner.agent_id)
            .field("session", &self.inner.session)
            .finish()
    }
}

fn parse_id(id: &str) -> Result<CoId> {
    CoId::parse(id).map_err(|e| NodeError::InvalidId {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

/// Current time in Unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// CoValue ids referenced from content, with the path segment to each.
fn references(content: &CoValueContent) -> Vec<(String, CoId)> {
    let as_id = |value: &Value| value.as_str().and_then(|s| CoId::parse(s).ok());
    match content {
        CoValueContent::Map(map) => map
            .iter()
            .filter_map(|(key, value)| as_id(value).map(|id| (key.to_string(), id)))
            .collect(),
        CoValueContent::List(list) => list
            .values()
            .into_iter()
            .enumerate()
            .filter_map(|(index, value)| as_id(value).map(|id| (index.to_string(), id)))
            .collect(),
        CoValueContent::Stream(stream) => stream
            .sessions()
            .flat_map(|session| {
                stream
                    .items(session)
                    .iter()
                    .enumerate()
                    .filter_map(move |(index, item)| {
                        as_id(&item.value).map(|id| (format!("{session}[{index}]"), id))
                    })
            })
            .collect(),
        CoValueContent::Group(_) => Vec::new(),
    }
}

async fn run_inbound(
    node: Weak<NodeInner>,
    mut inbound: mpsc::Receiver<Inbound>,
    shutdown: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = inbound.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let Some(inner) = node.upgrade() else {
            break;
        };
        inner.handle_inbound(item);
    }
    tracing::debug!("inbound task stopped");
}
