//! Per-peer sync state.
//!
//! For every CoValue the node has talked about with a peer it tracks two
//! known states:
//!
//! - `known`: what the peer has acknowledged holding
//! - `optimistic`: what the peer will hold once everything already sent
//!   arrives
//!
//! `known ⊆ optimistic` always holds. Diffs are computed against the
//! optimistic state so nothing is sent twice; a correction from the peer
//! resets both back to what it actually holds.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::mpsc;

use covalue_core::{CoId, KnownState};

use crate::messages::SyncMessage;

/// Identifier of a peer connection, chosen by whoever adds it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What the peer is to us.
///
/// Server peers receive every CoValue we hold; client peers only those they
/// have asked about or sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Client,
    Server,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Client => f.write_str("client"),
            PeerRole::Server => f.write_str("server"),
        }
    }
}

/// Sync state for one peer connection.
#[derive(Debug)]
pub struct PeerState {
    id: PeerId,
    role: PeerRole,
    generation: u64,
    known: HashMap<CoId, KnownState>,
    optimistic: HashMap<CoId, KnownState>,
    interested: HashSet<CoId>,
    errored: HashSet<CoId>,
    outbox: Option<mpsc::UnboundedSender<SyncMessage>>,
}

impl PeerState {
    /// A new peer with nothing known. `outbox` feeds the peer's writer task.
    pub fn new(
        id: PeerId,
        role: PeerRole,
        generation: u64,
        outbox: mpsc::UnboundedSender<SyncMessage>,
    ) -> Self {
        Self {
            id,
            role,
            generation,
            known: HashMap::new(),
            optimistic: HashMap::new(),
            interested: HashSet::new(),
            errored: HashSet::new(),
            outbox: Some(outbox),
        }
    }

    /// A replacement for `previous` (same peer id, new connection).
    ///
    /// Acknowledged known states carry over; optimistic states restart from
    /// them because anything in flight on the old connection may be lost.
    pub fn replacing(
        previous: &PeerState,
        role: PeerRole,
        generation: u64,
        outbox: mpsc::UnboundedSender<SyncMessage>,
    ) -> Self {
        let mut state = Self::new(previous.id.clone(), role, generation, outbox);
        state.known = previous.known.clone();
        state.optimistic = previous.known.clone();
        state.interested = previous.interested.clone();
        state
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_none()
    }

    /// Close the peer. Returns `true` the first time only.
    pub fn close(&mut self) -> bool {
        self.outbox.take().is_some()
    }

    /// Queue a message for the writer task. `false` if the peer is closed.
    pub fn send(&self, message: SyncMessage) -> bool {
        match &self.outbox {
            Some(outbox) => {
                tracing::trace!(peer = %self.id, action = message.action(), covalue = %message.id(), "queue");
                outbox.send(message).is_ok()
            }
            None => false,
        }
    }

    /// Acknowledged known state for `id`.
    pub fn known_state(&self, id: &CoId) -> Option<&KnownState> {
        self.known.get(id)
    }

    /// Optimistic known state for `id`.
    pub fn optimistic_known_state(&self, id: &CoId) -> Option<&KnownState> {
        self.optimistic.get(id)
    }

    /// The peer reported holding at least `known`.
    pub fn acknowledge(&mut self, known: &KnownState) {
        self.known
            .entry(known.id)
            .or_insert_with(|| KnownState::empty(known.id))
            .combine_with(known);
        self.optimistic
            .entry(known.id)
            .or_insert_with(|| KnownState::empty(known.id))
            .combine_with(known);
    }

    /// We sent enough that the peer will hold at least `known`.
    pub fn expect(&mut self, known: &KnownState) {
        self.optimistic
            .entry(known.id)
            .or_insert_with(|| KnownState::empty(known.id))
            .combine_with(known);
    }

    /// The peer corrected us: it holds exactly `known`.
    pub fn correct(&mut self, known: KnownState) {
        self.optimistic.insert(known.id, known.clone());
        self.known.insert(known.id, known);
    }

    /// Start tracking `id` with nothing known, if not tracked yet.
    /// Returns `true` if it was untracked.
    pub fn track(&mut self, id: CoId) -> bool {
        if self.optimistic.contains_key(&id) {
            return false;
        }
        self.optimistic.insert(id, KnownState::empty(id));
        true
    }

    /// The peer asked about or sent `id`.
    pub fn subscribe(&mut self, id: CoId) {
        self.interested.insert(id);
    }

    pub fn is_interested(&self, id: &CoId) -> bool {
        self.interested.contains(id)
    }

    /// Whether new content for `id` should be forwarded to this peer.
    pub fn wants(&self, id: &CoId) -> bool {
        !self.is_closed()
            && !self.is_errored(id)
            && (self.role == PeerRole::Server || self.is_interested(id))
    }

    /// Stop syncing `id` with this peer.
    pub fn mark_errored(&mut self, id: CoId) {
        self.errored.insert(id);
    }

    pub fn is_errored(&self, id: &CoId) -> bool {
        self.errored.contains(id)
    }
}
