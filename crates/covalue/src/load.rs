//! Loading CoValues that are not resident.
//!
//! One load per id is in flight at a time; every caller asking for the same
//! id shares its outcome through a watch channel. A driver task asks the
//! open peers, waits for progress, and retries per the node's
//! [`RetryPolicy`](covalue_sync::RetryPolicy) before giving up.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use covalue_core::{CoId, KnownState};
use covalue_sync::{PeerId, SyncMessage};

use crate::node::{NodeInner, NodeState};

/// How a load ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadOutcome {
    /// The CoValue is resident.
    Available,
    /// No peer had it, or every attempt timed out.
    Unavailable,
}

pub(crate) struct PendingLoad {
    seq: u64,
    tx: watch::Sender<Option<LoadOutcome>>,
    /// Peers asked by the current attempt.
    asked: HashSet<PeerId>,
    /// Asked peers that answered without the header.
    declined: HashSet<PeerId>,
    /// Peers whose own load requests wait on this one.
    deferred: Vec<PeerId>,
}

/// In-flight loads and negative results.
#[derive(Default)]
pub(crate) struct Loads {
    pending: HashMap<CoId, PendingLoad>,
    /// Ids whose last load ended unavailable. Retried when a peer is added.
    pub unavailable: HashSet<CoId>,
    next_seq: u64,
}

impl Loads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, id: &CoId) -> bool {
        self.pending.contains_key(id)
    }

    fn is_current(&self, id: &CoId, seq: u64) -> bool {
        self.pending.get(id).is_some_and(|load| load.seq == seq)
    }

    /// Whether `peer` was asked about `id` by the load in flight.
    pub fn was_asked(&self, id: &CoId, peer: &PeerId) -> bool {
        self.pending
            .get(id)
            .is_some_and(|load| load.asked.contains(peer))
    }

    /// Answer `peer` once the load of `id` ends. Returns `false` if no load
    /// is in flight.
    pub fn defer(&mut self, id: &CoId, peer: PeerId) -> bool {
        match self.pending.get_mut(id) {
            Some(load) => {
                if !load.deferred.contains(&peer) {
                    load.deferred.push(peer);
                }
                true
            }
            None => false,
        }
    }

    /// Record that `peer` does not have `id`. Returns `true` once every
    /// asked peer has declined.
    pub fn decline(&mut self, id: &CoId, peer: &PeerId) -> bool {
        let Some(load) = self.pending.get_mut(id) else {
            return false;
        };
        if !load.asked.contains(peer) {
            return false;
        }
        load.declined.insert(peer.clone());
        load.asked.is_subset(&load.declined)
    }

    /// Ids whose loads are now exhausted because `peer` went away.
    pub fn peer_gone(&mut self, peer: &PeerId) -> Vec<CoId> {
        let ids: Vec<CoId> = self
            .pending
            .iter()
            .filter(|(_, load)| load.asked.contains(peer))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter(|id| self.decline(id, peer))
            .collect()
    }
}

impl NodeInner {
    /// Join the load of `id`, starting one if none is in flight.
    pub(crate) fn start_load(
        self: &Arc<Self>,
        state: &mut NodeState,
        id: CoId,
    ) -> watch::Receiver<Option<LoadOutcome>> {
        if let Some(load) = state.loads.pending.get(&id) {
            return load.tx.subscribe();
        }
        let seq = state.loads.next_seq;
        state.loads.next_seq += 1;
        state.loads.unavailable.remove(&id);

        let (tx, rx) = watch::channel(None);
        state.loads.pending.insert(
            id,
            PendingLoad {
                seq,
                tx,
                asked: HashSet::new(),
                declined: HashSet::new(),
                deferred: Vec::new(),
            },
        );
        tracing::debug!(covalue = %id, seq, "load started");
        tokio::spawn(drive_load(Arc::downgrade(self), id, seq));
        rx
    }

    /// End the load of `id` and answer the peers waiting on it.
    pub(crate) fn finish_load(&self, state: &mut NodeState, id: CoId, outcome: LoadOutcome) {
        let Some(load) = state.loads.pending.remove(&id) else {
            return;
        };
        match outcome {
            LoadOutcome::Available => {
                state.loads.unavailable.remove(&id);
            }
            LoadOutcome::Unavailable => {
                state.loads.unavailable.insert(id);
            }
        }
        tracing::debug!(covalue = %id, ?outcome, "load finished");
        load.tx.send_replace(Some(outcome));

        for peer in load.deferred {
            self.answer_load(state, &peer, id);
        }
        self.bump_progress();
    }

    /// Send `Load` for `id` to every open peer. Returns how many were asked.
    fn ask_peers(&self, state: &mut NodeState, id: CoId) -> usize {
        let Some(load) = state.loads.pending.get_mut(&id) else {
            return 0;
        };
        load.asked.clear();
        load.declined.clear();

        for (peer_id, entry) in state.sync.peers.iter_mut() {
            let peer = &mut entry.state;
            if peer.is_closed() || peer.is_errored(&id) || load.deferred.contains(peer_id) {
                continue;
            }
            peer.track(id);
            if peer.send(SyncMessage::Load(KnownState::empty(id))) {
                load.asked.insert(peer_id.clone());
            }
        }
        load.asked.len()
    }
}

async fn drive_load(node: Weak<NodeInner>, id: CoId, seq: u64) {
    let Some(inner) = node.upgrade() else {
        return;
    };
    let retry = inner.config.sync.retry;
    let shutdown = inner.shutdown.clone();
    let mut progress = inner.progress.subscribe();
    drop(inner);

    for attempt in 0..retry.attempts() {
        {
            let Some(inner) = node.upgrade() else {
                return;
            };
            let mut state = inner.state.lock();
            if !state.loads.is_current(&id, seq) {
                return;
            }
            if state.registry.contains(&id) {
                inner.finish_load(&mut state, id, LoadOutcome::Available);
                return;
            }
            let asked = inner.ask_peers(&mut state, id);
            if asked == 0 {
                inner.finish_load(&mut state, id, LoadOutcome::Unavailable);
                return;
            }
            tracing::debug!(covalue = %id, attempt, asked, "asked peers");
        }

        let deadline = Instant::now() + retry.timeout;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = tokio::time::timeout_at(deadline, progress.changed()) => match changed {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return,
                    Err(_) => break,
                },
            }
            let Some(inner) = node.upgrade() else {
                return;
            };
            let state = inner.state.lock();
            if !state.loads.is_current(&id, seq) {
                return;
            }
        }
        tracing::debug!(covalue = %id, attempt, "load attempt timed out");
    }

    if let Some(inner) = node.upgrade() {
        let mut state = inner.state.lock();
        if state.loads.is_current(&id, seq) {
            inner.finish_load(&mut state, id, LoadOutcome::Unavailable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(loads: &mut Loads, id: CoId, asked: &[&str]) {
        let (tx, _) = watch::channel(None);
        loads.pending.insert(
            id,
            PendingLoad {
                seq: 0,
                tx,
                asked: asked.iter().map(|p| PeerId::from(*p)).collect(),
                declined: HashSet::new(),
                deferred: Vec::new(),
            },
        );
    }

    #[test]
    fn test_decline_completes_when_all_asked_decline() {
        let id = CoId([1; 32]);
        let mut loads = Loads::new();
        pending(&mut loads, id, &["a", "b"]);

        assert!(!loads.decline(&id, &PeerId::from("a")));
        assert!(!loads.decline(&id, &PeerId::from("stranger")));
        assert!(loads.decline(&id, &PeerId::from("b")));
    }

    #[test]
    fn test_peer_gone_counts_as_decline() {
        let id = CoId([1; 32]);
        let other = CoId([2; 32]);
        let mut loads = Loads::new();
        pending(&mut loads, id, &["a"]);
        pending(&mut loads, other, &["a", "b"]);

        assert_eq!(loads.peer_gone(&PeerId::from("a")), vec![id]);
    }

    #[test]
    fn test_defer_dedups() {
        let id = CoId([1; 32]);
        let mut loads = Loads::new();
        assert!(!loads.defer(&id, PeerId::from("a")));
        pending(&mut loads, id, &[]);
        assert!(loads.defer(&id, PeerId::from("a")));
        assert!(loads.defer(&id, PeerId::from("a")));
        assert_eq!(loads.pending[&id].deferred.len(), 1);
    }
}
