//! Node events, delivered over a broadcast channel.

use serde::Serialize;

use covalue_core::{CoId, TransactionId};
use covalue_sync::{PeerId, PeerRole};

/// Something observable happened on a node.
///
/// Subscribers that fall behind miss events (`RecvError::Lagged`); the node
/// never waits for them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeEvent {
    PeerConnected { peer: PeerId, role: PeerRole },
    PeerDisconnected { peer: PeerId, role: PeerRole },
    /// New transactions or a header were applied, locally or from a peer.
    CoValueUpdated { id: CoId },
    /// A transaction was excluded from content.
    TransactionRejected {
        id: CoId,
        #[serde(skip)]
        transaction: Option<TransactionId>,
        reason: String,
    },
}

/// Capacity of the event channel.
pub(crate) const EVENT_CAPACITY: usize = 1024;
