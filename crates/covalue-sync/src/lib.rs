//! # CoValue Sync
//!
//! Wire protocol and per-peer bookkeeping for syncing CoValues between nodes.
//!
//! ## Overview
//!
//! Nodes exchange three messages about one CoValue at a time. Each side
//! tracks, per peer, what the peer has acknowledged (`known`) and what it will
//! have once in-flight content arrives (`optimistic`). Content is always the
//! diff between our own known state and the peer's optimistic one.
//!
//! ## Key Properties
//!
//! - **Idempotent**: Re-sending content the peer already holds is a no-op
//! - **Self-correcting**: A gap on the receiving side triggers a correction
//!   and the sender resends from the receiver's real position
//! - **Order-independent**: Sessions are appended independently, so the
//!   final state doesn't depend on message interleaving across sessions
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-------- load(known A) ---------->|
//!   |<------- known(known B) ----------|
//!   |<------- content(B - A) ----------|
//!   |-------- known(ack) ------------->|
//!   |-------- content(A - B) --------->|
//!   |<------- known(ack) --------------|
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod peer;
pub mod transport;

pub use codec::{decode, encode, MAX_FRAME_LEN};
pub use config::{RetryPolicy, SyncConfig};
pub use error::{Result, SyncError};
pub use messages::{ContentMessage, KnownMessage, SessionContent, SyncMessage};
pub use metrics::PeerMetrics;
pub use peer::{PeerId, PeerRole, PeerState};
pub use transport::{duplex, PeerConnection};
