//! # CoValue
//!
//! A local-first sync engine for collaborative values.
//!
//! ## Overview
//!
//! A node holds CoValues: maps, lists, streams and groups identified by the
//! hash of their header. Every edit is a transaction appended to the
//! author's own session log, signed over a rolling hash. Nodes exchange
//! those logs with peers and converge without coordination:
//!
//! - **Sessions**: one writer, append-only, hash-chained and signed
//! - **Groups**: a ledger of roles and sealed read keys that decides which
//!   transactions count and who can decrypt them
//! - **Sync**: `load` / `known` / `content` messages that move only what a
//!   peer is missing
//!
//! ## Usage
//!
//! ```rust,no_run
//! use covalue::{LocalNode, NodeConfig, PeerRole};
//! use covalue::core::{MapEdit, Privacy};
//! use covalue::sync::duplex;
//!
//! async fn example() {
//!     let alice = LocalNode::new(NodeConfig::default());
//!     let bob = LocalNode::new(NodeConfig::default());
//!
//!     let (a, b) = duplex(256);
//!     alice.add_peer("bob", PeerRole::Server, a);
//!     bob.add_peer("alice", PeerRole::Client, b);
//!
//!     let group = alice.create_group().unwrap();
//!     let map = alice.create_map(&group).unwrap();
//!     alice
//!         .edit_map(&map, MapEdit::new().set("title", "hello"), Privacy::Private)
//!         .unwrap();
//!
//!     // Bob can fetch it, but not read it until Alice adds him.
//!     bob.load(&map.to_string()).await.unwrap();
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `covalue::core` - Ids, headers, session logs, content merge
//! - `covalue::perms` - Group ledger, roles and key distribution
//! - `covalue::store` - Storage abstraction, in-memory and SQLite
//! - `covalue::sync` - Wire messages, codec and peer state

pub mod config;
pub mod error;
pub mod events;
pub mod load;
pub mod node;
pub mod registry;
pub mod storage_peer;
mod sync_manager;
pub mod value;

// Re-export component crates
pub use covalue_core as core;
pub use covalue_perms as perms;
pub use covalue_store as store;
pub use covalue_sync as sync;

// Re-export main types for convenience
pub use crate::config::NodeConfig;
pub use crate::value::{CoValueCore, RejectedBatch};
pub use crate::error::{NodeError, Result};
pub use crate::events::NodeEvent;
pub use crate::load::LoadOutcome;
pub use crate::node::LocalNode;
pub use crate::storage_peer::StoragePeer;

// Re-export commonly used types
pub use covalue_core::{
    AgentId, CoId, CoValueContent, Header, KnownState, ListEdit, MapEdit, Privacy, SessionId,
    StreamEdit,
};
pub use covalue_perms::{MemberId, Role};
pub use covalue_sync::{PeerId, PeerRole};
