//! # CoValue Core
//!
//! Pure primitives for the CoValue engine: identifiers, crypto capability,
//! canonical encoding, session logs, known states and content merge.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over cryptographic data structures.
//!
//! ## Key Types
//!
//! - [`Header`] / [`CoId`] - Immutable metadata and its content-derived id
//! - [`Transaction`] - One atomic, signed batch of changes
//! - [`SessionLog`] - One writer's append-only log with a rolling hash
//! - [`KnownState`] - Per-CoValue sync cursor
//! - [`CoValueContent`] - Deterministic merge of readable transactions
//! - [`CryptoProvider`] - The crypto capability, with [`DalekCrypto`] as default
//!
//! ## Canonicalization
//!
//! Headers and transactions are hashed over deterministic CBOR. See [`canonical`].

pub mod encoding;

pub mod canonical;
pub mod content;
pub mod crypto;
pub mod error;
pub mod header;
pub mod known;
pub mod session;
pub mod transaction;
pub mod types;

pub use canonical::{canonical_header_bytes, canonical_transaction_bytes};
pub use content::{
    ApplyChanges, CoValueContent, ListContent, ListEdit, MapContent, MapEdit, OpRef,
    StreamContent, StreamEdit,
};
pub use crypto::{
    AgentId, AgentSecret, CryptoProvider, DalekCrypto, Encrypted, Hash, KeyId, KeySecret, Sealed,
    SealerId, SealerSecret, Signature, SignerId, SignerSecret, StreamingHash,
};
pub use error::{CoreError, ValidationError};
pub use header::{CoValueKind, Header, Ruleset};
pub use known::KnownState;
pub use session::{AddOutcome, PendingBatch, SessionLog, MAX_PENDING_BATCHES};
pub use transaction::{DecodedTransaction, Privacy, Transaction};
pub use types::{CoId, OpId, SessionId, TransactionId};
