//! # CoValue Permissions
//!
//! Groups decide who may read and write the values they own.
//!
//! A group is itself a CoValue whose content is a ledger map. Replaying that
//! ledger yields a [`GroupState`]: member roles over time, parent groups, and
//! the read keys members can recover. Values owned by a group encrypt their
//! private transactions under the group's current read key.
//!
//! ## Key Types
//!
//! - [`Role`] / [`MemberId`] - Roles and who holds them
//! - [`LedgerKey`] - The meaning of each group ledger entry
//! - [`GroupState`] - Replayed permission state, with read-key resolution
//! - [`GroupResolver`] - Access to other groups (parents, owners)

pub mod envelope;
pub mod error;
pub mod group;
pub mod keys;
pub mod ledger;
pub mod role;

pub use envelope::{decrypt_changes, encrypt_changes, envelope_nonce, readable_changes};
pub use error::{PermsError, Result};
pub use group::{
    can_read_owned, can_write_owned, GroupResolver, GroupState, InvalidTransaction, LedgerEntry,
    NoGroups,
};
pub use keys::{
    add_member_changes, extend_group_changes, initial_group_changes, remove_member_changes,
    rotate_read_key_changes,
};
pub use ledger::{LedgerKey, EXTEND, READ_KEY};
pub use role::{MemberId, Role};
