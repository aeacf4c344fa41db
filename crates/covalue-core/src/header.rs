//! CoValue headers.
//!
//! A header is the immutable metadata of a CoValue. Its canonical encoding is
//! hashed to produce the [`CoId`], so two nodes that hold the same header agree
//! on the id without coordination.

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_header_bytes;
use crate::crypto::{AgentId, CryptoProvider};
use crate::error::CoreError;
use crate::types::CoId;

/// The type tag of a CoValue, selecting its merge semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoValueKind {
    Map,
    List,
    Stream,
    Group,
}

impl CoValueKind {
    /// Convert to integer code for canonical encoding.
    pub fn to_u8(self) -> u8 {
        match self {
            CoValueKind::Map => 0,
            CoValueKind::List => 1,
            CoValueKind::Stream => 2,
            CoValueKind::Group => 3,
        }
    }

    /// Parse from integer code.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CoValueKind::Map),
            1 => Some(CoValueKind::List),
            2 => Some(CoValueKind::Stream),
            3 => Some(CoValueKind::Group),
            _ => None,
        }
    }
}

/// Who may write to a CoValue.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Ruleset {
    /// The CoValue is a group; its own ledger decides.
    Group {
        #[serde(rename = "initialAdmin")]
        initial_admin: AgentId,
    },

    /// Permissions come from the owning group.
    OwnedByGroup { group: CoId },

    /// Anyone may write. Used for tests and public scratch values.
    UnsafeAllowAll,
}

impl Ruleset {
    /// The owning group, if any.
    pub fn owning_group(&self) -> Option<&CoId> {
        match self {
            Ruleset::OwnedByGroup { group } => Some(group),
            _ => None,
        }
    }
}

/// Immutable metadata of a CoValue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub kind: CoValueKind,
    pub ruleset: Ruleset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    /// Random nonce so identical headers created twice get distinct ids.
    pub uniqueness: String,
    /// Creation time (Unix milliseconds).
    pub created_at: i64,
}

impl Header {
    /// Header of a new group whose first admin is `initial_admin`.
    pub fn group(initial_admin: AgentId, uniqueness: String, created_at: i64) -> Self {
        Self {
            kind: CoValueKind::Group,
            ruleset: Ruleset::Group { initial_admin },
            meta: None,
            uniqueness,
            created_at,
        }
    }

    /// Header of a value owned by `group`.
    pub fn owned_by(kind: CoValueKind, group: CoId, uniqueness: String, created_at: i64) -> Self {
        Self {
            kind,
            ruleset: Ruleset::OwnedByGroup { group },
            meta: None,
            uniqueness,
            created_at,
        }
    }

    /// Attach free-form metadata.
    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Compute the content-derived id of this header.
    pub fn id(&self, crypto: &dyn CryptoProvider) -> Result<CoId, CoreError> {
        let bytes = canonical_header_bytes(self)?;
        Ok(CoId(crypto.hash(&bytes).0))
    }

    /// Check that this header hashes to `claimed`.
    pub fn matches(&self, claimed: &CoId, crypto: &dyn CryptoProvider) -> bool {
        self.id(crypto).map(|id| id == *claimed).unwrap_or(false)
    }
}
