//! Strong type definitions for CoValue identifiers.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use std::fmt;
use std::str::FromStr;

use crate::crypto::AgentId;
use crate::encoding::{decode_prefixed_array, encode_prefixed, prefixed_bytes};
use crate::error::CoreError;

prefixed_bytes!(
    /// Content-derived identifier of a CoValue: `co_z<base58(blake3(canonical header))>`.
    CoId,
    "co",
    32
);

impl CoId {
    /// Parse an id arriving from an untrusted boundary.
    ///
    /// Empty strings and anything that is not a well-formed `co_z…` are rejected.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if s.is_empty() {
            return Err(CoreError::MalformedId("empty id".into()));
        }
        s.parse()
    }
}

/// Marker between the agent and the random part of a session id.
const SESSION_MARKER: &str = "_session";

/// Number of random bytes in a session id.
pub const SESSION_NONCE_LEN: usize = 8;

/// One writer's log for a CoValue: `<agentId>_session_z<base58(8 random bytes)>`.
///
/// Ordering is total and identical on every node; it is the tie-break for
/// transactions made at the same millisecond.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    agent: AgentId,
    nonce: [u8; SESSION_NONCE_LEN],
}

impl SessionId {
    /// Create a session id for an agent.
    pub const fn new(agent: AgentId, nonce: [u8; SESSION_NONCE_LEN]) -> Self {
        Self { agent, nonce }
    }

    /// The agent authoring this session.
    pub const fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// The random per-login component.
    pub const fn nonce(&self) -> &[u8; SESSION_NONCE_LEN] {
        &self.nonce
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            self.agent,
            encode_prefixed(SESSION_MARKER, &self.nonce)
        )
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionId({:?}, {})",
            self.agent,
            bs58::encode(self.nonce).into_string()
        )
    }
}

impl FromStr for SessionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let marker = s
            .rfind(SESSION_MARKER)
            .ok_or_else(|| CoreError::MalformedId(format!("not a session id: {s}")))?;
        let (agent, rest) = s.split_at(marker);
        let nonce = decode_prefixed_array::<SESSION_NONCE_LEN>(SESSION_MARKER, rest)?;
        Ok(Self {
            agent: agent.parse()?,
            nonce,
        })
    }
}

impl serde::Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Address of one transaction: its session and index in that session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId {
    pub session: SessionId,
    pub tx_index: u32,
}

/// Address of one change: a transaction plus the change's position in it.
///
/// Encodes as `<sessionId>:<txIndex>:<changeIndex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId {
    pub session: SessionId,
    pub tx_index: u32,
    pub change_index: u32,
}

impl OpId {
    pub const fn new(session: SessionId, tx_index: u32, change_index: u32) -> Self {
        Self {
            session,
            tx_index,
            change_index,
        }
    }

    /// The transaction this op belongs to.
    pub const fn transaction(&self) -> TransactionId {
        TransactionId {
            session: self.session,
            tx_index: self.tx_index,
        }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.session, self.tx_index, self.change_index)
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OpId({:?}, {}, {})",
            self.session, self.tx_index, self.change_index
        )
    }
}

impl FromStr for OpId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CoreError::MalformedId(format!("not an op id: {s}"));
        let mut parts = s.rsplitn(3, ':');
        let change_index = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(malformed)?;
        let tx_index = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(malformed)?;
        let session = parts.next().ok_or_else(malformed)?.parse()?;
        Ok(Self {
            session,
            tx_index,
            change_index,
        })
    }
}

impl serde::Serialize for OpId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for OpId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
