//! Sync protocol message types.
//!
//! Three messages, tagged by `action`:
//!
//! - `load`: "this is what I have of `id`, send me what I'm missing"
//! - `known`: "this is what I have of `id`" (an acknowledgement, or with
//!   `isCorrection` a request to resend from an earlier position)
//! - `content`: the header and/or new transactions per session

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use covalue_core::{CoId, Header, KnownState, SessionId, Signature, Transaction};

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SyncMessage {
    Load(KnownState),
    Known(KnownMessage),
    Content(ContentMessage),
}

impl SyncMessage {
    /// The CoValue this message is about.
    pub fn id(&self) -> &CoId {
        match self {
            SyncMessage::Load(known) => &known.id,
            SyncMessage::Known(known) => &known.known.id,
            SyncMessage::Content(content) => &content.id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            SyncMessage::Load(_) => "load",
            SyncMessage::Known(_) => "known",
            SyncMessage::Content(_) => "content",
        }
    }

    pub fn known(known: KnownState) -> Self {
        SyncMessage::Known(KnownMessage {
            known,
            is_correction: false,
        })
    }

    pub fn correction(known: KnownState) -> Self {
        SyncMessage::Known(KnownMessage {
            known,
            is_correction: true,
        })
    }
}

/// A known state, optionally flagged as a correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownMessage {
    #[serde(flatten)]
    pub known: KnownState,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_correction: bool,
}

/// New content for one CoValue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentMessage {
    pub id: CoId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<Header>,
    #[serde(default)]
    pub new: BTreeMap<SessionId, SessionContent>,
}

impl ContentMessage {
    pub fn new(id: CoId) -> Self {
        Self {
            id,
            header: None,
            new: BTreeMap::new(),
        }
    }

    /// Nothing to send.
    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.values().all(|s| s.new_transactions.is_empty())
    }

    /// What the sender holds at least, once this message is applied.
    pub fn implied_known_state(&self) -> KnownState {
        let mut known = KnownState::empty(self.id);
        known.header = self.header.is_some();
        for (session, content) in &self.new {
            known.advance(*session, content.after + content.new_transactions.len());
        }
        known
    }
}

/// New transactions for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContent {
    /// Number of transactions the sender believes the receiver holds.
    pub after: usize,
    pub new_transactions: Vec<Transaction>,
    /// Signature over the rolling hash of the session up to and including
    /// the last of `new_transactions`.
    pub last_signature: Signature,
}
