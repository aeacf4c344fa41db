//! CoValueCore: one CoValue's header and session logs.
//!
//! The core holds raw, signature-checked transactions. Which of them count
//! (permissions) and what they say (decryption) depends on groups, so those
//! views are computed against a [`GroupResolver`] and cached until either
//! this core or any group changes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use covalue_core::{
    AddOutcome, AgentId, AgentSecret, CoId, CoValueContent, CoValueKind, CoreError,
    CryptoProvider, DecodedTransaction, Header, KeyId, KeySecret, KnownState, Privacy, Ruleset,
    SessionId, SessionLog, Signature, Transaction, TransactionId, ValidationError,
};
use covalue_perms::{
    can_write_owned, encrypt_changes, readable_changes, GroupResolver, GroupState,
    InvalidTransaction, PermsError,
};
use covalue_sync::{ContentMessage, SessionContent};

/// A remote batch refused because its signature did not verify.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedBatch {
    pub session: SessionId,
    pub after: usize,
    pub len: usize,
    pub reason: String,
}

/// The local identity used to author transactions.
pub(crate) struct Author<'a> {
    pub secret: &'a AgentSecret,
    pub id: AgentId,
    pub session: SessionId,
}

/// One CoValue as held by a node.
pub struct CoValueCore {
    id: CoId,
    header: Header,
    sessions: BTreeMap<SessionId, SessionLog>,
    rejected: Vec<RejectedBatch>,
    /// Content as of a group epoch.
    cached: Option<(u64, CoValueContent)>,
    crypto: Arc<dyn CryptoProvider>,
}

impl CoValueCore {
    /// A core for `header`, with no transactions.
    pub fn new(header: Header, crypto: Arc<dyn CryptoProvider>) -> Result<Self, CoreError> {
        let id = header.id(crypto.as_ref())?;
        Ok(Self {
            id,
            header,
            sessions: BTreeMap::new(),
            rejected: Vec::new(),
            cached: None,
            crypto,
        })
    }

    /// A core for a header received under a claimed id.
    pub fn verified(
        claimed: CoId,
        header: Header,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self, ValidationError> {
        if !header.matches(&claimed, crypto.as_ref()) {
            return Err(ValidationError::HeaderMismatch);
        }
        Ok(Self::new(header, crypto)?)
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn kind(&self) -> CoValueKind {
        self.header.kind
    }

    pub fn session(&self, session: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&SessionId, &SessionLog)> {
        self.sessions.iter()
    }

    /// Transactions held for `session`.
    pub fn session_len(&self, session: &SessionId) -> usize {
        self.sessions.get(session).map_or(0, SessionLog::len)
    }

    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id,
            header: true,
            sessions: self
                .sessions
                .iter()
                .filter(|(_, log)| !log.is_empty())
                .map(|(session, log)| (*session, log.len()))
                .collect(),
        }
    }

    /// Batches refused for bad signatures, oldest first.
    pub fn rejected(&self) -> &[RejectedBatch] {
        &self.rejected
    }

    /// Groups this value depends on: its owning group, or a group's parents.
    pub fn dependencies(&self, resolver: &dyn GroupResolver) -> Vec<CoId> {
        match &self.header.ruleset {
            Ruleset::OwnedByGroup { group } => vec![*group],
            Ruleset::Group { .. } => resolver
                .group(&self.id)
                .map(|state| state.parents(i64::MAX))
                .unwrap_or_default(),
            Ruleset::UnsafeAllowAll => Vec::new(),
        }
    }

    /// Offer a remote batch for `session` starting after `after` transactions.
    ///
    /// A batch whose signature does not verify is refused as a whole and
    /// recorded in [`rejected`](Self::rejected); other sessions are unaffected.
    pub fn try_add_transactions(
        &mut self,
        session: SessionId,
        after: usize,
        transactions: Vec<Transaction>,
        last_signature: Signature,
    ) -> Result<AddOutcome, ValidationError> {
        let len = transactions.len();
        let log = self
            .sessions
            .entry(session)
            .or_insert_with(|| SessionLog::new(session));
        let result = log.try_add(after, transactions, last_signature, self.crypto.as_ref());

        match &result {
            Ok(AddOutcome::Applied { .. }) => self.invalidate(),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(covalue = %self.id, session = %session, after, error = %e, "rejected batch");
                self.rejected.push(RejectedBatch {
                    session,
                    after,
                    len,
                    reason: e.to_string(),
                });
            }
        }
        if self
            .sessions
            .get(&session)
            .is_some_and(|log| log.is_empty() && !log.has_pending())
        {
            self.sessions.remove(&session);
        }
        result
    }

    /// Author a transaction in `author`'s session.
    ///
    /// Returns `false`, leaving the core untouched, if the author may not
    /// write or a private transaction has no usable read key.
    pub(crate) fn make_transaction(
        &mut self,
        changes: &[Value],
        privacy: Privacy,
        made_at: i64,
        author: &Author<'_>,
        resolver: &dyn GroupResolver,
    ) -> bool {
        let tx_index = self.session_len(&author.session) as u32;

        let tx = match privacy {
            Privacy::Trusting => Transaction::trusting(made_at, changes),
            Privacy::Private => match self.current_read_key(author.secret, resolver) {
                Some((key_id, key)) => encrypt_changes(
                    &self.id,
                    &author.session,
                    tx_index,
                    made_at,
                    changes,
                    key_id,
                    &key,
                    self.crypto.as_ref(),
                )
                .map_err(|e| CoreError::EncodingError(e.to_string())),
                None => {
                    tracing::debug!(covalue = %self.id, "no read key for private transaction");
                    return false;
                }
            },
        };
        let tx = match tx {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(covalue = %self.id, error = %e, "could not build transaction");
                return false;
            }
        };

        let allowed = match &self.header.ruleset {
            Ruleset::Group { .. } => {
                let candidate = DecodedTransaction {
                    session: author.session,
                    tx_index,
                    made_at,
                    changes: changes.to_vec(),
                };
                match self.group_state_with(Some(candidate), resolver) {
                    Ok(state) => state.is_valid(&TransactionId {
                        session: author.session,
                        tx_index,
                    }),
                    Err(_) => false,
                }
            }
            ruleset => can_write_owned(ruleset, &author.id, made_at, resolver),
        };
        if !allowed {
            tracing::debug!(covalue = %self.id, agent = %author.id, "write not permitted");
            return false;
        }

        let log = self
            .sessions
            .entry(author.session)
            .or_insert_with(|| SessionLog::new(author.session));
        match log.append_local(tx, &author.secret.signer, self.crypto.as_ref()) {
            Ok(_) => {
                self.invalidate();
                true
            }
            Err(e) => {
                tracing::warn!(covalue = %self.id, error = %e, "could not sign transaction");
                false
            }
        }
    }

    /// The read key private transactions are encrypted under now.
    fn current_read_key(
        &self,
        agent: &AgentSecret,
        resolver: &dyn GroupResolver,
    ) -> Option<(KeyId, KeySecret)> {
        let group = match &self.header.ruleset {
            Ruleset::OwnedByGroup { group } => resolver.group(group)?,
            _ => return None,
        };
        let key_id = group.read_key_id()?;
        let key = group.resolve_read_key(&key_id, agent, self.crypto.as_ref(), resolver)?;
        Some((key_id, key))
    }

    /// Every held transaction with its readable changes, unfiltered.
    ///
    /// Private transactions whose key cannot be resolved are left out.
    fn readable(&self, agent: &AgentSecret, resolver: &dyn GroupResolver) -> Vec<DecodedTransaction> {
        let key_group = match &self.header.ruleset {
            Ruleset::OwnedByGroup { group } => resolver.group(group),
            _ => None,
        };
        let crypto = self.crypto.as_ref();

        let mut out = Vec::new();
        for (session, log) in &self.sessions {
            for (index, tx) in log.transactions().iter().enumerate() {
                let tx_index = index as u32;
                let key_for = |key_id: &KeyId| {
                    key_group
                        .as_ref()
                        .and_then(|g| g.resolve_read_key(key_id, agent, crypto, resolver))
                };
                if let Some(changes) =
                    readable_changes(tx, &self.id, session, tx_index, key_for, crypto)
                {
                    out.push(DecodedTransaction {
                        session: *session,
                        tx_index,
                        made_at: tx.made_at(),
                        changes,
                    });
                }
            }
        }
        out
    }

    /// Replay this core as a group ledger.
    pub fn group_state(&self, resolver: &dyn GroupResolver) -> Result<GroupState, PermsError> {
        self.group_state_with(None, resolver)
    }

    fn group_state_with(
        &self,
        extra: Option<DecodedTransaction>,
        resolver: &dyn GroupResolver,
    ) -> Result<GroupState, PermsError> {
        let mut txs = Vec::new();
        for (session, log) in &self.sessions {
            for (index, tx) in log.transactions().iter().enumerate() {
                match tx.trusting_changes() {
                    Some(Ok(changes)) => txs.push(DecodedTransaction {
                        session: *session,
                        tx_index: index as u32,
                        made_at: tx.made_at(),
                        changes,
                    }),
                    Some(Err(e)) => {
                        tracing::warn!(covalue = %self.id, session = %session, index, error = %e, "malformed ledger transaction");
                    }
                    None => {
                        tracing::warn!(covalue = %self.id, session = %session, index, "private ledger transaction ignored");
                    }
                }
            }
        }
        txs.extend(extra);
        GroupState::from_transactions(self.id, &self.header, txs, resolver)
    }

    /// Why `author` may not have written at `made_at`, if they may not.
    fn write_violation(&self, author: &AgentId, made_at: i64, resolver: &dyn GroupResolver) -> Option<String> {
        match &self.header.ruleset {
            Ruleset::UnsafeAllowAll => None,
            Ruleset::OwnedByGroup { group } => {
                if resolver.group(group).is_none() {
                    Some(format!("owning group {group} not available"))
                } else if can_write_owned(&self.header.ruleset, author, made_at, resolver) {
                    None
                } else {
                    Some(format!("{author} has no write access in {group}"))
                }
            }
            Ruleset::Group { .. } => None,
        }
    }

    /// Transactions excluded by permissions, with the reason.
    pub fn invalid_transactions(&self, resolver: &dyn GroupResolver) -> Vec<InvalidTransaction> {
        if let Ruleset::Group { .. } = self.header.ruleset {
            return resolver
                .group(&self.id)
                .map(|state| state.invalid_transactions().to_vec())
                .unwrap_or_default();
        }

        let mut out = Vec::new();
        for (session, log) in &self.sessions {
            for (index, tx) in log.transactions().iter().enumerate() {
                if let Some(reason) = self.write_violation(session.agent(), tx.made_at(), resolver) {
                    out.push(InvalidTransaction {
                        id: TransactionId {
                            session: *session,
                            tx_index: index as u32,
                        },
                        reason,
                    });
                }
            }
        }
        out
    }

    /// Permission-filtered, decrypted transactions in merge order.
    pub fn valid_transactions(
        &self,
        agent: &AgentSecret,
        resolver: &dyn GroupResolver,
    ) -> Vec<DecodedTransaction> {
        let group = match self.header.ruleset {
            Ruleset::Group { .. } => resolver.group(&self.id),
            _ => None,
        };
        let mut txs: Vec<DecodedTransaction> = self
            .readable(agent, resolver)
            .into_iter()
            .filter(|tx| match &group {
                Some(state) => state.is_valid(&TransactionId {
                    session: tx.session,
                    tx_index: tx.tx_index,
                }),
                None if matches!(self.header.ruleset, Ruleset::Group { .. }) => false,
                None => self
                    .write_violation(tx.session.agent(), tx.made_at, resolver)
                    .is_none(),
            })
            .collect();
        covalue_core::transaction::sort_for_merge(&mut txs);
        txs
    }

    /// Merged content as of `epoch`, computed on a miss.
    pub fn current_content(
        &mut self,
        epoch: u64,
        agent: &AgentSecret,
        resolver: &dyn GroupResolver,
    ) -> CoValueContent {
        if let Some((cached_epoch, content)) = &self.cached {
            if *cached_epoch == epoch {
                return content.clone();
            }
        }
        let content = self.compute_content(agent, resolver);
        self.cached = Some((epoch, content.clone()));
        content
    }

    /// Merged content, without touching the cache.
    pub fn compute_content(&self, agent: &AgentSecret, resolver: &dyn GroupResolver) -> CoValueContent {
        CoValueContent::from_transactions(self.kind(), self.valid_transactions(agent, resolver))
    }

    /// Drop cached content.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// What a peer holding `theirs` is missing, or `None` if nothing.
    pub fn content_since(&self, theirs: Option<&KnownState>) -> Option<ContentMessage> {
        let mut message = ContentMessage::new(self.id);
        if !theirs.is_some_and(|k| k.header) {
            message.header = Some(self.header.clone());
        }
        for (session, log) in &self.sessions {
            let after = theirs.map_or(0, |k| k.count(session));
            let new = log.transactions_since(after);
            let Some(last_signature) = log.last_signature() else {
                continue;
            };
            if new.is_empty() {
                continue;
            }
            message.new.insert(
                *session,
                SessionContent {
                    after,
                    new_transactions: new.to_vec(),
                    last_signature: *last_signature,
                },
            );
        }
        (!message.is_empty()).then_some(message)
    }
}

impl std::fmt::Debug for CoValueCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoValueCore")
            .field("id", &self.id)
            .field("kind", &self.header.kind)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
