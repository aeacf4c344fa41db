//! Group state computation.
//!
//! A group's permission state is computed by replaying its ledger
//! transactions in `(made_at, session, tx_index)` order. Each transaction is
//! checked against the state built so far; if any of its changes is not
//! authorized, the whole transaction is rejected and left out of the ledger.
//!
//! Everything here is a pure function of the verified log and the `made_at`
//! times embedded in it. Nothing reads the wall clock.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use covalue_core::content::MapChange;
use covalue_core::transaction::sort_for_merge;
use covalue_core::{
    AgentId, AgentSecret, CoId, CryptoProvider, DecodedTransaction, Encrypted, Header, KeyId,
    KeySecret, OpId, Ruleset, Sealed, TransactionId,
};

use crate::error::{PermsError, Result};
use crate::ledger::{LedgerKey, EXTEND, READ_KEY};
use crate::role::{MemberId, Role};

/// Looks up the state of other groups (parents, owners).
pub trait GroupResolver {
    fn group(&self, id: &CoId) -> Option<Arc<GroupState>>;
}

/// A resolver that knows no groups.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGroups;

impl GroupResolver for NoGroups {
    fn group(&self, _id: &CoId) -> Option<Arc<GroupState>> {
        None
    }
}

impl GroupResolver for HashMap<CoId, Arc<GroupState>> {
    fn group(&self, id: &CoId) -> Option<Arc<GroupState>> {
        self.get(id).cloned()
    }
}

/// One accepted ledger write.
#[derive(Clone, Debug, PartialEq)]
pub struct LedgerEntry {
    pub op: OpId,
    pub made_at: i64,
    pub author: AgentId,
    /// `None` for deletions.
    pub value: Option<serde_json::Value>,
}

impl LedgerEntry {
    fn as_str(&self) -> Option<&str> {
        self.value.as_ref().and_then(|v| v.as_str())
    }
}

/// A ledger transaction that was rejected during replay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidTransaction {
    pub id: TransactionId,
    pub reason: String,
}

/// Nonce material for key entries stored in a group ledger.
pub(crate) fn ledger_nonce(group: &CoId, key: &LedgerKey) -> Vec<u8> {
    format!("{group}:{key}").into_bytes()
}

/// Replayed permission state of one group.
#[derive(Clone, Debug)]
pub struct GroupState {
    id: CoId,
    initial_admin: AgentId,
    entries: BTreeMap<String, Vec<LedgerEntry>>,
    valid: BTreeSet<TransactionId>,
    invalid: Vec<InvalidTransaction>,
}

impl GroupState {
    /// Replay a group's ledger.
    ///
    /// `transactions` may arrive in any order; they are sorted before replay.
    pub fn from_transactions(
        id: CoId,
        header: &Header,
        mut transactions: Vec<DecodedTransaction>,
        resolver: &dyn GroupResolver,
    ) -> Result<Self> {
        let Ruleset::Group { initial_admin } = header.ruleset else {
            return Err(PermsError::NotAGroup(id.to_string()));
        };

        let mut state = Self {
            id,
            initial_admin,
            entries: BTreeMap::new(),
            valid: BTreeSet::new(),
            invalid: Vec::new(),
        };

        sort_for_merge(&mut transactions);
        for tx in &transactions {
            state.apply_transaction(tx, resolver);
        }
        Ok(state)
    }

    fn apply_transaction(&mut self, tx: &DecodedTransaction, resolver: &dyn GroupResolver) {
        let author = *tx.session.agent();
        let tx_id = TransactionId {
            session: tx.session,
            tx_index: tx.tx_index,
        };

        let mut staged: Vec<String> = Vec::new();
        let mut rejection = None;

        for (index, change) in tx.changes.iter().enumerate() {
            let (key, value) = match MapChange::deserialize(change) {
                Ok(MapChange::Set { key, value }) => (key, Some(value)),
                Ok(MapChange::Del { key }) => (key, None),
                Err(e) => {
                    rejection = Some(format!("malformed change: {e}"));
                    break;
                }
            };

            if let Err(reason) = self.authorize(&author, tx.made_at, &key, value.as_ref(), resolver) {
                rejection = Some(reason);
                break;
            }

            self.entries.entry(key.clone()).or_default().push(LedgerEntry {
                op: OpId::new(tx.session, tx.tx_index, index as u32),
                made_at: tx.made_at,
                author,
                value,
            });
            staged.push(key);
        }

        match rejection {
            None => {
                self.valid.insert(tx_id);
            }
            Some(reason) => {
                for key in staged.iter().rev() {
                    if let Some(history) = self.entries.get_mut(key) {
                        history.pop();
                        if history.is_empty() {
                            self.entries.remove(key);
                        }
                    }
                }
                tracing::warn!(
                    group = %self.id,
                    session = %tx.session,
                    tx_index = tx.tx_index,
                    reason = %reason,
                    "rejecting group transaction"
                );
                self.invalid.push(InvalidTransaction { id: tx_id, reason });
            }
        }
    }

    /// Check one change against the state built so far.
    fn authorize(
        &self,
        author: &AgentId,
        made_at: i64,
        key: &str,
        value: Option<&serde_json::Value>,
        resolver: &dyn GroupResolver,
    ) -> std::result::Result<(), String> {
        let key: LedgerKey = key
            .parse()
            .map_err(|e| format!("unknown ledger key {key}: {e}"))?;
        let author_role = self.role_of(author, made_at, resolver);

        let require = |needed: Role, what: &str| {
            if author_role.is_some_and(|r| r >= needed) {
                Ok(())
            } else {
                Err(format!("{what} requires {needed}, author has {author_role:?}"))
            }
        };

        let value = match value {
            None => return require(Role::Admin, "deleting a ledger entry"),
            Some(v) => v
                .as_str()
                .ok_or_else(|| format!("ledger values must be strings, got {v}"))?,
        };

        match key {
            LedgerKey::Member(MemberId::Everyone) => {
                let new_role = parse_role(value)?;
                if !matches!(new_role, Role::Reader | Role::Writer | Role::Revoked) {
                    return Err(format!("everyone cannot be {new_role}"));
                }
                require(Role::Manager, "changing everyone")
            }
            LedgerKey::Member(MemberId::Agent(target)) => {
                let new_role = parse_role(value)?;
                let target_role = self.own_role(&MemberId::Agent(target), made_at);

                if target == *author
                    && *author == self.initial_admin
                    && new_role == Role::Admin
                    && target_role.is_none()
                {
                    return Ok(());
                }

                match author_role {
                    Some(Role::Admin) => {
                        if target_role == Some(Role::Admin)
                            && target != *author
                            && new_role != Role::Admin
                        {
                            Err("an admin cannot demote another admin".into())
                        } else {
                            Ok(())
                        }
                    }
                    Some(Role::Manager) => {
                        if target_role == Some(Role::Admin) || new_role == Role::Admin {
                            Err("managers cannot change admins".into())
                        } else {
                            Ok(())
                        }
                    }
                    other => Err(format!("changing members requires manager, author has {other:?}")),
                }
            }
            LedgerKey::ReadKey => {
                value
                    .parse::<KeyId>()
                    .map_err(|e| format!("invalid read key id: {e}"))?;
                require(Role::Manager, "setting the read key")
            }
            LedgerKey::KeyFor { .. } => {
                value
                    .parse::<Sealed>()
                    .map_err(|e| format!("invalid sealed key: {e}"))?;
                require(Role::Manager, "sealing a key")
            }
            LedgerKey::KeyForEveryone(_) => {
                value
                    .parse::<KeySecret>()
                    .map_err(|e| format!("invalid revealed key: {e}"))?;
                require(Role::Manager, "revealing a key")
            }
            LedgerKey::KeyForKey { .. } => {
                value
                    .parse::<Encrypted>()
                    .map_err(|e| format!("invalid encrypted key: {e}"))?;
                require(Role::Manager, "chaining a key")
            }
            LedgerKey::Parent(_) => {
                if value != EXTEND {
                    return Err(format!("parent entry must be {EXTEND:?}"));
                }
                require(Role::Admin, "extending a parent group")
            }
        }
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn initial_admin(&self) -> &AgentId {
        &self.initial_admin
    }

    /// Whether a ledger transaction survived replay.
    pub fn is_valid(&self, tx: &TransactionId) -> bool {
        self.valid.contains(tx)
    }

    /// Ledger transactions rejected during replay, in replay order.
    pub fn invalid_transactions(&self) -> &[InvalidTransaction] {
        &self.invalid
    }

    /// The latest entry for `key` made at or before `at`.
    pub fn latest(&self, key: &str, at: i64) -> Option<&LedgerEntry> {
        self.entries
            .get(key)
            .and_then(|history| history.iter().rev().find(|e| e.made_at <= at))
    }

    /// The role given to `member` directly in this group.
    pub fn own_role(&self, member: &MemberId, at: i64) -> Option<Role> {
        self.latest(&member.to_string(), at)
            .and_then(LedgerEntry::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// The effective role of `agent` at `at`: the maximum of its own entry,
    /// the `everyone` entry, and the roles inherited from parent groups.
    pub fn role_of(&self, agent: &AgentId, at: i64, resolver: &dyn GroupResolver) -> Option<Role> {
        let mut visited = HashSet::from([self.id]);
        self.role_with_visited(agent, at, resolver, &mut visited)
    }

    fn role_with_visited(
        &self,
        agent: &AgentId,
        at: i64,
        resolver: &dyn GroupResolver,
        visited: &mut HashSet<CoId>,
    ) -> Option<Role> {
        let mut role = Role::max_of(
            self.own_role(&MemberId::Agent(*agent), at),
            self.own_role(&MemberId::Everyone, at),
        );
        for parent in self.parents(at) {
            if !visited.insert(parent) {
                continue;
            }
            if let Some(state) = resolver.group(&parent) {
                role = Role::max_of(role, state.role_with_visited(agent, at, resolver, visited));
            }
        }
        role
    }

    /// Parent groups extended at or before `at`.
    pub fn parents(&self, at: i64) -> Vec<CoId> {
        self.entries
            .keys()
            .filter_map(|key| match key.parse::<LedgerKey>() {
                Ok(LedgerKey::Parent(group)) => Some((key, group)),
                _ => None,
            })
            .filter(|(key, _)| {
                self.latest(key, at)
                    .and_then(LedgerEntry::as_str)
                    .is_some_and(|v| v == EXTEND)
            })
            .map(|(_, group)| group)
            .collect()
    }

    /// Direct members and their roles at `at`.
    pub fn members(&self, at: i64) -> Vec<(MemberId, Role)> {
        self.entries
            .keys()
            .filter_map(|key| match key.parse::<LedgerKey>() {
                Ok(LedgerKey::Member(member)) => Some(member),
                _ => None,
            })
            .filter_map(|member| self.own_role(&member, at).map(|role| (member, role)))
            .collect()
    }

    /// The current read key id.
    pub fn read_key_id(&self) -> Option<KeyId> {
        self.latest(READ_KEY, i64::MAX)
            .and_then(LedgerEntry::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// Resolve a read key for `agent`.
    ///
    /// Tries, in order: a copy sealed for the agent, a copy revealed to
    /// everyone, and keys encrypted under another key (previous-key chains in
    /// this group, reveals to parent group keys). Returns `None` when the
    /// agent was never granted the key; that is an expected state.
    pub fn resolve_read_key(
        &self,
        key_id: &KeyId,
        agent: &AgentSecret,
        crypto: &dyn CryptoProvider,
        resolver: &dyn GroupResolver,
    ) -> Option<KeySecret> {
        let agent_id = crypto.agent_id(agent);
        let mut visited = HashSet::new();
        self.resolve_with_visited(key_id, agent, &agent_id, crypto, resolver, &mut visited)
    }

    fn resolve_with_visited(
        &self,
        key_id: &KeyId,
        agent: &AgentSecret,
        agent_id: &AgentId,
        crypto: &dyn CryptoProvider,
        resolver: &dyn GroupResolver,
        visited: &mut HashSet<(CoId, KeyId)>,
    ) -> Option<KeySecret> {
        if !visited.insert((self.id, *key_id)) {
            return None;
        }
        let checked = |secret: KeySecret| (crypto.key_id(&secret) == *key_id).then_some(secret);

        let sealed_key = LedgerKey::KeyFor {
            key: *key_id,
            recipient: *agent_id,
        };
        if let Some(entry) = self.latest(&sealed_key.to_string(), i64::MAX) {
            let opened = entry
                .as_str()
                .and_then(|s| s.parse::<Sealed>().ok())
                .and_then(|sealed| {
                    crypto.unseal(
                        &sealed,
                        &agent.sealer,
                        &entry.author.sealer,
                        &ledger_nonce(&self.id, &sealed_key),
                    )
                })
                .and_then(|bytes| key_from_bytes(&bytes))
                .and_then(checked);
            if opened.is_some() {
                return opened;
            }
        }

        let everyone_key = LedgerKey::KeyForEveryone(*key_id).to_string();
        if let Some(secret) = self
            .latest(&everyone_key, i64::MAX)
            .and_then(LedgerEntry::as_str)
            .and_then(|s| s.parse::<KeySecret>().ok())
            .and_then(checked)
        {
            return Some(secret);
        }

        let prefix = format!("{key_id}_for_{}_z", KeyId::PREFIX);
        let chained: Vec<(LedgerKey, Encrypted)> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, history)| {
                let key = k.parse::<LedgerKey>().ok()?;
                let encrypted = history.last()?.as_str()?.parse::<Encrypted>().ok()?;
                Some((key, encrypted))
            })
            .collect();

        for (ledger_key, encrypted) in chained {
            let LedgerKey::KeyForKey { encrypting, .. } = ledger_key else {
                continue;
            };
            let encrypting_secret = self
                .resolve_with_visited(&encrypting, agent, agent_id, crypto, resolver, visited)
                .or_else(|| {
                    self.parents(i64::MAX).into_iter().find_map(|parent| {
                        resolver.group(&parent)?.resolve_with_visited(
                            &encrypting,
                            agent,
                            agent_id,
                            crypto,
                            resolver,
                            visited,
                        )
                    })
                });
            let Some(encrypting_secret) = encrypting_secret else {
                continue;
            };
            if let Some(secret) = crypto
                .decrypt(
                    &encrypting_secret,
                    &encrypted,
                    &ledger_nonce(&self.id, &ledger_key),
                )
                .and_then(|bytes| key_from_bytes(&bytes))
                .and_then(checked)
            {
                return Some(secret);
            }
        }

        None
    }

    /// The ledger as a JSON object of current values, for display.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.entries
                .iter()
                .filter_map(|(k, history)| {
                    history
                        .last()
                        .and_then(|e| e.value.clone())
                        .map(|v| (k.clone(), v))
                })
                .collect(),
        )
    }
}

fn parse_role(value: &str) -> std::result::Result<Role, String> {
    value.parse().map_err(|e| format!("{e}"))
}

pub(crate) fn key_from_bytes(bytes: &[u8]) -> Option<KeySecret> {
    let arr: [u8; 32] = bytes.try_into().ok()?;
    Some(KeySecret::from_bytes(arr))
}

/// Whether `author` may write to a value governed by `ruleset` at `at`.
///
/// Group values are not covered here; their own replay decides.
pub fn can_write_owned(
    ruleset: &Ruleset,
    author: &AgentId,
    at: i64,
    resolver: &dyn GroupResolver,
) -> bool {
    match ruleset {
        Ruleset::UnsafeAllowAll => true,
        Ruleset::OwnedByGroup { group } => resolver
            .group(group)
            .and_then(|state| state.role_of(author, at, resolver))
            .is_some_and(Role::can_write),
        Ruleset::Group { .. } => false,
    }
}

/// Whether `agent` may read a value governed by `ruleset` at `at`.
pub fn can_read_owned(
    ruleset: &Ruleset,
    agent: &AgentId,
    at: i64,
    resolver: &dyn GroupResolver,
) -> bool {
    match ruleset {
        Ruleset::UnsafeAllowAll => true,
        Ruleset::OwnedByGroup { group } => resolver
            .group(group)
            .and_then(|state| state.role_of(agent, at, resolver))
            .is_some_and(Role::can_read),
        Ruleset::Group { .. } => true,
    }
}
