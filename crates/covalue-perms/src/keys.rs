//! Authoring group ledger changes.
//!
//! These helpers build the change lists for membership and key operations.
//! They do not write anything; the caller appends the changes as one trusting
//! transaction to the group, so a membership change and the key material that
//! goes with it are accepted or rejected together.

use serde_json::Value;

use covalue_core::{AgentId, AgentSecret, CoId, CryptoProvider, KeyId, KeySecret, MapEdit};

use crate::error::{PermsError, Result};
use crate::group::{ledger_nonce, GroupResolver, GroupState};
use crate::ledger::{LedgerKey, EXTEND, READ_KEY};
use crate::role::{MemberId, Role};

/// Changes that bootstrap a new group: the creator becomes admin and gets a
/// first read key sealed for itself.
pub fn initial_group_changes(
    group: &CoId,
    admin: &AgentSecret,
    crypto: &dyn CryptoProvider,
) -> Result<Vec<Value>> {
    let admin_id = crypto.agent_id(admin);
    let key = crypto.new_key_secret();
    let key_id = crypto.key_id(&key);

    let edit = MapEdit::new().set(MemberId::Agent(admin_id).to_string(), Role::Admin.as_str());
    let edit = seal_for(edit, group, &key, &key_id, admin, &admin_id, crypto)?;
    Ok(edit.set(READ_KEY, key_id.to_string()).into_changes())
}

/// Changes that give `member` a role, and the current read key if the role
/// can read.
pub fn add_member_changes(
    state: &GroupState,
    member: MemberId,
    role: Role,
    author: &AgentSecret,
    crypto: &dyn CryptoProvider,
    resolver: &dyn GroupResolver,
) -> Result<Vec<Value>> {
    let author_id = crypto.agent_id(author);
    require_role(state, &author_id, Role::Manager, resolver)?;
    if member == MemberId::Everyone && !matches!(role, Role::Reader | Role::Writer) {
        return Err(PermsError::PermissionDenied(format!(
            "everyone cannot be {role}"
        )));
    }

    let mut edit = MapEdit::new().set(member.to_string(), role.as_str());

    if role.can_read() {
        if let Some(key_id) = state.read_key_id() {
            let key = current_key(state, &key_id, author, crypto, resolver)?;
            edit = match member {
                MemberId::Agent(recipient) => {
                    seal_for(edit, state.id(), &key, &key_id, author, &recipient, crypto)?
                }
                MemberId::Everyone => edit.set(
                    LedgerKey::KeyForEveryone(key_id).to_string(),
                    key.to_string(),
                ),
            };
        }
    }

    Ok(edit.into_changes())
}

/// Changes that revoke `member` and rotate the read key so that content
/// written afterwards is unreadable to them.
pub fn remove_member_changes(
    state: &GroupState,
    member: MemberId,
    author: &AgentSecret,
    crypto: &dyn CryptoProvider,
    resolver: &dyn GroupResolver,
) -> Result<Vec<Value>> {
    let author_id = crypto.agent_id(author);
    require_role(state, &author_id, Role::Manager, resolver)?;

    let edit = MapEdit::new().set(member.to_string(), Role::Revoked.as_str());
    Ok(rotate(edit, state, Some(&member), author, crypto, resolver)?.into_changes())
}

/// Changes that rotate the read key without changing membership.
pub fn rotate_read_key_changes(
    state: &GroupState,
    author: &AgentSecret,
    crypto: &dyn CryptoProvider,
    resolver: &dyn GroupResolver,
) -> Result<Vec<Value>> {
    let author_id = crypto.agent_id(author);
    require_role(state, &author_id, Role::Manager, resolver)?;
    Ok(rotate(MapEdit::new(), state, None, author, crypto, resolver)?.into_changes())
}

/// Changes that make `child` extend `parent`: parent members get their
/// parent role in the child, and the child's read key is revealed to the
/// parent's read key.
pub fn extend_group_changes(
    child: &GroupState,
    parent: &GroupState,
    author: &AgentSecret,
    crypto: &dyn CryptoProvider,
    resolver: &dyn GroupResolver,
) -> Result<Vec<Value>> {
    let author_id = crypto.agent_id(author);
    require_role(child, &author_id, Role::Admin, resolver)?;

    let mut edit = MapEdit::new().set(LedgerKey::Parent(*parent.id()).to_string(), EXTEND);
    if let Some(reveal) = reveal_to_parent(child, parent, author, crypto, resolver)? {
        edit = edit.set(reveal.0, reveal.1);
    }
    Ok(edit.into_changes())
}

fn require_role(
    state: &GroupState,
    author: &AgentId,
    needed: Role,
    resolver: &dyn GroupResolver,
) -> Result<()> {
    match state.role_of(author, i64::MAX, resolver) {
        Some(role) if role >= needed => Ok(()),
        other => Err(PermsError::PermissionDenied(format!(
            "need {needed} in {}, have {other:?}",
            state.id()
        ))),
    }
}

fn current_key(
    state: &GroupState,
    key_id: &KeyId,
    author: &AgentSecret,
    crypto: &dyn CryptoProvider,
    resolver: &dyn GroupResolver,
) -> Result<KeySecret> {
    state
        .resolve_read_key(key_id, author, crypto, resolver)
        .ok_or_else(|| PermsError::NoReadKey(format!("{key_id} in {}", state.id())))
}

fn seal_for(
    edit: MapEdit,
    group: &CoId,
    key: &KeySecret,
    key_id: &KeyId,
    author: &AgentSecret,
    recipient: &AgentId,
    crypto: &dyn CryptoProvider,
) -> Result<MapEdit> {
    let ledger_key = LedgerKey::KeyFor {
        key: *key_id,
        recipient: *recipient,
    };
    let sealed = crypto.seal(
        key.as_bytes(),
        &author.sealer,
        &recipient.sealer,
        &ledger_nonce(group, &ledger_key),
    )?;
    Ok(edit.set(ledger_key.to_string(), sealed.to_string()))
}

fn encrypt_key_for_key(
    group: &CoId,
    key: &KeySecret,
    key_id: &KeyId,
    encrypting: &KeySecret,
    encrypting_id: &KeyId,
    crypto: &dyn CryptoProvider,
) -> Result<(String, String)> {
    let ledger_key = LedgerKey::KeyForKey {
        key: *key_id,
        encrypting: *encrypting_id,
    };
    let encrypted = crypto.encrypt(
        encrypting,
        key.as_bytes(),
        &ledger_nonce(group, &ledger_key),
    )?;
    Ok((ledger_key.to_string(), encrypted.to_string()))
}

fn reveal_to_parent(
    child: &GroupState,
    parent: &GroupState,
    author: &AgentSecret,
    crypto: &dyn CryptoProvider,
    resolver: &dyn GroupResolver,
) -> Result<Option<(String, String)>> {
    let (Some(child_key_id), Some(parent_key_id)) = (child.read_key_id(), parent.read_key_id())
    else {
        return Ok(None);
    };
    let child_key = current_key(child, &child_key_id, author, crypto, resolver)?;
    let Some(parent_key) = parent.resolve_read_key(&parent_key_id, author, crypto, resolver)
    else {
        tracing::debug!(
            child = %child.id(),
            parent = %parent.id(),
            "author cannot read parent key, not revealing child key"
        );
        return Ok(None);
    };
    encrypt_key_for_key(
        child.id(),
        &child_key,
        &child_key_id,
        &parent_key,
        &parent_key_id,
        crypto,
    )
    .map(Some)
}

/// Append a key rotation to `edit`: a new key sealed for every remaining
/// reader, the previous key encrypted under the new one, reveals to
/// everyone and to parent keys where they apply, then the new `readKey`.
fn rotate(
    mut edit: MapEdit,
    state: &GroupState,
    excluded: Option<&MemberId>,
    author: &AgentSecret,
    crypto: &dyn CryptoProvider,
    resolver: &dyn GroupResolver,
) -> Result<MapEdit> {
    let group = state.id();
    let new_key = crypto.new_key_secret();
    let new_key_id = crypto.key_id(&new_key);

    let readers = state
        .members(i64::MAX)
        .into_iter()
        .filter(|(member, role)| Some(member) != excluded && role.can_read());

    for (member, _) in readers {
        edit = match member {
            MemberId::Agent(recipient) => {
                seal_for(edit, group, &new_key, &new_key_id, author, &recipient, crypto)?
            }
            MemberId::Everyone => edit.set(
                LedgerKey::KeyForEveryone(new_key_id).to_string(),
                new_key.to_string(),
            ),
        };
    }

    if let Some(old_key_id) = state.read_key_id() {
        let old_key = current_key(state, &old_key_id, author, crypto, resolver)?;
        let (k, v) = encrypt_key_for_key(group, &old_key, &old_key_id, &new_key, &new_key_id, crypto)?;
        edit = edit.set(k, v);
    }

    for parent_id in state.parents(i64::MAX) {
        let Some(parent) = resolver.group(&parent_id) else {
            tracing::debug!(group = %group, parent = %parent_id, "parent group unavailable during rotation");
            continue;
        };
        let Some(parent_key_id) = parent.read_key_id() else {
            continue;
        };
        let Some(parent_key) = parent.resolve_read_key(&parent_key_id, author, crypto, resolver)
        else {
            continue;
        };
        let (k, v) =
            encrypt_key_for_key(group, &new_key, &new_key_id, &parent_key, &parent_key_id, crypto)?;
        edit = edit.set(k, v);
    }

    tracing::debug!(group = %group, key = %new_key_id, "rotating read key");
    Ok(edit.set(READ_KEY, new_key_id.to_string()))
}
