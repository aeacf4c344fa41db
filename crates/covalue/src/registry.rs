//! The resident CoValues of a node, and group resolution over them.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use covalue_core::{CoId, CoValueKind};
use covalue_perms::{GroupResolver, GroupState};

use crate::value::CoValueCore;

/// Resident CoValues plus a cache of replayed group states.
///
/// `epoch` moves whenever any group changes; content cached under an older
/// epoch is stale.
#[derive(Debug, Default)]
pub struct Registry {
    covalues: HashMap<CoId, CoValueCore>,
    groups: RefCell<HashMap<CoId, Arc<GroupState>>>,
    epoch: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &CoId) -> Option<&CoValueCore> {
        self.covalues.get(id)
    }

    pub fn get_mut(&mut self, id: &CoId) -> Option<&mut CoValueCore> {
        self.covalues.get_mut(id)
    }

    pub fn contains(&self, id: &CoId) -> bool {
        self.covalues.contains_key(id)
    }

    pub fn insert(&mut self, core: CoValueCore) {
        let id = *core.id();
        let is_group = core.kind() == CoValueKind::Group;
        self.covalues.insert(id, core);
        if is_group {
            self.groups_changed();
        }
    }

    /// Resident ids, sorted.
    pub fn ids(&self) -> Vec<CoId> {
        let mut ids: Vec<CoId> = self.covalues.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.covalues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.covalues.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Record that `id` gained transactions.
    pub fn changed(&mut self, id: &CoId) {
        let is_group = self
            .covalues
            .get(id)
            .is_some_and(|core| core.kind() == CoValueKind::Group);
        if is_group {
            self.groups_changed();
        }
    }

    fn groups_changed(&mut self) {
        self.groups.get_mut().clear();
        self.epoch += 1;
    }

    /// A resolver over the resident groups.
    pub fn resolver(&self) -> RegistryResolver<'_> {
        RegistryResolver {
            covalues: &self.covalues,
            cache: &self.groups,
            in_progress: RefCell::new(HashSet::new()),
        }
    }

    /// Split into the covalue map and a resolver, so a core can be mutated
    /// while groups are being resolved.
    pub fn split_mut(&mut self, id: &CoId) -> Option<(&mut CoValueCore, ResolverSnapshot)> {
        let snapshot = ResolverSnapshot::capture(self, id);
        self.covalues.get_mut(id).map(|core| (core, snapshot))
    }
}

/// Resolves groups from resident cores, replaying each at most once per
/// epoch.
///
/// A group reached again while it is still being replayed (a parent cycle)
/// resolves to `None` for that inner lookup.
pub struct RegistryResolver<'a> {
    covalues: &'a HashMap<CoId, CoValueCore>,
    cache: &'a RefCell<HashMap<CoId, Arc<GroupState>>>,
    in_progress: RefCell<HashSet<CoId>>,
}

impl GroupResolver for RegistryResolver<'_> {
    fn group(&self, id: &CoId) -> Option<Arc<GroupState>> {
        if let Some(state) = self.cache.borrow().get(id) {
            return Some(state.clone());
        }
        let core = self.covalues.get(id)?;
        if core.kind() != CoValueKind::Group {
            return None;
        }
        if !self.in_progress.borrow_mut().insert(*id) {
            return None;
        }
        let replayed = core.group_state(self);
        self.in_progress.borrow_mut().remove(id);

        match replayed {
            Ok(state) => {
                let state = Arc::new(state);
                self.cache.borrow_mut().insert(*id, state.clone());
                Some(state)
            }
            Err(e) => {
                tracing::warn!(group = %id, error = %e, "group replay failed");
                None
            }
        }
    }
}

/// Group states needed to act on one core, resolved up front.
///
/// Lets a caller hold `&mut CoValueCore` while still answering group lookups.
pub struct ResolverSnapshot {
    groups: HashMap<CoId, Arc<GroupState>>,
}

impl ResolverSnapshot {
    fn capture(registry: &Registry, id: &CoId) -> Self {
        let resolver = registry.resolver();
        let mut groups = HashMap::new();
        let mut pending = vec![*id];
        let mut seen = HashSet::new();

        while let Some(next) = pending.pop() {
            if !seen.insert(next) {
                continue;
            }
            let Some(core) = registry.get(&next) else {
                continue;
            };
            if let Some(state) = resolver.group(&next) {
                groups.insert(next, state);
            }
            pending.extend(core.dependencies(&resolver));
        }
        Self { groups }
    }
}

impl GroupResolver for ResolverSnapshot {
    fn group(&self, id: &CoId) -> Option<Arc<GroupState>> {
        self.groups.get(id).cloned()
    }
}
