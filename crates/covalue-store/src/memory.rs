//! In-memory implementation of the Storage trait.
//!
//! Same semantics as SQLite but nothing is persisted.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use covalue_core::{CoId, Header, KnownState, SessionId, Signature, Transaction};

use crate::error::{Result, StoreError};
use crate::traits::{plan_append, AppendResult, Storage, StoredCoValue, StoredSession};

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<CoId, StoredCoValue>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored CoValues.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn load(&self, id: &CoId) -> Result<Option<StoredCoValue>> {
        Ok(self.inner.read().get(id).cloned())
    }

    async fn store_header(&self, id: &CoId, header: &Header) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.get(id) {
            Some(stored) if stored.header == *header => Ok(false),
            Some(_) => Err(StoreError::HeaderConflict(id.to_string())),
            None => {
                inner.insert(
                    *id,
                    StoredCoValue {
                        id: *id,
                        header: header.clone(),
                        sessions: BTreeMap::new(),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn append_transactions(
        &self,
        id: &CoId,
        session: &SessionId,
        after: usize,
        transactions: &[Transaction],
        last_signature: &Signature,
    ) -> Result<AppendResult> {
        let mut inner = self.inner.write();
        let stored = inner
            .get_mut(id)
            .ok_or_else(|| StoreError::MissingHeader(id.to_string()))?;

        let held = stored
            .sessions
            .get(session)
            .map_or(0, |s| s.transactions.len());
        let skip = match plan_append(held, after, transactions.len()) {
            Ok(skip) => skip,
            Err(outcome) => return Ok(outcome),
        };

        let fresh = &transactions[skip..];
        let entry = stored
            .sessions
            .entry(*session)
            .or_insert_with(|| StoredSession {
                transactions: Vec::new(),
                last_signature: *last_signature,
            });
        entry.transactions.extend_from_slice(fresh);
        entry.last_signature = *last_signature;

        Ok(AppendResult::Appended { added: fresh.len() })
    }

    async fn known_state(&self, id: &CoId) -> Result<KnownState> {
        Ok(self
            .inner
            .read()
            .get(id)
            .map(StoredCoValue::known_state)
            .unwrap_or_else(|| KnownState::empty(*id)))
    }

    async fn list_ids(&self) -> Result<Vec<CoId>> {
        let mut ids: Vec<CoId> = self.inner.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{sample, signature};

    #[tokio::test]
    async fn test_header_then_append() {
        let store = MemoryStore::new();
        let (id, header, session, txs) = sample(3);

        assert!(store.store_header(&id, &header).await.unwrap());
        assert!(!store.store_header(&id, &header).await.unwrap());

        let result = store
            .append_transactions(&id, &session, 0, &txs, &signature(1))
            .await
            .unwrap();
        assert_eq!(result, AppendResult::Appended { added: 3 });

        let known = store.known_state(&id).await.unwrap();
        assert!(known.header);
        assert_eq!(known.count(&session), 3);
        assert_eq!(store.list_ids().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_append_requires_header() {
        let store = MemoryStore::new();
        let (id, _, session, txs) = sample(1);
        let err = store
            .append_transactions(&id, &session, 0, &txs, &signature(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingHeader(_)));
    }

    #[tokio::test]
    async fn test_overlap_and_gap() {
        let store = MemoryStore::new();
        let (id, header, session, txs) = sample(4);
        store.store_header(&id, &header).await.unwrap();
        store
            .append_transactions(&id, &session, 0, &txs[..2], &signature(1))
            .await
            .unwrap();

        let gap = store
            .append_transactions(&id, &session, 3, &txs[3..], &signature(2))
            .await
            .unwrap();
        assert_eq!(gap, AppendResult::Gap { held: 2 });

        let overlap = store
            .append_transactions(&id, &session, 1, &txs[1..], &signature(3))
            .await
            .unwrap();
        assert_eq!(overlap, AppendResult::Appended { added: 2 });

        let again = store
            .append_transactions(&id, &session, 0, &txs, &signature(3))
            .await
            .unwrap();
        assert_eq!(again, AppendResult::AlreadyKnown);

        let stored = store.load(&id).await.unwrap().unwrap();
        assert_eq!(stored.sessions[&session].transactions, txs);
        assert_eq!(stored.sessions[&session].last_signature, signature(3));
    }
}
