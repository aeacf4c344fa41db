//! # CoValue Store
//!
//! Storage abstraction for CoValue logs. Provides the async [`Storage`] trait
//! with SQLite and in-memory implementations.
//!
//! ## Key Types
//!
//! - [`Storage`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`StoredCoValue`] - A header and its per-session transaction runs
//! - [`AppendResult`] - Outcome of appending to a session
//!
//! ## Usage
//!
//! ```rust,no_run
//! use covalue_store::{SqliteStore, Storage};
//!
//! async fn example() {
//!     let store = SqliteStore::open("covalues.db").unwrap();
//!     for id in store.list_ids().await.unwrap() {
//!         let known = store.known_state(&id).await.unwrap();
//!         println!("{id}: {} transactions", known.total());
//!     }
//! }
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{AppendResult, Storage, StoredCoValue, StoredSession};

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use covalue_core::{
        CoId, CoValueKind, CryptoProvider, DalekCrypto, Header, SessionId, Signature, Transaction,
    };

    /// A header, its id, one session and `n` trusting transactions.
    pub(crate) fn sample(n: usize) -> (CoId, Header, SessionId, Vec<Transaction>) {
        let crypto = DalekCrypto::new();
        let agent = crypto.agent_id(&crypto.new_agent_secret());
        let header = Header::owned_by(CoValueKind::Map, CoId([1; 32]), "store-test".into(), 0);
        let id = header.id(&crypto).unwrap();
        let session = SessionId::new(agent, [2; 8]);
        let txs = (0..n)
            .map(|i| {
                Transaction::trusting(
                    i as i64,
                    &[json!({"op": "set", "key": "n", "value": i})],
                )
                .unwrap()
            })
            .collect();
        (id, header, session, txs)
    }

    pub(crate) fn signature(byte: u8) -> Signature {
        Signature([byte; 64])
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Append properties, both backends
    // ─────────────────────────────────────────────────────────────────────────

    use proptest::prelude::*;

    use crate::{AppendResult, MemoryStore, SqliteStore, Storage};

    const RUN_SOURCE: usize = 10;

    /// What a store must answer for a run, given `held` stored transactions.
    fn expected(held: &mut usize, after: usize, end: usize) -> AppendResult {
        if after > *held {
            AppendResult::Gap { held: *held }
        } else if end <= *held {
            AppendResult::AlreadyKnown
        } else {
            let added = end - *held;
            *held = end;
            AppendResult::Appended { added }
        }
    }

    async fn replay(store: &dyn Storage, runs: &[(usize, usize)]) -> Result<(), TestCaseError> {
        let (id, header, session, txs) = sample(RUN_SOURCE);
        store.store_header(&id, &header).await.unwrap();

        let mut held = 0;
        for &(after, len) in runs {
            let end = (after + len).min(RUN_SOURCE);
            let result = store
                .append_transactions(&id, &session, after, &txs[after..end], &signature(end as u8))
                .await
                .unwrap();
            prop_assert_eq!(result, expected(&mut held, after, end));
        }

        // Replaying everything held stores nothing new.
        if held > 0 {
            let again = store
                .append_transactions(&id, &session, 0, &txs[..held], &signature(held as u8))
                .await
                .unwrap();
            prop_assert_eq!(again, AppendResult::AlreadyKnown);
        }
        let stored = store.load(&id).await.unwrap().unwrap();
        let stored_txs = stored
            .sessions
            .get(&session)
            .map(|run| run.transactions.clone())
            .unwrap_or_default();
        prop_assert_eq!(stored_txs, txs[..held].to_vec());
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_appends_are_idempotent_and_gapless(
            runs in prop::collection::vec((0..RUN_SOURCE, 1..4usize), 1..12),
        ) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let sqlite = SqliteStore::open(dir.path().join("append.db")).unwrap();

            runtime.block_on(replay(&MemoryStore::new(), &runs))?;
            runtime.block_on(replay(&sqlite, &runs))?;
        }
    }
}
