//! SQLite implementation of the Storage trait.
//!
//! rusqlite with bundled SQLite, driven from async code through
//! `tokio::task::spawn_blocking`. Headers and transactions are stored as
//! their canonical CBOR, the same bytes that were hashed and signed.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use covalue_core::canonical::{decode_header, decode_transaction};
use covalue_core::{
    canonical_header_bytes, canonical_transaction_bytes, CoId, Header, KnownState, SessionId,
    Signature, Transaction,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{plan_append, AppendResult, Storage, StoredCoValue, StoredSession};

/// SQLite-backed store.
///
/// Cloning shares the connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path, creating and migrating it
    /// if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Task(format!("connection mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {e}")))?
    }
}

fn signature_from_blob(bytes: Vec<u8>) -> Result<Signature> {
    let arr: [u8; 64] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| StoreError::InvalidData(format!("signature of {} bytes", b.len())))?;
    Ok(Signature(arr))
}

fn co_id_from_blob(bytes: Vec<u8>) -> Result<CoId> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| StoreError::InvalidData(format!("id of {} bytes", b.len())))?;
    Ok(CoId(arr))
}

fn parse_session(s: &str) -> Result<SessionId> {
    s.parse()
        .map_err(|e| StoreError::InvalidData(format!("session {s}: {e}")))
}

fn held(conn: &Connection, id: &CoId, session: &str) -> Result<usize> {
    let count: Option<i64> = conn
        .query_row(
            "SELECT tx_count FROM sessions WHERE covalue = ?1 AND session = ?2",
            params![id.as_bytes().as_slice(), session],
            |row| row.get(0),
        )
        .optional()?;
    Ok(count.unwrap_or(0) as usize)
}

#[async_trait]
impl Storage for SqliteStore {
    async fn load(&self, id: &CoId) -> Result<Option<StoredCoValue>> {
        let id = *id;
        self.with_conn(move |conn| {
            let header: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT header FROM covalues WHERE id = ?1",
                    params![id.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(header) = header else {
                return Ok(None);
            };
            let header = decode_header(&header)?;

            let session_rows: Vec<(String, Vec<u8>)> = conn
                .prepare(
                    "SELECT session, last_signature FROM sessions
                     WHERE covalue = ?1 ORDER BY session",
                )?
                .query_map(params![id.as_bytes().as_slice()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<_>>()?;

            let mut tx_stmt = conn.prepare(
                "SELECT tx FROM transactions WHERE covalue = ?1 AND session = ?2 ORDER BY idx",
            )?;

            let mut sessions = BTreeMap::new();
            for (session, signature) in session_rows {
                let blobs: Vec<Vec<u8>> = tx_stmt
                    .query_map(params![id.as_bytes().as_slice(), session], |row| row.get(0))?
                    .collect::<rusqlite::Result<_>>()?;
                let transactions = blobs
                    .iter()
                    .map(|blob| decode_transaction(blob))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                sessions.insert(
                    parse_session(&session)?,
                    StoredSession {
                        transactions,
                        last_signature: signature_from_blob(signature)?,
                    },
                );
            }

            Ok(Some(StoredCoValue {
                id,
                header,
                sessions,
            }))
        })
        .await
    }

    async fn store_header(&self, id: &CoId, header: &Header) -> Result<bool> {
        let id = *id;
        let bytes = canonical_header_bytes(header)?;
        self.with_conn(move |conn| {
            let existing: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT header FROM covalues WHERE id = ?1",
                    params![id.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(existing) if existing == bytes => Ok(false),
                Some(_) => Err(StoreError::HeaderConflict(id.to_string())),
                None => {
                    conn.execute(
                        "INSERT INTO covalues (id, header, stored_at) VALUES (?1, ?2, ?3)",
                        params![id.as_bytes().as_slice(), bytes, now_millis()],
                    )?;
                    Ok(true)
                }
            }
        })
        .await
    }

    async fn append_transactions(
        &self,
        id: &CoId,
        session: &SessionId,
        after: usize,
        transactions: &[Transaction],
        last_signature: &Signature,
    ) -> Result<AppendResult> {
        let id = *id;
        let session = session.to_string();
        let signature = *last_signature;
        let encoded = transactions
            .iter()
            .map(canonical_transaction_bytes)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let has_header: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM covalues WHERE id = ?1",
                    params![id.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            if has_header.is_none() {
                return Err(StoreError::MissingHeader(id.to_string()));
            }

            let held = held(&tx, &id, &session)?;
            let skip = match plan_append(held, after, encoded.len()) {
                Ok(skip) => skip,
                Err(outcome) => return Ok(outcome),
            };

            {
                let mut insert = tx.prepare(
                    "INSERT INTO transactions (covalue, session, idx, tx) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (offset, bytes) in encoded[skip..].iter().enumerate() {
                    insert.execute(params![
                        id.as_bytes().as_slice(),
                        session,
                        (held + offset) as i64,
                        bytes
                    ])?;
                }
            }

            let added = encoded.len() - skip;
            tx.execute(
                "INSERT INTO sessions (covalue, session, tx_count, last_signature)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(covalue, session) DO UPDATE SET
                    tx_count = excluded.tx_count,
                    last_signature = excluded.last_signature",
                params![
                    id.as_bytes().as_slice(),
                    session,
                    (held + added) as i64,
                    signature.as_bytes().as_slice()
                ],
            )?;
            tx.commit()?;

            Ok(AppendResult::Appended { added })
        })
        .await
    }

    async fn known_state(&self, id: &CoId) -> Result<KnownState> {
        let id = *id;
        self.with_conn(move |conn| {
            let mut known = KnownState::empty(id);
            known.header = conn
                .query_row(
                    "SELECT 1 FROM covalues WHERE id = ?1",
                    params![id.as_bytes().as_slice()],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .is_some();

            let rows: Vec<(String, i64)> = conn
                .prepare("SELECT session, tx_count FROM sessions WHERE covalue = ?1")?
                .query_map(params![id.as_bytes().as_slice()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<_>>()?;
            for (session, count) in rows {
                known.advance(parse_session(&session)?, count as usize);
            }
            Ok(known)
        })
        .await
    }

    async fn list_ids(&self) -> Result<Vec<CoId>> {
        self.with_conn(|conn| {
            let blobs: Vec<Vec<u8>> = conn
                .prepare("SELECT id FROM covalues ORDER BY id")?
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            blobs.into_iter().map(co_id_from_blob).collect()
        })
        .await
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
