//! Database schema migrations for SQLite.
//!
//! Versioned: each migration transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema. Safe to call repeatedly.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database is at version {current}, newer than {CURRENT_VERSION}"
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;
        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
            tracing::debug!(version, "applied storage migration");
        }
        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {version}"
        ))),
    }
}

/// Migration v1: headers, per-session cursors, transactions.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per CoValue; header is canonical CBOR
        CREATE TABLE covalues (
            id BLOB PRIMARY KEY,              -- 32 bytes, blake3 of canonical header
            header BLOB NOT NULL,
            stored_at INTEGER NOT NULL
        );

        -- Per-session tip
        CREATE TABLE sessions (
            covalue BLOB NOT NULL,
            session TEXT NOT NULL,            -- <agentId>_session_z...
            tx_count INTEGER NOT NULL,
            last_signature BLOB NOT NULL,     -- 64 bytes, over the rolling hash of all tx_count transactions
            PRIMARY KEY (covalue, session)
        );

        -- Transactions in session order; tx is canonical CBOR
        CREATE TABLE transactions (
            covalue BLOB NOT NULL,
            session TEXT NOT NULL,
            idx INTEGER NOT NULL,
            tx BLOB NOT NULL,
            PRIMARY KEY (covalue, session, idx)
        );
        "#,
    )?;
    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
