//! Canonical CBOR encoding for deterministic serialization.
//!
//! This module implements RFC 8949 Core Deterministic Encoding:
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//! - No floats (timestamps are i64 milliseconds, JSON travels as text)
//!
//! Headers are hashed into a `CoId` and transactions are fed into the rolling
//! session hash, so both must produce identical bytes on every platform.

use ciborium::value::Value;

use crate::crypto::{AgentId, Encrypted, KeyId, SealerId, SignerId};
use crate::error::CoreError;
use crate::header::{CoValueKind, Header, Ruleset};
use crate::transaction::Transaction;
use crate::types::CoId;

/// Canonical encoding version.
pub const CANONICAL_VERSION: u8 = 1;

/// Header field keys (integer keys for compact encoding).
///
/// Keys 0-23 encode as single bytes in CBOR.
mod header_keys {
    pub const VERSION: u64 = 0;
    pub const KIND: u64 = 1;
    pub const RULESET: u64 = 2;
    pub const META: u64 = 3;
    pub const UNIQUENESS: u64 = 4;
    pub const CREATED_AT: u64 = 5;
}

mod ruleset_keys {
    pub const TAG: u64 = 0;
    pub const SUBJECT: u64 = 1;
}

mod tx_keys {
    pub const PRIVACY: u64 = 0;
    pub const MADE_AT: u64 = 1;
    pub const CHANGES: u64 = 2;
    pub const KEY_USED: u64 = 3;
}

const RULESET_GROUP: u64 = 0;
const RULESET_OWNED_BY_GROUP: u64 = 1;
const RULESET_UNSAFE_ALLOW_ALL: u64 = 2;

const PRIVACY_TRUSTING: u64 = 0;
const PRIVACY_PRIVATE: u64 = 1;

/// Encode a header to canonical CBOR bytes.
pub fn canonical_header_bytes(header: &Header) -> Result<Vec<u8>, CoreError> {
    let value = header_to_cbor_value(header)?;
    encode_cbor_value_canonical(&value)
}

/// Encode a transaction to canonical CBOR bytes.
///
/// These bytes are what the rolling session hash consumes.
pub fn canonical_transaction_bytes(tx: &Transaction) -> Result<Vec<u8>, CoreError> {
    let value = transaction_to_cbor_value(tx);
    encode_cbor_value_canonical(&value)
}

fn int(n: u64) -> Value {
    Value::Integer(n.into())
}

fn entry(key: u64, value: Value) -> (Value, Value) {
    (int(key), value)
}

/// Convert a header to a CBOR Value (map with integer keys).
fn header_to_cbor_value(header: &Header) -> Result<Value, CoreError> {
    let ruleset = match &header.ruleset {
        Ruleset::Group { initial_admin } => {
            let mut admin = initial_admin.sealer.0.to_vec();
            admin.extend_from_slice(&initial_admin.signer.0);
            Value::Map(vec![
                entry(ruleset_keys::TAG, int(RULESET_GROUP)),
                entry(ruleset_keys::SUBJECT, Value::Bytes(admin)),
            ])
        }
        Ruleset::OwnedByGroup { group } => Value::Map(vec![
            entry(ruleset_keys::TAG, int(RULESET_OWNED_BY_GROUP)),
            entry(ruleset_keys::SUBJECT, Value::Bytes(group.0.to_vec())),
        ]),
        Ruleset::UnsafeAllowAll => {
            Value::Map(vec![entry(ruleset_keys::TAG, int(RULESET_UNSAFE_ALLOW_ALL))])
        }
    };

    // serde_json maps are ordered, so the text form of meta is deterministic
    let meta = match &header.meta {
        Some(meta) => Value::Text(
            serde_json::to_string(meta).map_err(|e| CoreError::EncodingError(e.to_string()))?,
        ),
        None => Value::Null,
    };

    Ok(Value::Map(vec![
        entry(header_keys::VERSION, int(CANONICAL_VERSION.into())),
        entry(header_keys::KIND, int(header.kind.to_u8().into())),
        entry(header_keys::RULESET, ruleset),
        entry(header_keys::META, meta),
        entry(header_keys::UNIQUENESS, Value::Text(header.uniqueness.clone())),
        entry(
            header_keys::CREATED_AT,
            Value::Integer(header.created_at.into()),
        ),
    ]))
}

/// Convert a transaction to a CBOR Value (map with integer keys).
fn transaction_to_cbor_value(tx: &Transaction) -> Value {
    match tx {
        Transaction::Trusting { made_at, changes } => Value::Map(vec![
            entry(tx_keys::PRIVACY, int(PRIVACY_TRUSTING)),
            entry(tx_keys::MADE_AT, Value::Integer((*made_at).into())),
            entry(tx_keys::CHANGES, Value::Text(changes.clone())),
        ]),
        Transaction::Private {
            made_at,
            key_used,
            encrypted_changes,
        } => Value::Map(vec![
            entry(tx_keys::PRIVACY, int(PRIVACY_PRIVATE)),
            entry(tx_keys::MADE_AT, Value::Integer((*made_at).into())),
            entry(tx_keys::CHANGES, Value::Bytes(encrypted_changes.0.clone())),
            entry(tx_keys::KEY_USED, Value::Bytes(key_used.0.to_vec())),
        ]),
    }
}

/// Encode a CBOR Value to canonical bytes.
///
/// This function ensures:
/// - Map keys are sorted by encoded byte comparison
/// - Integers use smallest encoding
/// - Definite lengths only
fn encode_cbor_value_canonical(value: &Value) -> Result<Vec<u8>, CoreError> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value)?;
    Ok(buf)
}

/// Recursively encode a CBOR value.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) -> Result<(), CoreError> {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => encode_bytes(buf, b),
        Value::Text(s) => encode_text(buf, s),
        Value::Array(arr) => encode_array(buf, arr)?,
        Value::Map(entries) => encode_map_canonical(buf, entries)?,
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        Value::Float(_) => {
            return Err(CoreError::EncodingError(
                "floats not supported in canonical encoding".into(),
            ))
        }
        _ => {
            return Err(CoreError::EncodingError(
                "unsupported CBOR value type".into(),
            ))
        }
    }
    Ok(())
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: ciborium::value::Integer) {
    let n: i128 = i.into();

    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        let abs = (-1 - n) as u64;
        encode_uint(buf, 1, abs);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffffffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    encode_uint(buf, 2, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn encode_text(buf: &mut Vec<u8>, s: &str) {
    encode_uint(buf, 3, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn encode_array(buf: &mut Vec<u8>, arr: &[Value]) -> Result<(), CoreError> {
    encode_uint(buf, 4, arr.len() as u64);
    for item in arr {
        encode_value_to(buf, item)?;
    }
    Ok(())
}

/// Encode a map canonically (major type 5).
///
/// Keys are sorted by their encoded byte comparison.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) -> Result<(), CoreError> {
    let mut pairs = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        let mut key_buf = Vec::new();
        encode_value_to(&mut key_buf, k)?;
        pairs.push((key_buf, v));
    }

    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value)?;
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────────────
// Decoding
// ───────────────────────────────────────────────────────────────────────────

/// Decode a header from canonical bytes.
pub fn decode_header(bytes: &[u8]) -> Result<Header, CoreError> {
    let value: Value =
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))?;
    let map = as_map(&value).ok_or_else(|| CoreError::MalformedHeader("expected map".into()))?;

    let version = get_int(map, header_keys::VERSION)
        .ok_or_else(|| CoreError::MalformedHeader("missing version".into()))?;
    if version != i128::from(CANONICAL_VERSION) {
        return Err(CoreError::MalformedHeader(format!(
            "unsupported version: {version}"
        )));
    }

    let kind = get_int(map, header_keys::KIND)
        .and_then(|n| u8::try_from(n).ok())
        .and_then(CoValueKind::from_u8)
        .ok_or_else(|| CoreError::MalformedHeader("invalid kind".into()))?;

    let ruleset_map = get(map, header_keys::RULESET)
        .and_then(as_map)
        .ok_or_else(|| CoreError::MalformedHeader("missing ruleset".into()))?;
    let tag = get_int(ruleset_map, ruleset_keys::TAG)
        .ok_or_else(|| CoreError::MalformedHeader("missing ruleset tag".into()))?;
    let subject = get_bytes(ruleset_map, ruleset_keys::SUBJECT);
    let ruleset = match (tag as u64, subject) {
        (RULESET_GROUP, Some(b)) if b.len() == 64 => {
            let sealer: [u8; 32] = b[..32]
                .try_into()
                .map_err(|_| CoreError::MalformedHeader("invalid admin".into()))?;
            let signer: [u8; 32] = b[32..]
                .try_into()
                .map_err(|_| CoreError::MalformedHeader("invalid admin".into()))?;
            Ruleset::Group {
                initial_admin: AgentId {
                    sealer: SealerId(sealer),
                    signer: SignerId(signer),
                },
            }
        }
        (RULESET_OWNED_BY_GROUP, Some(b)) => {
            let group: [u8; 32] = b
                .try_into()
                .map_err(|_| CoreError::MalformedHeader("invalid owning group".into()))?;
            Ruleset::OwnedByGroup { group: CoId(group) }
        }
        (RULESET_UNSAFE_ALLOW_ALL, _) => Ruleset::UnsafeAllowAll,
        _ => return Err(CoreError::MalformedHeader("invalid ruleset".into())),
    };

    let meta = match get(map, header_keys::META) {
        Some(Value::Text(s)) => Some(
            serde_json::from_str(s).map_err(|e| CoreError::MalformedHeader(e.to_string()))?,
        ),
        Some(Value::Null) | None => None,
        _ => return Err(CoreError::MalformedHeader("invalid meta".into())),
    };

    let uniqueness = match get(map, header_keys::UNIQUENESS) {
        Some(Value::Text(s)) => s.clone(),
        _ => return Err(CoreError::MalformedHeader("missing uniqueness".into())),
    };

    let created_at = get_int(map, header_keys::CREATED_AT)
        .and_then(|n| i64::try_from(n).ok())
        .ok_or_else(|| CoreError::MalformedHeader("missing created_at".into()))?;

    Ok(Header {
        kind,
        ruleset,
        meta,
        uniqueness,
        created_at,
    })
}

/// Decode a transaction from canonical bytes.
pub fn decode_transaction(bytes: &[u8]) -> Result<Transaction, CoreError> {
    let malformed = |what: &str| CoreError::DecodingError(format!("transaction: {what}"));

    let value: Value =
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))?;
    let map = as_map(&value).ok_or_else(|| malformed("expected map"))?;

    let made_at = get_int(map, tx_keys::MADE_AT)
        .and_then(|n| i64::try_from(n).ok())
        .ok_or_else(|| malformed("missing made_at"))?;

    match get_int(map, tx_keys::PRIVACY).map(|n| n as u64) {
        Some(PRIVACY_TRUSTING) => match get(map, tx_keys::CHANGES) {
            Some(Value::Text(changes)) => Ok(Transaction::Trusting {
                made_at,
                changes: changes.clone(),
            }),
            _ => Err(malformed("missing changes")),
        },
        Some(PRIVACY_PRIVATE) => {
            let encrypted = get_bytes(map, tx_keys::CHANGES)
                .ok_or_else(|| malformed("missing encrypted changes"))?;
            let key_used: [u8; 16] = get_bytes(map, tx_keys::KEY_USED)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| malformed("invalid key_used"))?;
            Ok(Transaction::Private {
                made_at,
                key_used: KeyId(key_used),
                encrypted_changes: Encrypted(encrypted.to_vec()),
            })
        }
        _ => Err(malformed("invalid privacy")),
    }
}

fn as_map(value: &Value) -> Option<&[(Value, Value)]> {
    match value {
        Value::Map(m) => Some(m.as_slice()),
        _ => None,
    }
}

fn get(map: &[(Value, Value)], key: u64) -> Option<&Value> {
    map.iter()
        .find(|(k, _)| matches!(k, Value::Integer(i) if i128::from(*i) == i128::from(key)))
        .map(|(_, v)| v)
}

fn get_int(map: &[(Value, Value)], key: u64) -> Option<i128> {
    match get(map, key) {
        Some(Value::Integer(i)) => Some((*i).into()),
        _ => None,
    }
}

fn get_bytes(map: &[(Value, Value)], key: u64) -> Option<&[u8]> {
    match get(map, key) {
        Some(Value::Bytes(b)) => Some(b.as_slice()),
        _ => None,
    }
}
