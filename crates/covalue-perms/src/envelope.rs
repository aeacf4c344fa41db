//! Private transaction envelopes.
//!
//! A private transaction carries its changes encrypted under the owning
//! group's read key. The nonce is derived from the transaction's position,
//! `{coId}:{sessionId}:{txIndex}`, so a ciphertext cannot be replayed at a
//! different slot.

use serde_json::Value;

use covalue_core::transaction::{decode_changes, encode_changes};
use covalue_core::{CoId, CryptoProvider, KeyId, KeySecret, SessionId, Transaction};

use crate::error::Result;

/// Nonce material for a private transaction at a given position.
pub fn envelope_nonce(id: &CoId, session: &SessionId, tx_index: u32) -> Vec<u8> {
    format!("{id}:{session}:{tx_index}").into_bytes()
}

/// Encrypt `changes` into a private transaction.
#[allow(clippy::too_many_arguments)]
pub fn encrypt_changes(
    id: &CoId,
    session: &SessionId,
    tx_index: u32,
    made_at: i64,
    changes: &[Value],
    key_id: KeyId,
    key: &KeySecret,
    crypto: &dyn CryptoProvider,
) -> Result<Transaction> {
    let plaintext = encode_changes(changes)?;
    let encrypted_changes = crypto.encrypt(
        key,
        plaintext.as_bytes(),
        &envelope_nonce(id, session, tx_index),
    )?;
    Ok(Transaction::Private {
        made_at,
        key_used: key_id,
        encrypted_changes,
    })
}

/// Decrypt the changes of a private transaction.
///
/// `None` when the transaction is not private, the key does not open it, or
/// the plaintext is not a change list.
pub fn decrypt_changes(
    tx: &Transaction,
    id: &CoId,
    session: &SessionId,
    tx_index: u32,
    key: &KeySecret,
    crypto: &dyn CryptoProvider,
) -> Option<Vec<Value>> {
    let Transaction::Private {
        encrypted_changes, ..
    } = tx
    else {
        return None;
    };
    let plaintext = crypto.decrypt(key, encrypted_changes, &envelope_nonce(id, session, tx_index))?;
    match decode_changes(&plaintext) {
        Ok(changes) => Some(changes),
        Err(e) => {
            tracing::warn!(co_id = %id, session = %session, tx_index, error = %e, "decrypted payload is not a change list");
            None
        }
    }
}

/// The readable changes of any transaction.
///
/// Trusting transactions are decoded directly. Private ones are opened with
/// the key returned by `key_for`; a missing key yields `None`.
pub fn readable_changes(
    tx: &Transaction,
    id: &CoId,
    session: &SessionId,
    tx_index: u32,
    key_for: impl FnOnce(&KeyId) -> Option<KeySecret>,
    crypto: &dyn CryptoProvider,
) -> Option<Vec<Value>> {
    match tx {
        Transaction::Trusting { .. } => match tx.trusting_changes()? {
            Ok(changes) => Some(changes),
            Err(e) => {
                tracing::warn!(co_id = %id, session = %session, tx_index, error = %e, "malformed trusting changes");
                None
            }
        },
        Transaction::Private { key_used, .. } => {
            let key = key_for(key_used)?;
            decrypt_changes(tx, id, session, tx_index, &key, crypto)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalue_core::DalekCrypto;
    use proptest::prelude::*;
    use serde_json::json;

    fn setup() -> (DalekCrypto, CoId, SessionId, KeySecret, KeyId) {
        let crypto = DalekCrypto::new();
        let agent = crypto.agent_id(&crypto.new_agent_secret());
        let key = crypto.new_key_secret();
        let key_id = crypto.key_id(&key);
        (crypto, CoId([3; 32]), SessionId::new(agent, [1; 8]), key, key_id)
    }

    #[test]
    fn test_private_roundtrip() {
        let (crypto, id, session, key, key_id) = setup();
        let changes = vec![json!({"op": "set", "key": "secret", "value": "shh"})];
        let tx = encrypt_changes(&id, &session, 0, 5, &changes, key_id, &key, &crypto).unwrap();

        assert_eq!(tx.key_used(), Some(&key_id));
        assert_eq!(tx.made_at(), 5);
        assert_eq!(
            decrypt_changes(&tx, &id, &session, 0, &key, &crypto),
            Some(changes)
        );
    }

    #[test]
    fn test_wrong_slot_does_not_decrypt() {
        let (crypto, id, session, key, key_id) = setup();
        let changes = vec![json!({"op": "set", "key": "a", "value": 1})];
        let tx = encrypt_changes(&id, &session, 0, 5, &changes, key_id, &key, &crypto).unwrap();

        assert!(decrypt_changes(&tx, &id, &session, 1, &key, &crypto).is_none());
        assert!(decrypt_changes(&tx, &CoId([4; 32]), &session, 0, &key, &crypto).is_none());
        let other = crypto.new_key_secret();
        assert!(decrypt_changes(&tx, &id, &session, 0, &other, &crypto).is_none());
    }

    #[test]
    fn test_readable_changes_without_key() {
        let (crypto, id, session, key, key_id) = setup();
        let changes = vec![json!({"op": "set", "key": "a", "value": 1})];
        let private = encrypt_changes(&id, &session, 0, 5, &changes, key_id, &key, &crypto).unwrap();
        let trusting = Transaction::trusting(5, &changes).unwrap();

        assert!(readable_changes(&private, &id, &session, 0, |_| None, &crypto).is_none());
        assert_eq!(
            readable_changes(&private, &id, &session, 0, |_| Some(key.clone()), &crypto),
            Some(changes.clone())
        );
        assert_eq!(
            readable_changes(&trusting, &id, &session, 0, |_| None, &crypto),
            Some(changes)
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_envelope_opens_only_at_its_slot(
            written in 0..1000u32,
            read in 0..1000u32,
            value in any::<i64>(),
        ) {
            let (crypto, id, session, key, key_id) = setup();
            let changes = vec![json!({"op": "set", "key": "n", "value": value})];
            let tx = encrypt_changes(&id, &session, written, 0, &changes, key_id, &key, &crypto)
                .unwrap();

            let opened = decrypt_changes(&tx, &id, &session, read, &key, &crypto);
            if read == written {
                prop_assert_eq!(opened, Some(changes));
            } else {
                prop_assert!(opened.is_none());
            }
        }
    }
}
