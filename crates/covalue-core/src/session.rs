//! SessionLog: one writer's append-only, signed transaction log for a CoValue.
//!
//! Each transaction's canonical bytes are fed into a rolling BLAKE3 hash. A
//! batch of transactions carries one signature over the hash of the *full*
//! resulting prefix, so truncating or rewriting history breaks every later
//! signature.
//!
//! Batches that arrive ahead of the tip are buffered until the gap fills.

use std::collections::BTreeMap;

use crate::canonical::canonical_transaction_bytes;
use crate::crypto::{CryptoProvider, Hash, Signature, SignerSecret, StreamingHash};
use crate::error::{CoreError, ValidationError};
use crate::transaction::Transaction;
use crate::types::SessionId;

/// Out-of-order batches held per session. Past this, the batch starting
/// furthest from the tip is dropped; the sender resends after a correction.
pub const MAX_PENDING_BATCHES: usize = 32;

/// A batch received ahead of the session tip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingBatch {
    pub transactions: Vec<Transaction>,
    pub signature: Signature,
}

/// Result of offering a batch to a session log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// New transactions were appended. Includes any buffered batches that
    /// became contiguous as a result.
    Applied { added: usize },

    /// Every transaction in the batch was already held.
    AlreadyKnown,

    /// The batch starts beyond the tip and was buffered.
    Buffered { tip: usize, after: usize },
}

/// Append-only log for one `(CoId, SessionId)`.
#[derive(Clone, Debug)]
pub struct SessionLog {
    session: SessionId,
    transactions: Vec<Transaction>,
    hasher: StreamingHash,
    last_hash: Option<Hash>,
    last_signature: Option<Signature>,
    /// Signature valid after transaction `index`, for every batch boundary seen.
    signatures: BTreeMap<usize, Signature>,
    /// Out-of-order batches keyed by their `after`.
    pending: BTreeMap<usize, PendingBatch>,
}

impl SessionLog {
    /// Create an empty log.
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            transactions: Vec::new(),
            hasher: StreamingHash::new(),
            last_hash: None,
            last_signature: None,
            signatures: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Number of transactions held.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Transactions after the first `after`.
    pub fn transactions_since(&self, after: usize) -> &[Transaction] {
        self.transactions.get(after..).unwrap_or(&[])
    }

    /// Rolling hash of the full log.
    pub fn last_hash(&self) -> Option<&Hash> {
        self.last_hash.as_ref()
    }

    /// Signature over the full log.
    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    /// Signature valid for the prefix ending at `index`, if one was recorded.
    pub fn signature_at(&self, index: usize) -> Option<&Signature> {
        self.signatures.get(&index)
    }

    /// Whether out-of-order batches are waiting for a gap to fill.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of buffered out-of-order batches.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Hash of the prefix extended by `new`, without mutating the log.
    fn hash_with(&self, new: &[Transaction]) -> Result<(Hash, StreamingHash), CoreError> {
        let mut hasher = self.hasher.clone();
        for tx in new {
            hasher.update(&canonical_transaction_bytes(tx)?);
        }
        Ok((hasher.finalize(), hasher))
    }

    /// Append a locally authored transaction and sign the new prefix.
    pub fn append_local(
        &mut self,
        tx: Transaction,
        signer: &SignerSecret,
        crypto: &dyn CryptoProvider,
    ) -> Result<Signature, CoreError> {
        let (hash, hasher) = self.hash_with(std::slice::from_ref(&tx))?;
        let signature = crypto.sign(signer, hash.as_bytes());
        self.commit(vec![tx], hash, hasher, signature);
        Ok(signature)
    }

    /// Offer a remote batch that starts after the first `after` transactions.
    ///
    /// Overlap with transactions already held is trimmed. The signature must
    /// verify over the rolling hash of the full resulting prefix under the
    /// session author's signing key; otherwise nothing is applied.
    pub fn try_add(
        &mut self,
        after: usize,
        transactions: Vec<Transaction>,
        signature: Signature,
        crypto: &dyn CryptoProvider,
    ) -> Result<AddOutcome, ValidationError> {
        if transactions.is_empty() {
            return Err(ValidationError::EmptyBatch {
                session: self.session,
            });
        }

        let tip = self.len();
        if after > tip {
            tracing::debug!(
                session = %self.session,
                tip,
                after,
                "buffering out-of-order batch"
            );
            self.buffer(
                after,
                PendingBatch {
                    transactions,
                    signature,
                },
            );
            return Ok(AddOutcome::Buffered { tip, after });
        }

        if after + transactions.len() <= tip {
            return Ok(AddOutcome::AlreadyKnown);
        }

        let added = self.verify_and_commit(after, transactions, signature, crypto)?;
        let drained = self.drain_pending(crypto);
        Ok(AddOutcome::Applied {
            added: added + drained,
        })
    }

    fn verify_and_commit(
        &mut self,
        after: usize,
        mut transactions: Vec<Transaction>,
        signature: Signature,
        crypto: &dyn CryptoProvider,
    ) -> Result<usize, ValidationError> {
        let overlap = self.len() - after;
        let new: Vec<Transaction> = transactions.drain(overlap..).collect();

        let (hash, hasher) = self.hash_with(&new)?;
        if !crypto.verify(&self.session.agent().signer, hash.as_bytes(), &signature) {
            return Err(ValidationError::InvalidSignature {
                session: self.session,
            });
        }

        let added = new.len();
        self.commit(new, hash, hasher, signature);
        Ok(added)
    }

    fn buffer(&mut self, after: usize, batch: PendingBatch) {
        if !self.pending.contains_key(&after) && self.pending.len() >= MAX_PENDING_BATCHES {
            let Some(furthest) = self.pending.keys().next_back().copied() else {
                return;
            };
            if after > furthest {
                tracing::debug!(session = %self.session, after, "pending buffer full, dropping batch");
                return;
            }
            self.pending.remove(&furthest);
        }
        self.pending.insert(after, batch);
    }

    /// Apply buffered batches that became contiguous.
    fn drain_pending(&mut self, crypto: &dyn CryptoProvider) -> usize {
        let mut drained = 0;
        loop {
            let tip = self.len();
            let Some(after) = self.pending.range(..=tip).next().map(|(after, _)| *after) else {
                break;
            };
            let Some(batch) = self.pending.remove(&after) else {
                break;
            };
            if after + batch.transactions.len() <= tip {
                continue;
            }
            match self.verify_and_commit(after, batch.transactions, batch.signature, crypto) {
                Ok(added) => drained += added,
                Err(e) => {
                    tracing::warn!(session = %self.session, error = %e, "dropping buffered batch");
                }
            }
        }
        drained
    }

    fn commit(
        &mut self,
        new: Vec<Transaction>,
        hash: Hash,
        hasher: StreamingHash,
        signature: Signature,
    ) {
        self.transactions.extend(new);
        self.hasher = hasher;
        self.last_hash = Some(hash);
        self.last_signature = Some(signature);
        self.signatures.insert(self.transactions.len() - 1, signature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AgentSecret, DalekCrypto};
    use serde_json::json;

    fn setup() -> (DalekCrypto, AgentSecret, SessionId) {
        let crypto = DalekCrypto::new();
        let secret = crypto.new_agent_secret();
        let session = SessionId::new(crypto.agent_id(&secret), [7; 8]);
        (crypto, secret, session)
    }

    fn tx(n: i64) -> Transaction {
        Transaction::trusting(n, &[json!({"op": "set", "key": "k", "value": n})]).unwrap()
    }

    /// Author `count` transactions and return them with their signatures.
    fn authored(count: i64) -> (DalekCrypto, SessionLog, SessionId) {
        let (crypto, secret, session) = setup();
        let mut log = SessionLog::new(session);
        for n in 0..count {
            log.append_local(tx(n), &secret.signer, &crypto).unwrap();
        }
        (crypto, log, session)
    }

    #[test]
    fn test_local_append_signs_prefix() {
        let (crypto, log, session) = authored(3);
        assert_eq!(log.len(), 3);

        let hash = log.last_hash().unwrap();
        assert!(crypto.verify(
            &session.agent().signer,
            hash.as_bytes(),
            log.last_signature().unwrap()
        ));
        assert!(log.signature_at(0).is_some());
        assert!(log.signature_at(2).is_some());
    }

    #[test]
    fn test_replica_accepts_whole_log() {
        let (crypto, source, session) = authored(4);
        let mut replica = SessionLog::new(session);

        let outcome = replica
            .try_add(
                0,
                source.transactions().to_vec(),
                *source.last_signature().unwrap(),
                &crypto,
            )
            .unwrap();

        assert_eq!(outcome, AddOutcome::Applied { added: 4 });
        assert_eq!(replica.last_hash(), source.last_hash());
    }

    #[test]
    fn test_redelivery_is_noop() {
        let (crypto, source, session) = authored(2);
        let mut replica = SessionLog::new(session);
        let sig = *source.last_signature().unwrap();

        replica
            .try_add(0, source.transactions().to_vec(), sig, &crypto)
            .unwrap();
        let again = replica
            .try_add(0, source.transactions().to_vec(), sig, &crypto)
            .unwrap();

        assert_eq!(again, AddOutcome::AlreadyKnown);
        assert_eq!(replica.len(), 2);
    }

    #[test]
    fn test_overlap_trimmed() {
        let (crypto, source, session) = authored(3);
        let mut replica = SessionLog::new(session);

        replica
            .try_add(
                0,
                source.transactions()[..1].to_vec(),
                *source.signature_at(0).unwrap(),
                &crypto,
            )
            .unwrap();
        let outcome = replica
            .try_add(
                0,
                source.transactions().to_vec(),
                *source.last_signature().unwrap(),
                &crypto,
            )
            .unwrap();

        assert_eq!(outcome, AddOutcome::Applied { added: 2 });
        assert_eq!(replica.last_hash(), source.last_hash());
    }

    #[test]
    fn test_gap_buffered_then_filled() {
        let (crypto, source, session) = authored(3);
        let mut replica = SessionLog::new(session);

        let outcome = replica
            .try_add(
                2,
                source.transactions_since(2).to_vec(),
                *source.signature_at(2).unwrap(),
                &crypto,
            )
            .unwrap();
        assert_eq!(outcome, AddOutcome::Buffered { tip: 0, after: 2 });
        assert_eq!(replica.len(), 0);
        assert!(replica.has_pending());

        let outcome = replica
            .try_add(
                0,
                source.transactions()[..2].to_vec(),
                *source.signature_at(1).unwrap(),
                &crypto,
            )
            .unwrap();
        assert_eq!(outcome, AddOutcome::Applied { added: 3 });
        assert!(!replica.has_pending());
        assert_eq!(replica.last_hash(), source.last_hash());
    }

    #[test]
    fn test_pending_buffer_keeps_batches_nearest_tip() {
        let (crypto, _, session) = setup();
        let mut replica = SessionLog::new(session);
        let forged = Signature([0; 64]);

        for after in 2..2 + MAX_PENDING_BATCHES {
            replica.try_add(after, vec![tx(after as i64)], forged, &crypto).unwrap();
        }
        assert_eq!(replica.pending_len(), MAX_PENDING_BATCHES);

        // Further out than everything held: not kept.
        let outcome = replica.try_add(100, vec![tx(100)], forged, &crypto).unwrap();
        assert_eq!(outcome, AddOutcome::Buffered { tip: 0, after: 100 });
        assert!(!replica.pending.contains_key(&100));

        // Nearer the tip: displaces the furthest.
        replica.try_add(1, vec![tx(1)], forged, &crypto).unwrap();
        assert_eq!(replica.pending_len(), MAX_PENDING_BATCHES);
        assert!(replica.pending.contains_key(&1));
        assert!(!replica.pending.contains_key(&(1 + MAX_PENDING_BATCHES)));
    }

    #[test]
    fn test_wrong_author_rejected() {
        let (crypto, source, _) = authored(2);
        let (_, _, other_session) = setup();
        let mut replica = SessionLog::new(other_session);

        let err = replica
            .try_add(
                0,
                source.transactions().to_vec(),
                *source.last_signature().unwrap(),
                &crypto,
            )
            .unwrap_err();

        assert!(matches!(err, ValidationError::InvalidSignature { .. }));
        assert!(replica.is_empty());
    }

    #[test]
    fn test_tampered_history_breaks_later_signatures() {
        let (crypto, source, session) = authored(3);
        let mut txs = source.transactions().to_vec();
        txs[0] = tx(99);

        let mut replica = SessionLog::new(session);
        for end in 1..=3 {
            let err = replica
                .try_add(
                    0,
                    txs[..end].to_vec(),
                    *source.signature_at(end - 1).unwrap(),
                    &crypto,
                )
                .unwrap_err();
            assert!(matches!(err, ValidationError::InvalidSignature { .. }));
        }
        assert!(replica.is_empty());
    }

    #[test]
    fn test_empty_batch_rejected() {
        let (crypto, source, session) = authored(1);
        let mut replica = SessionLog::new(session);
        let err = replica
            .try_add(0, vec![], *source.last_signature().unwrap(), &crypto)
            .unwrap_err();
        assert!(matches!(err, ValidationError::EmptyBatch { .. }));
    }
}
