//! A storage backend exposed as a sync peer.
//!
//! The node treats storage like any server peer: it pushes everything it
//! holds and asks it during loads. The storage side only persists and
//! replays; validation happens on whichever node loads the data back.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use covalue_core::{CoId, CryptoProvider, KnownState};
use covalue_store::{AppendResult, Storage, StoreError, StoredCoValue};
use covalue_sync::{
    decode, encode, ContentMessage, KnownMessage, PeerConnection, SessionContent, SyncError,
    SyncMessage,
};

use crate::error::{NodeError, Result};

/// Serves one node from a [`Storage`] backend over a [`PeerConnection`].
pub struct StoragePeer {
    storage: Arc<dyn Storage>,
    connection: PeerConnection,
    crypto: Arc<dyn CryptoProvider>,
    /// What has been sent per CoValue, so a node that refuses stored data is
    /// not sent it again.
    sent: HashMap<CoId, KnownState>,
}

impl StoragePeer {
    pub fn new(
        storage: Arc<dyn Storage>,
        connection: PeerConnection,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        Self {
            storage,
            connection,
            crypto,
            sent: HashMap::new(),
        }
    }

    /// Serve until the node hangs up or `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = self.connection.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let message = match decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!(error = %e, "storage peer dropping malformed frame");
                    continue;
                }
            };
            let id = *message.id();
            match self.handle(message).await {
                Ok(()) => {}
                Err(NodeError::Sync(e @ SyncError::TransportError(_))) => {
                    tracing::debug!(error = %e, "storage peer connection closed");
                    break;
                }
                Err(e) => tracing::warn!(covalue = %id, error = %e, "storage peer failed"),
            }
        }
        tracing::debug!("storage peer stopped");
    }

    async fn handle(&mut self, message: SyncMessage) -> Result<()> {
        match message {
            SyncMessage::Load(theirs) => self.handle_load(theirs).await,
            SyncMessage::Known(known) => self.handle_known(known).await,
            SyncMessage::Content(content) => self.handle_content(content).await,
        }
    }

    async fn handle_load(&mut self, theirs: KnownState) -> Result<()> {
        self.sent.insert(theirs.id, theirs.clone());
        match self.storage.load(&theirs.id).await? {
            Some(stored) => {
                self.send(SyncMessage::known(stored.known_state())).await?;
                self.send_missing(&stored).await
            }
            None => self.send(SyncMessage::known(KnownState::empty(theirs.id))).await,
        }
    }

    async fn handle_known(&mut self, message: KnownMessage) -> Result<()> {
        let KnownMessage {
            known,
            is_correction,
        } = message;
        let id = known.id;
        match self.sent.get_mut(&id) {
            Some(sent) if !is_correction => sent.combine_with(&known),
            _ => {
                self.sent.insert(id, known);
            }
        }
        match self.storage.load(&id).await? {
            Some(stored) => self.send_missing(&stored).await,
            None => Ok(()),
        }
    }

    async fn handle_content(&mut self, content: ContentMessage) -> Result<()> {
        let id = content.id;
        let implied = content.implied_known_state();

        if let Some(header) = &content.header {
            if !header.matches(&id, self.crypto.as_ref()) {
                tracing::warn!(covalue = %id, "refusing header that does not hash to id");
                return Ok(());
            }
            match self.storage.store_header(&id, header).await {
                Ok(_) => {}
                Err(StoreError::HeaderConflict(reason)) => {
                    tracing::warn!(covalue = %id, %reason, "header conflict");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        } else if !self.storage.known_state(&id).await?.header {
            return self
                .send(SyncMessage::correction(KnownState::empty(id)))
                .await;
        }

        let mut gap = false;
        for (session, batch) in &content.new {
            let result = self
                .storage
                .append_transactions(
                    &id,
                    session,
                    batch.after,
                    &batch.new_transactions,
                    &batch.last_signature,
                )
                .await?;
            if let AppendResult::Gap { held } = result {
                tracing::debug!(covalue = %id, %session, held, after = batch.after, "gap in stored session");
                gap = true;
            }
        }

        self.sent
            .entry(id)
            .or_insert_with(|| KnownState::empty(id))
            .combine_with(&implied);
        let stored = self.storage.known_state(&id).await?;
        self.send(if gap {
            SyncMessage::correction(stored)
        } else {
            SyncMessage::known(stored)
        })
        .await
    }

    /// Send what the node lacks of `stored`, judged by what was sent before.
    async fn send_missing(&mut self, stored: &StoredCoValue) -> Result<()> {
        let theirs = self.sent.get(&stored.id);
        let Some(content) = content_since(stored, theirs) else {
            return Ok(());
        };
        self.sent
            .entry(stored.id)
            .or_insert_with(|| KnownState::empty(stored.id))
            .combine_with(&content.implied_known_state());
        self.send(SyncMessage::Content(content)).await
    }

    async fn send(&self, message: SyncMessage) -> Result<()> {
        let frame = encode(&message)?;
        self.connection.send(frame).await?;
        Ok(())
    }
}

fn content_since(stored: &StoredCoValue, theirs: Option<&KnownState>) -> Option<ContentMessage> {
    let mut message = ContentMessage::new(stored.id);
    if !theirs.is_some_and(|known| known.header) {
        message.header = Some(stored.header.clone());
    }
    for (session, run) in &stored.sessions {
        let after = theirs.map_or(0, |known| known.count(session));
        if after >= run.transactions.len() {
            continue;
        }
        message.new.insert(
            *session,
            SessionContent {
                after,
                new_transactions: run.transactions[after..].to_vec(),
                last_signature: run.last_signature,
            },
        );
    }
    (!message.is_empty()).then_some(message)
}
