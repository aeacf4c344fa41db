//! In-memory duplex transport.
//!
//! A connection is a pair of bounded channels carrying encoded frames.
//! Dropping the sending half is end-of-stream for the other side, which
//! is how a peer observes a disconnect.

use tokio::sync::mpsc;

use crate::error::{Result, SyncError};

/// One end of a peer connection.
#[derive(Debug)]
pub struct PeerConnection {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

impl PeerConnection {
    /// Send one frame, waiting for capacity.
    pub async fn send(&self, frame: String) -> Result<()> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| SyncError::TransportError("remote end closed".into()))
    }

    /// Receive one frame. `None` once the remote end has gone away.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    /// Split into the two halves.
    pub fn split(self) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        (self.outgoing, self.incoming)
    }
}

/// Create two connected ends, each with `capacity` frames of buffering per
/// direction.
pub fn duplex(capacity: usize) -> (PeerConnection, PeerConnection) {
    let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
    (
        PeerConnection {
            outgoing: a_tx,
            incoming: a_rx,
        },
        PeerConnection {
            outgoing: b_tx,
            incoming: b_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_send_recv() {
        let (a, mut b) = duplex(4);
        a.send("hello".into()).await.unwrap();
        assert_eq!(b.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_drop_is_eof() {
        let (a, mut b) = duplex(4);
        drop(a);
        assert!(b.recv().await.is_none());
        assert!(b.send("late".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_bounded_backpressure() {
        let (a, _b) = duplex(1);
        a.send("one".into()).await.unwrap();
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            a.send("two".into()),
        )
        .await;
        assert!(second.is_err(), "second send should wait for capacity");
    }
}
