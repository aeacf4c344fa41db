//! Test fixtures and helpers.
//!
//! Multi-node networks over in-memory transports, a raw peer for speaking
//! the wire protocol by hand, and hand-signed session batches.

use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use serde_json::Value;

use covalue::{LocalNode, NodeConfig};
use covalue_core::{
    AgentId, AgentSecret, CoId, CryptoProvider, DalekCrypto, SessionId, SessionLog, Transaction,
};
use covalue_sync::{
    decode, duplex, encode, ContentMessage, PeerConnection, PeerId, PeerRole, SessionContent,
    SyncMessage,
};

/// Install a test-writer subscriber once per process.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing_subscriber::filter::LevelFilter::INFO)
            .try_init();
    });
}

/// Node configuration with short load timeouts.
pub fn test_config() -> NodeConfig {
    NodeConfig::default().with_load_timeout(1, Duration::from_millis(500))
}

/// Default time allowed for a network to settle.
pub const SETTLE: Duration = Duration::from_secs(10);

/// Nodes connected over in-memory duplex channels.
///
/// Node `i` is known to its peers as `node-{i}`.
pub struct TestNetwork {
    nodes: Vec<LocalNode>,
}

impl TestNetwork {
    /// `count` unconnected nodes, each with its own agent.
    pub fn new(count: usize) -> Self {
        init_tracing();
        Self {
            nodes: (0..count).map(|_| LocalNode::new(test_config())).collect(),
        }
    }

    /// Every pair connected, lower index as the client.
    pub fn mesh(count: usize) -> Self {
        let network = Self::new(count);
        for client in 0..count {
            for server in client + 1..count {
                network.connect(client, server);
            }
        }
        network
    }

    pub fn node(&self, i: usize) -> &LocalNode {
        &self.nodes[i]
    }

    pub fn nodes(&self) -> &[LocalNode] {
        &self.nodes
    }

    pub fn peer_id(i: usize) -> PeerId {
        PeerId::from(format!("node-{i}"))
    }

    /// Link two nodes; `client` treats `server` as a server peer.
    pub fn connect(&self, client: usize, server: usize) {
        let (a, b) = duplex(256);
        self.nodes[client].add_peer(Self::peer_id(server), PeerRole::Server, a);
        self.nodes[server].add_peer(Self::peer_id(client), PeerRole::Client, b);
    }

    /// Drop the link between two nodes on both sides.
    pub fn disconnect(&self, a: usize, b: usize) {
        self.nodes[a].remove_peer(&Self::peer_id(b));
        self.nodes[b].remove_peer(&Self::peer_id(a));
    }

    /// Wait until every node holds `id` with the same known state.
    pub async fn converged(&self, id: &CoId, timeout: Duration) -> anyhow::Result<()> {
        converged(&self.nodes, id, timeout).await
    }
}

/// Wait until every node in `nodes` holds `id` with the same known state.
pub async fn converged(nodes: &[LocalNode], id: &CoId, timeout: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let states: Vec<_> = nodes.iter().map(|node| node.known_state(id)).collect();
        let first = states.first().cloned().flatten();
        if first.is_some() && states.iter().all(|state| *state == first) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("{id} did not converge: {states:#?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll `check` until it returns true.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// The far end of a node connection, driven by hand.
pub struct RawPeer {
    connection: PeerConnection,
}

impl RawPeer {
    /// Connect to `node`, which will know this peer as `name` with `role`.
    pub fn connect(node: &LocalNode, name: &str, role: PeerRole) -> Self {
        let (ours, theirs) = duplex(256);
        node.add_peer(name, role, ours);
        Self { connection: theirs }
    }

    pub async fn send(&self, message: &SyncMessage) -> anyhow::Result<()> {
        self.connection.send(encode(message)?).await?;
        Ok(())
    }

    pub async fn send_frame(&self, frame: impl Into<String>) -> anyhow::Result<()> {
        self.connection.send(frame.into()).await?;
        Ok(())
    }

    /// Next message from the node.
    pub async fn recv(&mut self) -> anyhow::Result<SyncMessage> {
        let frame = tokio::time::timeout(SETTLE, self.connection.recv())
            .await
            .context("no message from node")?
            .ok_or_else(|| anyhow!("node closed the connection"))?;
        Ok(decode(&frame)?)
    }

    /// Skip messages until one matches.
    pub async fn recv_until<F>(&mut self, mut matches: F) -> anyhow::Result<SyncMessage>
    where
        F: FnMut(&SyncMessage) -> bool,
    {
        loop {
            let message = self.recv().await?;
            if matches(&message) {
                return Ok(message);
            }
        }
    }
}

/// An agent outside any node, for signing batches by hand.
pub struct Signer {
    pub crypto: Arc<dyn CryptoProvider>,
    pub secret: AgentSecret,
    pub id: AgentId,
}

impl Signer {
    pub fn new() -> Self {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(DalekCrypto::new());
        let secret = crypto.new_agent_secret();
        let id = crypto.agent_id(&secret);
        Self { crypto, secret, id }
    }

    pub fn session(&self, nonce: u8) -> SessionId {
        SessionId::new(self.id, [nonce; 8])
    }

    /// A signed session log holding one trusting transaction per entry of
    /// `batches`, with the signature after each.
    pub fn log(
        &self,
        session: SessionId,
        made_at: i64,
        batches: &[Vec<Value>],
    ) -> anyhow::Result<(SessionLog, Vec<covalue_core::Signature>)> {
        let mut log = SessionLog::new(session);
        let mut signatures = Vec::new();
        for (i, changes) in batches.iter().enumerate() {
            let tx = Transaction::trusting(made_at + i as i64, changes)?;
            signatures.push(log.append_local(tx, &self.secret.signer, self.crypto.as_ref())?);
        }
        Ok((log, signatures))
    }

    /// Content for `id` carrying `log` from `after` onwards.
    pub fn content(
        &self,
        id: CoId,
        log: &SessionLog,
        after: usize,
    ) -> anyhow::Result<ContentMessage> {
        let last_signature = *log
            .last_signature()
            .ok_or_else(|| anyhow!("empty log"))?;
        let mut message = ContentMessage::new(id);
        message.new.insert(
            *log.session(),
            SessionContent {
                after,
                new_transactions: log.transactions_since(after).to_vec(),
                last_signature,
            },
        );
        Ok(message)
    }
}

impl Default for Signer {
    fn default() -> Self {
        Self::new()
    }
}

/// Current time in Unix milliseconds.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Replace the changes of a trusting transaction, keeping its timestamp.
pub fn tamper(tx: &Transaction, changes: &[Value]) -> anyhow::Result<Transaction> {
    Ok(Transaction::trusting(tx.made_at(), changes)?)
}
