//! Peer-count gauges.

use iroh_metrics::{Gauge, MetricsGroup};

use crate::peer::PeerRole;

/// Connected peers per role.
///
/// Incremented when a peer is added, decremented exactly once when it
/// closes.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "covalue_peers")]
pub struct PeerMetrics {
    /// Open peers that connected to us.
    #[metrics(help = "Number of connected client peers.")]
    pub clients_connected: Gauge,
    /// Open peers we connected to, storage included.
    #[metrics(help = "Number of connected server peers.")]
    pub servers_connected: Gauge,
}

impl PeerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn gauge(&self, role: PeerRole) -> &Gauge {
        match role {
            PeerRole::Client => &self.clients_connected,
            PeerRole::Server => &self.servers_connected,
        }
    }

    pub fn peer_connected(&self, role: PeerRole) {
        self.gauge(role).inc();
    }

    pub fn peer_disconnected(&self, role: PeerRole) {
        self.gauge(role).dec();
    }

    /// Currently connected peers with `role`.
    pub fn connected(&self, role: PeerRole) -> i64 {
        self.gauge(role).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_per_role() {
        let metrics = PeerMetrics::new();
        metrics.peer_connected(PeerRole::Client);
        metrics.peer_connected(PeerRole::Client);
        metrics.peer_connected(PeerRole::Server);
        metrics.peer_disconnected(PeerRole::Client);

        assert_eq!(metrics.connected(PeerRole::Client), 1);
        assert_eq!(metrics.connected(PeerRole::Server), 1);
    }

    #[test]
    fn test_group_named_for_export() {
        let metrics = PeerMetrics::new();
        metrics.peer_connected(PeerRole::Server);

        assert_eq!(MetricsGroup::name(&metrics), "covalue_peers");
        assert_eq!(metrics.servers_connected.get(), 1);
        assert_eq!(metrics.clients_connected.get(), 0);
    }
}
