//! Node configuration.

use std::time::Duration;

use covalue_sync::{RetryPolicy, SyncConfig};

/// Closed peers kept for resumption unless configured otherwise.
pub const DEFAULT_MAX_CLOSED_PEERS: usize = 256;

/// Configuration for a [`LocalNode`](crate::LocalNode).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Sync configuration.
    pub sync: SyncConfig,
    /// Forget a peer's known states when it closes.
    ///
    /// When `false`, a peer re-added under the same id resumes from what it
    /// acknowledged before.
    pub delete_peer_state_on_close: bool,
    /// Closed peers whose state is retained. Past this, the earliest
    /// connected of them are forgotten.
    pub max_closed_peers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            delete_peer_state_on_close: false,
            max_closed_peers: DEFAULT_MAX_CLOSED_PEERS,
        }
    }
}

impl NodeConfig {
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.sync.retry = retry;
        self
    }

    /// Shorthand for a retry policy with `max_retries` and `timeout`.
    pub fn with_load_timeout(mut self, max_retries: u32, timeout: Duration) -> Self {
        self.sync.retry = RetryPolicy {
            max_retries,
            timeout,
        };
        self
    }

    pub fn with_delete_peer_state_on_close(mut self, delete: bool) -> Self {
        self.delete_peer_state_on_close = delete;
        self
    }

    pub fn with_max_closed_peers(mut self, max: usize) -> Self {
        self.max_closed_peers = max;
        self
    }
}
