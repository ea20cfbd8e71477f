//! Centralized configuration for the request pipe.
//!
//! Constant transport parameters plus the runtime options a process supplies
//! when it sets up its `RpcHost`.

use std::time::Duration;

use crate::request::PeerId;

/// Transport-level constants.
pub struct TransportConfig;

impl TransportConfig {
    /// Length prefix of every frame: `[u32 BE: len][JSON bytes]`.
    pub const FRAME_HEADER_LEN: usize = 4;
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const READ_CHUNK_SIZE: usize = 8192;

    /// Bound on a single consumer poll, so workers can notice shutdown.
    pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

    pub const DEFAULT_WORKERS: usize = 1;
    pub const DEFAULT_PEER: PeerId = 0;
}

/// Runtime options for an `RpcHost`.
///
/// # Example
///
/// ```rust,ignore
/// let options = HostOptions::new("JACK DSP")
///     .workers(2)
///     .request_timeout(Duration::from_secs(5));
/// let host = RpcHost::new(options);
/// ```
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Human-readable node name, used in logs and diagnostics.
    pub node_id: String,
    /// Consumer workers started per managed pipe.
    pub workers: usize,
    /// How long a caller waits for its response. `None` waits until the
    /// response arrives or the peer goes away.
    pub request_timeout: Option<Duration>,
    /// Peer used when a class has no known publisher.
    pub default_peer: PeerId,
}

impl HostOptions {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// Default: `TransportConfig::DEFAULT_WORKERS`
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Default: no timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Default: `TransportConfig::DEFAULT_PEER`
    pub fn default_peer(mut self, peer_id: PeerId) -> Self {
        self.default_peer = peer_id;
        self
    }
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            node_id: "mfp".to_string(),
            workers: TransportConfig::DEFAULT_WORKERS,
            request_timeout: None,
            default_peer: TransportConfig::DEFAULT_PEER,
        }
    }
}
