//! Peer synchronization: discovery, wire protocol, and sync engine.
//!
//! Discovery announces the device over UDP broadcast and maintains a
//! peer table; the sync engine exchanges record digests with chosen
//! peers over newline-framed JSON on TCP and merges differences under
//! a deterministic conflict strategy.

use std::net::{TcpListener, UdpSocket};
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod discovery;
mod engine;
mod protocol;

pub use discovery::{DiscoveryConfig, DiscoverySession, PeerCallback};
pub use engine::SyncEngine;
pub use protocol::{FrameReader, SyncMessage};

/// Fixed TCP port for the sync responder.
pub const SYNC_PORT: u16 = 51820;

/// Primary UDP port for discovery broadcasts.
pub const DISCOVERY_PORT: u16 = 51820;

/// Last port of the discovery listener fallback range.
pub const DISCOVERY_FALLBACK_END: u16 = 51829;

/// Interval between discovery announces.
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(2);

/// Default discovery session timeout.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-peer socket timeout for sync send and receive.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on concurrently served responder connections.
pub const MAX_SIMULTANEOUS_CONNECTIONS: usize = 10;

/// Cap on a single accumulated protocol message.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Conflict resolution strategy for incoming sync entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Keep the local version on conflicts.
    LocalWins,
    /// Accept the remote version on conflicts.
    RemoteWins,
    /// Keep whichever side has the greater `modified`; ties keep local.
    #[default]
    NewestWins,
    /// Surface conflicts to the caller; mutate nothing.
    Manual,
    /// Keep both: the remote copy is inserted under a fresh id.
    Duplicate,
}

/// Authentication mode for sync connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// No handshake; trusted network.
    #[default]
    None,
    /// Shared-secret challenge/response (HMAC-SHA256).
    Passphrase,
    /// Reserved; rejected when selected.
    QrCode,
    /// Reserved; rejected when selected.
    DevicePairing,
}

/// Result of one sync run across a set of peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Records sent to peers.
    pub entries_sent: usize,
    /// Records received from peers.
    pub entries_received: usize,
    /// Id collisions resolved by the conflict strategy.
    pub conflicts_resolved: usize,
    /// One entry per failed peer; failures do not abort other peers.
    pub errors: Vec<String>,
    /// True when every peer completed without error.
    pub success: bool,
}

/// Aggregate statistics over the sync history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Total sync runs this session.
    pub total_syncs: usize,
    /// Runs that completed without any peer error.
    pub successful_syncs: usize,
    /// Runs with at least one peer error.
    pub failed_syncs: usize,
    /// Time of the most recent run, epoch seconds.
    pub last_sync: Option<i64>,
}

/// Returns true when `port` can be bound on loopback for both TCP and
/// UDP.
#[must_use]
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok() && UdpSocket::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_default_is_newest_wins() {
        assert_eq!(SyncStrategy::default(), SyncStrategy::NewestWins);
        assert_eq!(AuthMethod::default(), AuthMethod::None);
    }

    #[test]
    fn test_sync_result_default_is_empty() {
        let result = SyncResult::default();
        assert_eq!(result.entries_sent, 0);
        assert!(result.errors.is_empty());
        assert!(!result.success);
    }

    #[test]
    fn test_is_port_available_detects_bound_port() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available(port));
    }
}
