//! UDP broadcast peer discovery.
//!
//! A discovery session runs two background threads: an announcer that
//! broadcasts a JSON presence packet every two seconds, and a listener
//! that collects announces from other devices into a peer table and
//! answers each one with a unicast response. Devices that cannot bind
//! the primary port fall back to 51821..51829 and still become visible
//! through the response path.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::{VaultError, VaultResult};
use crate::types::{now_iso8601, Peer};

use super::{BROADCAST_INTERVAL, DISCOVERY_FALLBACK_END, DISCOVERY_PORT, DISCOVERY_TIMEOUT};

const ANNOUNCE_TYPE: &str = "LOCALPDUB_ANNOUNCE";
const RESPONSE_TYPE: &str = "LOCALPDUB_RESPONSE";
const PROTOCOL_VERSION: u32 = 1;

/// Callback invoked when a previously unseen peer enters the table.
pub type PeerCallback = Arc<dyn Fn(&Peer) + Send + Sync>;

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnnouncePacket {
    #[serde(rename = "type")]
    kind: String,
    version: u32,
    device: DeviceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth: Option<AuthInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeviceInfo {
    id: String,
    name: String,
    port: u16,
    vault_id: String,
    last_modified: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthInfo {
    #[serde(default)]
    challenge: String,
    #[serde(default)]
    public_key: String,
}

// =============================================================================
// Configuration
// =============================================================================

/// Settings for a discovery session.
#[derive(Clone)]
pub struct DiscoveryConfig {
    /// Human-readable device name included in announces.
    pub device_name: String,
    /// Identifier of the vault being announced.
    pub vault_id: String,
    /// Session deadline; the session cancels itself afterwards.
    pub timeout: Duration,
    /// Primary listen/broadcast port.
    pub primary_port: u16,
    /// Last port of the listener fallback range.
    pub fallback_end: u16,
    /// Destination address for announces.
    pub broadcast_addr: Ipv4Addr,
    /// Invoked when a new peer (not a refresh) is recorded.
    pub on_peer_found: Option<PeerCallback>,
}

impl DiscoveryConfig {
    /// Creates a config with the standard ports and timeout.
    #[must_use]
    pub fn new<S: Into<String>, V: Into<String>>(device_name: S, vault_id: V) -> Self {
        Self {
            device_name: device_name.into(),
            vault_id: vault_id.into(),
            timeout: DISCOVERY_TIMEOUT,
            primary_port: DISCOVERY_PORT,
            fallback_end: DISCOVERY_FALLBACK_END,
            broadcast_addr: Ipv4Addr::BROADCAST,
            on_peer_found: None,
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// An active discovery session.
///
/// The session ends when [`stop`](DiscoverySession::stop) is called,
/// the timeout elapses, or the session is dropped.
pub struct DiscoverySession {
    device_id: String,
    bound_port: u16,
    peers: Arc<Mutex<HashMap<String, Peer>>>,
    token: CancelToken,
    threads: Vec<JoinHandle<()>>,
}

impl DiscoverySession {
    /// Starts announcing and listening.
    ///
    /// Binds the listener to the primary port or the first free
    /// fallback port; fails with a network error when none binds.
    pub fn start(config: DiscoveryConfig) -> VaultResult<Self> {
        let device_id = uuid::Uuid::new_v4().to_string();
        let (listener, bound_port) = bind_listener(config.primary_port, config.fallback_end)?;
        listener
            .set_read_timeout(Some(Duration::from_secs(1)))
            .map_err(|e| VaultError::io("configure discovery listener", e))?;

        let announcer = UdpSocket::bind(("0.0.0.0", 0))
            .map_err(|e| VaultError::io("bind announce socket", e))?;
        announcer
            .set_broadcast(true)
            .map_err(|e| VaultError::io("enable broadcast", e))?;

        let peers = Arc::new(Mutex::new(HashMap::new()));
        let token = CancelToken::new();

        let identity = Identity {
            device_id: device_id.clone(),
            device_name: config.device_name.clone(),
            vault_id: config.vault_id.clone(),
            bound_port,
        };

        let announce_thread = {
            let token = token.clone();
            let identity = identity.clone();
            let target = (config.broadcast_addr, config.primary_port);
            let timeout = config.timeout;
            std::thread::spawn(move || run_announcer(&announcer, &identity, target, timeout, &token))
        };

        let listen_thread = {
            let token = token.clone();
            let peers = Arc::clone(&peers);
            let callback = config.on_peer_found.clone();
            std::thread::spawn(move || run_listener(&listener, &identity, &peers, callback.as_ref(), &token))
        };

        log::debug!("discovery session started on udp port {bound_port}");

        Ok(Self {
            device_id,
            bound_port,
            peers,
            token,
            threads: vec![announce_thread, listen_thread],
        })
    }

    /// Returns this device's id, as seen by peers.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the UDP port the listener bound.
    #[must_use]
    pub const fn bound_port(&self) -> u16 {
        self.bound_port
    }

    /// Returns true until the session is stopped or times out.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Returns a snapshot of the discovered peers.
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        self.peers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Stops both background threads and clears the peer table.
    ///
    /// Idempotent; joins the threads before returning.
    pub fn stop(&mut self) {
        self.token.cancel();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.peers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Background loops
// =============================================================================

#[derive(Clone)]
struct Identity {
    device_id: String,
    device_name: String,
    vault_id: String,
    bound_port: u16,
}

impl Identity {
    fn packet(&self, kind: &str) -> AnnouncePacket {
        AnnouncePacket {
            kind: kind.to_string(),
            version: PROTOCOL_VERSION,
            device: DeviceInfo {
                id: self.device_id.clone(),
                name: self.device_name.clone(),
                port: self.bound_port,
                vault_id: self.vault_id.clone(),
                last_modified: now_iso8601(),
            },
            auth: None,
        }
    }
}

fn bind_listener(primary: u16, fallback_end: u16) -> VaultResult<(UdpSocket, u16)> {
    for port in primary..=fallback_end {
        if let Ok(socket) = UdpSocket::bind(("0.0.0.0", port)) {
            return Ok((socket, port));
        }
    }
    Err(VaultError::network(format!(
        "no discovery port available in {primary}..={fallback_end}"
    )))
}

fn run_announcer(
    socket: &UdpSocket,
    identity: &Identity,
    target: (Ipv4Addr, u16),
    timeout: Duration,
    token: &CancelToken,
) {
    let started = Instant::now();
    loop {
        if started.elapsed() >= timeout {
            log::debug!("discovery session timed out");
            token.cancel();
            return;
        }

        match serde_json::to_vec(&identity.packet(ANNOUNCE_TYPE)) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, target) {
                    // A single failed send does not end the session.
                    log::debug!("announce send failed: {e}");
                }
            }
            Err(e) => log::warn!("announce encoding failed: {e}"),
        }

        if token.wait(BROADCAST_INTERVAL) {
            return;
        }
    }
}

fn run_listener(
    socket: &UdpSocket,
    identity: &Identity,
    peers: &Mutex<HashMap<String, Peer>>,
    callback: Option<&PeerCallback>,
    token: &CancelToken,
) {
    let mut buf = [0u8; 4096];
    while !token.is_cancelled() {
        match socket.recv_from(&mut buf) {
            Ok((len, sender)) => {
                let reply_port =
                    record_datagram(&buf[..len], sender.ip(), &identity.device_id, peers, callback);
                if let Some(port) = reply_port {
                    match serde_json::to_vec(&identity.packet(RESPONSE_TYPE)) {
                        Ok(bytes) => {
                            if let Err(e) = socket.send_to(&bytes, (sender.ip(), port)) {
                                log::debug!("discovery response send failed: {e}");
                            }
                        }
                        Err(e) => log::warn!("response encoding failed: {e}"),
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::warn!("discovery receive error: {e}");
                if token.wait(Duration::from_millis(200)) {
                    return;
                }
            }
        }
    }
}

/// Parses one datagram and updates the peer table.
///
/// Returns the port to unicast a response to when the datagram was an
/// announce from another device. Malformed JSON is dropped silently;
/// the device's own packets are ignored.
fn record_datagram(
    bytes: &[u8],
    sender_ip: IpAddr,
    own_id: &str,
    peers: &Mutex<HashMap<String, Peer>>,
    callback: Option<&PeerCallback>,
) -> Option<u16> {
    let packet: AnnouncePacket = serde_json::from_slice(bytes).ok()?;
    if packet.kind != ANNOUNCE_TYPE && packet.kind != RESPONSE_TYPE {
        return None;
    }
    // Self-echo: broadcasts loop back to our own listener.
    if packet.device.id == own_id {
        return None;
    }

    let peer = Peer {
        id: packet.device.id,
        name: packet.device.name,
        ip: sender_ip.to_string(),
        port: packet.device.port,
        vault_id: packet.device.vault_id,
        last_modified: packet.device.last_modified,
        public_key: packet
            .auth
            .and_then(|a| (!a.public_key.is_empty()).then_some(a.public_key)),
    };

    let is_new = {
        let mut table = peers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        table.insert(peer.id.clone(), peer.clone()).is_none()
    };
    if is_new {
        log::debug!("discovered peer {} at {}:{}", peer.name, peer.ip, peer.port);
        if let Some(cb) = callback {
            cb(&peer);
        }
    }

    (packet.kind == ANNOUNCE_TYPE).then_some(peer.port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_bytes(kind: &str, id: &str, name: &str, port: u16) -> Vec<u8> {
        let packet = AnnouncePacket {
            kind: kind.to_string(),
            version: PROTOCOL_VERSION,
            device: DeviceInfo {
                id: id.to_string(),
                name: name.to_string(),
                port,
                vault_id: "/tmp/v.lpd".to_string(),
                last_modified: "2024-01-01T00:00:00Z".to_string(),
            },
            auth: None,
        };
        serde_json::to_vec(&packet).unwrap()
    }

    fn sender() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7))
    }

    #[test]
    fn test_packet_wire_shape() {
        let bytes = packet_bytes(ANNOUNCE_TYPE, "dev-1", "laptop", 51820);
        let json = String::from_utf8(bytes).unwrap();
        assert!(json.contains("\"type\":\"LOCALPDUB_ANNOUNCE\""));
        assert!(json.contains("\"version\":1"));
        assert!(json.contains("\"port\":51820"));
    }

    #[test]
    fn test_announce_inserts_peer_and_requests_reply() {
        let peers = Mutex::new(HashMap::new());
        let reply = record_datagram(
            &packet_bytes(ANNOUNCE_TYPE, "dev-1", "laptop", 51821),
            sender(),
            "own-id",
            &peers,
            None,
        );
        assert_eq!(reply, Some(51821));

        let table = peers.lock().unwrap();
        let peer = table.get("dev-1").expect("peer recorded");
        assert_eq!(peer.ip, "192.168.1.7");
        assert_eq!(peer.port, 51821);
    }

    #[test]
    fn test_response_inserts_peer_without_reply() {
        let peers = Mutex::new(HashMap::new());
        let reply = record_datagram(
            &packet_bytes(RESPONSE_TYPE, "dev-1", "laptop", 51821),
            sender(),
            "own-id",
            &peers,
            None,
        );
        assert_eq!(reply, None);
        assert_eq!(peers.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_self_echo_is_dropped() {
        let peers = Mutex::new(HashMap::new());
        let reply = record_datagram(
            &packet_bytes(ANNOUNCE_TYPE, "own-id", "me", 51820),
            sender(),
            "own-id",
            &peers,
            None,
        );
        assert_eq!(reply, None);
        assert!(peers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_refresh_updates_in_place() {
        let peers = Mutex::new(HashMap::new());
        record_datagram(
            &packet_bytes(ANNOUNCE_TYPE, "dev-1", "laptop", 51821),
            sender(),
            "own-id",
            &peers,
            None,
        );
        record_datagram(
            &packet_bytes(ANNOUNCE_TYPE, "dev-1", "laptop-renamed", 51822),
            sender(),
            "own-id",
            &peers,
            None,
        );

        let table = peers.lock().unwrap();
        assert_eq!(table.len(), 1);
        let peer = table.get("dev-1").unwrap();
        assert_eq!(peer.name, "laptop-renamed");
        assert_eq!(peer.port, 51822);
    }

    #[test]
    fn test_malformed_and_foreign_packets_are_dropped() {
        let peers = Mutex::new(HashMap::new());
        assert_eq!(
            record_datagram(b"not json", sender(), "own-id", &peers, None),
            None
        );
        assert_eq!(
            record_datagram(
                br#"{"type":"SOMETHING_ELSE","version":1,"device":{"id":"x","name":"n","port":1,"vault_id":"v","last_modified":"t"}}"#,
                sender(),
                "own-id",
                &peers,
                None
            ),
            None
        );
        assert!(peers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_callback_fires_once_per_peer() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let peers = Mutex::new(HashMap::new());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let callback: PeerCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..3 {
            record_datagram(
                &packet_bytes(ANNOUNCE_TYPE, "dev-1", "laptop", 51821),
                sender(),
                "own-id",
                &peers,
                Some(&callback),
            );
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut config = DiscoveryConfig::new("test-device", "/tmp/v.lpd");
        // Ephemeral port range so tests never collide with a real session.
        config.primary_port = 0;
        config.fallback_end = 0;
        config.broadcast_addr = Ipv4Addr::LOCALHOST;

        let mut session = DiscoverySession::start(config).expect("session starts");
        assert!(session.is_active());
        session.stop();
        assert!(!session.is_active());
        assert!(session.peers().is_empty());
        session.stop();
    }
}
