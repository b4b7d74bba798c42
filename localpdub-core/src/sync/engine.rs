//! TCP sync engine: responder, initiator, authentication, and conflict
//! resolution.
//!
//! Each sync connection walks a strict message order: `SYNC_REQUEST`,
//! optional challenge/response, `DIGEST` both ways, `ENTRIES` both
//! ways, close. The engine operates on the in-memory record store
//! only; persisting the merged state is the session coordinator's job.

use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::crypto;
use crate::error::{VaultError, VaultResult};
use crate::types::{now_epoch, EntryDigest, Peer};
use crate::vault::RecordStore;

use super::protocol::{write_message, FrameReader, SyncMessage, CHALLENGE_SIZE};
use super::{
    AuthMethod, SyncResult, SyncStats, SyncStrategy, MAX_SIMULTANEOUS_CONNECTIONS, SOCKET_TIMEOUT,
};

const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Transfer counts for one completed peer exchange.
struct PeerOutcome {
    sent: usize,
    received: usize,
    conflicts: usize,
}

/// Shared responder configuration, re-read per connection.
struct EngineConfig {
    strategy: SyncStrategy,
    auth: AuthMethod,
    passphrase: Option<String>,
}

/// Everything a responder connection handler needs.
#[derive(Clone)]
struct ResponderCtx {
    store: Arc<RecordStore>,
    config: Arc<Mutex<EngineConfig>>,
}

struct ResponderHandle {
    token: CancelToken,
    thread: JoinHandle<()>,
    port: u16,
}

/// The sync protocol engine.
///
/// Holds a reference to the live record store; the responder and all
/// initiators read and mutate that store under its own lock, so
/// concurrent connections never race on the vault file.
pub struct SyncEngine {
    device_id: String,
    vault_id: String,
    store: Arc<RecordStore>,
    config: Arc<Mutex<EngineConfig>>,
    history: Mutex<Vec<SyncResult>>,
    last_sync: Mutex<Option<i64>>,
    responder: Mutex<Option<ResponderHandle>>,
}

impl SyncEngine {
    /// Creates an engine bound to a record store.
    #[must_use]
    pub fn new<S: Into<String>, V: Into<String>>(
        device_id: S,
        vault_id: V,
        store: Arc<RecordStore>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            vault_id: vault_id.into(),
            store,
            config: Arc::new(Mutex::new(EngineConfig {
                strategy: SyncStrategy::default(),
                auth: AuthMethod::default(),
                passphrase: None,
            })),
            history: Mutex::new(Vec::new()),
            last_sync: Mutex::new(None),
            responder: Mutex::new(None),
        }
    }

    /// Sets the strategy and auth the responder applies to incoming
    /// connections.
    ///
    /// # Errors
    ///
    /// Rejects the reserved auth modes, and `Passphrase` without a
    /// passphrase.
    pub fn configure(
        &self,
        strategy: SyncStrategy,
        auth: AuthMethod,
        passphrase: Option<&str>,
    ) -> VaultResult<()> {
        validate_auth(auth, passphrase)?;
        let mut config = lock(&self.config);
        config.strategy = strategy;
        config.auth = auth;
        config.passphrase = passphrase.map(str::to_owned);
        Ok(())
    }

    // =========================================================================
    // Responder
    // =========================================================================

    /// Starts the TCP responder, if not already running.
    ///
    /// Returns the bound port (useful with port 0). Incoming
    /// connections are served by one handler thread each, capped at
    /// [`MAX_SIMULTANEOUS_CONNECTIONS`].
    pub fn start_responder(&self, port: u16) -> VaultResult<u16> {
        let mut responder = lock_plain(&self.responder);
        if let Some(handle) = responder.as_ref() {
            return Ok(handle.port);
        }

        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| VaultError::network(format!("bind sync port {port}: {e}")))?;
        let bound_port = listener
            .local_addr()
            .map_err(|e| VaultError::io("read responder address", e))?
            .port();
        listener
            .set_nonblocking(true)
            .map_err(|e| VaultError::io("configure responder socket", e))?;

        let token = CancelToken::new();
        let ctx = ResponderCtx {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        };
        let thread = {
            let token = token.clone();
            std::thread::spawn(move || run_acceptor(&listener, &ctx, &token))
        };

        log::debug!("sync responder listening on tcp port {bound_port}");
        *responder = Some(ResponderHandle {
            token,
            thread,
            port: bound_port,
        });
        Ok(bound_port)
    }

    /// Stops the responder and joins its threads. Idempotent.
    pub fn stop_responder(&self) {
        let handle = lock_plain(&self.responder).take();
        if let Some(handle) = handle {
            handle.token.cancel();
            let _ = handle.thread.join();
            log::debug!("sync responder stopped");
        }
    }

    /// Returns the responder's bound port while it is running.
    #[must_use]
    pub fn responder_port(&self) -> Option<u16> {
        lock_plain(&self.responder).as_ref().map(|h| h.port)
    }

    // =========================================================================
    // Initiator
    // =========================================================================

    /// Syncs with each peer in turn, accumulating one result.
    ///
    /// A failed peer adds an entry to `errors` and does not abort the
    /// remaining peers; that peer's contribution leaves the local
    /// store untouched.
    pub fn sync_with_peers(
        &self,
        peers: &[Peer],
        strategy: SyncStrategy,
        auth: AuthMethod,
        passphrase: Option<&str>,
    ) -> SyncResult {
        let mut total = SyncResult::default();

        for peer in peers {
            match self.run_initiator(peer, strategy, auth, passphrase) {
                Ok(outcome) => {
                    log::info!(
                        "synced with {}: sent {}, received {}, {} conflicts",
                        peer.name,
                        outcome.sent,
                        outcome.received,
                        outcome.conflicts
                    );
                    total.entries_sent += outcome.sent;
                    total.entries_received += outcome.received;
                    total.conflicts_resolved += outcome.conflicts;
                }
                Err(e) => {
                    log::warn!("sync with {} failed: {e}", peer.name);
                    total.errors.push(format!("sync with {} failed: {e}", peer.name));
                }
            }
        }

        total.success = total.errors.is_empty();
        *lock_plain(&self.last_sync) = Some(now_epoch());
        lock_plain(&self.history).push(total.clone());
        total
    }

    fn run_initiator(
        &self,
        peer: &Peer,
        strategy: SyncStrategy,
        auth: AuthMethod,
        passphrase: Option<&str>,
    ) -> VaultResult<PeerOutcome> {
        validate_auth(auth, passphrase)?;

        let addr: SocketAddr = format!("{}:{}", peer.ip, peer.port)
            .parse()
            .map_err(|e| VaultError::network(format!("peer address {}:{}: {e}", peer.ip, peer.port)))?;
        let stream = TcpStream::connect_timeout(&addr, SOCKET_TIMEOUT)
            .map_err(|e| VaultError::network(format!("connect to {addr}: {e}")))?;
        configure_stream(&stream)?;

        let mut reader = FrameReader::new(
            stream
                .try_clone()
                .map_err(|e| VaultError::io("clone sync stream", e))?,
        );
        let mut writer = stream;

        write_message(
            &mut writer,
            &SyncMessage::SyncRequest {
                device_id: self.device_id.clone(),
                vault_id: self.vault_id.clone(),
            },
        )?;

        let authed = if auth == AuthMethod::Passphrase {
            let passphrase = passphrase.ok_or_else(|| VaultError::auth("passphrase required"))?;
            let mut challenge = [0u8; CHALLENGE_SIZE];
            reader
                .read_exact_raw(&mut challenge)
                .map_err(|_| VaultError::auth("peer closed before sending challenge"))?;
            let response = crypto::hmac_sha256(passphrase.as_bytes(), &challenge);
            writer
                .write_all(&response)
                .map_err(|e| VaultError::io("send auth response", e))?;
            true
        } else {
            false
        };

        let local_digest = self.store.compute_digest()?;
        let digest_sent = write_message(
            &mut writer,
            &SyncMessage::Digest {
                entries: local_digest.clone(),
            },
        );
        if let Err(e) = digest_sent {
            // A responder that rejects the challenge may have reset the
            // connection before this write.
            return Err(if authed {
                VaultError::auth("peer rejected passphrase")
            } else {
                e
            });
        }

        let remote_digest = match reader.read_message() {
            Ok(SyncMessage::Digest { entries }) => entries,
            Ok(other) => {
                return Err(VaultError::protocol(format!(
                    "expected DIGEST, got {}",
                    message_name(&other)
                )))
            }
            // A responder that rejects the challenge closes the
            // connection without sending its digest.
            Err(_) if authed => return Err(VaultError::auth("peer rejected passphrase")),
            Err(e) => return Err(e),
        };

        let to_send = select_to_send(&local_digest, &remote_digest);
        let records = self.store.records_by_id(&to_send)?;
        let sent = records.len();
        write_message(&mut writer, &SyncMessage::Entries { entries: records })?;

        let incoming = match reader.read_message()? {
            SyncMessage::Entries { entries } => entries,
            other => {
                return Err(VaultError::protocol(format!(
                    "expected ENTRIES, got {}",
                    message_name(&other)
                )))
            }
        };
        let received = incoming.len();
        let conflicts = if incoming.is_empty() {
            0
        } else {
            self.store.apply_incoming(incoming, strategy)?.conflicts.len()
        };

        let _ = writer.shutdown(Shutdown::Both);
        Ok(PeerOutcome {
            sent,
            received,
            conflicts,
        })
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Returns the sync results recorded this session, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<SyncResult> {
        lock_plain(&self.history).clone()
    }

    /// Returns aggregate statistics over the history.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        let history = lock_plain(&self.history);
        let successful = history.iter().filter(|r| r.success).count();
        SyncStats {
            total_syncs: history.len(),
            successful_syncs: successful,
            failed_syncs: history.len() - successful,
            last_sync: *lock_plain(&self.last_sync),
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop_responder();
    }
}

// =============================================================================
// Responder internals
// =============================================================================

fn run_acceptor(listener: &TcpListener, ctx: &ResponderCtx, token: &CancelToken) {
    let active = Arc::new(AtomicUsize::new(0));
    let mut handlers: Vec<JoinHandle<()>> = Vec::new();

    while !token.is_cancelled() {
        match listener.accept() {
            Ok((stream, addr)) => {
                handlers.retain(|h| !h.is_finished());
                if active.load(Ordering::SeqCst) >= MAX_SIMULTANEOUS_CONNECTIONS {
                    log::warn!("sync connection from {addr} dropped: handler limit reached");
                    continue;
                }
                active.fetch_add(1, Ordering::SeqCst);

                let ctx = ctx.clone();
                let active = Arc::clone(&active);
                handlers.push(std::thread::spawn(move || {
                    log::debug!("incoming sync connection from {addr}");
                    if let Err(e) = serve_connection(&ctx, stream) {
                        log::warn!("sync connection from {addr} failed: {e}");
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                }));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if token.wait(ACCEPT_POLL) {
                    break;
                }
            }
            Err(e) => {
                log::warn!("sync accept failed: {e}");
                if token.wait(ACCEPT_POLL) {
                    break;
                }
            }
        }
    }

    for handle in handlers {
        let _ = handle.join();
    }
}

fn serve_connection(ctx: &ResponderCtx, stream: TcpStream) -> VaultResult<()> {
    stream
        .set_nonblocking(false)
        .map_err(|e| VaultError::io("configure sync socket", e))?;
    configure_stream(&stream)?;

    let (strategy, auth, passphrase) = {
        let config = lock(&ctx.config);
        (config.strategy, config.auth, config.passphrase.clone())
    };

    let mut reader = FrameReader::new(
        stream
            .try_clone()
            .map_err(|e| VaultError::io("clone sync stream", e))?,
    );
    let mut writer = stream;

    let device_id = match reader.read_message()? {
        SyncMessage::SyncRequest { device_id, .. } => device_id,
        other => {
            return Err(VaultError::protocol(format!(
                "expected SYNC_REQUEST, got {}",
                message_name(&other)
            )))
        }
    };
    log::debug!("sync request from device {device_id}");

    match auth {
        AuthMethod::None => {}
        AuthMethod::Passphrase => {
            let passphrase =
                passphrase.ok_or_else(|| VaultError::auth("passphrase not configured"))?;
            let mut challenge = [0u8; CHALLENGE_SIZE];
            crypto::random_bytes(&mut challenge)?;
            writer
                .write_all(&challenge)
                .map_err(|e| VaultError::io("send auth challenge", e))?;

            let mut response = [0u8; CHALLENGE_SIZE];
            reader.read_exact_raw(&mut response)?;
            let expected = crypto::hmac_sha256(passphrase.as_bytes(), &challenge);
            if !crypto::constant_time_eq(&response, &expected) {
                let _ = writer.shutdown(Shutdown::Both);
                return Err(VaultError::auth(format!(
                    "challenge response mismatch from device {device_id}"
                )));
            }
        }
        reserved => return Err(VaultError::auth(format!("auth mode {reserved:?} is reserved"))),
    }

    let local_digest = ctx.store.compute_digest()?;
    write_message(
        &mut writer,
        &SyncMessage::Digest {
            entries: local_digest.clone(),
        },
    )?;

    let remote_digest = match reader.read_message()? {
        SyncMessage::Digest { entries } => entries,
        other => {
            return Err(VaultError::protocol(format!(
                "expected DIGEST, got {}",
                message_name(&other)
            )))
        }
    };

    let to_send = select_to_send(&local_digest, &remote_digest);
    let records = ctx.store.records_by_id(&to_send)?;
    let sent = records.len();
    write_message(&mut writer, &SyncMessage::Entries { entries: records })?;

    let incoming = match reader.read_message()? {
        SyncMessage::Entries { entries } => entries,
        other => {
            return Err(VaultError::protocol(format!(
                "expected ENTRIES, got {}",
                message_name(&other)
            )))
        }
    };

    if incoming.is_empty() {
        log::debug!("served sync for {device_id}: sent {sent}, received 0");
    } else {
        let outcome = ctx.store.apply_incoming(incoming, strategy)?;
        log::debug!(
            "served sync for {device_id}: sent {sent}, received {}, {} conflicts",
            outcome.inserted + outcome.replaced,
            outcome.conflicts.len()
        );
    }

    let _ = writer.shutdown(Shutdown::Both);
    Ok(())
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Picks the local records worth transferring.
///
/// A record is sent when the peer lacks its id entirely, or holds a
/// different version that is strictly older. Equal `modified` keeps
/// the transfer off the wire, which keeps newest-wins deterministic on
/// both peers.
fn select_to_send(local: &[EntryDigest], remote: &[EntryDigest]) -> Vec<String> {
    let remote_by_id: HashMap<&str, &EntryDigest> =
        remote.iter().map(|d| (d.id.as_str(), d)).collect();

    local
        .iter()
        .filter(|l| match remote_by_id.get(l.id.as_str()) {
            None => true,
            Some(r) => r.hash != l.hash && l.modified > r.modified,
        })
        .map(|l| l.id.clone())
        .collect()
}

fn validate_auth(auth: AuthMethod, passphrase: Option<&str>) -> VaultResult<()> {
    match auth {
        AuthMethod::None => Ok(()),
        AuthMethod::Passphrase => {
            if passphrase.is_some_and(|p| !p.is_empty()) {
                Ok(())
            } else {
                Err(VaultError::auth("passphrase required"))
            }
        }
        reserved => Err(VaultError::auth(format!("auth mode {reserved:?} is reserved"))),
    }
}

fn configure_stream(stream: &TcpStream) -> VaultResult<()> {
    stream
        .set_read_timeout(Some(SOCKET_TIMEOUT))
        .map_err(|e| VaultError::io("set read timeout", e))?;
    stream
        .set_write_timeout(Some(SOCKET_TIMEOUT))
        .map_err(|e| VaultError::io("set write timeout", e))?;
    Ok(())
}

const fn message_name(message: &SyncMessage) -> &'static str {
    match message {
        SyncMessage::SyncRequest { .. } => "SYNC_REQUEST",
        SyncMessage::Digest { .. } => "DIGEST",
        SyncMessage::Entries { .. } => "ENTRIES",
    }
}

fn lock(config: &Mutex<EngineConfig>) -> std::sync::MutexGuard<'_, EngineConfig> {
    config.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock_plain<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
