//! Session coordinator: vault lifecycle and sync orchestration.
//!
//! A session owns the derived key and is the only component that
//! writes the vault file. The sync responder and initiators share the
//! session's in-memory record store and never touch the file, so a
//! save cannot race a concurrent merge.

use std::fs;
use std::sync::Arc;

use crate::crypto::{self, VaultKey};
use crate::error::{VaultError, VaultResult};
use crate::paths::VaultPaths;
use crate::sync::{
    AuthMethod, DiscoveryConfig, DiscoverySession, SyncEngine, SyncResult, SyncStats,
    SyncStrategy, SYNC_PORT,
};
use crate::types::{Peer, VaultDocument};
use crate::vault::{self, RecordStore, SALT_SIZE};

/// An open vault session: open → mutate → save → optional sync → close.
pub struct Session {
    paths: VaultPaths,
    device_id: String,
    sync_port: u16,
    store: Arc<RecordStore>,
    key: Option<VaultKey>,
    salt: Option<[u8; SALT_SIZE]>,
    engine: Option<SyncEngine>,
}

impl Session {
    /// Opens an existing vault file.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidPassword`] when the password does
    /// not match (or the file is corrupted), and an I/O error when the
    /// file cannot be read.
    pub fn open<P: AsRef<std::path::Path>>(path: P, password: &str) -> VaultResult<Self> {
        let paths = VaultPaths::at(path);
        let decoded = vault::read_from_path(&paths, password)?;

        let store = Arc::new(RecordStore::new());
        store.load(decoded.document);
        log::info!("opened vault at {}", paths.vault_path().display());

        Ok(Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            sync_port: SYNC_PORT,
            store,
            key: Some(decoded.key),
            salt: Some(decoded.salt),
            engine: None,
            paths,
        })
    }

    /// Creates a new empty vault file and opens a session on it.
    ///
    /// Fails when a file already exists at `path`.
    pub fn create<P: AsRef<std::path::Path>>(path: P, password: &str) -> VaultResult<Self> {
        let paths = VaultPaths::at(path);
        if paths.vault_path().exists() {
            return Err(VaultError::io(
                "create vault",
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "vault file exists"),
            ));
        }

        let salt = crypto::generate_salt()?;
        let key = crypto::derive_key(password, &salt)?;

        let document = VaultDocument::empty();
        let bytes = vault::encode_with_key(&document, &key, &salt)?;
        vault::write_to_path(&paths, &bytes)?;

        let store = Arc::new(RecordStore::new());
        store.load(document);
        log::info!("created vault at {}", paths.vault_path().display());

        Ok(Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            sync_port: SYNC_PORT,
            store,
            key: Some(key),
            salt: Some(salt),
            engine: None,
            paths,
        })
    }

    /// Returns true while the vault is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.key.is_some() && self.store.is_open()
    }

    /// Returns the record store backing this session.
    #[must_use]
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Returns this device's sync identity.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the vault file location.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        self.paths.vault_path()
    }

    /// Overrides the TCP port the sync responder binds (default 51820).
    pub fn set_sync_port(&mut self, port: u16) {
        self.sync_port = port;
    }

    /// Re-encrypts the store and atomically replaces the vault file.
    ///
    /// The existing salt is reused so the cached key stays valid.
    pub fn save(&self) -> VaultResult<()> {
        let (key, salt) = self.key_material()?;
        let document = self.store.document()?;
        let bytes = vault::encode_with_key(&document, key, salt)?;
        vault::write_to_path(&self.paths, &bytes)?;
        log::debug!("saved vault ({} entries)", document.entries.len());
        Ok(())
    }

    /// Re-decodes the vault file with the cached key.
    pub fn reload(&self) -> VaultResult<()> {
        let (key, _) = self.key_material()?;
        let bytes =
            fs::read(self.paths.vault_path()).map_err(|e| VaultError::io("reload vault", e))?;
        let document = vault::decode_with_key(&bytes, key)?;
        self.store.load(document);
        Ok(())
    }

    /// Zeroizes the key and drops the in-memory store. Idempotent.
    pub fn close(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.stop_responder();
        }
        // VaultKey zeroizes on drop.
        self.key = None;
        self.salt = None;
        self.store.close();
        log::debug!("closed vault at {}", self.paths.vault_path().display());
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Starts a discovery session announcing this vault.
    pub fn discover<S: Into<String>>(&self, device_name: S) -> VaultResult<DiscoverySession> {
        if !self.is_open() {
            return Err(VaultError::NotOpen);
        }
        let config = DiscoveryConfig::new(
            device_name,
            self.paths.vault_path().display().to_string(),
        );
        DiscoverySession::start(config)
    }

    /// Syncs with the given peers.
    ///
    /// Starts the TCP responder if it is not already running (so the
    /// peers can pull from this device too), drives one initiator per
    /// peer, then persists and reloads when any records were received.
    pub fn sync(
        &mut self,
        peers: &[Peer],
        strategy: SyncStrategy,
        auth: AuthMethod,
        passphrase: Option<&str>,
    ) -> VaultResult<SyncResult> {
        if !self.is_open() {
            return Err(VaultError::NotOpen);
        }

        let engine = self.engine.get_or_insert_with(|| {
            SyncEngine::new(
                self.device_id.clone(),
                self.paths.vault_path().display().to_string(),
                Arc::clone(&self.store),
            )
        });

        engine.configure(strategy, auth, passphrase)?;
        engine.start_responder(self.sync_port)?;

        let result = engine.sync_with_peers(peers, strategy, auth, passphrase);

        if result.entries_received > 0 {
            self.save()?;
            self.reload()?;
        }
        Ok(result)
    }

    /// Returns the sync results recorded this session.
    #[must_use]
    pub fn sync_history(&self) -> Vec<SyncResult> {
        self.engine.as_ref().map(SyncEngine::history).unwrap_or_default()
    }

    /// Returns aggregate sync statistics.
    #[must_use]
    pub fn sync_stats(&self) -> SyncStats {
        self.engine.as_ref().map(SyncEngine::stats).unwrap_or_default()
    }

    fn key_material(&self) -> VaultResult<(&VaultKey, &[u8; SALT_SIZE])> {
        match (&self.key, &self.salt) {
            (Some(key), Some(salt)) => Ok((key, salt)),
            _ => Err(VaultError::NotOpen),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
