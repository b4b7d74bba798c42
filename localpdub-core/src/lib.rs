#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]

//! LocalPDub core: a local-first encrypted password vault with
//! peer-to-peer synchronization over a local-area network.
//!
//! Secrets live in a single encrypted file on disk, protected by a
//! password-derived key. The same user, from multiple devices, can
//! reconcile their vaults without any intermediary server.
//!
//! # Architecture
//!
//! - [`crypto`] — Argon2id key derivation, AES-256-GCM sealing,
//!   HMAC-SHA256 sync authentication, zeroized key material.
//! - [`vault`] — the on-disk container codec with atomic replacement,
//!   and the mutex-protected in-memory record store.
//! - [`sync`] — UDP broadcast peer discovery and the TCP digest
//!   exchange protocol with deterministic conflict resolution.
//! - [`session`] — the lifecycle coordinator tying the pieces
//!   together: open → mutate → save → optional sync → close.

pub mod cancel;
pub mod crypto;
pub mod error;
pub mod paths;
pub mod session;
pub mod sync;
pub mod types;
pub mod vault;

pub use error::{VaultError, VaultResult};
pub use session::Session;
pub use types::{Category, EntryDigest, Peer, Record, RecordKind};
