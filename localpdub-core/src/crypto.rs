//! Cryptographic primitives for the vault engine.
//!
//! This module provides Argon2id password-based key derivation,
//! AES-256-GCM authenticated encryption for the vault container,
//! HMAC-SHA256 for sync authentication, and SHA-256 content digests.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
};
use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{VaultError, VaultResult};

type HmacSha256 = Hmac<Sha256>;

/// Size of the symmetric vault key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the Argon2id salt in bytes.
pub const SALT_SIZE: usize = 32;

/// Size of the AES-GCM nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Size of an HMAC-SHA256 output in bytes.
pub const HMAC_SIZE: usize = 32;

// Argon2id parameters. These must match on every device or vaults are
// not portable; changing them requires a vault format version bump.
const ARGON2_MEMORY_KIB: u32 = 65536;
const ARGON2_ITERATIONS: u32 = 3;
const ARGON2_PARALLELISM: u32 = 4;

// =============================================================================
// VaultKey
// =============================================================================

/// Vault encryption key (256-bit), derived from the master password.
///
/// The key lives only in memory while the vault is open and is
/// zeroized on drop. It never touches disk.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey([u8; KEY_SIZE]);

impl VaultKey {
    /// Creates a key from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns a reference to the raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Random material
// =============================================================================

/// Fills `buf` with cryptographically strong random bytes.
pub fn random_bytes(buf: &mut [u8]) -> VaultResult<()> {
    getrandom::getrandom(buf).map_err(|e| VaultError::crypto(format!("rng failure: {e}")))
}

/// Generates a random Argon2id salt.
pub fn generate_salt() -> VaultResult<[u8; SALT_SIZE]> {
    let mut salt = [0u8; SALT_SIZE];
    random_bytes(&mut salt)?;
    Ok(salt)
}

/// Generates a random AES-GCM nonce.
pub fn generate_nonce() -> VaultResult<[u8; NONCE_SIZE]> {
    let mut nonce = [0u8; NONCE_SIZE];
    random_bytes(&mut nonce)?;
    Ok(nonce)
}

// =============================================================================
// Key derivation
// =============================================================================

/// Derives the vault key from a password using Argon2id.
///
/// Parameters: t=3, m=65536 KiB, p=4, 32-byte output.
pub fn derive_key(password: &str, salt: &[u8; SALT_SIZE]) -> VaultResult<VaultKey> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(KEY_SIZE),
    )
    .map_err(|e| VaultError::crypto(format!("invalid argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| VaultError::crypto(format!("key derivation failed: {e}")))?;

    Ok(VaultKey::from_bytes(key))
}

// =============================================================================
// AEAD sealing
// =============================================================================

/// Encrypts plaintext with AES-256-GCM.
///
/// Returns the ciphertext with the 16-byte authentication tag appended.
pub fn seal(plaintext: &[u8], key: &VaultKey, nonce: &[u8; NONCE_SIZE]) -> VaultResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| VaultError::crypto("invalid AES-256-GCM key length"))?;

    cipher
        .encrypt(nonce.into(), plaintext)
        .map_err(|_| VaultError::crypto("AES-256-GCM encryption failed"))
}

/// Decrypts and authenticates a sealed blob produced by [`seal`].
///
/// # Errors
///
/// Returns [`VaultError::InvalidPassword`] on tag mismatch: a wrong key
/// and a tampered ciphertext are indistinguishable to the caller.
pub fn open(sealed: &[u8], key: &VaultKey, nonce: &[u8; NONCE_SIZE]) -> VaultResult<Vec<u8>> {
    if sealed.len() < TAG_SIZE {
        return Err(VaultError::InvalidPassword);
    }
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| VaultError::crypto("invalid AES-256-GCM key length"))?;

    cipher
        .decrypt(nonce.into(), sealed)
        .map_err(|_| VaultError::InvalidPassword)
}

// =============================================================================
// Digests and authentication
// =============================================================================

/// Computes HMAC-SHA256 over `message` with `key`.
#[must_use]
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; HMAC_SIZE] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    let mut out = [0u8; HMAC_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Compares two byte strings in constant time.
///
/// Used for the passphrase challenge/response so the comparison does
/// not short-circuit on the first differing byte.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Computes the hex-encoded SHA-256 digest of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
