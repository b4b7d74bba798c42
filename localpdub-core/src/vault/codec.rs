//! Vault container codec: encode/decode and atomic file replacement.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use fs2::FileExt;
use zeroize::Zeroize;

use crate::crypto::{self, VaultKey};
use crate::error::{VaultError, VaultResult};
use crate::paths::VaultPaths;
use crate::types::VaultDocument;

use super::format::{MIN_SEALED_SIZE, SALT_SIZE, SEALED_OFFSET};
use super::header::FileHeader;

/// Result of decoding a vault container with a password.
///
/// Carries the derived key and the salt so the caller can re-encode
/// later saves without re-running the KDF, and reload the file after a
/// sync without the password.
pub struct DecodedVault {
    /// The decrypted vault payload.
    pub document: VaultDocument,
    /// The key derived from the password and the file's salt.
    pub key: VaultKey,
    /// The salt embedded in the file.
    pub salt: [u8; SALT_SIZE],
}

// =============================================================================
// Encoding
// =============================================================================

/// Encodes a vault document with an already-derived key and salt.
///
/// Reusing the salt of the existing file keeps the KDF output stable
/// across saves, so the cached key stays valid.
pub fn encode_with_key(
    document: &VaultDocument,
    key: &VaultKey,
    salt: &[u8; SALT_SIZE],
) -> VaultResult<Vec<u8>> {
    let mut plaintext = serde_json::to_vec(document)
        .map_err(|e| VaultError::invalid_format(format!("document encoding: {e}")))?;

    let nonce = crypto::generate_nonce()?;
    let ciphertext = crypto::seal(&plaintext, key, &nonce)?;
    plaintext.zeroize();

    let mut sealed = Vec::with_capacity(nonce.len() + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);

    let data_size = u32::try_from(sealed.len())
        .map_err(|_| VaultError::invalid_format("vault payload exceeds format limits"))?;

    let header = FileHeader::new(data_size);
    let mut bytes = Vec::with_capacity(SEALED_OFFSET + sealed.len());
    bytes.extend_from_slice(&header.encode());
    bytes.extend_from_slice(salt);
    bytes.extend_from_slice(&sealed);
    Ok(bytes)
}

/// Encodes a vault document with a password, generating a fresh salt.
pub fn encode(document: &VaultDocument, password: &str) -> VaultResult<Vec<u8>> {
    let salt = crypto::generate_salt()?;
    let key = crypto::derive_key(password, &salt)?;
    encode_with_key(document, &key, &salt)
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes a vault container with a password.
///
/// # Errors
///
/// Returns [`VaultError::InvalidFormat`] for header-level problems and
/// [`VaultError::InvalidPassword`] for anything after key derivation;
/// wrong password and corruption are indistinguishable.
pub fn decode(bytes: &[u8], password: &str) -> VaultResult<DecodedVault> {
    let (salt, nonce, ciphertext) = split_container(bytes)?;
    let key = crypto::derive_key(password, &salt)?;
    let document = open_document(ciphertext, &key, &nonce)?;
    Ok(DecodedVault {
        document,
        key,
        salt,
    })
}

/// Decodes a vault container with an already-derived key.
///
/// Used by `reload()` after a save, when the key for the file's salt
/// is already cached.
pub fn decode_with_key(bytes: &[u8], key: &VaultKey) -> VaultResult<VaultDocument> {
    let (_, nonce, ciphertext) = split_container(bytes)?;
    open_document(ciphertext, key, &nonce)
}

/// Validates the container layout and splits it into parts.
fn split_container(bytes: &[u8]) -> VaultResult<([u8; SALT_SIZE], [u8; crypto::NONCE_SIZE], &[u8])> {
    let header = FileHeader::decode(bytes)?;

    let data_size = header.data_size as usize;
    if data_size < MIN_SEALED_SIZE {
        return Err(VaultError::invalid_format("sealed blob too short"));
    }
    if bytes.len() != SEALED_OFFSET + data_size {
        return Err(VaultError::invalid_format(format!(
            "length mismatch: expected {} bytes, have {}",
            SEALED_OFFSET + data_size,
            bytes.len()
        )));
    }

    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&bytes[super::format::SALT_OFFSET..SEALED_OFFSET]);

    let sealed = &bytes[SEALED_OFFSET..];
    let mut nonce = [0u8; crypto::NONCE_SIZE];
    nonce.copy_from_slice(&sealed[..crypto::NONCE_SIZE]);

    Ok((salt, nonce, &sealed[crypto::NONCE_SIZE..]))
}

/// Opens the sealed blob and parses the plaintext document.
fn open_document(
    ciphertext: &[u8],
    key: &VaultKey,
    nonce: &[u8; crypto::NONCE_SIZE],
) -> VaultResult<VaultDocument> {
    let mut plaintext = crypto::open(ciphertext, key, nonce)?;
    // A parse failure here is treated exactly like a tag mismatch.
    let document = serde_json::from_slice(&plaintext).map_err(|_| VaultError::InvalidPassword);
    plaintext.zeroize();
    document
}

// =============================================================================
// File I/O
// =============================================================================

/// Reads and decodes the vault file at `paths` with a password.
pub fn read_from_path(paths: &VaultPaths, password: &str) -> VaultResult<DecodedVault> {
    let bytes = fs::read(paths.vault_path()).map_err(|e| VaultError::io("open vault", e))?;
    decode(&bytes, password)
}

/// Atomically replaces the vault file with `bytes`.
///
/// Writes `<path>.tmp`, fsyncs, copies any existing file to
/// `<path>.bak`, then renames over `<path>`. The whole sequence runs
/// under an exclusive file lock so only one save is in flight.
pub fn write_to_path(paths: &VaultPaths, bytes: &[u8]) -> VaultResult<()> {
    let vault = paths.vault_path();
    if let Some(parent) = vault.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| VaultError::io("create vault directory", e))?;
        }
    }

    let _lock = SaveLock::acquire(&paths.lock_path())?;

    let tmp = paths.tmp_path();
    write_private(&tmp, bytes)?;

    if vault.exists() {
        fs::copy(vault, paths.bak_path()).map_err(|e| VaultError::io("write vault backup", e))?;
    }

    fs::rename(&tmp, vault).map_err(|e| VaultError::io("publish vault file", e))?;
    Ok(())
}

/// Writes `bytes` to `path` with owner-only permissions and fsync.
fn write_private(path: &Path, bytes: &[u8]) -> VaultResult<()> {
    let mut file = File::create(path).map_err(|e| VaultError::io("create temp file", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| VaultError::io("set vault permissions", e))?;
    }

    file.write_all(bytes)
        .map_err(|e| VaultError::io("write vault data", e))?;
    file.sync_all()
        .map_err(|e| VaultError::io("sync vault data", e))?;
    Ok(())
}

/// Exclusive file lock held for the duration of one save.
struct SaveLock {
    file: File,
}

impl SaveLock {
    fn acquire(path: &Path) -> VaultResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| VaultError::io("open save lock", e))?;
        file.lock_exclusive()
            .map_err(|e| VaultError::io("acquire save lock", e))?;
        Ok(Self { file })
    }
}

impl Drop for SaveLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Record;

    fn sample_document() -> VaultDocument {
        let mut doc = VaultDocument::empty();
        let mut record = Record::new("example");
        record.username = "alice".to_string();
        record.password = "hunter2".to_string();
        doc.entries.push(record);
        doc.metadata.entry_count = 1;
        doc
    }

    #[test]
    fn test_roundtrip_with_password() {
        let doc = sample_document();
        let bytes = encode(&doc, "hunter22").unwrap();

        let decoded = decode(&bytes, "hunter22").unwrap();
        assert_eq!(decoded.document, doc);
    }

    #[test]
    fn test_wrong_password_is_invalid_password() {
        let bytes = encode(&sample_document(), "hunter22").unwrap();
        assert!(matches!(
            decode(&bytes, "wrong"),
            Err(VaultError::InvalidPassword)
        ));
    }

    #[test]
    fn test_roundtrip_with_cached_key() {
        let doc = sample_document();
        let salt = [9u8; SALT_SIZE];
        let key = VaultKey::from_bytes([3u8; crypto::KEY_SIZE]);

        let bytes = encode_with_key(&doc, &key, &salt).unwrap();
        let decoded = decode_with_key(&bytes, &key).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn test_salt_is_embedded_verbatim() {
        let salt = [0xABu8; SALT_SIZE];
        let key = VaultKey::from_bytes([3u8; crypto::KEY_SIZE]);
        let bytes = encode_with_key(&sample_document(), &key, &salt).unwrap();
        assert_eq!(&bytes[super::super::format::SALT_OFFSET..SEALED_OFFSET], salt);
    }

    #[test]
    fn test_bad_magic_is_invalid_format() {
        let key = VaultKey::from_bytes([3u8; crypto::KEY_SIZE]);
        let mut bytes = encode_with_key(&sample_document(), &key, &[0u8; SALT_SIZE]).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            decode_with_key(&bytes, &key),
            Err(VaultError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_truncated_file_is_invalid_format() {
        let key = VaultKey::from_bytes([3u8; crypto::KEY_SIZE]);
        let bytes = encode_with_key(&sample_document(), &key, &[0u8; SALT_SIZE]).unwrap();
        assert!(matches!(
            decode_with_key(&bytes[..bytes.len() - 4], &key),
            Err(VaultError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_flipped_ciphertext_is_invalid_password() {
        let key = VaultKey::from_bytes([3u8; crypto::KEY_SIZE]);
        let mut bytes = encode_with_key(&sample_document(), &key, &[0u8; SALT_SIZE]).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            decode_with_key(&bytes, &key),
            Err(VaultError::InvalidPassword)
        ));
    }

    #[test]
    fn test_atomic_write_creates_backup() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VaultPaths::at(dir.path().join("vault.lpd"));
        let key = VaultKey::from_bytes([3u8; crypto::KEY_SIZE]);
        let salt = [0u8; SALT_SIZE];

        let first = encode_with_key(&sample_document(), &key, &salt).unwrap();
        write_to_path(&paths, &first).unwrap();
        assert!(!paths.bak_path().exists());

        let mut doc = sample_document();
        doc.entries[0].title = "renamed".to_string();
        let second = encode_with_key(&doc, &key, &salt).unwrap();
        write_to_path(&paths, &second).unwrap();

        // The backup holds the previous save, the vault the new one.
        assert_eq!(fs::read(paths.bak_path()).unwrap(), first);
        assert_eq!(fs::read(paths.vault_path()).unwrap(), second);
        assert!(!paths.tmp_path().exists());
    }

    #[test]
    fn test_stale_tmp_file_is_never_read() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VaultPaths::at(dir.path().join("vault.lpd"));
        let key = VaultKey::from_bytes([3u8; crypto::KEY_SIZE]);

        let bytes = encode_with_key(&sample_document(), &key, &[0u8; SALT_SIZE]).unwrap();
        write_to_path(&paths, &bytes).unwrap();

        // Simulate a save interrupted mid-write on a later attempt.
        fs::write(paths.tmp_path(), b"partial garbage").unwrap();

        let reread = fs::read(paths.vault_path()).unwrap();
        let decoded = decode_with_key(&reread, &key).unwrap();
        assert_eq!(decoded.entries.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_vault_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let paths = VaultPaths::at(dir.path().join("vault.lpd"));
        let key = VaultKey::from_bytes([3u8; crypto::KEY_SIZE]);

        let bytes = encode_with_key(&sample_document(), &key, &[0u8; SALT_SIZE]).unwrap();
        write_to_path(&paths, &bytes).unwrap();

        let mode = fs::metadata(paths.vault_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
