//! On-disk format constants and layout definitions.

use crate::crypto;

/// Magic bytes at the start of every vault file.
pub const FILE_MAGIC: &[u8; 4] = b"LPDV";

/// Current vault file format version.
pub const FORMAT_VERSION: u16 = 1;

/// Size of the fixed file header in bytes.
/// Layout: magic(4) + version(2) + flags(2) + header_size(4) + data_size(4) = 16
pub const HEADER_SIZE: usize = 16;

/// Byte offset of the KDF salt.
pub const SALT_OFFSET: usize = HEADER_SIZE;

/// Size of the KDF salt in bytes.
pub const SALT_SIZE: usize = crypto::SALT_SIZE;

/// Byte offset of the sealed blob (nonce || ciphertext || tag).
pub const SEALED_OFFSET: usize = SALT_OFFSET + SALT_SIZE;

/// Minimum length of a sealed blob: nonce plus authentication tag.
pub const MIN_SEALED_SIZE: usize = crypto::NONCE_SIZE + crypto::TAG_SIZE;
