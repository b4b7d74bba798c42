//! Vault file engine: on-disk container codec and in-memory record store.
//!
//! # File structure
//!
//! ```text
//! offset  size  field
//!  0      4     magic = "LPDV"
//!  4      2     version (u16 LE, currently 1)
//!  6      2     flags (u16 LE, reserved)
//!  8      4     header_size (u32 LE, = 16)
//! 12      4     data_size (u32 LE, sealed blob length)
//! 16     32     salt (Argon2id input)
//! 48      ?     sealed blob = nonce(12) || ciphertext || tag(16)
//! ```
//!
//! The plaintext inside the sealed blob is the UTF-8 JSON
//! [`VaultDocument`](crate::types::VaultDocument). The file is never
//! mutated in place: saves write `<path>.tmp`, fsync, back up the
//! previous file to `<path>.bak`, then rename over `<path>`.

mod codec;
mod format;
mod header;
mod store;

pub use codec::{decode, decode_with_key, encode, encode_with_key, read_from_path, write_to_path, DecodedVault};
pub use format::*;
pub use header::FileHeader;
pub use store::{ApplyOutcome, RecordStore};
