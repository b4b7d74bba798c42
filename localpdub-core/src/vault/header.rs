//! Fixed file header encode/decode.

use crate::error::{VaultError, VaultResult};

use super::format::{FILE_MAGIC, FORMAT_VERSION, HEADER_SIZE};

/// Fixed header at the start of every vault file.
///
/// # Binary layout (16 bytes, little-endian)
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     magic ("LPDV")
/// 4       2     version (u16 LE)
/// 6       2     flags (u16 LE, reserved)
/// 8       4     header_size (u32 LE, = 16)
/// 12      4     data_size (u32 LE)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version.
    pub version: u16,
    /// Reserved flag bits, currently zero.
    pub flags: u16,
    /// Length of the sealed blob following the salt.
    pub data_size: u32,
}

impl FileHeader {
    /// Creates a header for the current format version.
    #[must_use]
    pub const fn new(data_size: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            flags: 0,
            data_size,
        }
    }

    /// Encodes the header to its fixed byte form.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(FILE_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..12].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&self.data_size.to_le_bytes());
        buf
    }

    /// Decodes and validates a header.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidFormat`] if the buffer is
    /// truncated, the magic bytes don't match, the version is
    /// unsupported, or the declared header size is wrong.
    pub fn decode(bytes: &[u8]) -> VaultResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(VaultError::invalid_format("truncated header"));
        }
        if &bytes[0..4] != FILE_MAGIC {
            return Err(VaultError::invalid_format("bad magic bytes"));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(VaultError::invalid_format(format!(
                "unsupported version {version}"
            )));
        }

        let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
        let header_size = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if header_size as usize != HEADER_SIZE {
            return Err(VaultError::invalid_format(format!(
                "unexpected header size {header_size}"
            )));
        }

        let data_size = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

        Ok(Self {
            version,
            flags,
            data_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FileHeader::new(12345);
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);

        let decoded = FileHeader::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_field_layout() {
        let header = FileHeader::new(0x0102_0304);
        let encoded = header.encode();

        assert_eq!(&encoded[0..4], b"LPDV");
        assert_eq!(u16::from_le_bytes([encoded[4], encoded[5]]), 1);
        assert_eq!(u16::from_le_bytes([encoded[6], encoded[7]]), 0);
        assert_eq!(
            u32::from_le_bytes([encoded[8], encoded[9], encoded[10], encoded[11]]),
            16
        );
        assert_eq!(
            u32::from_le_bytes([encoded[12], encoded[13], encoded[14], encoded[15]]),
            0x0102_0304
        );
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut encoded = FileHeader::new(10).encode();
        encoded[0] = b'X';
        assert!(matches!(
            FileHeader::decode(&encoded),
            Err(VaultError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_header_rejects_unknown_version() {
        let mut encoded = FileHeader::new(10).encode();
        encoded[4] = 9;
        assert!(matches!(
            FileHeader::decode(&encoded),
            Err(VaultError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_header_rejects_truncation() {
        let encoded = FileHeader::new(10).encode();
        assert!(matches!(
            FileHeader::decode(&encoded[..HEADER_SIZE - 1]),
            Err(VaultError::InvalidFormat(_))
        ));
    }
}
