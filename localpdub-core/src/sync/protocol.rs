//! Wire messages and newline framing for the TCP sync protocol.
//!
//! Every protocol message is a single JSON object terminated by `\n`.
//! Receivers accumulate bytes until the first newline, parse the
//! prefix, and retain trailing bytes as the start of the next message.
//! The unframed 32-byte challenge and response of passphrase
//! authentication pass through [`FrameReader::read_exact_raw`] so they
//! drain any already-buffered bytes first.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::types::{EntryDigest, Record};

use super::MAX_MESSAGE_SIZE;

/// Size of the passphrase auth challenge and response.
pub const CHALLENGE_SIZE: usize = 32;

/// A framed sync protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    /// Opens a sync conversation.
    #[serde(rename = "SYNC_REQUEST")]
    SyncRequest {
        /// Initiator's device id.
        device_id: String,
        /// Identifier of the vault being synced.
        vault_id: String,
    },
    /// One side's record digests.
    #[serde(rename = "DIGEST")]
    Digest {
        /// Digest per local record.
        entries: Vec<EntryDigest>,
    },
    /// Full records selected for transfer.
    #[serde(rename = "ENTRIES")]
    Entries {
        /// The records themselves.
        entries: Vec<Record>,
    },
}

/// Serializes a message and writes it with its newline terminator.
pub fn write_message<W: Write>(writer: &mut W, message: &SyncMessage) -> VaultResult<()> {
    let mut bytes = serde_json::to_vec(message)
        .map_err(|e| VaultError::protocol(format!("message encoding: {e}")))?;
    bytes.push(b'\n');
    writer
        .write_all(&bytes)
        .map_err(|e| VaultError::io("send sync message", e))?;
    writer
        .flush()
        .map_err(|e| VaultError::io("flush sync message", e))?;
    Ok(())
}

/// Buffered newline-framed message reader.
///
/// Bytes past a message's terminator stay in the buffer for the next
/// read. A single accumulated message is capped at 10 MiB; exceeding
/// the cap is a protocol error and the caller aborts the connection.
pub struct FrameReader<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    /// Wraps a byte stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
        }
    }

    /// Reads the next framed message.
    pub fn read_message(&mut self) -> VaultResult<SyncMessage> {
        let frame = self.read_frame()?;
        serde_json::from_slice(&frame)
            .map_err(|e| VaultError::protocol(format!("malformed message: {e}")))
    }

    /// Reads exactly `buf.len()` raw bytes, draining buffered bytes
    /// first.
    pub fn read_exact_raw(&mut self, buf: &mut [u8]) -> VaultResult<()> {
        let from_buffer = self.buffer.len().min(buf.len());
        if from_buffer > 0 {
            buf[..from_buffer].copy_from_slice(&self.buffer[..from_buffer]);
            self.buffer.drain(..from_buffer);
        }
        self.reader
            .read_exact(&mut buf[from_buffer..])
            .map_err(|e| VaultError::io("read auth bytes", e))
    }

    /// Accumulates until the first newline and returns the frame
    /// without its terminator.
    fn read_frame(&mut self) -> VaultResult<Vec<u8>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut frame: Vec<u8> = self.buffer.drain(..=pos).collect();
                frame.pop();
                return Ok(frame);
            }
            if self.buffer.len() > MAX_MESSAGE_SIZE {
                return Err(VaultError::protocol("message exceeds 10 MiB cap"));
            }

            let mut chunk = [0u8; 4096];
            let n = self
                .reader
                .read(&mut chunk)
                .map_err(|e| VaultError::io("receive sync message", e))?;
            if n == 0 {
                return Err(VaultError::protocol("peer closed connection mid-message"));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}
