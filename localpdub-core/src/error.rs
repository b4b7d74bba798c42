//! Error types for the vault core.

use thiserror::Error;

/// Result type alias for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

/// Errors raised by the vault engine and the sync subsystem.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Bad magic bytes, truncated header, or unknown format version.
    #[error("invalid vault file: {0}")]
    InvalidFormat(String),

    /// AEAD authentication failure or parse failure after decryption.
    ///
    /// Wrong-password and corrupted-file failures are deliberately
    /// indistinguishable.
    #[error("invalid password or corrupted vault")]
    InvalidPassword,

    /// Operation attempted on a store that is not open.
    #[error("vault is not open")]
    NotOpen,

    /// No record or peer matching an id.
    #[error("not found: {0}")]
    NotFound(String),

    /// File or socket failure.
    #[error("i/o error during {context}: {source}")]
    Io {
        /// Context describing the operation.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Bind, connect, accept, or address resolution failure.
    #[error("network error: {0}")]
    Network(String),

    /// Challenge/response mismatch or unsupported auth mode.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed or out-of-order protocol message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Primitive failure (exhausted CSRNG, KDF error, cipher error).
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl VaultError {
    /// Creates an invalid format error.
    pub fn invalid_format<S: Into<String>>(context: S) -> Self {
        Self::InvalidFormat(context.into())
    }

    /// Creates an I/O error with context.
    pub fn io<S: Into<String>>(context: S, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a not found error.
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates a network error.
    pub fn network<S: Into<String>>(context: S) -> Self {
        Self::Network(context.into())
    }

    /// Creates an authentication error.
    pub fn auth<S: Into<String>>(context: S) -> Self {
        Self::Auth(context.into())
    }

    /// Creates a protocol error.
    pub fn protocol<S: Into<String>>(context: S) -> Self {
        Self::Protocol(context.into())
    }

    /// Creates a crypto error.
    pub fn crypto<S: Into<String>>(context: S) -> Self {
        Self::Crypto(context.into())
    }
}
