//! Wire protocol error types.

use thiserror::Error;

/// Envelope codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Command is empty after trimming
    #[error("command is empty")]
    EmptyCommand,

    /// Blob is empty after trimming
    #[error("message is empty")]
    EmptyMessage,

    /// Blob could not be decompressed
    #[error("message unarchiving failed")]
    UnarchiveFailed,

    /// Decompressed blob is not a valid envelope
    #[error("message decoding failed")]
    DecodeFailed,

    /// Checksum does not match the recovered plaintext
    #[error("invalid message checksum")]
    InvalidChecksum,

    /// Archived blob exceeds the size cap
    #[error("oversized message: {size} bytes exceeds {limit}")]
    OversizedMessage {
        /// Archived size
        size: usize,
        /// Configured cap
        limit: usize,
    },

    /// Encryption primitive failure
    #[error("crypto error")]
    Crypto,
}

/// Transport frame errors
#[derive(Error, Debug)]
pub enum FrameError {
    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown frame type
    #[error("unknown type {0}")]
    Type(u8),

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,
}
