//! Session error types.

use std::net::IpAddr;

use msgpak_wire::FrameError;
use thiserror::Error;

/// Key exchange failures. All of them are connection scoped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Peer did not complete the exchange in time
    #[error("handshake timeout")]
    Timeout,

    /// Unexpected message during the exchange
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// Exchange material missing, malformed or inconsistent
    #[error("handshake compute failed: {0}")]
    ComputeFailed(String),
}

/// Transport failures. They terminate the session loop.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Read or write deadline expired
    #[error("{0} deadline exceeded")]
    Timeout(&'static str),

    /// Peer closed the connection
    #[error("connection closed: {0}")]
    Closed(String),

    /// Transport credentials refused
    #[error("transport authentication rejected")]
    AuthRejected,

    /// Remote address not in the allow-list
    #[error("remote address {0} not allowed")]
    IpRefused(IpAddr),

    /// TLS setup or negotiation failure
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Errors surfaced by session loops and the broker
#[derive(Error, Debug)]
pub enum SessionError {
    /// Key exchange failure
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}
