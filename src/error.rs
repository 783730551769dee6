//! # Transport Errors
//!
//! Every transport failure is a typed outcome returned to the immediate
//! caller of `send`/`receive`. This layer performs no silent retries -
//! retry policy belongs to the collaborator.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::message::ClientUid;

/// Errors reported by the framing and connection layers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The wire stream contained a malformed or inconsistent frame. The
    /// stream position can no longer be trusted, so the handler closes.
    #[error("framing error: {0}")]
    Framing(String),

    /// A frame body exceeded the configured size bound.
    #[error("frame body too large: {size} bytes (max: {max} bytes)")]
    BodyTooLarge {
        /// Declared or actual body size.
        size: usize,
        /// Maximum allowed body size.
        max: usize,
    },

    /// The peer reset the connection or the stream ended. Reported once to
    /// whichever receive call is pending; the handler is Closed afterwards.
    #[error("connection closed")]
    ConnectionClosed,

    /// One send attempt did not complete within its timeout. The handler is
    /// left unchanged - the caller decides whether to retry or close.
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    /// A connect-time operation exceeded its deadline.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
    },

    /// TLS configuration error.
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// Certificate parsing error.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Private key parsing error.
    #[error("private key error: {0}")]
    PrivateKey(String),

    /// TLS handshake failure. The whole connection attempt is aborted and
    /// no handler is produced.
    #[error("TLS handshake error: {0}")]
    Handshake(String),

    /// `send_to` was asked for a client the server does not know.
    #[error("unknown client: {0}")]
    UnknownClient(ClientUid),

    /// The server stopped listening.
    #[error("server shut down")]
    ServerClosed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// True for I/O error kinds that mean the peer is gone rather than that a
/// single operation failed.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
