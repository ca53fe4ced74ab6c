//! Error types for the proxy handshake.

use std::io;

use thiserror::Error;

use crate::message::DecodeError;

/// Result type for handshake operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classes of handshake failure
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// The HTTP framing around the handshake was not as expected
    ProtocolFraming,
    /// The proxy's challenge could not be decoded
    ChallengeDecode,
    /// The proxy did not accept the credentials
    AuthorizationRejected,
    /// The underlying connection failed
    TransportFailure,
    /// The operation is not possible in the current state
    InvalidState,
}

/// Main error type for the handshake engine
#[derive(Debug, Error)]
pub enum Error {
    /// The first write did not contain a complete HTTP header block
    #[error("invalid first HTTP request: no blank line terminates the header block")]
    InvalidFirstRequest,

    /// A configured extra header is not a single `Name: value` line
    #[error("invalid extra header line: {header:?}")]
    InvalidExtraHeader { header: String },

    /// The proxy answered the Negotiate request with something other than 401 or 407
    #[error("proxy challenge answer mismatch, expected 401 or 407: {status_line:?}")]
    ChallengeStatusMismatch { status_line: String },

    /// The proxy's answer carried no NTLM challenge header
    #[error("no NTLM challenge received from proxy")]
    NoChallengeHeader,

    /// The challenge token is not valid base64
    #[error("challenge token is not valid base64: {0}")]
    ChallengeEncoding(#[from] base64::DecodeError),

    /// The challenge message is malformed
    #[error("invalid challenge message: {0}")]
    ChallengeDecode(#[from] DecodeError),

    /// The proxy answered the Authenticate request with a non-2xx status
    #[error("proxy response was different than authorized: {status_line:?}")]
    AuthorizationRejected { status_line: String },

    /// The handshake, or the release of writes queued behind it, has already failed on this
    /// connection
    #[error("proxy connection failed earlier; no further writes are accepted")]
    HandshakeFailed,

    /// I/O error on the underlying connection
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl Error {
    /// Returns the class this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidFirstRequest
            | Error::InvalidExtraHeader { .. }
            | Error::ChallengeStatusMismatch { .. }
            | Error::NoChallengeHeader => ErrorKind::ProtocolFraming,
            Error::ChallengeEncoding(_) | Error::ChallengeDecode(_) => ErrorKind::ChallengeDecode,
            Error::AuthorizationRejected { .. } => ErrorKind::AuthorizationRejected,
            Error::HandshakeFailed => ErrorKind::InvalidState,
            Error::Transport(_) => ErrorKind::TransportFailure,
        }
    }
}
