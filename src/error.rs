//! Error taxonomy for the TLS channel adapter.
//!
//! Kinds, not type names: callers match on variant, not on a stringified
//! cause. `NeedsRead`/`NeedsWrite` are would-block signals, not failures --
//! see the propagation policy on [`Error`].

use std::fmt;
use std::io;

use thiserror::Error;

/// Errors produced by the adapter.
///
/// `NeedsRead` and `NeedsWrite` propagate straight out of the stack; they are
/// not exceptions about failure, they are would-block signals and do not
/// latch the adapter invalid. Every other variant latches `invalid` before
/// it is returned, so a caller that retries after one of these never
/// observes a half-mutated adapter.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport returned would-block on a read and the adapter cannot
    /// produce a result without more input. Retry once the transport is
    /// readable.
    #[error("operation would block: needs the transport to become readable")]
    NeedsRead,

    /// The transport returned would-block on a write, or buffered
    /// ciphertext could not be fully drained. Retry once the transport is
    /// writable.
    #[error("operation would block: needs the transport to become writable")]
    NeedsWrite,

    /// An operation was attempted on an adapter that has already latched
    /// `invalid` (via `close()` or a prior fatal error).
    #[error("channel is closed")]
    ClosedChannel,

    /// The engine reported a protocol error during `wrap` or `unwrap`.
    #[error("TLS protocol error")]
    TlsProtocol {
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O or engine failure occurred inside the handshake loop, other
    /// than the would-block signals. Carries the original cause as a
    /// chained source rather than a stringified message or type name.
    #[error("TLS handshake failed")]
    HandshakeFailure {
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The engine reported a status the adapter's contract says is
    /// impossible in that position (e.g. buffer-overflow from `wrap`).
    /// Treated as a fatal program error, not a retryable condition.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(&'static str),

    /// Propagated straight from the underlying transport.
    #[error("transport I/O error")]
    Io(#[source] io::Error),

    /// Constructing the adapter failed validation (e.g. an
    /// inbound-encrypted buffer smaller than `MAX_RECORD_SIZE`).
    #[error("invalid adapter configuration: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub fn tls_protocol<E>(cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::TlsProtocol {
            cause: Box::new(cause),
        }
    }

    pub fn handshake_failure<E>(cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::HandshakeFailure {
            cause: Box::new(cause),
        }
    }

    /// True for the two would-block signals, which never latch `invalid`.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::NeedsRead | Error::NeedsWrite)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::WouldBlock {
            // Ambiguous without call-site context; callers that can tell
            // read from write should map directly to NeedsRead/NeedsWrite
            // instead of relying on this conversion.
            Error::NeedsRead
        } else {
            Error::Io(e)
        }
    }
}

/// A trivial placeholder error type for adapting engine causes that don't
/// carry a richer error of their own (used by the reference engine).
#[derive(Debug)]
pub struct SimpleError(pub String);

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SimpleError {}

pub type Result<T> = std::result::Result<T, Error>;
