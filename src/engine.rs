//! The generic engine contract the adapter drives.
//!
//! An [`Engine`] is an opaque TLS state machine: the adapter never inspects
//! cipher suites, certificates, or key material, it only pumps bytes
//! through `wrap`/`unwrap` and reacts to the reported [`HandshakeStatus`].

use crate::buffer::FrameBuffer;

pub mod native;

/// Result of a `wrap` or `unwrap` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation completed; the engine may still want more calls.
    Ok,
    /// The engine needs more input than `src` currently holds.
    BufferUnderflow,
    /// `dst` filled before the engine finished producing output.
    BufferOverflow,
    /// The engine has moved to a closed state (e.g. after a close-notify).
    Closed,
}

/// The engine's self-reported next required action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Steady state: no handshake in progress.
    NotHandshaking,
    /// The engine has a handshake record ready to produce; call `wrap`.
    NeedWrap,
    /// The engine needs a handshake record from the peer; call `unwrap`.
    NeedUnwrap,
    /// The engine has deferred CPU work; call `delegated_task()` and run it.
    NeedTask,
    /// A handshake (or renegotiation) has just completed.
    Finished,
}

/// The shape returned by both `wrap` and `unwrap`.
#[derive(Debug, Clone, Copy)]
pub struct EngineResult {
    pub status: Status,
    pub handshake_status: HandshakeStatus,
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
}

/// A unit of deferred CPU work the engine wants run synchronously before
/// the handshake can proceed (e.g. a key-schedule derivation following a
/// Diffie-Hellman exchange). The adapter never defers this to a worker
/// pool; it is run inline on the calling thread, per the design's
/// delegated-task note.
pub trait DelegatedTask: Send {
    fn run(self: Box<Self>);
}

/// The opaque TLS engine contract the adapter is written against.
///
/// Implementors own all cryptographic state; the adapter only sees the
/// vocabulary above. `Engine::Error` is the engine's own error type,
/// chained as the `source()` of [`crate::Error::TlsProtocol`] /
/// [`crate::Error::HandshakeFailure`] rather than stringified.
pub trait Engine: Send {
    type Error: std::error::Error + Send + Sync + 'static;
    type Session;

    /// Consume plaintext from `src`, produce ciphertext (or a handshake
    /// record) into `dst`.
    fn wrap(
        &mut self,
        src: &mut FrameBuffer,
        dst: &mut FrameBuffer,
    ) -> Result<EngineResult, Self::Error>;

    /// Consume ciphertext (or a handshake record) from `src`, produce
    /// plaintext into `dst`.
    fn unwrap(
        &mut self,
        src: &mut FrameBuffer,
        dst: &mut FrameBuffer,
    ) -> Result<EngineResult, Self::Error>;

    /// Start (or restart, for renegotiation) an actively-initiated
    /// handshake.
    fn begin_handshake(&mut self) -> Result<(), Self::Error>;

    /// Start a best-effort close; the engine should report `NeedWrap` next
    /// if it wants to emit a close-notify record.
    fn close_outbound(&mut self);

    fn handshake_status(&self) -> HandshakeStatus;

    /// Take the next delegated task, if any. Returns `None` once there is
    /// no more deferred work for the current handshake status.
    fn delegated_task(&mut self) -> Option<Box<dyn DelegatedTask>>;

    /// The engine's current session descriptor. Opaque to the adapter --
    /// passed straight through to the session-initialized callback.
    fn session(&self) -> Self::Session;
}
