//! A non-blocking TLS framing adapter over arbitrary byte transports.
//!
//! [`TlsChannelAdapter`] sits between an opaque [`engine::Engine`] (the
//! pluggable TLS state machine) and a pair of transport halves, presenting a
//! plain `read`/`write`/`close` surface while transparently driving the
//! handshake, renegotiation, and record framing underneath. See
//! [`adapter`] for the orchestration itself and [`engine::native`] for the
//! reference engine this crate's own tests are built against.

pub mod adapter;
pub mod buffer;
pub mod engine;
pub mod error;
pub mod transport;

pub use adapter::{ReadOutcome, TlsChannelAdapter};
pub use engine::{DelegatedTask, Engine, EngineResult, HandshakeStatus, Status};
pub use error::{Error, Result};
pub use transport::Shutdown;
