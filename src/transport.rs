//! The minimal transport-side contract the adapter needs beyond
//! `std::io::Read`/`std::io::Write`: a way to half-close a transport when
//! the adapter itself is torn down, and a best-effort liveness probe for
//! [`crate::adapter::TlsChannelAdapter::is_open`]. `std::io::Write` has no
//! `close()`, and the generic `W`/`R` the adapter is built over isn't
//! necessarily a `TcpStream` the adapter could otherwise call `shutdown` or
//! query directly.

use std::io;
use std::net::{Shutdown as NetShutdown, TcpStream};

/// Half-close a transport, and report whether it still looks connected.
/// Errors from `shutdown` are expected to be swallowed by callers (the
/// adapter's own close path treats transport teardown as best-effort).
pub trait Shutdown {
    fn shutdown(&mut self) -> io::Result<()>;

    /// `true` unless the transport has observed a pending socket error.
    /// `std` exposes no portable "is this connection still up" query --
    /// `take_error` is the closest approximation it gives a `TcpStream`, so
    /// that's what this reports. It does not by itself detect a half-close
    /// the local side just performed; the adapter's own `is_open()` layers
    /// its `invalid` latch on top for that.
    fn is_open(&self) -> bool;
}

impl Shutdown for TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, NetShutdown::Both)
    }

    fn is_open(&self) -> bool {
        matches!(TcpStream::take_error(self), Ok(None))
    }
}

impl Shutdown for &TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, NetShutdown::Both)
    }

    fn is_open(&self) -> bool {
        matches!(TcpStream::take_error(self), Ok(None))
    }
}
