//! Shared scaffolding for the adapter's end-to-end tests: a loopback TCP
//! pair and a thin wrapper around constructing a [`TlsChannelAdapter`] over
//! the reference engine.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use tls_channel_adapter::buffer::MAX_RECORD_SIZE;
use tls_channel_adapter::engine::native::{NativeEngine, Role};
use tls_channel_adapter::TlsChannelAdapter;

pub type Adapter = TlsChannelAdapter<TcpStream, TcpStream, NativeEngine>;

/// Routes the adapter's `log` output through the test harness; safe to call
/// from every test since a second `try_init()` is a harmless no-op.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A connected pair of loopback sockets, one per side.
pub fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().expect("local addr");
    let client = TcpStream::connect(addr).expect("connect loopback");
    let (server, _) = listener.accept().expect("accept loopback");
    client.set_nodelay(true).expect("set_nodelay");
    server.set_nodelay(true).expect("set_nodelay");
    (client, server)
}

/// Builds an adapter over `stream` with a counting session-initialized
/// callback; returns the adapter plus a shared counter so callers can
/// assert the callback ran exactly once.
pub fn build_adapter(stream: TcpStream, role: Role) -> (Adapter, Arc<AtomicUsize>) {
    let reader = stream.try_clone().expect("clone tcp stream for read half");
    let writer = stream;
    let callback_count = Arc::new(AtomicUsize::new(0));
    let counted = callback_count.clone();
    let adapter = TlsChannelAdapter::new(reader, writer, NativeEngine::new(role), MAX_RECORD_SIZE, move |_session| {
        counted.fetch_add(1, Ordering::SeqCst);
    })
    .expect("construct adapter");
    (adapter, callback_count)
}

/// Deterministically generates `n` pseudo-random bytes from `seed`, the
/// same way both the writer side and the verifying side of a round-trip
/// test derive their expectation independently of the network.
pub fn seeded_bytes(seed: u64, n: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = vec![0u8; n];
    rng.fill_bytes(&mut out);
    out
}
