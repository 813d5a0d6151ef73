//! Mid-stream renegotiation: the writer forces a fresh handshake every
//! 10,000 bytes while a transfer is in progress. The reader, which never
//! calls `renegotiate()` itself, must transparently ride out each
//! renegotiation (via its passive handshake path in `read()`) and still
//! deliver every byte, in order, with no corruption and no premature
//! end-of-stream.

mod common;

use std::sync::Arc;
use std::thread;

use sha2::{Digest, Sha256};

use common::{build_adapter, seeded_bytes, tcp_pair};
use tls_channel_adapter::{engine::native::Role, ReadOutcome};

const SEED: u64 = 551_155_665;
const N: usize = 50_000;
const RENEGOTIATE_EVERY: usize = 10_000;
const CHUNK: usize = 2_000;

#[test]
fn mid_stream_renegotiation_preserves_the_stream() {
    common::init_logging();
    let (client_sock, server_sock) = tcp_pair();
    let (client, client_cb) = build_adapter(client_sock, Role::Client);
    let (server, _server_cb) = build_adapter(server_sock, Role::Server);
    let client = Arc::new(client);

    let payload = seeded_bytes(SEED, N);
    let expected: [u8; 32] = Sha256::digest(&payload).into();

    let writer = {
        let client = client.clone();
        let payload = payload.clone();
        thread::spawn(move || {
            let mut since_renegotiate = 0usize;
            for chunk in payload.chunks(CHUNK) {
                let mut sent = 0;
                while sent < chunk.len() {
                    let n = client.write(&chunk[sent..]).expect("blocking write never signals would-block");
                    sent += n;
                    since_renegotiate += n;
                    if since_renegotiate >= RENEGOTIATE_EVERY {
                        client.renegotiate().expect("renegotiate");
                        since_renegotiate = 0;
                    }
                }
            }
        })
    };

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 4096];
    let mut total = 0;
    while total < N {
        match server.read(&mut buf).expect("blocking read never signals would-block") {
            ReadOutcome::Read(k) => {
                hasher.update(&buf[..k]);
                total += k;
            }
            ReadOutcome::EndOfStream => panic!("unexpected end-of-stream after {total} of {N} bytes"),
        }
    }
    writer.join().expect("writer thread panicked");

    assert_eq!(hasher.finalize().as_slice(), expected.as_slice());
    // Exactly one initial handshake, regardless of how many renegotiations
    // ran on top of it.
    assert_eq!(client_cb.load(std::sync::atomic::Ordering::SeqCst), 1);
}
