//! Both directions of a session driven concurrently on four threads: the
//! client writes while the server reads, and the server writes while the
//! client reads, all at once. Each direction's digest must still match,
//! proving the read path (touching `inbound-*`) and the write path
//! (touching `outbound-encrypted`) don't corrupt each other when run
//! concurrently against one adapter per side.

mod common;

use std::sync::Arc;
use std::thread;

use sha2::{Digest, Sha256};

use common::{build_adapter, seeded_bytes, tcp_pair, Adapter};
use tls_channel_adapter::{engine::native::Role, ReadOutcome};

const SEED_A: u64 = 271_828_182;
const SEED_B: u64 = 314_159_265;
const N: usize = 200_000;
const CHUNK: usize = 20 * 1024;

fn write_all_chunked(adapter: &Adapter, payload: &[u8]) {
    for chunk in payload.chunks(CHUNK) {
        let mut sent = 0;
        while sent < chunk.len() {
            let n = adapter.write(&chunk[sent..]).expect("blocking write never signals would-block");
            sent += n;
        }
    }
}

fn read_digest(adapter: &Adapter, n: usize) -> [u8; 32] {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut total = 0;
    while total < n {
        match adapter.read(&mut buf).expect("blocking read never signals would-block") {
            ReadOutcome::Read(k) => {
                hasher.update(&buf[..k]);
                total += k;
            }
            ReadOutcome::EndOfStream => panic!("unexpected end-of-stream after {total} of {n} bytes"),
        }
    }
    hasher.finalize().into()
}

#[test]
fn full_duplex_transfer_does_not_corrupt_either_direction() {
    common::init_logging();
    let (client_sock, server_sock) = tcp_pair();
    let (client, _) = build_adapter(client_sock, Role::Client);
    let (server, _) = build_adapter(server_sock, Role::Server);
    let client = Arc::new(client);
    let server = Arc::new(server);

    let client_to_server = seeded_bytes(SEED_A, N);
    let server_to_client = seeded_bytes(SEED_B, N);
    let expected_c2s: [u8; 32] = Sha256::digest(&client_to_server).into();
    let expected_s2c: [u8; 32] = Sha256::digest(&server_to_client).into();

    let h1 = {
        let client = client.clone();
        let payload = client_to_server.clone();
        thread::spawn(move || write_all_chunked(&client, &payload))
    };
    let h2 = {
        let server = server.clone();
        thread::spawn(move || read_digest(&server, N))
    };
    let h3 = {
        let server = server.clone();
        let payload = server_to_client.clone();
        thread::spawn(move || write_all_chunked(&server, &payload))
    };
    let h4 = {
        let client = client.clone();
        thread::spawn(move || read_digest(&client, N))
    };

    h1.join().expect("client writer panicked");
    let got_c2s = h2.join().expect("server reader panicked");
    h3.join().expect("server writer panicked");
    let got_s2c = h4.join().expect("client reader panicked");

    assert_eq!(got_c2s, expected_c2s);
    assert_eq!(got_s2c, expected_s2c);
}
