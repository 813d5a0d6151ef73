//! A self-contained, from-scratch [`Engine`] used to drive the adapter's own
//! test suite. It speaks a minimal TLS-1.3-flavored protocol over the
//! primitives in [`crypto`]: an ephemeral X25519 key exchange, a
//! ClientHello/ServerHello/Finished handshake with HMAC-verified transcripts,
//! and AES-128-GCM record protection keyed by the resulting traffic secrets.
//!
//! This is not a certified TLS stack -- no certificates, no cipher or version
//! negotiation, a single fixed suite. It exists so the adapter's concurrency
//! model, delegated-task path, and renegotiation support have something real
//! to exercise `wrap`/`unwrap` against.

mod crypto;

use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::buffer::FrameBuffer;
use crate::engine::{DelegatedTask, Engine, EngineResult, HandshakeStatus, Status};
use crate::error::SimpleError;

use crypto::{
    aes_gcm_decrypt, aes_gcm_encrypt, derive_secret, hkdf_expand_label, hkdf_extract, hmac_sha256,
    sha256, x25519, x25519_base,
};

/// Which side of the handshake an engine instance plays. Fixed for the life
/// of the engine; a client always sends ClientHello first, a server always
/// waits for one, whether or not its own `begin_handshake()` was called --
/// this is what lets a server detect and drive a peer-initiated
/// renegotiation passively, as real TLS servers do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Opaque session descriptor handed to the adapter's session-initialized
/// callback. `epoch` counts completed handshakes (the initial one is epoch 1
/// once it finishes); useful in tests for asserting a renegotiation actually
/// ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeSession {
    pub role: Role,
    pub epoch: u64,
}

const HEADER_LEN: usize = 3;
const TAG_CLEAR_HANDSHAKE: u8 = 0;
const TAG_APPLICATION: u8 = 1;

const INNER_APP_DATA: u8 = 0;
const INNER_HANDSHAKE: u8 = 1;
const INNER_CLOSE_NOTIFY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    ClientSendHello,
    ClientAwaitServerHello,
    ClientAwaitServerFinished,
    ClientSendFinished,
    ServerAwaitClientHello,
    ServerSendHello,
    ServerSendFinished,
    ServerAwaitClientFinished,
}

enum HsMsg {
    ClientHello { random: [u8; 32], pubkey: [u8; 32] },
    ServerHello { random: [u8; 32], pubkey: [u8; 32] },
    Finished { verify_data: [u8; 32] },
}

impl HsMsg {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(65);
        match self {
            HsMsg::ClientHello { random, pubkey } => {
                out.push(0);
                out.extend_from_slice(random);
                out.extend_from_slice(pubkey);
            }
            HsMsg::ServerHello { random, pubkey } => {
                out.push(1);
                out.extend_from_slice(random);
                out.extend_from_slice(pubkey);
            }
            HsMsg::Finished { verify_data } => {
                out.push(2);
                out.extend_from_slice(verify_data);
            }
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, SimpleError> {
        if bytes.is_empty() {
            return Err(SimpleError("empty handshake message".into()));
        }
        match bytes[0] {
            0 | 1 if bytes.len() == 65 => {
                let mut random = [0u8; 32];
                random.copy_from_slice(&bytes[1..33]);
                let mut pubkey = [0u8; 32];
                pubkey.copy_from_slice(&bytes[33..65]);
                if bytes[0] == 0 {
                    Ok(HsMsg::ClientHello { random, pubkey })
                } else {
                    Ok(HsMsg::ServerHello { random, pubkey })
                }
            }
            2 if bytes.len() == 33 => {
                let mut verify_data = [0u8; 32];
                verify_data.copy_from_slice(&bytes[1..33]);
                Ok(HsMsg::Finished { verify_data })
            }
            other => Err(SimpleError(format!(
                "malformed handshake message (type {other}, {} bytes)",
                bytes.len()
            ))),
        }
    }
}

#[derive(Clone, Copy)]
struct DirectionKeys {
    key: [u8; 16],
    iv: [u8; 12],
}

struct EpochKeys {
    write: DirectionKeys,
    read: DirectionKeys,
}

struct HandshakeScratch {
    local_random: [u8; 32],
    local_private: [u8; 32],
    local_public: [u8; 32],
    peer_random: Option<[u8; 32]>,
    peer_public: Option<[u8; 32]>,
    finished_key_client: Option<[u8; 32]>,
    finished_key_server: Option<[u8; 32]>,
    transcript: Option<[u8; 32]>,
    new_keys: Option<EpochKeys>,
}

struct Inner {
    role: Role,
    status: HandshakeStatus,
    phase: Phase,
    scratch: Option<HandshakeScratch>,
    keys: Option<EpochKeys>,
    send_seq: u64,
    recv_seq: u64,
    epoch: u64,
    closed_outbound: bool,
}

/// The reference engine. Cheaply `Clone`-able in spirit (though it doesn't
/// derive `Clone` itself, since the adapter only ever needs one instance
/// per side): all state lives behind an `Arc<Mutex<_>>` so the delegated
/// task handed out by `delegated_task()` can mutate it from outside the
/// engine lock the adapter briefly holds to fetch that task.
pub struct NativeEngine {
    inner: Arc<Mutex<Inner>>,
}

impl NativeEngine {
    pub fn new(role: Role) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                role,
                status: HandshakeStatus::NotHandshaking,
                phase: Phase::Idle,
                scratch: None,
                keys: None,
                send_seq: 0,
                recv_seq: 0,
                epoch: 0,
                closed_outbound: false,
            })),
        }
    }
}

fn random_32() -> [u8; 32] {
    let mut b = [0u8; 32];
    OsRng.fill_bytes(&mut b);
    b
}

fn ephemeral_keypair() -> ([u8; 32], [u8; 32]) {
    let private = random_32();
    let public = x25519_base(&private);
    (private, public)
}

fn fixed32(v: Vec<u8>) -> [u8; 32] {
    v.try_into().expect("hkdf_expand_label(.., 32) returns 32 bytes")
}

fn fixed16(v: Vec<u8>) -> [u8; 16] {
    v.try_into().expect("hkdf_expand_label(.., 16) returns 16 bytes")
}

fn fixed12(v: Vec<u8>) -> [u8; 12] {
    v.try_into().expect("hkdf_expand_label(.., 12) returns 12 bytes")
}

fn make_nonce(iv: &[u8; 12], seq: u64) -> [u8; 12] {
    let mut nonce = *iv;
    let seq_bytes = seq.to_be_bytes();
    for i in 0..8 {
        nonce[4 + i] ^= seq_bytes[i];
    }
    nonce
}

fn new_scratch() -> HandshakeScratch {
    let (local_private, local_public) = ephemeral_keypair();
    HandshakeScratch {
        local_random: random_32(),
        local_private,
        local_public,
        peer_random: None,
        peer_public: None,
        finished_key_client: None,
        finished_key_server: None,
        transcript: None,
        new_keys: None,
    }
}

fn begin_handshake_locked(inner: &mut Inner) {
    inner.scratch = Some(new_scratch());
    match inner.role {
        Role::Client => {
            inner.phase = Phase::ClientSendHello;
            inner.status = HandshakeStatus::NeedWrap;
        }
        Role::Server => {
            inner.phase = Phase::ServerAwaitClientHello;
            inner.status = HandshakeStatus::NeedUnwrap;
        }
    }
}

/// Derives the handshake and application traffic secrets from the
/// Diffie-Hellman shared secret, following the TLS 1.3 key schedule (RFC
/// 8446 SS7.1) restricted to `TLS_AES_128_GCM_SHA256`. Run as a delegated
/// task, outside the engine lock the adapter holds only to fetch it.
fn derive_keys_and_advance(inner: &mut Inner) {
    let (client_random, client_pub, server_random, server_pub, peer_public, local_private) = {
        let scratch = inner.scratch.as_ref().expect("scratch present for key derivation");
        let peer_public = scratch.peer_public.expect("peer hello already processed");
        let peer_random = scratch.peer_random.expect("peer hello already processed");
        match inner.role {
            Role::Client => (
                scratch.local_random,
                scratch.local_public,
                peer_random,
                peer_public,
                peer_public,
                scratch.local_private,
            ),
            Role::Server => (
                peer_random,
                peer_public,
                scratch.local_random,
                scratch.local_public,
                peer_public,
                scratch.local_private,
            ),
        }
    };

    let shared_secret = x25519(&local_private, &peer_public);

    let mut transcript_input = Vec::with_capacity(128);
    transcript_input.extend_from_slice(&client_random);
    transcript_input.extend_from_slice(&client_pub);
    transcript_input.extend_from_slice(&server_random);
    transcript_input.extend_from_slice(&server_pub);
    let transcript = sha256(&transcript_input);

    let handshake_secret = hkdf_extract(&[0u8; 32], &shared_secret);
    let client_hs_secret = derive_secret(&handshake_secret, "c hs traffic", &transcript);
    let server_hs_secret = derive_secret(&handshake_secret, "s hs traffic", &transcript);
    let finished_key_client = fixed32(hkdf_expand_label(&client_hs_secret, "finished", &[], 32));
    let finished_key_server = fixed32(hkdf_expand_label(&server_hs_secret, "finished", &[], 32));

    let empty_hash = sha256(&[]);
    let derived = derive_secret(&handshake_secret, "derived", &empty_hash);
    let master_secret = hkdf_extract(&derived, &[0u8; 32]);
    let client_ap_secret = derive_secret(&master_secret, "c ap traffic", &transcript);
    let server_ap_secret = derive_secret(&master_secret, "s ap traffic", &transcript);

    let client_ap = DirectionKeys {
        key: fixed16(hkdf_expand_label(&client_ap_secret, "key", &[], 16)),
        iv: fixed12(hkdf_expand_label(&client_ap_secret, "iv", &[], 12)),
    };
    let server_ap = DirectionKeys {
        key: fixed16(hkdf_expand_label(&server_ap_secret, "key", &[], 16)),
        iv: fixed12(hkdf_expand_label(&server_ap_secret, "iv", &[], 12)),
    };

    let new_keys = match inner.role {
        Role::Client => EpochKeys { write: client_ap, read: server_ap },
        Role::Server => EpochKeys { write: server_ap, read: client_ap },
    };

    let scratch = inner.scratch.as_mut().expect("scratch present");
    scratch.finished_key_client = Some(finished_key_client);
    scratch.finished_key_server = Some(finished_key_server);
    scratch.transcript = Some(transcript);
    scratch.new_keys = Some(new_keys);

    inner.status = match inner.role {
        // Still needs the peer's Finished before it can respond.
        Role::Client => HandshakeStatus::NeedUnwrap,
        // Key schedule is ready; ServerHello is next out the door.
        Role::Server => HandshakeStatus::NeedWrap,
    };
}

/// Switches both directions over to the newly-derived epoch, resets the
/// per-direction sequence counters, and returns to steady state. Called by
/// whichever side reaches the end of its own handshake sequence first --
/// the two sides don't complete at the same instant, but record-layer
/// ordering guarantees neither sends data under the new epoch before it has
/// derived it locally.
fn complete_handshake(inner: &mut Inner) {
    if let Some(scratch) = inner.scratch.take() {
        if let Some(new_keys) = scratch.new_keys {
            inner.keys = Some(new_keys);
        }
    }
    inner.send_seq = 0;
    inner.recv_seq = 0;
    inner.epoch += 1;
    inner.phase = Phase::Idle;
    inner.status = HandshakeStatus::NotHandshaking;
}

/// Builds the next outbound handshake message for the current phase,
/// advancing `phase`/`status` for everything except the final message on
/// each side (whose completion the caller handles once the record carrying
/// it has actually been written out).
fn build_next_handshake_message(inner: &mut Inner) -> Result<(HsMsg, bool), SimpleError> {
    match (inner.role, inner.phase) {
        (Role::Client, Phase::ClientSendHello) => {
            let scratch = inner.scratch.as_ref().expect("scratch set by begin_handshake");
            let msg = HsMsg::ClientHello {
                random: scratch.local_random,
                pubkey: scratch.local_public,
            };
            inner.phase = Phase::ClientAwaitServerHello;
            inner.status = HandshakeStatus::NeedUnwrap;
            Ok((msg, false))
        }
        (Role::Client, Phase::ClientSendFinished) => {
            let scratch = inner.scratch.as_ref().expect("scratch present");
            let key = scratch.finished_key_client.expect("finished key derived");
            let transcript = scratch.transcript.expect("transcript derived");
            let msg = HsMsg::Finished {
                verify_data: hmac_sha256(&key, &transcript),
            };
            Ok((msg, true))
        }
        (Role::Server, Phase::ServerSendHello) => {
            let scratch = inner.scratch.as_ref().expect("scratch present");
            let msg = HsMsg::ServerHello {
                random: scratch.local_random,
                pubkey: scratch.local_public,
            };
            inner.phase = Phase::ServerSendFinished;
            Ok((msg, false))
        }
        (Role::Server, Phase::ServerSendFinished) => {
            let scratch = inner.scratch.as_ref().expect("scratch present");
            let key = scratch.finished_key_server.expect("finished key derived");
            let transcript = scratch.transcript.expect("transcript derived");
            let msg = HsMsg::Finished {
                verify_data: hmac_sha256(&key, &transcript),
            };
            inner.phase = Phase::ServerAwaitClientFinished;
            inner.status = HandshakeStatus::NeedUnwrap;
            Ok((msg, false))
        }
        (role, phase) => Err(SimpleError(format!(
            "wrap() called with no pending handshake message (role={role:?}, phase={phase:?})"
        ))),
    }
}

enum RecordKind {
    ClearHandshake,
    Protected(u8),
}

fn write_record(inner: &mut Inner, dst: &mut FrameBuffer, kind: RecordKind, payload: &[u8]) -> Result<usize, SimpleError> {
    match kind {
        RecordKind::ClearHandshake => {
            let total = HEADER_LEN + payload.len();
            if dst.write_remaining() < total {
                return Err(SimpleError("dst buffer overflow (cleartext handshake record)".into()));
            }
            let len = payload.len() as u16;
            dst.put(&[TAG_CLEAR_HANDSHAKE, (len >> 8) as u8, len as u8]);
            dst.put(payload);
            Ok(total)
        }
        RecordKind::Protected(inner_type) => {
            let keys = inner.keys.as_ref().expect("protected record without established keys").write;
            let mut plain = Vec::with_capacity(payload.len() + 1);
            plain.extend_from_slice(payload);
            plain.push(inner_type);
            let clen = (plain.len() + 16) as u16;
            let header = [TAG_APPLICATION, (clen >> 8) as u8, clen as u8];
            let nonce = make_nonce(&keys.iv, inner.send_seq);
            let ciphertext = aes_gcm_encrypt(&keys.key, &nonce, &header, &plain);
            inner.send_seq += 1;
            let total = HEADER_LEN + ciphertext.len();
            if dst.write_remaining() < total {
                return Err(SimpleError("dst buffer overflow (protected record)".into()));
            }
            dst.put(&header);
            dst.put(&ciphertext);
            Ok(total)
        }
    }
}

fn handle_handshake_payload(inner: &mut Inner, msg_bytes: &[u8], consumed: usize) -> Result<EngineResult, SimpleError> {
    let msg = HsMsg::decode(msg_bytes)?;
    let role = inner.role;
    let phase = inner.phase;
    match (role, phase, msg) {
        (Role::Server, Phase::ServerAwaitClientHello, HsMsg::ClientHello { random, pubkey })
        | (Role::Server, Phase::Idle, HsMsg::ClientHello { random, pubkey }) => {
            if inner.scratch.is_none() {
                inner.scratch = Some(new_scratch());
            }
            let scratch = inner.scratch.as_mut().expect("just initialized");
            scratch.peer_random = Some(random);
            scratch.peer_public = Some(pubkey);
            inner.phase = Phase::ServerSendHello;
            inner.status = HandshakeStatus::NeedTask;
            Ok(EngineResult {
                status: Status::Ok,
                handshake_status: HandshakeStatus::NeedTask,
                bytes_consumed: consumed,
                bytes_produced: 0,
            })
        }
        (Role::Client, Phase::ClientAwaitServerHello, HsMsg::ServerHello { random, pubkey }) => {
            let scratch = inner.scratch.as_mut().expect("scratch set by begin_handshake");
            scratch.peer_random = Some(random);
            scratch.peer_public = Some(pubkey);
            inner.phase = Phase::ClientAwaitServerFinished;
            inner.status = HandshakeStatus::NeedTask;
            Ok(EngineResult {
                status: Status::Ok,
                handshake_status: HandshakeStatus::NeedTask,
                bytes_consumed: consumed,
                bytes_produced: 0,
            })
        }
        (Role::Client, Phase::ClientAwaitServerFinished, HsMsg::Finished { verify_data }) => {
            let scratch = inner.scratch.as_ref().expect("scratch present");
            let expected = hmac_sha256(
                &scratch.finished_key_server.expect("finished key derived"),
                &scratch.transcript.expect("transcript derived"),
            );
            if expected != verify_data {
                return Err(SimpleError("server Finished did not match expected transcript verification".into()));
            }
            inner.phase = Phase::ClientSendFinished;
            inner.status = HandshakeStatus::NeedWrap;
            Ok(EngineResult {
                status: Status::Ok,
                handshake_status: HandshakeStatus::NeedWrap,
                bytes_consumed: consumed,
                bytes_produced: 0,
            })
        }
        (Role::Server, Phase::ServerAwaitClientFinished, HsMsg::Finished { verify_data }) => {
            let scratch = inner.scratch.as_ref().expect("scratch present");
            let expected = hmac_sha256(
                &scratch.finished_key_client.expect("finished key derived"),
                &scratch.transcript.expect("transcript derived"),
            );
            if expected != verify_data {
                return Err(SimpleError("client Finished did not match expected transcript verification".into()));
            }
            complete_handshake(inner);
            Ok(EngineResult {
                status: Status::Ok,
                handshake_status: HandshakeStatus::Finished,
                bytes_consumed: consumed,
                bytes_produced: 0,
            })
        }
        (role, phase, _) => Err(SimpleError(format!(
            "unexpected handshake message for role={role:?} in phase={phase:?}"
        ))),
    }
}

impl Engine for NativeEngine {
    type Error = SimpleError;
    type Session = NativeSession;

    fn wrap(&mut self, src: &mut FrameBuffer, dst: &mut FrameBuffer) -> Result<EngineResult, Self::Error> {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed_outbound {
            let kind = if inner.keys.is_some() {
                RecordKind::Protected(INNER_CLOSE_NOTIFY)
            } else {
                RecordKind::ClearHandshake
            };
            let produced = write_record(&mut inner, dst, kind, &[])?;
            inner.status = HandshakeStatus::NotHandshaking;
            return Ok(EngineResult {
                status: Status::Closed,
                handshake_status: inner.status,
                bytes_consumed: 0,
                bytes_produced: produced,
            });
        }

        if inner.status == HandshakeStatus::NeedWrap {
            let (msg, completes_after) = build_next_handshake_message(&mut inner)?;
            let encoded = msg.encode();
            let kind = if inner.keys.is_some() {
                RecordKind::Protected(INNER_HANDSHAKE)
            } else {
                RecordKind::ClearHandshake
            };
            let produced = write_record(&mut inner, dst, kind, &encoded)?;
            let reported_status = if completes_after {
                complete_handshake(&mut inner);
                HandshakeStatus::Finished
            } else {
                inner.status
            };
            return Ok(EngineResult {
                status: Status::Ok,
                handshake_status: reported_status,
                bytes_consumed: 0,
                bytes_produced: produced,
            });
        }

        let n = src.read_remaining();
        if n == 0 {
            return Ok(EngineResult {
                status: Status::Ok,
                handshake_status: inner.status,
                bytes_consumed: 0,
                bytes_produced: 0,
            });
        }
        if inner.keys.is_none() {
            return Err(SimpleError("application data requested before the handshake established keys".into()));
        }
        let payload = src.read_slice().to_vec();
        let produced = write_record(&mut inner, dst, RecordKind::Protected(INNER_APP_DATA), &payload)?;
        src.advance_read(n);
        Ok(EngineResult {
            status: Status::Ok,
            handshake_status: inner.status,
            bytes_consumed: n,
            bytes_produced: produced,
        })
    }

    fn unwrap(&mut self, src: &mut FrameBuffer, dst: &mut FrameBuffer) -> Result<EngineResult, Self::Error> {
        let mut inner = self.inner.lock().unwrap();

        let (tag, header, payload);
        {
            let peek = src.read_slice();
            if peek.len() < HEADER_LEN {
                return Ok(EngineResult {
                    status: Status::BufferUnderflow,
                    handshake_status: inner.status,
                    bytes_consumed: 0,
                    bytes_produced: 0,
                });
            }
            let len = u16::from_be_bytes([peek[1], peek[2]]) as usize;
            if peek.len() < HEADER_LEN + len {
                return Ok(EngineResult {
                    status: Status::BufferUnderflow,
                    handshake_status: inner.status,
                    bytes_consumed: 0,
                    bytes_produced: 0,
                });
            }
            tag = peek[0];
            header = [peek[0], peek[1], peek[2]];
            payload = peek[HEADER_LEN..HEADER_LEN + len].to_vec();
        }
        let consumed = HEADER_LEN + payload.len();
        src.advance_read(consumed);

        match tag {
            TAG_CLEAR_HANDSHAKE => {
                if payload.is_empty() {
                    inner.status = HandshakeStatus::NotHandshaking;
                    return Ok(EngineResult {
                        status: Status::Closed,
                        handshake_status: inner.status,
                        bytes_consumed: consumed,
                        bytes_produced: 0,
                    });
                }
                handle_handshake_payload(&mut inner, &payload, consumed)
            }
            TAG_APPLICATION => {
                let keys = inner
                    .keys
                    .as_ref()
                    .ok_or_else(|| SimpleError("protected record received before keys were established".into()))?
                    .read;
                let nonce = make_nonce(&keys.iv, inner.recv_seq);
                let plain = aes_gcm_decrypt(&keys.key, &nonce, &header, &payload)
                    .map_err(|_| SimpleError("AEAD authentication failed on inbound record".into()))?;
                inner.recv_seq += 1;
                let (body, inner_type) = plain
                    .split_last()
                    .map(|(t, b)| (b, *t))
                    .ok_or_else(|| SimpleError("protected record plaintext missing inner content type".into()))?;
                match inner_type {
                    INNER_APP_DATA => {
                        if dst.write_remaining() < body.len() {
                            return Ok(EngineResult {
                                status: Status::BufferOverflow,
                                handshake_status: inner.status,
                                bytes_consumed: consumed,
                                bytes_produced: 0,
                            });
                        }
                        dst.put(body);
                        Ok(EngineResult {
                            status: Status::Ok,
                            handshake_status: inner.status,
                            bytes_consumed: consumed,
                            bytes_produced: body.len(),
                        })
                    }
                    INNER_HANDSHAKE => handle_handshake_payload(&mut inner, body, consumed),
                    INNER_CLOSE_NOTIFY => {
                        inner.status = HandshakeStatus::NotHandshaking;
                        Ok(EngineResult {
                            status: Status::Closed,
                            handshake_status: inner.status,
                            bytes_consumed: consumed,
                            bytes_produced: 0,
                        })
                    }
                    other => Err(SimpleError(format!("unknown inner content type {other}"))),
                }
            }
            other => Err(SimpleError(format!("unknown record tag {other}"))),
        }
    }

    fn begin_handshake(&mut self) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().unwrap();
        begin_handshake_locked(&mut inner);
        Ok(())
    }

    fn close_outbound(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.closed_outbound {
            inner.closed_outbound = true;
            inner.status = HandshakeStatus::NeedWrap;
        }
    }

    fn handshake_status(&self) -> HandshakeStatus {
        self.inner.lock().unwrap().status
    }

    fn delegated_task(&mut self) -> Option<Box<dyn DelegatedTask>> {
        let needs_task = self.inner.lock().unwrap().status == HandshakeStatus::NeedTask;
        if needs_task {
            Some(Box::new(KeyScheduleTask {
                inner: self.inner.clone(),
            }))
        } else {
            None
        }
    }

    fn session(&self) -> Self::Session {
        let inner = self.inner.lock().unwrap();
        NativeSession {
            role: inner.role,
            epoch: inner.epoch,
        }
    }
}

struct KeyScheduleTask {
    inner: Arc<Mutex<Inner>>,
}

impl DelegatedTask for KeyScheduleTask {
    fn run(self: Box<Self>) {
        let mut inner = self.inner.lock().unwrap();
        derive_keys_and_advance(&mut inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake(client: &mut NativeEngine, server: &mut NativeEngine) {
        client.begin_handshake().unwrap();
        let mut wire = FrameBuffer::with_capacity(4096);
        let mut sentinel = FrameBuffer::empty_sentinel();
        let mut sink = FrameBuffer::with_capacity(4096);

        loop {
            let client_hs = client.handshake_status();
            let server_hs = server.handshake_status();
            if client_hs == HandshakeStatus::NotHandshaking && server_hs == HandshakeStatus::NotHandshaking {
                break;
            }
            if client_hs == HandshakeStatus::NeedWrap {
                let r = client.wrap(&mut sentinel, &mut wire).unwrap();
                if r.handshake_status == HandshakeStatus::NeedTask {
                    client.delegated_task().unwrap().run();
                }
                wire.flip();
                let mut consumed_total = 0;
                while wire.read_remaining() > 0 {
                    let r = server.unwrap(&mut wire, &mut sink).unwrap();
                    if r.handshake_status == HandshakeStatus::NeedTask {
                        server.delegated_task().unwrap().run();
                    }
                    if r.bytes_consumed == 0 {
                        break;
                    }
                    consumed_total += r.bytes_consumed;
                }
                let _ = consumed_total;
                wire.compact();
            } else if server_hs == HandshakeStatus::NeedWrap {
                let r = server.wrap(&mut sentinel, &mut wire).unwrap();
                if r.handshake_status == HandshakeStatus::NeedTask {
                    server.delegated_task().unwrap().run();
                }
                wire.flip();
                while wire.read_remaining() > 0 {
                    let r = client.unwrap(&mut wire, &mut sink).unwrap();
                    if r.handshake_status == HandshakeStatus::NeedTask {
                        client.delegated_task().unwrap().run();
                    }
                    if r.bytes_consumed == 0 {
                        break;
                    }
                }
                wire.compact();
            } else {
                panic!("handshake stalled: client={client_hs:?} server={server_hs:?}");
            }
        }
    }

    #[test]
    fn handshake_completes_and_establishes_matching_epoch() {
        let mut client = NativeEngine::new(Role::Client);
        let mut server = NativeEngine::new(Role::Server);
        run_handshake(&mut client, &mut server);
        assert_eq!(client.session().epoch, 1);
        assert_eq!(server.session().epoch, 1);
    }

    #[test]
    fn application_data_round_trips_after_handshake() {
        let mut client = NativeEngine::new(Role::Client);
        let mut server = NativeEngine::new(Role::Server);
        run_handshake(&mut client, &mut server);

        let mut src = FrameBuffer::from_read_slice(b"hello over the wire");
        let mut wire = FrameBuffer::with_capacity(4096);
        client.wrap(&mut src, &mut wire).unwrap();
        wire.flip();
        let mut plain = FrameBuffer::with_capacity(4096);
        let r = server.unwrap(&mut wire, &mut plain).unwrap();
        assert_eq!(r.status, Status::Ok);
        plain.flip();
        assert_eq!(plain.read_slice(), b"hello over the wire");
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let mut client = NativeEngine::new(Role::Client);
        let mut server = NativeEngine::new(Role::Server);
        run_handshake(&mut client, &mut server);

        let mut src = FrameBuffer::from_read_slice(b"attack at dawn");
        let mut wire = FrameBuffer::with_capacity(4096);
        client.wrap(&mut src, &mut wire).unwrap();
        wire.flip();
        let mut tampered: Vec<u8> = wire.read_slice().to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        let mut wire = FrameBuffer::from_read_slice(&tampered);
        let mut plain = FrameBuffer::with_capacity(4096);
        assert!(server.unwrap(&mut wire, &mut plain).is_err());
    }

    #[test]
    fn renegotiation_rekeys_and_resets_sequence_numbers() {
        let mut client = NativeEngine::new(Role::Client);
        let mut server = NativeEngine::new(Role::Server);
        run_handshake(&mut client, &mut server);

        let mut src = FrameBuffer::from_read_slice(b"epoch one");
        let mut wire = FrameBuffer::with_capacity(4096);
        client.wrap(&mut src, &mut wire).unwrap();
        wire.flip();
        let mut plain = FrameBuffer::with_capacity(4096);
        server.unwrap(&mut wire, &mut plain).unwrap();
        wire.compact();

        run_handshake(&mut client, &mut server);
        assert_eq!(client.session().epoch, 2);
        assert_eq!(server.session().epoch, 2);

        let mut src = FrameBuffer::from_read_slice(b"epoch two");
        let mut wire2 = FrameBuffer::with_capacity(4096);
        client.wrap(&mut src, &mut wire2).unwrap();
        wire2.flip();
        let mut plain2 = FrameBuffer::with_capacity(4096);
        let r = server.unwrap(&mut wire2, &mut plain2).unwrap();
        assert_eq!(r.status, Status::Ok);
        plain2.flip();
        assert_eq!(plain2.read_slice(), b"epoch two");
    }

    #[test]
    fn close_notify_round_trips() {
        let mut client = NativeEngine::new(Role::Client);
        let mut server = NativeEngine::new(Role::Server);
        run_handshake(&mut client, &mut server);

        client.close_outbound();
        assert_eq!(client.handshake_status(), HandshakeStatus::NeedWrap);
        let mut sentinel = FrameBuffer::empty_sentinel();
        let mut wire = FrameBuffer::with_capacity(4096);
        let r = client.wrap(&mut sentinel, &mut wire).unwrap();
        assert_eq!(r.status, Status::Closed);

        wire.flip();
        let mut sink = FrameBuffer::with_capacity(4096);
        let r = server.unwrap(&mut wire, &mut sink).unwrap();
        assert_eq!(r.status, Status::Closed);
    }
}
