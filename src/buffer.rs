//! Buffer pool & framing state.
//!
//! The adapter's three buffers are kept in "write mode at rest": `position`
//! marks the next free slot and `limit` marks capacity. An operation may
//! temporarily flip a buffer to read mode (`position` becomes a read
//! cursor, `limit` becomes the end of valid data) but must compact it back
//! to write mode before releasing the lock that governs it. This mirrors
//! `java.nio.ByteBuffer`'s flip/compact discipline, the convention the
//! adapter's invariants (see the data model) are written against.

/// Plaintext payload per TLS record: 2^15 bytes, intentionally one bit
/// larger than the TLS-spec 2^14 to accommodate engine behavior observed in
/// some implementations.
pub const MAX_DATA_SIZE: usize = 32768;

/// header(5) + iv(256) + data(32768) + padding(256) + mac(20)
pub const MAX_RECORD_SIZE: usize = 5 + 256 + MAX_DATA_SIZE + 256 + 20;

/// A fixed-capacity byte buffer with an explicit write/read mode, kept in
/// write mode at rest.
///
/// Write mode: `data[0..pos]` holds already-written bytes; `data[pos..cap]`
/// is free space. Read mode (entered via [`flip`](Self::flip)):
/// `data[pos..limit]` holds unread bytes.
pub struct FrameBuffer {
    data: Vec<u8>,
    pos: usize,
    limit: usize,
    mode: Mode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Write,
    Read,
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            pos: 0,
            limit: capacity,
            mode: Mode::Write,
        }
    }

    /// Zero-length buffer used as the "empty sentinel" source for wrap
    /// calls made during a handshake, where the engine requires a source
    /// argument even though no caller payload is being sent.
    pub fn empty_sentinel() -> Self {
        Self {
            data: Vec::new(),
            pos: 0,
            limit: 0,
            mode: Mode::Read,
        }
    }

    /// Build a buffer already in read mode over a copy of `slice`, used by
    /// the wrap driver to hand the engine one chunk of caller-supplied
    /// plaintext at a time without requiring the caller's whole `src` to
    /// live in a single `FrameBuffer`.
    pub fn from_read_slice(slice: &[u8]) -> Self {
        Self {
            data: slice.to_vec(),
            pos: 0,
            limit: slice.len(),
            mode: Mode::Read,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes already written and not yet flipped-for-read, i.e. how full
    /// the buffer is at rest.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_write_mode(&self) -> bool {
        self.mode == Mode::Write
    }

    /// Writable tail, valid only in write mode.
    pub fn write_slice(&mut self) -> &mut [u8] {
        debug_assert_eq!(self.mode, Mode::Write);
        &mut self.data[self.pos..self.limit]
    }

    pub fn write_remaining(&self) -> usize {
        debug_assert_eq!(self.mode, Mode::Write);
        self.limit - self.pos
    }

    pub fn advance_write(&mut self, n: usize) {
        debug_assert_eq!(self.mode, Mode::Write);
        debug_assert!(self.pos + n <= self.limit);
        self.pos += n;
    }

    /// Append bytes in write mode, growing is not permitted -- the caller
    /// must ensure `write_remaining() >= data.len()`.
    pub fn put(&mut self, bytes: &[u8]) {
        let n = bytes.len();
        self.write_slice()[..n].copy_from_slice(bytes);
        self.advance_write(n);
    }

    /// Switch to read mode: unread data is `data[0..pos]` before the flip.
    pub fn flip(&mut self) {
        debug_assert_eq!(self.mode, Mode::Write);
        self.limit = self.pos;
        self.pos = 0;
        self.mode = Mode::Read;
    }

    pub fn read_slice(&self) -> &[u8] {
        debug_assert_eq!(self.mode, Mode::Read);
        &self.data[self.pos..self.limit]
    }

    pub fn read_remaining(&self) -> usize {
        debug_assert_eq!(self.mode, Mode::Read);
        self.limit - self.pos
    }

    pub fn advance_read(&mut self, n: usize) {
        debug_assert_eq!(self.mode, Mode::Read);
        debug_assert!(self.pos + n <= self.limit);
        self.pos += n;
    }

    /// Restore write mode, shifting any unread bytes (`data[pos..limit]`)
    /// down to the front. Invariant 1 of the data model requires this to
    /// run before the governing lock is released.
    pub fn compact(&mut self) {
        debug_assert_eq!(self.mode, Mode::Read);
        let remaining = self.limit - self.pos;
        if remaining > 0 {
            self.data.copy_within(self.pos..self.limit, 0);
        }
        self.pos = remaining;
        self.limit = self.data.len();
        self.mode = Mode::Write;
    }

    /// Copy up to `dst.len()` unread bytes out of this buffer (which must
    /// be in read mode) and advance its read cursor accordingly. Returns
    /// the number of bytes copied.
    pub fn copy_out(&mut self, dst: &mut [u8]) -> usize {
        debug_assert_eq!(self.mode, Mode::Read);
        let n = dst.len().min(self.read_remaining());
        dst[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.advance_read(n);
        n
    }
}
