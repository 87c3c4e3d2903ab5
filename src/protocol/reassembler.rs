//! Frame reassembly
//!
//! Recovers complete payloads from a byte stream that may arrive in any
//! chunking and may contain foreign or corrupted bytes. The scan always
//! restarts at the head of the buffer:
//!
//! - no marker anywhere: keep the last `MAGIC_LEN - 1` bytes and wait
//! - marker past the head: drop everything before it (resync)
//! - header or payload incomplete: wait for more input
//! - otherwise: emit the payload and continue with the rest
//!
//! A payload is never emitted until every byte its header declares is
//! present, so a truncated frame produces nothing rather than a partial read.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use super::constants::{FRAME_HEADER_LEN, FRAME_MAGIC, MAGIC_CARRY_LEN};

/// Stateful frame decoder
#[derive(Debug)]
pub struct FrameReassembler {
    buf: BytesMut,
    max_frame_len: Option<usize>,
    frames: u64,
    discarded: u64,
}

impl FrameReassembler {
    /// Create a reassembler that waits for whatever length a header declares
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_len: None,
            frames: 0,
            discarded: 0,
        }
    }

    /// Create a reassembler that treats headers declaring more than
    /// `max_frame_len` payload bytes as false markers
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: Some(max_frame_len),
            ..Self::new()
        }
    }

    /// Append received bytes
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Take the next complete payload, if one is buffered
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let mut buf = std::mem::take(&mut self.buf);
        let frame = self.take_frame(&mut buf);
        self.buf = buf;
        frame
    }

    /// Append `chunk` and drain every payload it completes, in order
    pub fn push(&mut self, chunk: &[u8]) -> impl Iterator<Item = Bytes> + '_ {
        self.extend(chunk);
        std::iter::from_fn(move || self.next_frame())
    }

    /// Bytes currently held waiting for more input
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Payloads emitted so far
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Bytes dropped while resynchronizing
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    fn take_frame(&mut self, buf: &mut BytesMut) -> Option<Bytes> {
        loop {
            match find_magic(buf) {
                None => {
                    if buf.len() > MAGIC_CARRY_LEN {
                        let stale = buf.len() - MAGIC_CARRY_LEN;
                        buf.advance(stale);
                        self.discarded += stale as u64;
                    }
                    return None;
                }
                Some(0) => {}
                Some(offset) => {
                    tracing::trace!(skipped = offset, "Resynchronized on frame marker");
                    buf.advance(offset);
                    self.discarded += offset as u64;
                    continue;
                }
            }

            if buf.len() < FRAME_HEADER_LEN {
                return None;
            }

            let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;

            if self.max_frame_len.is_some_and(|max| len > max) {
                // Payload bytes that happen to match the marker
                tracing::trace!(declared = len, "Rejected oversized frame header");
                buf.advance(1);
                self.discarded += 1;
                continue;
            }

            if buf.len() < FRAME_HEADER_LEN + len {
                return None;
            }

            buf.advance(FRAME_HEADER_LEN);
            self.frames += 1;
            return Some(buf.split_to(len).freeze());
        }
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Lets `FramedRead` drive the same state machine over any `AsyncRead`.
/// The read buffer belongs to `FramedRead`; the internal one stays empty.
impl Decoder for FrameReassembler {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        Ok(self.take_frame(src))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        // A dangling partial frame at end of stream is dropped, not an error
        let frame = self.take_frame(buf);
        if frame.is_none() && !buf.is_empty() {
            self.discarded += buf.len() as u64;
            buf.clear();
        }
        Ok(frame)
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_MAGIC.len())
        .position(|window| window == FRAME_MAGIC)
}
