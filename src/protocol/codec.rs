//! Frame encoder
//!
//! Every input chunk becomes exactly one frame. Chunk boundaries carry no
//! meaning to the receiver; only the concatenated payload order matters.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Encoder;

use super::constants::{FRAME_HEADER_LEN, FRAME_MAGIC};

/// Wrap `chunk` in a frame header
///
/// Returns `None` if the chunk does not fit the 32-bit length field.
pub fn encode_frame(chunk: &[u8]) -> Option<Bytes> {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + chunk.len());
    put_frame(chunk, &mut buf).ok()?;
    Some(buf.freeze())
}

fn put_frame(chunk: &[u8], dst: &mut BytesMut) -> std::io::Result<()> {
    let len = u32::try_from(chunk.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("chunk of {} bytes exceeds frame length field", chunk.len()),
        )
    })?;

    dst.reserve(FRAME_HEADER_LEN + chunk.len());
    dst.put_slice(&FRAME_MAGIC);
    dst.put_u32(len);
    dst.put_slice(chunk);
    Ok(())
}

/// `tokio_util` encoder for use with `FramedWrite`
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEncoder;

impl FrameEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<Bytes> for FrameEncoder {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(&item, dst)
    }
}

impl<'a> Encoder<&'a [u8]> for FrameEncoder {
    type Error = std::io::Error;

    fn encode(&mut self, item: &'a [u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(item, dst)
    }
}
