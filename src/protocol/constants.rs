//! Frame protocol constants

/// Marker that starts every frame
pub const FRAME_MAGIC: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];

/// Size of the big-endian length field
pub const FRAME_LENGTH_LEN: usize = 4;

/// Magic plus length field
pub const FRAME_HEADER_LEN: usize = FRAME_MAGIC.len() + FRAME_LENGTH_LEN;

/// Bytes kept when no marker is found, in case one straddles two reads
pub const MAGIC_CARRY_LEN: usize = FRAME_MAGIC.len() - 1;
