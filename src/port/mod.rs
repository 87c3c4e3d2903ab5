//! RTP port leasing
//!
//! The transcoder listens on loopback UDP ports that the media engine's plain
//! transports send to. Ports come from a bounded pool shared by every session.

pub mod allocator;

pub use allocator::{PortAllocator, PortError, PortRange};
