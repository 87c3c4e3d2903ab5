//! Serial frame protocol
//!
//! Raw media chunks are carried over a byte-oriented link (a USB gadget serial
//! line) as self-describing frames:
//!
//! ```text
//! ┌──────────────────┬───────────────────┬─────────────────────┐
//! │  magic (4 bytes) │ length (u32, BE)  │ payload (length)    │
//! │   AA BB CC DD    │                   │                     │
//! └──────────────────┴───────────────────┴─────────────────────┘
//! ```
//!
//! There is no checksum and no version field. The receiver resynchronizes by
//! scanning for the magic marker, so bytes lost or injected on the line only
//! cost the frames they touch.

pub mod codec;
pub mod constants;
pub mod reassembler;

pub use codec::{encode_frame, FrameEncoder};
pub use constants::{FRAME_HEADER_LEN, FRAME_MAGIC};
pub use reassembler::FrameReassembler;
