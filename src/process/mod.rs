//! External process supervision
//!
//! A recording is a chain of one or two processes:
//!
//! ```text
//!   SDP ──stdin──► [ffmpeg transcoder] ──stdout──► [frame-sink] ──► serial device
//!                        │                              │
//!                     stderr ──► tracing             stderr ──► tracing
//! ```
//!
//! The second stage only exists for the serial sink. When the transcoder
//! exits for any reason the framer is interrupted; `kill()` interrupts both.

pub mod framer;
pub mod sdp;
pub mod sink;
pub mod supervisor;

use thiserror::Error;

pub use framer::{run_frame_sink, FrameSinkStats};
pub use sdp::{create_sdp_text, CodecInfo, MediaDescription, MediaStream};
pub use sink::{SerialSinkConfig, SinkConfig, SinkMode, StageSpec};
pub use supervisor::{spawn_chain, ProcessState, ProcessSupervisor, SupervisedProcess};

/// Supervised process errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// A stage could not be started
    #[error("failed to spawn {stage} ({program}): {source}")]
    Spawn {
        stage: &'static str,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The recording directory could not be prepared
    #[error("cannot prepare output directory {path}: {source}")]
    OutputDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Negotiated parameters cannot be described to the transcoder
    #[error("invalid media description: {0}")]
    InvalidMedia(String),

    /// The chain definition is unusable
    #[error("empty process chain")]
    EmptyChain,
}
