//! rtc-recorder: signaling and recording orchestration for an SFU
//!
//! A WebSocket client negotiates transports and producers with a media
//! engine through a small JSON protocol. On `start-record` the server routes
//! every producer into a plain RTP transport and supervises an external
//! transcoder that writes the media to a file, a UDP socket, or a serial line
//! using a framed byte protocol.
//!
//! ```text
//!   browser ──ws──► server ──► SignalingGateway ──► SessionRegistry
//!                                   │                     │
//!                                   ▼                     ▼
//!                              MediaEngine ──RTP──► ProcessSupervisor
//!                                                   ffmpeg [─► frame-sink ─► serial]
//! ```
//!
//! # Example
//!
//! A dry run on [`MemoryEngine`](engine::MemoryEngine), which only keeps
//! negotiation state and moves no RTP. A deployment passes its SFU binding,
//! an implementation of [`MediaEngine`](engine::MediaEngine), instead.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rtc_recorder::engine::MemoryEngine;
//! use rtc_recorder::{RecorderServer, ServerConfig};
//!
//! # async fn run() -> rtc_recorder::Result<()> {
//! let config = ServerConfig::default().record_dir("./files");
//! let dry_run = Arc::new(MemoryEngine::new());
//! let server = RecorderServer::new(config, dry_run).await?;
//! server.run().await
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod port;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod signaling;

pub use error::{Error, Result};
pub use registry::{SessionId, SessionRegistry};
pub use server::{RecorderServer, ServerConfig};
pub use signaling::{GatewayConfig, SignalingGateway};
