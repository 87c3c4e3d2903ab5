//! JSON signaling protocol
//!
//! ```text
//!   client                         gateway
//!     │◄── router-rtp-capabilities ──│  (on connect)
//!     │── create-transport ─────────►│──► engine.create_transport(webRtc)
//!     │── connect-transport ────────►│──► engine.connect_transport(dtls)
//!     │── produce ──────────────────►│──► engine.produce
//!     │── start-record ─────────────►│──► plain transport + ports + paused consumer
//!     │                              │    per producer, spawn process, resume later
//!     │── stop-record ──────────────►│──► kill process, release ports
//! ```
//!
//! Failed requests are logged. An error envelope is only sent back when
//! enabled in [`GatewayConfig`].

pub mod error;
pub mod gateway;
pub mod message;

pub use error::SignalingError;
pub use gateway::{GatewayConfig, SignalingGateway};
pub use message::{ErrorBody, ErrorResponse, Request, Response};
