//! Media engine seam
//!
//! The SFU that terminates ICE/DTLS/SRTP and routes RTP is an external
//! collaborator. This module describes what the recorder needs from it and
//! nothing more: negotiation parameters pass through as opaque JSON.
//!
//! [`MemoryEngine`] is a bookkeeping-only implementation used by tests and by
//! the server's dry-run mode.

pub mod memory;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{EngineCall, MemoryEngine};
pub use types::{
    ConnectParams, ConsumeRequest, ConsumerInfo, MediaKind, PlainTransportOptions, ProducerInfo,
    RouterInfo, TransportInfo, TransportKind, TransportRequest,
};

/// Media engine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Workers or router could not be brought up
    #[error("engine initialization failed: {0}")]
    Initialization(String),

    /// Referenced engine object does not exist
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// Engine refused the request
    #[error("engine rejected request: {0}")]
    Rejected(String),
}

impl EngineError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }
}

/// Operations the recorder drives on the media engine
///
/// A single router is assumed; `create_router` is called once at startup and
/// every transport is created on it.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Bring up engine workers
    async fn initialize(&self) -> Result<(), EngineError>;

    /// Create the router and return its capability descriptor
    async fn create_router(&self) -> Result<RouterInfo, EngineError>;

    /// Create a client-facing or plain-media transport
    async fn create_transport(&self, request: TransportRequest)
        -> Result<TransportInfo, EngineError>;

    /// Complete negotiation on a transport
    async fn connect_transport(
        &self,
        transport_id: &str,
        params: ConnectParams,
    ) -> Result<(), EngineError>;

    /// Register an inbound source on a client transport
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    ) -> Result<ProducerInfo, EngineError>;

    /// Attach an outbound flow for `request.producer_id` to a plain transport
    async fn consume(
        &self,
        transport_id: &str,
        request: ConsumeRequest,
    ) -> Result<ConsumerInfo, EngineError>;

    /// Resume a paused consumer
    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    /// Ask the producer behind a consumer for a fresh keyframe
    async fn request_key_frame(&self, consumer_id: &str) -> Result<(), EngineError>;

    /// Close a transport and everything attached to it
    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError>;
}
