//! Registry error types

use thiserror::Error;

use super::id::SessionId;
use crate::port::PortError;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No peer with this session id
    #[error("peer not found: {0}")]
    PeerNotFound(SessionId),

    /// The peer has no transport with this id
    #[error("transport not found: {0}")]
    TransportNotFound(String),

    /// The peer has no recording process
    #[error("peer is not recording: {0}")]
    NotRecording(SessionId),

    /// The peer already has a recording process
    #[error("peer is already recording: {0}")]
    AlreadyRecording(SessionId),

    /// Port pool refused the lease
    #[error(transparent)]
    Port(#[from] PortError),
}
