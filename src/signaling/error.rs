//! Signaling error types

use thiserror::Error;

use crate::engine::{EngineError, MediaKind};
use crate::port::PortError;
use crate::process::ProcessError;
use crate::registry::RegistryError;

/// Error raised while handling one client message
///
/// None of these close the connection.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Malformed message
    #[error("malformed message: {0}")]
    Protocol(String),

    /// Action not understood
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// No such session, or a session the connection does not own
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("transport not found: {0}")]
    TransportNotFound(String),

    /// start-record on a peer without producers
    #[error("peer has no producers")]
    NoProducers,

    #[error("peer is already recording")]
    AlreadyRecording,

    #[error("peer is not recording")]
    NotRecording,

    /// The router offers no codec for a producer's kind
    #[error("router has no {0} codec")]
    NoRouterCodec(MediaKind),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl SignalingError {
    /// Stable code used in error replies
    pub fn code(&self) -> &'static str {
        match self {
            SignalingError::Protocol(_) => "protocol",
            SignalingError::UnknownAction(_) => "unknown-action",
            SignalingError::PeerNotFound(_)
            | SignalingError::TransportNotFound(_)
            | SignalingError::Engine(EngineError::NotFound { .. }) => "not-found",
            SignalingError::NoProducers => "no-producers",
            SignalingError::AlreadyRecording => "already-recording",
            SignalingError::NotRecording => "not-recording",
            SignalingError::NoRouterCodec(_) => "unsupported-codec",
            SignalingError::Engine(_) => "engine",
            SignalingError::Port(_) => "resource-exhausted",
            SignalingError::Process(_) => "process",
        }
    }

    /// Errors that are only logged, never answered
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            SignalingError::Protocol(_) | SignalingError::UnknownAction(_)
        )
    }
}

impl From<RegistryError> for SignalingError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::PeerNotFound(id) => SignalingError::PeerNotFound(id.to_string()),
            RegistryError::TransportNotFound(id) => SignalingError::TransportNotFound(id),
            RegistryError::NotRecording(_) => SignalingError::NotRecording,
            RegistryError::AlreadyRecording(_) => SignalingError::AlreadyRecording,
            RegistryError::Port(e) => SignalingError::Port(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionId;

    #[test]
    fn test_registry_errors_map_to_codes() {
        let id = SessionId::new();

        let error = SignalingError::from(RegistryError::PeerNotFound(id));
        assert_eq!(error.code(), "not-found");
        assert!(error.to_string().contains(&id.to_string()));

        let error = SignalingError::from(RegistryError::Port(PortError::Exhausted {
            min: 1,
            max: 2,
        }));
        assert_eq!(error.code(), "resource-exhausted");

        assert_eq!(
            SignalingError::from(RegistryError::NotRecording(id)).code(),
            "not-recording"
        );
    }

    #[test]
    fn test_engine_not_found_code() {
        let error = SignalingError::from(EngineError::not_found("transport", "T1"));
        assert_eq!(error.code(), "not-found");

        let error = SignalingError::from(EngineError::Rejected("busy".into()));
        assert_eq!(error.code(), "engine");
        assert!(!error.is_protocol());
    }
}
