//! Error types
//!
//! Each layer has its own error enum; [`Error`] folds them together for
//! callers that only need to propagate.

use thiserror::Error;

use crate::engine::EngineError;
use crate::port::PortError;
use crate::process::ProcessError;
use crate::registry::RegistryError;
use crate::signaling::SignalingError;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport failed
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Port pool error
    #[error(transparent)]
    Port(#[from] PortError),

    /// Session registry error
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Media engine error
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Supervised process error
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Signaling protocol error
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}
