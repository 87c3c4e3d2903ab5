//! Client protocol messages
//!
//! Every message is a JSON object with an `action` field. Requests carry the
//! client's `sessionId`; responses echo the request's `action`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::SignalingError;
use crate::engine::MediaKind;
use crate::registry::SessionId;

/// Client request
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Request {
    CreateTransport {
        #[serde(default)]
        session_id: Option<String>,
    },
    ConnectTransport {
        #[serde(default)]
        session_id: Option<String>,
        transport_id: String,
        #[serde(default)]
        dtls_parameters: Value,
    },
    Produce {
        #[serde(default)]
        session_id: Option<String>,
        transport_id: String,
        kind: MediaKind,
        #[serde(default)]
        rtp_parameters: Value,
    },
    StartRecord {
        #[serde(default)]
        session_id: Option<String>,
    },
    StopRecord {
        #[serde(default)]
        session_id: Option<String>,
    },
}

impl Request {
    /// Actions a client may send
    pub const ACTIONS: [&'static str; 5] = [
        "create-transport",
        "connect-transport",
        "produce",
        "start-record",
        "stop-record",
    ];

    /// Parse a text frame
    ///
    /// Malformed JSON and unknown actions are told apart so the caller can
    /// log them differently.
    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| SignalingError::Protocol(e.to_string()))?;

        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| SignalingError::Protocol("missing action".into()))?;

        if !Self::ACTIONS.contains(&action) {
            return Err(SignalingError::UnknownAction(action.to_string()));
        }
        let action = action.to_string();

        serde_json::from_value(value)
            .map_err(|e| SignalingError::Protocol(format!("{}: {}", action, e)))
    }

    pub fn action(&self) -> &'static str {
        match self {
            Request::CreateTransport { .. } => "create-transport",
            Request::ConnectTransport { .. } => "connect-transport",
            Request::Produce { .. } => "produce",
            Request::StartRecord { .. } => "start-record",
            Request::StopRecord { .. } => "stop-record",
        }
    }

    /// The `sessionId` the client claims, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Request::CreateTransport { session_id }
            | Request::ConnectTransport { session_id, .. }
            | Request::Produce { session_id, .. }
            | Request::StartRecord { session_id }
            | Request::StopRecord { session_id } => session_id.as_deref(),
        }
    }
}

/// Server message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Response {
    /// Sent once when the connection opens
    RouterRtpCapabilities {
        router_rtp_capabilities: Value,
        session_id: SessionId,
    },
    CreateTransport {
        id: String,
        ice_parameters: Value,
        ice_candidates: Value,
        dtls_parameters: Value,
    },
    ConnectTransport,
    Produce {
        id: String,
        kind: MediaKind,
    },
    StopRecord,
}

impl Response {
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Protocol(e.to_string()))
    }
}

/// Body of an error reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Error reply, sent only when error responses are enabled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub action: String,
    pub error: ErrorBody,
}

impl ErrorResponse {
    pub fn new(action: impl Into<String>, error: &SignalingError) -> Self {
        Self {
            action: action.into(),
            error: ErrorBody {
                code: error.code().to_string(),
                message: error.to_string(),
            },
        }
    }
}
