//! In-memory media engine
//!
//! Mints ids, tracks which transports/producers/consumers exist and records
//! every call. It moves no media; it exists so the signaling state machine
//! can run without an SFU attached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use super::types::{
    ConnectParams, ConsumeRequest, ConsumerInfo, MediaKind, ProducerInfo, RouterInfo,
    TransportInfo, TransportKind, TransportRequest,
};
use super::{EngineError, MediaEngine};

/// A call observed by [`MemoryEngine`]
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Initialize,
    CreateRouter,
    CreateTransport(TransportRequest),
    ConnectTransport(String, ConnectParams),
    Produce(String, MediaKind),
    Consume(String, String),
    ResumeConsumer(String),
    RequestKeyFrame(String),
    CloseTransport(String),
}

#[derive(Default)]
struct State {
    transports: HashMap<String, TransportKind>,
    producers: HashMap<String, MediaKind>,
    consumers: HashMap<String, String>,
    calls: Vec<EngineCall>,
    failing: Option<&'static str>,
}

/// Bookkeeping-only engine
pub struct MemoryEngine {
    capabilities: Value,
    state: Mutex<State>,
    next_rtcp_port: AtomicU16,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_capabilities(default_capabilities())
    }

    /// Use a custom router capability descriptor
    pub fn with_capabilities(capabilities: Value) -> Self {
        Self {
            capabilities,
            state: Mutex::new(State::default()),
            next_rtcp_port: AtomicU16::new(40000),
        }
    }

    /// Make every future call of `operation` fail with `Rejected`
    ///
    /// Operation names match the trait methods (`"consume"`, `"produce"`, ...).
    pub fn fail_operation(&self, operation: &'static str) {
        self.state.lock().failing = Some(operation);
    }

    /// Snapshot of recorded calls
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    /// Number of open transports
    pub fn transport_count(&self) -> usize {
        self.state.lock().transports.len()
    }

    /// Number of live consumers
    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    fn record(&self, operation: &'static str, call: EngineCall) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.failing == Some(operation) {
            return Err(EngineError::Rejected(format!("{} failed", operation)));
        }
        Ok(())
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MemoryEngine {
    async fn initialize(&self) -> Result<(), EngineError> {
        self.record("initialize", EngineCall::Initialize)
            .map_err(|e| EngineError::Initialization(e.to_string()))
    }

    async fn create_router(&self) -> Result<RouterInfo, EngineError> {
        self.record("create_router", EngineCall::CreateRouter)?;
        Ok(RouterInfo {
            rtp_capabilities: self.capabilities.clone(),
        })
    }

    async fn create_transport(
        &self,
        request: TransportRequest,
    ) -> Result<TransportInfo, EngineError> {
        self.record("create_transport", EngineCall::CreateTransport(request.clone()))?;

        let id = Uuid::new_v4().to_string();
        let kind = request.kind();
        let rtcp_local_port = match &request {
            TransportRequest::Plain(options) if !options.rtcp_mux => {
                Some(self.next_rtcp_port.fetch_add(1, Ordering::Relaxed))
            }
            _ => None,
        };

        self.state.lock().transports.insert(id.clone(), kind);

        let (ice_parameters, ice_candidates, dtls_parameters) = match kind {
            TransportKind::WebRtc => (
                json!({ "usernameFragment": Uuid::new_v4().simple().to_string(), "password": Uuid::new_v4().simple().to_string(), "iceLite": true }),
                json!([]),
                json!({ "role": "auto", "fingerprints": [] }),
            ),
            TransportKind::Plain => (Value::Null, Value::Null, Value::Null),
        };

        Ok(TransportInfo {
            id,
            kind,
            ice_parameters,
            ice_candidates,
            dtls_parameters,
            rtcp_local_port,
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        params: ConnectParams,
    ) -> Result<(), EngineError> {
        self.record(
            "connect_transport",
            EngineCall::ConnectTransport(transport_id.to_string(), params),
        )?;

        if !self.state.lock().transports.contains_key(transport_id) {
            return Err(EngineError::not_found("transport", transport_id));
        }
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        _rtp_parameters: Value,
    ) -> Result<ProducerInfo, EngineError> {
        self.record("produce", EngineCall::Produce(transport_id.to_string(), kind))?;

        let mut state = self.state.lock();
        if state.transports.get(transport_id) != Some(&TransportKind::WebRtc) {
            return Err(EngineError::not_found("transport", transport_id));
        }

        let id = Uuid::new_v4().to_string();
        state.producers.insert(id.clone(), kind);
        Ok(ProducerInfo { id, kind })
    }

    async fn consume(
        &self,
        transport_id: &str,
        request: ConsumeRequest,
    ) -> Result<ConsumerInfo, EngineError> {
        self.record(
            "consume",
            EngineCall::Consume(transport_id.to_string(), request.producer_id.clone()),
        )?;

        let mut state = self.state.lock();
        if !state.transports.contains_key(transport_id) {
            return Err(EngineError::not_found("transport", transport_id));
        }
        let kind = *state
            .producers
            .get(&request.producer_id)
            .ok_or_else(|| EngineError::not_found("producer", &request.producer_id))?;

        let codec = request
            .rtp_capabilities
            .get("codecs")
            .and_then(|codecs| codecs.get(0))
            .cloned()
            .ok_or_else(|| EngineError::Rejected("no compatible codec".into()))?;

        let mut rtp_codec = json!({
            "mimeType": codec["mimeType"],
            "payloadType": codec["preferredPayloadType"],
            "clockRate": codec["clockRate"],
        });
        if let Some(channels) = codec.get("channels") {
            rtp_codec["channels"] = channels.clone();
        }

        let id = Uuid::new_v4().to_string();
        state.consumers.insert(id.clone(), transport_id.to_string());

        Ok(ConsumerInfo {
            id,
            producer_id: request.producer_id,
            kind,
            rtp_parameters: json!({ "codecs": [rtp_codec], "encodings": [{ "ssrc": 1111 }] }),
            paused: request.paused,
        })
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.record(
            "resume_consumer",
            EngineCall::ResumeConsumer(consumer_id.to_string()),
        )?;

        if !self.state.lock().consumers.contains_key(consumer_id) {
            return Err(EngineError::not_found("consumer", consumer_id));
        }
        Ok(())
    }

    async fn request_key_frame(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.record(
            "request_key_frame",
            EngineCall::RequestKeyFrame(consumer_id.to_string()),
        )?;

        if !self.state.lock().consumers.contains_key(consumer_id) {
            return Err(EngineError::not_found("consumer", consumer_id));
        }
        Ok(())
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError> {
        self.record(
            "close_transport",
            EngineCall::CloseTransport(transport_id.to_string()),
        )?;

        let mut state = self.state.lock();
        if state.transports.remove(transport_id).is_none() {
            return Err(EngineError::not_found("transport", transport_id));
        }
        state.consumers.retain(|_, owner| owner != transport_id);
        Ok(())
    }
}

fn default_capabilities() -> Value {
    json!({
        "codecs": [
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 100,
                "clockRate": 48000,
                "channels": 2,
                "rtcpFeedback": []
            },
            {
                "kind": "video",
                "mimeType": "video/VP8",
                "preferredPayloadType": 101,
                "clockRate": 90000,
                "parameters": { "x-google-start-bitrate": 1000 },
                "rtcpFeedback": [
                    { "type": "nack" },
                    { "type": "nack", "parameter": "pli" },
                    { "type": "ccm", "parameter": "fir" },
                    { "type": "goog-remb" }
                ]
            }
        ],
        "headerExtensions": []
    })
}
