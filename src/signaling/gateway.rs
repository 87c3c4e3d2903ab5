//! Per-connection request handling
//!
//! The gateway turns client requests into registry updates and media engine
//! calls. It holds no per-connection state of its own; the connection task
//! passes its session id with every message.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use super::error::SignalingError;
use super::message::{ErrorResponse, Request, Response};
use crate::engine::{
    ConnectParams, ConsumeRequest, MediaEngine, MediaKind, PlainTransportOptions, ProducerInfo,
    RouterInfo, TransportRequest,
};
use crate::process::{MediaDescription, MediaStream, ProcessSupervisor};
use crate::registry::{SessionId, SessionRegistry};

/// Address the plain transports send RTP to
const RECORDER_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Gateway behaviour settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Wait before resuming consumers of a new recording
    pub settle_delay: Duration,

    /// Template for every recording's plain transports
    pub plain_transport: PlainTransportOptions,

    /// Answer failed requests with an error envelope
    pub error_responses: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(1000),
            plain_transport: PlainTransportOptions::default(),
            error_responses: false,
        }
    }
}

impl GatewayConfig {
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn rtcp_mux(mut self, enabled: bool) -> Self {
        self.plain_transport.rtcp_mux = enabled;
        self
    }

    pub fn error_responses(mut self, enabled: bool) -> Self {
        self.error_responses = enabled;
        self
    }
}

/// Signaling gateway shared by every connection
pub struct SignalingGateway {
    registry: Arc<SessionRegistry>,
    engine: Arc<dyn MediaEngine>,
    router: RouterInfo,
    supervisor: ProcessSupervisor,
    config: GatewayConfig,
}

impl SignalingGateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        engine: Arc<dyn MediaEngine>,
        router: RouterInfo,
        supervisor: ProcessSupervisor,
        config: GatewayConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            router,
            supervisor,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Create a peer for a new connection
    ///
    /// Returns the session id and the welcome message carrying the router
    /// capabilities.
    pub async fn open_session(&self) -> Result<(SessionId, String), SignalingError> {
        let session = self.registry.create_peer().await;

        let welcome = Response::RouterRtpCapabilities {
            router_rtp_capabilities: self.router.rtp_capabilities.clone(),
            session_id: session,
        };
        match welcome.to_json() {
            Ok(text) => Ok((session, text)),
            Err(e) => {
                self.close_session(&session).await;
                Err(e)
            }
        }
    }

    /// Release everything a connection created
    ///
    /// Safe to call more than once.
    pub async fn close_session(&self, session: &SessionId) {
        let Some(teardown) = self.registry.destroy_peer(session).await else {
            return;
        };
        self.close_transports(session, &teardown.transport_ids).await;
    }

    /// Handle one text frame, returning the reply to send, if any
    pub async fn handle_message(&self, session: &SessionId, text: &str) -> Option<String> {
        let request = match Request::parse(text) {
            Ok(request) => request,
            Err(SignalingError::UnknownAction(action)) => {
                tracing::warn!(session_id = %session, action = %action, "Unknown action");
                return None;
            }
            Err(e) => {
                tracing::warn!(session_id = %session, error = %e, "Malformed message");
                return None;
            }
        };

        let action = request.action();
        tracing::debug!(session_id = %session, action = action, "Request");

        match self.dispatch(session, request).await {
            Ok(Some(response)) => match response.to_json() {
                Ok(text) => Some(text),
                Err(e) => {
                    tracing::error!(session_id = %session, action = action, error = %e, "Failed to encode response");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(session_id = %session, action = action, code = e.code(), error = %e, "Request failed");

                if !self.config.error_responses || e.is_protocol() {
                    return None;
                }
                serde_json::to_string(&ErrorResponse::new(action, &e)).ok()
            }
        }
    }

    /// Execute a parsed request on behalf of `session`
    pub async fn dispatch(
        &self,
        session: &SessionId,
        request: Request,
    ) -> Result<Option<Response>, SignalingError> {
        if let Some(claimed) = request.session_id() {
            if claimed != session.to_string() {
                return Err(SignalingError::PeerNotFound(claimed.to_string()));
            }
        }

        match request {
            Request::CreateTransport { .. } => self.create_transport(session).await.map(Some),
            Request::ConnectTransport {
                transport_id,
                dtls_parameters,
                ..
            } => self
                .connect_transport(session, &transport_id, dtls_parameters)
                .await
                .map(Some),
            Request::Produce {
                transport_id,
                kind,
                rtp_parameters,
                ..
            } => self
                .produce(session, &transport_id, kind, rtp_parameters)
                .await
                .map(Some),
            Request::StartRecord { .. } => self.start_record(session).await.map(|()| None),
            Request::StopRecord { .. } => self.stop_record(session).await.map(Some),
        }
    }

    async fn create_transport(&self, session: &SessionId) -> Result<Response, SignalingError> {
        if !self.registry.contains(session).await {
            return Err(SignalingError::PeerNotFound(session.to_string()));
        }

        let mut transport = self.engine.create_transport(TransportRequest::WebRtc).await?;
        if let Some(dtls) = transport.dtls_parameters.as_object_mut() {
            dtls.insert("role".into(), Value::from("client"));
        }

        let response = Response::CreateTransport {
            id: transport.id.clone(),
            ice_parameters: transport.ice_parameters.clone(),
            ice_candidates: transport.ice_candidates.clone(),
            dtls_parameters: transport.dtls_parameters.clone(),
        };

        let transport_id = transport.id.clone();
        if let Err(e) = self.registry.add_transport(session, transport).await {
            self.close_transports(session, &[transport_id]).await;
            return Err(e.into());
        }

        tracing::info!(session_id = %session, transport_id = %transport_id, "Transport created");
        Ok(response)
    }

    async fn connect_transport(
        &self,
        session: &SessionId,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<Response, SignalingError> {
        let transport = self.registry.get_transport(session, transport_id).await?;

        self.engine
            .connect_transport(&transport.id, ConnectParams::Dtls(dtls_parameters))
            .await?;

        tracing::info!(session_id = %session, transport_id = %transport.id, "Transport connected");
        Ok(Response::ConnectTransport)
    }

    async fn produce(
        &self,
        session: &SessionId,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<Response, SignalingError> {
        let transport = self.registry.get_transport(session, transport_id).await?;

        let producer = self
            .engine
            .produce(&transport.id, kind, rtp_parameters)
            .await?;
        let response = Response::Produce {
            id: producer.id.clone(),
            kind: producer.kind,
        };
        self.registry.add_producer(session, producer).await?;

        tracing::info!(session_id = %session, transport_id = %transport.id, kind = %kind, "Producer added");
        Ok(response)
    }

    async fn start_record(&self, session: &SessionId) -> Result<(), SignalingError> {
        let producers = self.registry.producers(session).await?;
        if producers.is_empty() {
            return Err(SignalingError::NoProducers);
        }
        if self.registry.is_recording(session).await? {
            return Err(SignalingError::AlreadyRecording);
        }

        let media = match self.prepare_recording(session, &producers).await {
            Ok(media) => media,
            Err(e) => {
                self.rollback_recording(session).await;
                return Err(e);
            }
        };

        let process = match self.supervisor.start(&media).await {
            Ok(process) => process,
            Err(e) => {
                self.rollback_recording(session).await;
                return Err(e.into());
            }
        };

        let generation = match self.registry.begin_recording(session, process).await {
            Ok(generation) => generation,
            Err(e) => {
                self.rollback_recording(session).await;
                return Err(e.into());
            }
        };

        self.schedule_resume(*session, generation);
        Ok(())
    }

    /// Create one plain transport and paused consumer per producer
    async fn prepare_recording(
        &self,
        session: &SessionId,
        producers: &[ProducerInfo],
    ) -> Result<MediaDescription, SignalingError> {
        let mut streams = Vec::with_capacity(producers.len());

        for producer in producers {
            let options = self.config.plain_transport.clone();
            let rtcp_mux = options.rtcp_mux;

            let transport = self
                .engine
                .create_transport(TransportRequest::Plain(options))
                .await?;
            let transport_id = transport.id.clone();
            let local_rtcp_port = transport.rtcp_local_port;
            if let Err(e) = self.registry.add_transport(session, transport).await {
                self.close_transports(session, &[transport_id]).await;
                return Err(e.into());
            }

            let rtp_port = self.registry.acquire_port(session).await?;
            let rtcp_port = if rtcp_mux {
                None
            } else {
                Some(self.registry.acquire_port(session).await?)
            };

            self.engine
                .connect_transport(
                    &transport_id,
                    ConnectParams::Plain {
                        ip: RECORDER_IP,
                        port: rtp_port,
                        rtcp_port,
                    },
                )
                .await?;

            let codec = self
                .router
                .codec_for(producer.kind)
                .cloned()
                .ok_or(SignalingError::NoRouterCodec(producer.kind))?;

            let consumer = self
                .engine
                .consume(
                    &transport_id,
                    ConsumeRequest {
                        producer_id: producer.id.clone(),
                        rtp_capabilities: json!({ "codecs": [codec], "rtcpFeedback": [] }),
                        paused: true,
                    },
                )
                .await?;

            tracing::debug!(
                session_id = %session,
                transport_id = %transport_id,
                consumer_id = %consumer.id,
                kind = %producer.kind,
                rtp_port = rtp_port,
                rtcp_port = ?rtcp_port,
                "Recording stream prepared"
            );

            streams.push(MediaStream {
                kind: producer.kind,
                remote_rtp_port: rtp_port,
                remote_rtcp_port: rtcp_port,
                local_rtcp_port,
                rtp_parameters: consumer.rtp_parameters.clone(),
            });
            self.registry.add_consumer(session, consumer).await?;
        }

        Ok(MediaDescription {
            streams,
            file_name: recording_name(),
        })
    }

    async fn rollback_recording(&self, session: &SessionId) {
        match self.registry.abort_recording(session).await {
            Ok(teardown) => self.close_transports(session, &teardown.transport_ids).await,
            Err(e) => tracing::debug!(session_id = %session, error = %e, "Nothing to roll back"),
        }
    }

    /// Resume consumers once the process has had time to open its ports
    fn schedule_resume(&self, session: SessionId, generation: u64) {
        let registry = self.registry.clone();
        let engine = self.engine.clone();
        let delay = self.config.settle_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(consumers) = registry.recording_consumers(&session, generation).await else {
                tracing::debug!(session_id = %session, generation = generation, "Recording ended before resume");
                return;
            };

            for consumer_id in consumers {
                if let Err(e) = engine.resume_consumer(&consumer_id).await {
                    tracing::warn!(session_id = %session, consumer_id = %consumer_id, error = %e, "Failed to resume consumer");
                    continue;
                }
                if let Err(e) = engine.request_key_frame(&consumer_id).await {
                    tracing::warn!(session_id = %session, consumer_id = %consumer_id, error = %e, "Keyframe request failed");
                }
            }

            tracing::info!(session_id = %session, generation = generation, "Recording consumers resumed");
        });
    }

    async fn stop_record(&self, session: &SessionId) -> Result<Response, SignalingError> {
        let teardown = self.registry.stop_recording(session).await?;
        self.close_transports(session, &teardown.transport_ids).await;
        Ok(Response::StopRecord)
    }

    async fn close_transports(&self, session: &SessionId, transport_ids: &[String]) {
        for transport_id in transport_ids {
            if let Err(e) = self.engine.close_transport(transport_id).await {
                tracing::warn!(session_id = %session, transport_id = %transport_id, error = %e, "Failed to close transport");
            }
        }
    }
}

/// Millisecond timestamp used as the recording's base name
fn recording_name() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::engine::{EngineCall, MemoryEngine};
    use crate::port::{PortAllocator, PortRange};
    use crate::process::SinkConfig;
    use crate::registry::SessionPhase;

    struct Harness {
        gateway: SignalingGateway,
        engine: Arc<MemoryEngine>,
        _dir: tempfile::TempDir,
    }

    async fn harness(config: GatewayConfig) -> Harness {
        let engine = Arc::new(MemoryEngine::new());
        let router = engine.create_router().await.unwrap();
        let registry = Arc::new(SessionRegistry::with_ports(Arc::new(PortAllocator::new(
            PortRange::new(41000, 41099),
        ))));
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(SinkConfig {
            ffmpeg_path: PathBuf::from("true"),
            record_dir: dir.path().to_path_buf(),
            ..Default::default()
        });

        Harness {
            gateway: SignalingGateway::new(registry, engine.clone(), router, supervisor, config),
            engine,
            _dir: dir,
        }
    }

    fn request(value: Value) -> String {
        value.to_string()
    }

    async fn create_transport(gateway: &SignalingGateway, session: &SessionId) -> String {
        let reply = gateway
            .handle_message(
                session,
                &request(json!({ "action": "create-transport", "sessionId": session })),
            )
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        reply["id"].as_str().unwrap().to_string()
    }

    async fn produce(gateway: &SignalingGateway, session: &SessionId, transport_id: &str, kind: &str) {
        let reply = gateway
            .handle_message(
                session,
                &request(json!({
                    "action": "produce",
                    "sessionId": session,
                    "transportId": transport_id,
                    "kind": kind,
                    "rtpParameters": {}
                })),
            )
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["kind"], kind);
    }

    #[tokio::test]
    async fn test_open_session_welcome() {
        let h = harness(GatewayConfig::default()).await;
        let (session, welcome) = h.gateway.open_session().await.unwrap();

        let welcome: Value = serde_json::from_str(&welcome).unwrap();
        assert_eq!(welcome["action"], "router-rtp-capabilities");
        assert_eq!(welcome["sessionId"], session.to_string());
        assert!(welcome["routerRtpCapabilities"]["codecs"].is_array());
        assert!(h.gateway.registry().contains(&session).await);
    }

    #[tokio::test]
    async fn test_create_transport_forces_client_role() {
        let h = harness(GatewayConfig::default()).await;
        let (session, _) = h.gateway.open_session().await.unwrap();

        let reply = h
            .gateway
            .handle_message(
                &session,
                &request(json!({ "action": "create-transport", "sessionId": session })),
            )
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();

        assert_eq!(reply["action"], "create-transport");
        assert_eq!(reply["dtlsParameters"]["role"], "client");
        assert!(reply["iceParameters"].is_object());
        assert!(reply["iceCandidates"].is_array());

        let transport_id = reply["id"].as_str().unwrap();
        assert!(h
            .gateway
            .registry()
            .get_transport(&session, transport_id)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_connect_unknown_transport_is_silent() {
        let h = harness(GatewayConfig::default()).await;
        let (session, _) = h.gateway.open_session().await.unwrap();

        let reply = h
            .gateway
            .handle_message(
                &session,
                &request(json!({
                    "action": "connect-transport",
                    "sessionId": session,
                    "transportId": "T1",
                    "dtlsParameters": { "fingerprints": [] }
                })),
            )
            .await;

        assert!(reply.is_none());
        assert!(h.gateway.registry().contains(&session).await);
        assert!(!h
            .engine
            .calls()
            .iter()
            .any(|call| matches!(call, EngineCall::ConnectTransport(..))));
    }

    #[tokio::test]
    async fn test_connect_unknown_transport_error_envelope() {
        let h = harness(GatewayConfig::default().error_responses(true)).await;
        let (session, _) = h.gateway.open_session().await.unwrap();

        let reply = h
            .gateway
            .handle_message(
                &session,
                &request(json!({
                    "action": "connect-transport",
                    "sessionId": session,
                    "transportId": "T1",
                    "dtlsParameters": {}
                })),
            )
            .await
            .unwrap();
        let reply: ErrorResponse = serde_json::from_str(&reply).unwrap();

        assert_eq!(reply.action, "connect-transport");
        assert_eq!(reply.error.code, "not-found");
    }

    #[tokio::test]
    async fn test_connect_transport_ack() {
        let h = harness(GatewayConfig::default()).await;
        let (session, _) = h.gateway.open_session().await.unwrap();
        let transport_id = create_transport(&h.gateway, &session).await;

        let reply = h
            .gateway
            .handle_message(
                &session,
                &request(json!({
                    "action": "connect-transport",
                    "sessionId": session,
                    "transportId": transport_id,
                    "dtlsParameters": { "role": "client" }
                })),
            )
            .await
            .unwrap();

        assert_eq!(reply, r#"{"action":"connect-transport"}"#);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_are_silent() {
        let h = harness(GatewayConfig::default().error_responses(true)).await;
        let (session, _) = h.gateway.open_session().await.unwrap();

        assert!(h
            .gateway
            .handle_message(&session, r#"{"action":"rewind"}"#)
            .await
            .is_none());
        assert!(h.gateway.handle_message(&session, "{not json").await.is_none());
        assert!(h.gateway.registry().contains(&session).await);
    }

    #[tokio::test]
    async fn test_foreign_session_rejected() {
        let h = harness(GatewayConfig::default()).await;
        let (mine, _) = h.gateway.open_session().await.unwrap();
        let (other, _) = h.gateway.open_session().await.unwrap();

        let result = h
            .gateway
            .dispatch(
                &mine,
                Request::CreateTransport {
                    session_id: Some(other.to_string()),
                },
            )
            .await;

        assert!(matches!(result, Err(SignalingError::PeerNotFound(_))));
        assert_eq!(h.engine.transport_count(), 0);
    }

    #[tokio::test]
    async fn test_start_record_without_producers() {
        let h = harness(GatewayConfig::default()).await;
        let (session, _) = h.gateway.open_session().await.unwrap();
        create_transport(&h.gateway, &session).await;

        let result = h
            .gateway
            .dispatch(&session, Request::StartRecord { session_id: None })
            .await;

        assert!(matches!(result, Err(SignalingError::NoProducers)));
        assert_eq!(h.gateway.registry().ports().leased_count(), 0);
        assert!(!h.gateway.registry().is_recording(&session).await.unwrap());
        assert_eq!(
            h.gateway.registry().phase(&session).await.unwrap(),
            SessionPhase::Negotiating
        );
    }

    #[tokio::test]
    async fn test_stop_without_recording() {
        let h = harness(GatewayConfig::default()).await;
        let (session, _) = h.gateway.open_session().await.unwrap();

        let result = h
            .gateway
            .dispatch(&session, Request::StopRecord { session_id: None })
            .await;

        assert!(matches!(result, Err(SignalingError::NotRecording)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_record_cycle() {
        let h = harness(GatewayConfig::default().settle_delay(Duration::from_millis(20))).await;
        let (session, _) = h.gateway.open_session().await.unwrap();
        let transport_id = create_transport(&h.gateway, &session).await;
        produce(&h.gateway, &session, &transport_id, "audio").await;
        produce(&h.gateway, &session, &transport_id, "video").await;

        let reply = h
            .gateway
            .handle_message(
                &session,
                &request(json!({ "action": "start-record", "sessionId": session })),
            )
            .await;
        assert!(reply.is_none());

        let registry = h.gateway.registry();
        assert!(registry.is_recording(&session).await.unwrap());
        // RTP and RTCP port per producer
        assert_eq!(registry.ports().leased_count(), 4);
        assert_eq!(registry.consumers(&session).await.unwrap().len(), 2);
        assert_eq!(h.engine.consumer_count(), 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let calls = h.engine.calls();
        assert_eq!(
            calls
                .iter()
                .filter(|call| matches!(call, EngineCall::ResumeConsumer(_)))
                .count(),
            2
        );
        assert_eq!(
            calls
                .iter()
                .filter(|call| matches!(call, EngineCall::RequestKeyFrame(_)))
                .count(),
            2
        );

        let again = h
            .gateway
            .dispatch(&session, Request::StartRecord { session_id: None })
            .await;
        assert!(matches!(again, Err(SignalingError::AlreadyRecording)));
        assert_eq!(registry.ports().leased_count(), 4);

        let reply = h
            .gateway
            .handle_message(
                &session,
                &request(json!({ "action": "stop-record", "sessionId": session })),
            )
            .await
            .unwrap();
        assert_eq!(reply, r#"{"action":"stop-record"}"#);
        assert_eq!(registry.ports().leased_count(), 0);
        assert_eq!(h.engine.consumer_count(), 0);
        // Only the client transport is left
        assert_eq!(h.engine.transport_count(), 1);

        h.gateway.close_session(&session).await;
        h.gateway.close_session(&session).await;
        assert_eq!(h.engine.transport_count(), 0);
        assert!(!registry.contains(&session).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rtcp_mux_uses_one_port() {
        let h = harness(GatewayConfig::default().rtcp_mux(true)).await;
        let (session, _) = h.gateway.open_session().await.unwrap();
        let transport_id = create_transport(&h.gateway, &session).await;
        produce(&h.gateway, &session, &transport_id, "video").await;

        h.gateway
            .dispatch(&session, Request::StartRecord { session_id: None })
            .await
            .unwrap();

        assert_eq!(h.gateway.registry().ports().leased_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        let h = harness(GatewayConfig::default()).await;
        let (session, _) = h.gateway.open_session().await.unwrap();
        let transport_id = create_transport(&h.gateway, &session).await;
        produce(&h.gateway, &session, &transport_id, "audio").await;
        h.engine.fail_operation("consume");

        let result = h
            .gateway
            .dispatch(&session, Request::StartRecord { session_id: None })
            .await;

        assert!(matches!(result, Err(SignalingError::Engine(_))));
        let registry = h.gateway.registry();
        assert_eq!(registry.ports().leased_count(), 0);
        assert!(!registry.is_recording(&session).await.unwrap());
        assert_eq!(h.engine.transport_count(), 1);
        assert!(registry.get_transport(&session, &transport_id).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_before_settle_skips_resume() {
        let h = harness(GatewayConfig::default().settle_delay(Duration::from_millis(100))).await;
        let (session, _) = h.gateway.open_session().await.unwrap();
        let transport_id = create_transport(&h.gateway, &session).await;
        produce(&h.gateway, &session, &transport_id, "video").await;

        h.gateway
            .dispatch(&session, Request::StartRecord { session_id: None })
            .await
            .unwrap();
        h.gateway
            .dispatch(&session, Request::StopRecord { session_id: None })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!h
            .engine
            .calls()
            .iter()
            .any(|call| matches!(call, EngineCall::ResumeConsumer(_))));
    }
}
