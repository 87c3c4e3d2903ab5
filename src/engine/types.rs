//! Engine request and handle types

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Media kind of a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Client-facing WebRTC transport
    #[serde(rename = "webRtc")]
    WebRtc,
    /// Plain RTP transport feeding the transcoder
    #[serde(rename = "plain")]
    Plain,
}

/// Options for a plain RTP transport
///
/// Cloned for every recording start; one session's settings never leak into
/// another's request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainTransportOptions {
    /// Local address the engine listens on
    pub listen_ip: IpAddr,
    /// Address announced to the remote side
    pub announced_ip: Option<IpAddr>,
    /// Multiplex RTP and RTCP on one port
    pub rtcp_mux: bool,
    /// Learn the remote address from the first received packet
    pub comedia: bool,
}

impl Default for PlainTransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            announced_ip: Some(IpAddr::from([127, 0, 0, 1])),
            rtcp_mux: false,
            comedia: false,
        }
    }
}

/// Transport creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRequest {
    WebRtc,
    Plain(PlainTransportOptions),
}

impl TransportRequest {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportRequest::WebRtc => TransportKind::WebRtc,
            TransportRequest::Plain(_) => TransportKind::Plain,
        }
    }
}

/// Handle returned by the engine for a new transport
#[derive(Debug, Clone, PartialEq)]
pub struct TransportInfo {
    pub id: String,
    pub kind: TransportKind,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    /// Local RTCP port when RTCP is not multiplexed (plain transports)
    pub rtcp_local_port: Option<u16>,
}

/// Negotiation completion parameters
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectParams {
    /// DTLS parameters supplied by the client
    Dtls(Value),
    /// Remote RTP (and optional RTCP) endpoint for a plain transport
    Plain {
        ip: IpAddr,
        port: u16,
        rtcp_port: Option<u16>,
    },
}

/// Router capability descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct RouterInfo {
    pub rtp_capabilities: Value,
}

impl RouterInfo {
    /// First router codec of the given kind
    pub fn codec_for(&self, kind: MediaKind) -> Option<&Value> {
        self.rtp_capabilities
            .get("codecs")?
            .as_array()?
            .iter()
            .find(|codec| codec.get("kind").and_then(Value::as_str) == Some(kind.as_str()))
    }
}

/// Registered inbound source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerInfo {
    pub id: String,
    pub kind: MediaKind,
}

/// Consume request for a plain transport
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeRequest {
    pub producer_id: String,
    pub rtp_capabilities: Value,
    pub paused: bool,
}

/// Outbound flow handle
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub paused: bool,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_codec_for_kind() {
        let router = RouterInfo {
            rtp_capabilities: json!({
                "codecs": [
                    { "kind": "audio", "mimeType": "audio/opus" },
                    { "kind": "video", "mimeType": "video/VP8" },
                    { "kind": "video", "mimeType": "video/H264" },
                ]
            }),
        };

        assert_eq!(
            router.codec_for(MediaKind::Video).unwrap()["mimeType"],
            "video/VP8"
        );
        assert_eq!(
            router.codec_for(MediaKind::Audio).unwrap()["mimeType"],
            "audio/opus"
        );
    }

    #[test]
    fn test_codec_for_missing() {
        let router = RouterInfo {
            rtp_capabilities: json!({ "codecs": [] }),
        };
        assert!(router.codec_for(MediaKind::Audio).is_none());

        let router = RouterInfo {
            rtp_capabilities: json!({}),
        };
        assert!(router.codec_for(MediaKind::Video).is_none());
    }

    #[test]
    fn test_kind_serde() {
        assert_eq!(serde_json::to_value(MediaKind::Video).unwrap(), "video");
        assert_eq!(
            serde_json::from_value::<MediaKind>(json!("audio")).unwrap(),
            MediaKind::Audio
        );
        assert_eq!(serde_json::to_value(TransportKind::WebRtc).unwrap(), "webRtc");
    }
}
