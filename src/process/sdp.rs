//! Session description synthesis
//!
//! The transcoder learns where RTP arrives and how to depacketize it from an
//! SDP document written to its stdin. The document is built from the
//! consumers' negotiated RTP parameters.

use serde::Deserialize;
use serde_json::Value;

use super::ProcessError;
use crate::engine::MediaKind;

/// Codec details taken from a consumer's RTP parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    pub payload_type: u8,
    pub codec_name: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RtpCodec {
    mime_type: String,
    payload_type: u8,
    clock_rate: u32,
    channels: Option<u8>,
}

impl CodecInfo {
    /// Extract the first codec of `rtp_parameters`
    pub fn from_rtp_parameters(
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<Self, ProcessError> {
        let codec = rtp_parameters
            .get("codecs")
            .and_then(|codecs| codecs.get(0))
            .ok_or_else(|| ProcessError::InvalidMedia(format!("{} has no codecs", kind)))?;

        let codec = RtpCodec::deserialize(codec)
            .map_err(|e| ProcessError::InvalidMedia(format!("{} codec: {}", kind, e)))?;

        let prefix = format!("{}/", kind);
        let codec_name = codec
            .mime_type
            .strip_prefix(&prefix)
            .unwrap_or(codec.mime_type.as_str())
            .to_string();

        Ok(Self {
            payload_type: codec.payload_type,
            codec_name,
            clock_rate: codec.clock_rate,
            channels: match kind {
                MediaKind::Audio => codec.channels,
                MediaKind::Video => None,
            },
        })
    }
}

/// One consumed stream as seen by the transcoder
#[derive(Debug, Clone, PartialEq)]
pub struct MediaStream {
    pub kind: MediaKind,
    /// Port the transcoder receives RTP on
    pub remote_rtp_port: u16,
    /// Port the transcoder receives RTCP on, when not multiplexed
    pub remote_rtcp_port: Option<u16>,
    /// Engine-side RTCP port
    pub local_rtcp_port: Option<u16>,
    pub rtp_parameters: Value,
}

/// Aggregate description of a recording
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDescription {
    pub streams: Vec<MediaStream>,
    /// Base name for file output
    pub file_name: String,
}

impl MediaDescription {
    pub fn stream(&self, kind: MediaKind) -> Option<&MediaStream> {
        self.streams.iter().find(|stream| stream.kind == kind)
    }

    pub fn has_video(&self) -> bool {
        self.stream(MediaKind::Video).is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.stream(MediaKind::Audio).is_some()
    }
}

/// Build the SDP text for `media`
///
/// Only the first stream of each kind is described.
pub fn create_sdp_text(media: &MediaDescription) -> Result<String, ProcessError> {
    let mut sdp = String::from(
        "v=0\r\n\
         o=- 0 0 IN IP4 127.0.0.1\r\n\
         s=FFmpeg\r\n\
         c=IN IP4 127.0.0.1\r\n\
         t=0 0\r\n",
    );

    for kind in [MediaKind::Video, MediaKind::Audio] {
        let Some(stream) = media.stream(kind) else {
            continue;
        };
        let codec = CodecInfo::from_rtp_parameters(kind, &stream.rtp_parameters)?;

        sdp.push_str(&format!(
            "m={} {} RTP/AVP {}\r\n",
            kind, stream.remote_rtp_port, codec.payload_type
        ));
        match codec.channels {
            Some(channels) => sdp.push_str(&format!(
                "a=rtpmap:{} {}/{}/{}\r\n",
                codec.payload_type, codec.codec_name, codec.clock_rate, channels
            )),
            None => sdp.push_str(&format!(
                "a=rtpmap:{} {}/{}\r\n",
                codec.payload_type, codec.codec_name, codec.clock_rate
            )),
        }
        if let Some(rtcp_port) = stream.remote_rtcp_port {
            sdp.push_str(&format!("a=rtcp:{}\r\n", rtcp_port));
        }
        sdp.push_str("a=sendonly\r\n");
    }

    Ok(sdp)
}
