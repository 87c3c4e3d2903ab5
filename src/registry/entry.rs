//! Peer entry and lifecycle types
//!
//! A [`Peer`] holds everything one signaling connection has created. All of
//! it is released exactly once, either by stopping a recording or by
//! destroying the peer.

use std::collections::HashMap;
use std::time::Instant;

use super::id::SessionId;
use crate::engine::{ConsumerInfo, ProducerInfo, TransportInfo, TransportKind};
use crate::port::PortAllocator;
use crate::process::SupervisedProcess;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Connection open, peer created
    Connected,
    /// Transports and producers being set up
    Negotiating,
    /// A recording process is running
    Recording,
    /// Peer destroyed
    Closed,
}

/// Engine objects and ports released when a recording stops
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecordingTeardown {
    /// Plain transports to close on the engine
    pub transport_ids: Vec<String>,
    /// Consumers dropped with those transports
    pub consumer_ids: Vec<String>,
    /// Ports returned to the pool
    pub released_ports: Vec<u16>,
    /// Whether this call sent the kill sequence
    pub killed: bool,
}

/// Everything released when a peer is destroyed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTeardown {
    pub session_id: SessionId,
    /// Every transport the peer owned, to close on the engine
    pub transport_ids: Vec<String>,
    pub released_ports: Vec<u16>,
    /// Whether a recording process was interrupted
    pub killed: bool,
}

/// State owned by one signaling connection
pub struct Peer {
    pub id: SessionId,

    /// Current phase
    pub phase: SessionPhase,

    /// When the connection opened
    pub connected_at: Instant,

    transports: HashMap<String, TransportInfo>,
    producers: Vec<ProducerInfo>,
    consumers: Vec<ConsumerInfo>,
    process: Option<SupervisedProcess>,
    ports: Vec<u16>,

    /// Bumped every time a recording starts
    generation: u64,
}

impl Peer {
    pub(super) fn new(id: SessionId) -> Self {
        Self {
            id,
            phase: SessionPhase::Connected,
            connected_at: Instant::now(),
            transports: HashMap::new(),
            producers: Vec::new(),
            consumers: Vec::new(),
            process: None,
            ports: Vec::new(),
            generation: 0,
        }
    }

    pub fn transport(&self, transport_id: &str) -> Option<&TransportInfo> {
        self.transports.get(transport_id)
    }

    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    /// Producers in creation order
    pub fn producers(&self) -> &[ProducerInfo] {
        &self.producers
    }

    /// Consumers in creation order
    pub fn consumers(&self) -> &[ConsumerInfo] {
        &self.consumers
    }

    /// Leased ports in allocation order
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn is_recording(&self) -> bool {
        self.process.is_some()
    }

    pub fn process(&self) -> Option<&SupervisedProcess> {
        self.process.as_ref()
    }

    /// Generation of the current (or last) recording
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(super) fn add_transport(&mut self, transport: TransportInfo) {
        if self.phase == SessionPhase::Connected {
            self.phase = SessionPhase::Negotiating;
        }
        self.transports.insert(transport.id.clone(), transport);
    }

    pub(super) fn add_producer(&mut self, producer: ProducerInfo) {
        self.producers.push(producer);
    }

    pub(super) fn add_consumer(&mut self, consumer: ConsumerInfo) {
        self.consumers.push(consumer);
    }

    pub(super) fn add_port(&mut self, port: u16) {
        self.ports.push(port);
    }

    pub(super) fn attach_process(&mut self, process: SupervisedProcess) -> u64 {
        self.generation += 1;
        self.process = Some(process);
        self.phase = SessionPhase::Recording;
        self.generation
    }

    /// Kill the process, release ports and drop plain transports/consumers
    pub(super) fn release_recording(&mut self, ports: &PortAllocator) -> RecordingTeardown {
        let killed = self
            .process
            .take()
            .map(|process| process.kill())
            .unwrap_or(false);

        let released_ports = self.release_ports(ports);

        let transport_ids: Vec<String> = self
            .transports
            .iter()
            .filter(|(_, transport)| transport.kind == TransportKind::Plain)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &transport_ids {
            self.transports.remove(id);
        }

        let consumer_ids = self.consumers.drain(..).map(|consumer| consumer.id).collect();

        if self.phase == SessionPhase::Recording {
            self.phase = SessionPhase::Negotiating;
        }

        RecordingTeardown {
            transport_ids,
            consumer_ids,
            released_ports,
            killed,
        }
    }

    /// Release everything; the peer is unusable afterwards
    pub(super) fn teardown(&mut self, ports: &PortAllocator) -> PeerTeardown {
        let recording = self.release_recording(ports);

        let transport_ids = self.transports.drain().map(|(id, _)| id).collect::<Vec<_>>();
        self.producers.clear();
        self.phase = SessionPhase::Closed;

        PeerTeardown {
            session_id: self.id,
            transport_ids: recording.transport_ids.into_iter().chain(transport_ids).collect(),
            released_ports: recording.released_ports,
            killed: recording.killed,
        }
    }

    fn release_ports(&mut self, ports: &PortAllocator) -> Vec<u16> {
        let mut released = Vec::with_capacity(self.ports.len());
        for port in self.ports.drain(..) {
            match ports.release(port) {
                Ok(()) => released.push(port),
                Err(e) => tracing::warn!(session_id = %self.id, port = port, error = %e, "Port release rejected"),
            }
        }
        released
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("transports", &self.transports.len())
            .field("producers", &self.producers.len())
            .field("consumers", &self.consumers.len())
            .field("ports", &self.ports)
            .field("recording", &self.is_recording())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::engine::MediaKind;
    use crate::port::PortRange;

    fn transport(id: &str, kind: TransportKind) -> TransportInfo {
        TransportInfo {
            id: id.into(),
            kind,
            ice_parameters: Value::Null,
            ice_candidates: Value::Null,
            dtls_parameters: Value::Null,
            rtcp_local_port: None,
        }
    }

    #[test]
    fn test_phase_transitions() {
        let mut peer = Peer::new(SessionId::new());
        assert_eq!(peer.phase, SessionPhase::Connected);

        peer.add_transport(transport("t1", TransportKind::WebRtc));
        assert_eq!(peer.phase, SessionPhase::Negotiating);

        let ports = PortAllocator::new(PortRange::new(100, 101));
        let teardown = peer.teardown(&ports);
        assert_eq!(peer.phase, SessionPhase::Closed);
        assert_eq!(teardown.transport_ids, vec!["t1".to_string()]);
        assert!(!teardown.killed);
    }

    #[test]
    fn test_release_recording_keeps_client_side() {
        let ports = PortAllocator::new(PortRange::new(100, 110));
        let mut peer = Peer::new(SessionId::new());

        peer.add_transport(transport("client", TransportKind::WebRtc));
        peer.add_transport(transport("plain", TransportKind::Plain));
        peer.add_producer(ProducerInfo {
            id: "p1".into(),
            kind: MediaKind::Audio,
        });
        peer.add_consumer(ConsumerInfo {
            id: "c1".into(),
            producer_id: "p1".into(),
            kind: MediaKind::Audio,
            rtp_parameters: Value::Null,
            paused: true,
        });
        let port = ports.acquire().unwrap();
        peer.add_port(port);

        let teardown = peer.release_recording(&ports);

        assert_eq!(teardown.transport_ids, vec!["plain".to_string()]);
        assert_eq!(teardown.consumer_ids, vec!["c1".to_string()]);
        assert_eq!(teardown.released_ports, vec![port]);
        assert!(peer.transport("client").is_some());
        assert_eq!(peer.producers().len(), 1);
        assert_eq!(ports.leased_count(), 0);
    }
}
