//! Session registry implementation
//!
//! The central registry that owns every peer and the port pool their
//! recordings lease from.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::entry::{Peer, PeerTeardown, RecordingTeardown, SessionPhase};
use super::error::RegistryError;
use super::id::SessionId;
use crate::engine::{ConsumerInfo, ProducerInfo, TransportInfo};
use crate::port::PortAllocator;
use crate::process::SupervisedProcess;

/// Central registry for all live peers
///
/// The map lock is only held long enough to find a peer; per-peer work
/// happens under that peer's own lock.
pub struct SessionRegistry {
    /// Map of session id to peer
    peers: RwLock<HashMap<SessionId, Arc<Mutex<Peer>>>>,

    /// Pool shared by every peer's recordings
    ports: Arc<PortAllocator>,
}

impl SessionRegistry {
    /// Create a registry with a default port pool
    pub fn new() -> Self {
        Self::with_ports(Arc::new(PortAllocator::default()))
    }

    /// Create a registry leasing from `ports`
    pub fn with_ports(ports: Arc<PortAllocator>) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            ports,
        }
    }

    /// The port pool
    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Create a peer for a new connection
    pub async fn create_peer(&self) -> SessionId {
        let mut peers = self.peers.write().await;

        let mut id = SessionId::new();
        while peers.contains_key(&id) {
            id = SessionId::new();
        }
        peers.insert(id, Arc::new(Mutex::new(Peer::new(id))));

        tracing::info!(session_id = %id, peers = peers.len(), "Peer created");
        id
    }

    /// Destroy a peer, releasing everything it owns
    ///
    /// Returns `None` if the peer does not exist (including when it was
    /// already destroyed), so calling this twice is harmless.
    pub async fn destroy_peer(&self, id: &SessionId) -> Option<PeerTeardown> {
        let entry = self.peers.write().await.remove(id)?;
        let mut peer = entry.lock().await;
        let teardown = peer.teardown(&self.ports);

        tracing::info!(
            session_id = %id,
            transports = teardown.transport_ids.len(),
            ports = ?teardown.released_ports,
            killed = teardown.killed,
            "Peer destroyed"
        );

        Some(teardown)
    }

    /// Check if a peer exists
    pub async fn contains(&self, id: &SessionId) -> bool {
        self.peers.read().await.contains_key(id)
    }

    /// Number of live peers
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    async fn peer(&self, id: &SessionId) -> Result<Arc<Mutex<Peer>>, RegistryError> {
        self.peers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(RegistryError::PeerNotFound(*id))
    }

    /// Current phase of a peer
    pub async fn phase(&self, id: &SessionId) -> Result<SessionPhase, RegistryError> {
        Ok(self.peer(id).await?.lock().await.phase)
    }

    /// Attach a transport to a peer
    pub async fn add_transport(
        &self,
        id: &SessionId,
        transport: TransportInfo,
    ) -> Result<(), RegistryError> {
        let entry = self.peer(id).await?;
        let mut peer = entry.lock().await;

        tracing::debug!(session_id = %id, transport_id = %transport.id, kind = ?transport.kind, "Transport added");
        peer.add_transport(transport);
        Ok(())
    }

    /// Look up one of a peer's transports
    pub async fn get_transport(
        &self,
        id: &SessionId,
        transport_id: &str,
    ) -> Result<TransportInfo, RegistryError> {
        let entry = self.peer(id).await?;
        let peer = entry.lock().await;

        peer.transport(transport_id)
            .cloned()
            .ok_or_else(|| RegistryError::TransportNotFound(transport_id.to_string()))
    }

    /// Record a producer created on one of the peer's transports
    pub async fn add_producer(
        &self,
        id: &SessionId,
        producer: ProducerInfo,
    ) -> Result<(), RegistryError> {
        let entry = self.peer(id).await?;
        let mut peer = entry.lock().await;

        tracing::debug!(session_id = %id, producer_id = %producer.id, kind = %producer.kind, "Producer added");
        peer.add_producer(producer);
        Ok(())
    }

    /// Producers of a peer, in creation order
    pub async fn producers(&self, id: &SessionId) -> Result<Vec<ProducerInfo>, RegistryError> {
        Ok(self.peer(id).await?.lock().await.producers().to_vec())
    }

    /// Record a consumer feeding the peer's recording
    pub async fn add_consumer(
        &self,
        id: &SessionId,
        consumer: ConsumerInfo,
    ) -> Result<(), RegistryError> {
        let entry = self.peer(id).await?;
        let mut peer = entry.lock().await;

        tracing::debug!(session_id = %id, consumer_id = %consumer.id, kind = %consumer.kind, "Consumer added");
        peer.add_consumer(consumer);
        Ok(())
    }

    /// Consumers of a peer, in creation order
    pub async fn consumers(&self, id: &SessionId) -> Result<Vec<ConsumerInfo>, RegistryError> {
        Ok(self.peer(id).await?.lock().await.consumers().to_vec())
    }

    /// Whether a peer has a recording process
    pub async fn is_recording(&self, id: &SessionId) -> Result<bool, RegistryError> {
        Ok(self.peer(id).await?.lock().await.is_recording())
    }

    /// Lease a port on behalf of a peer
    ///
    /// The port is released when the recording stops or the peer is
    /// destroyed. Nothing is leased if the peer does not exist.
    pub async fn acquire_port(&self, id: &SessionId) -> Result<u16, RegistryError> {
        let entry = self.peer(id).await?;
        let mut peer = entry.lock().await;

        let port = self.ports.acquire()?;
        peer.add_port(port);

        tracing::debug!(session_id = %id, port = port, "Port leased");
        Ok(port)
    }

    /// Attach a running process and enter the recording phase
    ///
    /// Returns the new recording generation. On error the process is
    /// dropped, which interrupts it.
    pub async fn begin_recording(
        &self,
        id: &SessionId,
        process: SupervisedProcess,
    ) -> Result<u64, RegistryError> {
        let entry = self.peer(id).await?;
        let mut peer = entry.lock().await;

        if peer.is_recording() {
            return Err(RegistryError::AlreadyRecording(*id));
        }

        let pids = process.pids();
        let generation = peer.attach_process(process);

        tracing::info!(session_id = %id, generation = generation, pids = ?pids, "Recording started");
        Ok(generation)
    }

    /// Consumer ids of a recording, if that recording is still the active one
    pub async fn recording_consumers(
        &self,
        id: &SessionId,
        generation: u64,
    ) -> Option<Vec<String>> {
        let entry = self.peer(id).await.ok()?;
        let peer = entry.lock().await;

        if !peer.is_recording() || peer.generation() != generation {
            return None;
        }
        Some(peer.consumers().iter().map(|consumer| consumer.id.clone()).collect())
    }

    /// Stop a peer's recording
    ///
    /// Kills the process, releases the recording's ports and drops its plain
    /// transports and consumers.
    pub async fn stop_recording(&self, id: &SessionId) -> Result<RecordingTeardown, RegistryError> {
        let entry = self.peer(id).await?;
        let mut peer = entry.lock().await;

        if !peer.is_recording() {
            return Err(RegistryError::NotRecording(*id));
        }

        let teardown = peer.release_recording(&self.ports);
        tracing::info!(
            session_id = %id,
            ports = ?teardown.released_ports,
            transports = teardown.transport_ids.len(),
            "Recording stopped"
        );
        Ok(teardown)
    }

    /// Undo a recording start that failed before a process was attached
    pub async fn abort_recording(&self, id: &SessionId) -> Result<RecordingTeardown, RegistryError> {
        let entry = self.peer(id).await?;
        let mut peer = entry.lock().await;

        let teardown = peer.release_recording(&self.ports);
        tracing::debug!(session_id = %id, ports = ?teardown.released_ports, "Recording start rolled back");
        Ok(teardown)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::engine::{MediaKind, TransportKind};
    use crate::port::{PortError, PortRange};

    fn registry(min: u16, max: u16) -> SessionRegistry {
        SessionRegistry::with_ports(Arc::new(PortAllocator::new(PortRange::new(min, max))))
    }

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

    #[tokio::test]
    async fn test_create_and_destroy() {
        let registry = SessionRegistry::new();
        let a = registry.create_peer().await;
        let b = registry.create_peer().await;

        assert_ne!(a, b);
        assert_eq!(registry.peer_count().await, 2);
        assert_eq!(registry.phase(&a).await.unwrap(), SessionPhase::Connected);

        assert!(registry.destroy_peer(&a).await.is_some());
        assert!(!registry.contains(&a).await);
        assert!(registry.contains(&b).await);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let registry = SessionRegistry::new();
        let id = SessionId::new();

        assert_eq!(
            registry.producers(&id).await,
            Err(RegistryError::PeerNotFound(id))
        );
        assert_eq!(
            registry.acquire_port(&id).await,
            Err(RegistryError::PeerNotFound(id))
        );
        assert_eq!(registry.ports().leased_count(), 0);
        assert!(registry.destroy_peer(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_transport_lookup() {
        let registry = SessionRegistry::new();
        let id = registry.create_peer().await;

        registry
            .add_transport(&id, transport("t1", TransportKind::WebRtc))
            .await
            .unwrap();

        assert_eq!(registry.get_transport(&id, "t1").await.unwrap().id, "t1");
        assert_eq!(
            registry.get_transport(&id, "t2").await,
            Err(RegistryError::TransportNotFound("t2".into()))
        );
        assert_eq!(registry.phase(&id).await.unwrap(), SessionPhase::Negotiating);
    }

    #[tokio::test]
    async fn test_producers_in_order() {
        let registry = SessionRegistry::new();
        let id = registry.create_peer().await;

        for (pid, kind) in [("a", MediaKind::Audio), ("v", MediaKind::Video)] {
            registry
                .add_producer(&id, ProducerInfo { id: pid.into(), kind })
                .await
                .unwrap();
        }

        let ids: Vec<_> = registry
            .producers(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["a", "v"]);
    }

    #[tokio::test]
    async fn test_stop_without_recording() {
        let registry = SessionRegistry::new();
        let id = registry.create_peer().await;

        assert_eq!(
            registry.stop_recording(&id).await,
            Err(RegistryError::NotRecording(id))
        );
    }

    #[tokio::test]
    async fn test_abort_releases_ports() {
        let registry = registry(30000, 30001);
        let id = registry.create_peer().await;

        registry.acquire_port(&id).await.unwrap();
        registry.acquire_port(&id).await.unwrap();
        assert_eq!(
            registry.acquire_port(&id).await,
            Err(RegistryError::Port(PortError::Exhausted {
                min: 30000,
                max: 30001
            }))
        );

        let teardown = registry.abort_recording(&id).await.unwrap();
        assert_eq!(teardown.released_ports, vec![30000, 30001]);
        assert!(!teardown.killed);
        assert_eq!(registry.ports().leased_count(), 0);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::process::{spawn_chain, StageSpec};

        fn sleeper() -> SupervisedProcess {
            spawn_chain(vec![StageSpec::new("transcoder", "sleep").args(["30"])]).unwrap()
        }

        #[tokio::test]
        async fn test_destroy_twice_releases_once() {
            let registry = registry(40000, 40009);
            let id = registry.create_peer().await;

            registry
                .add_transport(&id, transport("client", TransportKind::WebRtc))
                .await
                .unwrap();
            registry
                .add_transport(&id, transport("plain", TransportKind::Plain))
                .await
                .unwrap();
            let rtp = registry.acquire_port(&id).await.unwrap();
            let rtcp = registry.acquire_port(&id).await.unwrap();
            registry.begin_recording(&id, sleeper()).await.unwrap();
            assert_eq!(registry.ports().leased_count(), 2);

            let first = registry.destroy_peer(&id).await.unwrap();
            assert_eq!(first.released_ports, vec![rtp, rtcp]);
            assert!(first.killed);
            assert_eq!(first.transport_ids.len(), 2);
            assert_eq!(registry.ports().leased_count(), 0);

            assert!(registry.destroy_peer(&id).await.is_none());
            assert_eq!(registry.ports().leased_count(), 0);
            assert!(!registry.ports().is_leased(rtp));
        }

        #[tokio::test]
        async fn test_recording_cycle() {
            let registry = registry(40010, 40019);
            let id = registry.create_peer().await;

            registry.acquire_port(&id).await.unwrap();
            let first = registry.begin_recording(&id, sleeper()).await.unwrap();
            assert_eq!(registry.phase(&id).await.unwrap(), SessionPhase::Recording);
            assert!(registry.recording_consumers(&id, first).await.is_some());

            assert!(matches!(
                registry.begin_recording(&id, sleeper()).await,
                Err(RegistryError::AlreadyRecording(_))
            ));

            let teardown = registry.stop_recording(&id).await.unwrap();
            assert!(teardown.killed);
            assert_eq!(registry.ports().leased_count(), 0);
            assert_eq!(registry.phase(&id).await.unwrap(), SessionPhase::Negotiating);

            // A stale settle task must not see the next recording as its own
            assert!(registry.recording_consumers(&id, first).await.is_none());
            let second = registry.begin_recording(&id, sleeper()).await.unwrap();
            assert!(second > first);
            assert!(registry.recording_consumers(&id, first).await.is_none());
            assert!(registry.recording_consumers(&id, second).await.is_some());

            let teardown = registry.destroy_peer(&id).await.unwrap();
            assert!(teardown.killed);
        }
    }
}
