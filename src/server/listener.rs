//! Recorder server listener
//!
//! Handles the TCP accept loop and spawns a connection task per client.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::engine::MediaEngine;
use crate::error::Result;
use crate::port::PortAllocator;
use crate::process::ProcessSupervisor;
use crate::registry::SessionRegistry;
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::signaling::SignalingGateway;

/// Signaling and recording server
pub struct RecorderServer {
    config: ServerConfig,
    gateway: Arc<SignalingGateway>,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl RecorderServer {
    /// Initialize `engine`, create its router and build the server
    ///
    /// Fails if the engine cannot be brought up; nothing can be served then.
    pub async fn new(config: ServerConfig, engine: Arc<dyn MediaEngine>) -> Result<Self> {
        engine.initialize().await?;
        let router = engine.create_router().await?;

        let ports =
            Arc::new(PortAllocator::new(config.port_range).with_udp_probe(config.probe_ports));
        let registry = Arc::new(SessionRegistry::with_ports(ports));
        let supervisor = ProcessSupervisor::new(config.sink.clone());
        let gateway = Arc::new(SignalingGateway::new(
            registry,
            engine,
            router,
            supervisor,
            config.gateway.clone(),
        ));

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Ok(Self {
            config,
            gateway,
            connection_semaphore,
        })
    }

    /// Get a reference to the session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.gateway.registry()
    }

    pub fn gateway(&self) -> &Arc<SignalingGateway> {
        &self.gateway
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, mode = %self.config.sink.mode, "Recorder server listening");

        self.accept_loop(&listener).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn run_with_listener<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tracing::info!(addr = ?listener.local_addr().ok(), mode = %self.config.sink.mode, "Recorder server listening");

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let permit = match self
            .connection_semaphore
            .as_ref()
            .map(|limit| Arc::clone(limit).try_acquire_owned())
        {
            Some(Err(_)) => {
                tracing::warn!(peer = %peer_addr, "Session refused, connection limit reached");
                return;
            }
            Some(Ok(permit)) => Some(permit),
            None => None,
        };

        tracing::debug!(peer = %peer_addr, "New connection");

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let connection = Connection::new(Arc::clone(&self.gateway), peer_addr);

        tokio::spawn(async move {
            let _permit = permit;

            if let Err(e) = connection.run(socket).await {
                tracing::debug!(
                    peer = %peer_addr,
                    error = %e,
                    "Connection error"
                );
            }

            tracing::debug!(peer = %peer_addr, "Connection closed");
        });
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;

    #[tokio::test]
    async fn test_engine_initialization_failure() {
        let engine = MemoryEngine::new();
        engine.fail_operation("initialize");

        let result = RecorderServer::new(ServerConfig::default(), Arc::new(engine)).await;

        assert!(matches!(result, Err(crate::Error::Engine(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let server = RecorderServer::new(ServerConfig::default(), Arc::new(MemoryEngine::new()))
            .await
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let result = server.run_with_listener(listener, async {}).await;

        assert!(result.is_ok());
        assert_eq!(server.registry().peer_count().await, 0);
    }
}
