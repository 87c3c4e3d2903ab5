//! Server configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::port::PortRange;
use crate::process::{SinkConfig, SinkMode};
use crate::signaling::GatewayConfig;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Enable TCP_NODELAY on accepted sockets
    pub tcp_nodelay: bool,

    /// Ports leased to recording processes
    pub port_range: PortRange,

    /// Skip pool ports that cannot be bound locally
    pub probe_ports: bool,

    /// Where recordings go
    pub sink: SinkConfig,

    /// Request handling behaviour
    pub gateway: GatewayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            max_connections: 0, // Unlimited
            tcp_nodelay: true,
            port_range: PortRange::default(),
            probe_ports: false,
            sink: SinkConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the recording port range
    pub fn port_range(mut self, min: u16, max: u16) -> Self {
        self.port_range = PortRange::new(min, max);
        self
    }

    /// Probe ports with a UDP bind before leasing them
    pub fn probe_ports(mut self, enabled: bool) -> Self {
        self.probe_ports = enabled;
        self
    }

    /// Set the sink mode
    pub fn sink_mode(mut self, mode: SinkMode) -> Self {
        self.sink.mode = mode;
        self
    }

    /// Set the recording directory
    pub fn record_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sink.record_dir = dir.into();
        self
    }

    /// Set the transcoder executable
    pub fn ffmpeg_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sink.ffmpeg_path = path.into();
        self
    }

    /// Set the delay before consumers of a new recording are resumed
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.gateway.settle_delay = delay;
        self
    }

    /// Multiplex RTP and RTCP on one port per stream
    pub fn rtcp_mux(mut self, enabled: bool) -> Self {
        self.gateway.plain_transport.rtcp_mux = enabled;
        self
    }

    /// Reply to failed requests with an error envelope
    pub fn error_responses(mut self, enabled: bool) -> Self {
        self.gateway.error_responses = enabled;
        self
    }
}
