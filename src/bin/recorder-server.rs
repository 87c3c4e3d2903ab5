//! Signaling and recording server
//!
//! Every flag can also be given through the environment variable named in
//! `--help`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use rtc_recorder::engine::{MediaEngine, MemoryEngine};
use rtc_recorder::process::SinkMode;
use rtc_recorder::{RecorderServer, ServerConfig};

/// Delay before a failed startup exits the process
const FATAL_EXIT_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "recorder-server", version, about = "WebSocket signaling and RTP recording server")]
struct Args {
    /// Port the WebSocket server listens on
    #[arg(short, long, env = "SERVER_PORT", default_value_t = 3000)]
    port: u16,

    /// Address the WebSocket server binds to
    #[arg(long, env = "BIND_ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Recording sink: file, socket or serial (PROCESS_NAME is also read)
    #[arg(long, env = "SINK_MODE")]
    sink_mode: Option<SinkMode>,

    /// Directory for file recordings
    #[arg(long, env = "RECORD_DIR", default_value = "./files")]
    record_dir: PathBuf,

    /// Target of the socket sink
    #[arg(long, env = "SINK_UDP_TARGET", default_value = "127.0.0.1:5004")]
    udp_target: SocketAddr,

    /// Serial device written by the framer
    #[arg(long, env = "SERIAL_DEVICE", default_value = "/dev/ttyACM0")]
    serial_device: PathBuf,

    #[arg(long, env = "SERIAL_BAUD_RATE", default_value_t = 921_600)]
    serial_baud_rate: u32,

    /// Framer read size in bytes
    #[arg(long, env = "BUFFER_SIZE", default_value_t = 4096)]
    buffer_size: usize,

    /// Lowest port leased to recordings
    #[arg(long, env = "RTP_PORT_MIN", default_value_t = 20000)]
    rtp_port_min: u16,

    /// Highest port leased to recordings
    #[arg(long, env = "RTP_PORT_MAX", default_value_t = 30000)]
    rtp_port_max: u16,

    /// Skip ports that cannot be bound locally
    #[arg(long, env = "PROBE_PORTS")]
    probe_ports: bool,

    /// Delay before recording consumers are resumed
    #[arg(long, env = "SETTLE_DELAY_MS", default_value_t = 1000)]
    settle_delay_ms: u64,

    /// Share one port between RTP and RTCP
    #[arg(long, env = "RTCP_MUX")]
    rtcp_mux: bool,

    /// Answer failed requests with an error envelope
    #[arg(long, env = "ERROR_RESPONSES")]
    error_responses: bool,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 0)]
    max_connections: usize,

    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    ffmpeg_path: PathBuf,

    /// Framer helper binary, defaults to the `frame-sink` next to this one
    #[arg(long, env = "FRAME_SINK_PATH")]
    frame_sink_path: Option<PathBuf>,
}

impl Args {
    fn sink_mode(&self) -> Result<SinkMode, String> {
        if let Some(mode) = self.sink_mode {
            return Ok(mode);
        }
        match std::env::var("PROCESS_NAME") {
            Ok(name) => name.parse(),
            Err(_) => Ok(SinkMode::File),
        }
    }

    fn server_config(&self) -> Result<ServerConfig, String> {
        let mut config = ServerConfig::default()
            .bind(SocketAddr::new(self.bind, self.port))
            .max_connections(self.max_connections)
            .port_range(self.rtp_port_min, self.rtp_port_max)
            .probe_ports(self.probe_ports)
            .sink_mode(self.sink_mode()?)
            .record_dir(&self.record_dir)
            .ffmpeg_path(&self.ffmpeg_path)
            .settle_delay(Duration::from_millis(self.settle_delay_ms))
            .rtcp_mux(self.rtcp_mux)
            .error_responses(self.error_responses);

        config.sink.udp_target = self.udp_target;
        config.sink.serial.device = self.serial_device.clone();
        config.sink.serial.baud_rate = self.serial_baud_rate;
        config.sink.serial.buffer_size = self.buffer_size;
        if let Some(path) = &self.frame_sink_path {
            config.sink.serial.frame_sink_path = path.clone();
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "Failed to start, exiting in 2 seconds");
        tokio::time::sleep(FATAL_EXIT_DELAY).await;
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.server_config()?;

    tracing::info!(
        addr = %config.bind_addr,
        mode = %config.sink.mode,
        port_min = config.port_range.min,
        port_max = config.port_range.max,
        "Starting recorder server"
    );

    // No SFU binding is linked into this binary; negotiation is bookkept only.
    tracing::warn!("Using the in-memory media engine, no RTP will flow");
    let engine: Arc<dyn MediaEngine> = Arc::new(MemoryEngine::new());

    let server = RecorderServer::new(config, engine).await?;
    server.run_until(shutdown_signal()).await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
