//! Frame stdin onto a serial device
//!
//! Spawned by the recorder behind the transcoder in serial mode. Each read
//! from stdin becomes one `AA BB CC DD | len | payload` frame on the device.

use std::path::PathBuf;

use clap::Parser;
use tokio::fs::OpenOptions;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use rtc_recorder::process::run_frame_sink;

#[derive(Parser, Debug)]
#[command(name = "frame-sink", version, about = "Frame stdin onto a serial device")]
struct Args {
    /// Device to write frames to
    #[arg(long, env = "SERIAL_DEVICE", default_value = "/dev/ttyACM0")]
    device: PathBuf,

    /// Nominal line rate; USB gadget serial ignores it
    #[arg(long, env = "SERIAL_BAUD_RATE", default_value_t = 921_600)]
    baud_rate: u32,

    /// Maximum bytes read from stdin per frame
    #[arg(long, env = "BUFFER_SIZE", default_value_t = 4096)]
    buffer_size: usize,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let device = OpenOptions::new()
        .write(true)
        .open(&args.device)
        .await
        .inspect_err(|e| {
            tracing::error!(device = %args.device.display(), error = %e, "Failed to open device")
        })?;

    tracing::info!(
        device = %args.device.display(),
        baud_rate = args.baud_rate,
        buffer_size = args.buffer_size,
        "Framing stdin onto device"
    );

    tokio::select! {
        result = run_frame_sink(tokio::io::stdin(), device, args.buffer_size) => {
            let stats = result.inspect_err(|e| tracing::error!(error = %e, "stdin read failed"))?;
            tracing::info!(
                frames = stats.frames,
                bytes = stats.bytes,
                write_errors = stats.write_errors,
                "Input stream ended"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    Ok(())
}
