//! Read frames from a serial device and save each payload as a file
//!
//! The counterpart of `frame-sink`, used to check a serial link end to end.
//! Frames are written to `<output>/frame_<n>.yuv`. When the device goes away
//! or reaches EOF it is reopened after a short pause. With `--snapshot-every`
//! every Nth frame is also converted to a JPEG next to it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use clap::Parser;
use futures_util::StreamExt;
use tokio::fs::File;
use tokio::process::Command;
use tokio_util::codec::FramedRead;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use rtc_recorder::protocol::FrameReassembler;

const REOPEN_DELAY: Duration = Duration::from_secs(3);

/// Read size for the device
const READ_CAPACITY: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(name = "frame-recv", version, about = "Save frames received on a serial device")]
struct Args {
    /// Device to read frames from
    #[arg(long, env = "SERIAL_DEVICE", default_value = "/tmp/vserial2")]
    device: PathBuf,

    /// Directory the frames are written to
    #[arg(long, env = "OUTPUT_DIR", default_value = "received_frames")]
    output: PathBuf,

    /// Treat markers declaring larger frames as noise
    #[arg(long)]
    max_frame_len: Option<usize>,

    /// Convert every Nth frame to JPEG (0 = never)
    #[arg(long, default_value_t = 0)]
    snapshot_every: u64,

    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    ffmpeg_path: PathBuf,

    /// Frame width for snapshots
    #[arg(long, default_value_t = 320)]
    width: u32,

    /// Frame height for snapshots
    #[arg(long, default_value_t = 240)]
    height: u32,
}

impl Args {
    fn wants_snapshot(&self, index: u64) -> bool {
        self.snapshot_every > 0 && index % self.snapshot_every == 0
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .init();

    let args = Args::parse();
    tokio::fs::create_dir_all(&args.output).await?;

    tracing::info!(device = %args.device.display(), output = %args.output.display(), "Receiver started");

    let mut saved = 0u64;
    tokio::select! {
        result = receive_forever(&args, &mut saved) => result?,
        _ = tokio::signal::ctrl_c() => {}
    }

    tracing::info!(frames = saved, "Receiver stopped");
    Ok(())
}

async fn receive_forever(args: &Args, saved: &mut u64) -> std::io::Result<()> {
    loop {
        match File::open(&args.device).await {
            Ok(device) => {
                tracing::info!(device = %args.device.display(), "Device opened");
                let decoder = match args.max_frame_len {
                    Some(max) => FrameReassembler::with_max_frame_len(max),
                    None => FrameReassembler::new(),
                };
                let mut frames = FramedRead::with_capacity(device, decoder, READ_CAPACITY);

                while let Some(frame) = frames.next().await {
                    match frame {
                        Ok(payload) => {
                            let path = frame_path(&args.output, *saved);
                            tokio::fs::write(&path, &payload).await?;
                            tracing::info!(frame = *saved, bytes = payload.len(), "Saved frame");
                            if args.wants_snapshot(*saved) {
                                snapshot(args, &path).await;
                            }
                            *saved += 1;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Device read failed");
                            break;
                        }
                    }
                }
                tracing::info!("Device closed, reopening");
            }
            Err(e) => {
                tracing::warn!(device = %args.device.display(), error = %e, "Failed to open device");
            }
        }

        tokio::time::sleep(REOPEN_DELAY).await;
    }
}

fn frame_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("frame_{}.yuv", index))
}

fn snapshot_args(raw: &Path, jpeg: &Path, width: u32, height: u32) -> Vec<String> {
    vec![
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pixel_format".into(),
        "yuv420p".into(),
        "-video_size".into(),
        format!("{}x{}", width, height),
        "-i".into(),
        raw.display().to_string(),
        jpeg.display().to_string(),
    ]
}

/// Convert one raw frame to JPEG; failures are logged and ignored
async fn snapshot(args: &Args, raw: &Path) {
    let jpeg = raw.with_extension("jpg");
    let status = Command::new(&args.ffmpeg_path)
        .args(snapshot_args(raw, &jpeg, args.width, args.height))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => {
            tracing::info!(path = %jpeg.display(), "Saved snapshot");
        }
        Ok(status) => tracing::warn!(status = %status, "Snapshot conversion failed"),
        Err(e) => tracing::warn!(error = %e, "Failed to run ffmpeg for snapshot"),
    }
}
