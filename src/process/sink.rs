//! Sink modes and process chain construction

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytes::Bytes;

use super::sdp::{create_sdp_text, MediaDescription};
use super::ProcessError;

/// Where the transcoded stream goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkMode {
    /// Container file in the recording directory
    File,
    /// Matroska stream to a UDP target
    Socket,
    /// Raw video frames over a serial device
    Serial,
}

impl FromStr for SinkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "ffmpeg" => Ok(SinkMode::File),
            "socket" | "udp" => Ok(SinkMode::Socket),
            "serial" | "serialstreamer" => Ok(SinkMode::Serial),
            other => Err(format!("unknown sink mode: {}", other)),
        }
    }
}

impl std::fmt::Display for SinkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SinkMode::File => "file",
            SinkMode::Socket => "socket",
            SinkMode::Serial => "serial",
        })
    }
}

/// Serial sink settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSinkConfig {
    /// Device the framer writes to
    pub device: PathBuf,
    /// Line rate hint passed to the framer
    pub baud_rate: u32,
    /// Read size for the framer's input
    pub buffer_size: usize,
    /// Helper binary that frames stdin onto the device
    pub frame_sink_path: PathBuf,
    /// Output frame width
    pub width: u32,
    /// Output frame height
    pub height: u32,
}

impl Default for SerialSinkConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/ttyACM0"),
            baud_rate: 921_600,
            buffer_size: 4096,
            frame_sink_path: default_frame_sink_path(),
            width: 320,
            height: 240,
        }
    }
}

/// Prefer a `frame-sink` next to the running executable
fn default_frame_sink_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("frame-sink")))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from("frame-sink"))
}

/// Sink configuration shared by every recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub mode: SinkMode,
    /// Transcoder executable
    pub ffmpeg_path: PathBuf,
    /// Directory for file recordings
    pub record_dir: PathBuf,
    /// Target for socket mode
    pub udp_target: SocketAddr,
    pub serial: SerialSinkConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            mode: SinkMode::File,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            record_dir: PathBuf::from("./files"),
            udp_target: SocketAddr::from(([127, 0, 0, 1], 5004)),
            serial: SerialSinkConfig::default(),
        }
    }
}

/// One process in a chain
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    /// Name used in logs
    pub stage: &'static str,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Bytes written to stdin before it is closed
    pub input: Option<Bytes>,
}

impl StageSpec {
    pub fn new(stage: &'static str, program: impl Into<PathBuf>) -> Self {
        Self {
            stage,
            program: program.into(),
            args: Vec::new(),
            input: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, input: impl Into<Bytes>) -> Self {
        self.input = Some(input.into());
        self
    }
}

impl SinkConfig {
    /// File a recording of `media` is written to, in file mode
    pub fn output_path(&self, media: &MediaDescription) -> Option<PathBuf> {
        match self.mode {
            SinkMode::File => Some(self.record_dir.join(format!("{}.webm", media.file_name))),
            SinkMode::Socket | SinkMode::Serial => None,
        }
    }

    /// Build the process chain for `media`
    pub fn stages(&self, media: &MediaDescription) -> Result<Vec<StageSpec>, ProcessError> {
        if media.streams.is_empty() {
            return Err(ProcessError::InvalidMedia("no media streams".into()));
        }
        let sdp = create_sdp_text(media)?;

        let mut args: Vec<String> = [
            "-loglevel",
            "debug",
            "-protocol_whitelist",
            "pipe,udp,rtp",
            "-fflags",
            "+genpts",
            "-f",
            "sdp",
            "-i",
            "pipe:0",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();

        match self.mode {
            SinkMode::File | SinkMode::Socket => {
                if media.has_video() {
                    args.extend(["-map", "0:v:0", "-c:v", "copy"].map(String::from));
                }
                if media.has_audio() {
                    args.extend(["-map", "0:a:0", "-strict", "-2", "-c:a", "copy"].map(String::from));
                }
                args.extend(["-flags", "+global_header"].map(String::from));

                match self.output_path(media) {
                    Some(path) => {
                        args.push("-y".into());
                        args.push(path_arg(&path));
                    }
                    None => {
                        args.extend(["-f", "matroska"].map(String::from));
                        args.push(format!("udp://{}", self.udp_target));
                    }
                }

                Ok(vec![StageSpec::new("transcoder", &self.ffmpeg_path)
                    .args(args)
                    .input(sdp)])
            }
            SinkMode::Serial => {
                if !media.has_video() {
                    return Err(ProcessError::InvalidMedia(
                        "serial sink needs a video stream".into(),
                    ));
                }
                let serial = &self.serial;
                args.extend(["-map", "0:v:0", "-vf"].map(String::from));
                args.push(format!("scale={}:{}", serial.width, serial.height));
                args.extend(["-pix_fmt", "yuv420p", "-f", "rawvideo", "-"].map(String::from));

                let framer = StageSpec::new("framer", &serial.frame_sink_path).args([
                    "--device".to_string(),
                    path_arg(&serial.device),
                    "--baud-rate".to_string(),
                    serial.baud_rate.to_string(),
                    "--buffer-size".to_string(),
                    serial.buffer_size.to_string(),
                ]);

                Ok(vec![
                    StageSpec::new("transcoder", &self.ffmpeg_path)
                        .args(args)
                        .input(sdp),
                    framer,
                ])
            }
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
