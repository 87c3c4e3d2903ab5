//! Process chain supervision
//!
//! Each stage gets a monitor task that owns its `Child`. The monitor waits for
//! either the process to exit or an interrupt request; on exit it interrupts
//! the next stage in the chain. Output pipes are drained by their own tasks so
//! a chatty transcoder never blocks on a full stderr pipe.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Notify};

use super::sdp::MediaDescription;
use super::sink::{SinkConfig, SinkMode, StageSpec};
use super::ProcessError;

/// Lifecycle of a supervised chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawning stages
    Starting,
    /// Every stage spawned
    Running,
    /// Interrupt sent, waiting for exits
    Closing,
    /// Every stage has exited
    Closed,
}

/// Spawns process chains for recordings
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    sink: SinkConfig,
}

impl ProcessSupervisor {
    pub fn new(sink: SinkConfig) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &SinkConfig {
        &self.sink
    }

    /// Start the chain that records `media`
    pub async fn start(&self, media: &MediaDescription) -> Result<SupervisedProcess, ProcessError> {
        let stages = self.sink.stages(media)?;

        if self.sink.mode == SinkMode::File {
            tokio::fs::create_dir_all(&self.sink.record_dir)
                .await
                .map_err(|source| ProcessError::OutputDir {
                    path: self.sink.record_dir.display().to_string(),
                    source,
                })?;
        }

        let process = spawn_chain(stages)?;

        tracing::info!(
            mode = %self.sink.mode,
            file = %media.file_name,
            pids = ?process.pids(),
            "Recording process started"
        );

        Ok(process)
    }
}

struct Shared {
    state: watch::Sender<ProcessState>,
    running: AtomicUsize,
}

impl Shared {
    fn stage_exited(&self) {
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.send_replace(ProcessState::Closed);
        }
    }
}

struct StageHandle {
    stage: &'static str,
    pid: Option<u32>,
    interrupt: Arc<Notify>,
}

/// Handle to a running chain
///
/// Dropping the handle interrupts the chain.
pub struct SupervisedProcess {
    stages: Vec<StageHandle>,
    shared: Arc<Shared>,
    state: watch::Receiver<ProcessState>,
    killed: AtomicBool,
}

impl std::fmt::Debug for SupervisedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisedProcess")
            .field("pids", &self.pids())
            .field("state", &self.state())
            .finish()
    }
}

impl SupervisedProcess {
    /// Pids of the stages, in chain order
    pub fn pids(&self) -> Vec<u32> {
        self.stages.iter().filter_map(|stage| stage.pid).collect()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Whether `kill` has been called
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Interrupt every stage
    ///
    /// Only the first call sends signals; returns whether this call did.
    /// Does not wait for the stages to exit, see [`wait_closed`](Self::wait_closed).
    pub fn kill(&self) -> bool {
        if self.killed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.shared.state.send_if_modified(|state| {
            if *state == ProcessState::Closed {
                return false;
            }
            *state = ProcessState::Closing;
            true
        });

        for stage in &self.stages {
            tracing::debug!(stage = stage.stage, pid = ?stage.pid, "Interrupting stage");
            stage.interrupt.notify_one();
        }
        true
    }

    /// Wait up to `timeout` for every stage to exit
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        let closed = matches!(
            tokio::time::timeout(timeout, state.wait_for(|s| *s == ProcessState::Closed)).await,
            Ok(Ok(_))
        );
        closed
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Spawn `stages` as a pipeline
///
/// The first stage receives its `input` on stdin; every later stage reads the
/// previous stage's stdout. If any stage fails to spawn, the ones already
/// started are killed.
pub fn spawn_chain(stages: Vec<StageSpec>) -> Result<SupervisedProcess, ProcessError> {
    if stages.is_empty() {
        return Err(ProcessError::EmptyChain);
    }

    let mut spawned = Vec::with_capacity(stages.len());
    for (index, spec) in stages.into_iter().enumerate() {
        let stdin = if index > 0 || spec.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                stage: spec.stage,
                program: spec.program.display().to_string(),
                source,
            })?;

        tracing::debug!(stage = spec.stage, pid = ?child.id(), program = %spec.program.display(), "Stage spawned");
        spawned.push((spec, child));
    }

    let (state_tx, state_rx) = watch::channel(ProcessState::Starting);
    let shared = Arc::new(Shared {
        state: state_tx,
        running: AtomicUsize::new(spawned.len()),
    });

    let interrupts: Vec<Arc<Notify>> = spawned.iter().map(|_| Arc::new(Notify::new())).collect();
    let last = spawned.len() - 1;
    let mut handles = Vec::with_capacity(spawned.len());
    let mut upstream: Option<ChildStdout> = None;

    for (index, (spec, mut child)) in spawned.into_iter().enumerate() {
        let pid = child.id();

        match (upstream.take(), child.stdin.take()) {
            (Some(from), Some(to)) => {
                tokio::spawn(pump(spec.stage, from, to));
            }
            (None, Some(stdin)) => {
                if let Some(input) = spec.input.clone() {
                    tokio::spawn(feed(spec.stage, stdin, input));
                }
            }
            _ => {}
        }

        if let Some(stdout) = child.stdout.take() {
            if index < last {
                upstream = Some(stdout);
            } else {
                tokio::spawn(log_lines(spec.stage, "stdout", pid, stdout));
            }
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_lines(spec.stage, "stderr", pid, stderr));
        }

        tokio::spawn(monitor(
            spec.stage,
            child,
            interrupts[index].clone(),
            interrupts.get(index + 1).cloned(),
            shared.clone(),
        ));

        handles.push(StageHandle {
            stage: spec.stage,
            pid,
            interrupt: interrupts[index].clone(),
        });
    }

    shared.state.send_if_modified(|state| {
        if *state != ProcessState::Starting {
            return false;
        }
        *state = ProcessState::Running;
        true
    });

    Ok(SupervisedProcess {
        stages: handles,
        shared,
        state: state_rx,
        killed: AtomicBool::new(false),
    })
}

async fn monitor(
    stage: &'static str,
    mut child: Child,
    interrupt: Arc<Notify>,
    downstream: Option<Arc<Notify>>,
    shared: Arc<Shared>,
) {
    let pid = child.id();

    let status = tokio::select! {
        status = child.wait() => status,
        _ = interrupt.notified() => {
            send_interrupt(&mut child, stage);
            child.wait().await
        }
    };

    match status {
        Ok(status) => tracing::info!(stage = stage, pid = ?pid, status = %status, "Stage exited"),
        Err(e) => tracing::warn!(stage = stage, pid = ?pid, error = %e, "Failed to wait for stage"),
    }

    if let Some(next) = downstream {
        next.notify_one();
    }
    shared.stage_exited();
}

#[cfg(unix)]
fn send_interrupt(child: &mut Child, stage: &'static str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        tracing::warn!(stage = stage, pid = pid, error = %e, "Failed to send SIGINT");
    }
}

#[cfg(not(unix))]
fn send_interrupt(child: &mut Child, stage: &'static str) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(stage = stage, pid = ?child.id(), error = %e, "Failed to kill stage");
    }
}

/// Write `input` to a stage's stdin, then close it
async fn feed(stage: &'static str, mut stdin: ChildStdin, input: bytes::Bytes) {
    if let Err(e) = stdin.write_all(&input).await {
        tracing::warn!(stage = stage, error = %e, "Failed to write stage input");
        return;
    }
    if let Err(e) = stdin.shutdown().await {
        tracing::debug!(stage = stage, error = %e, "Failed to close stage input");
    }
}

/// Copy one stage's stdout into the next stage's stdin
async fn pump(stage: &'static str, mut from: ChildStdout, mut to: ChildStdin) {
    match tokio::io::copy(&mut from, &mut to).await {
        Ok(bytes) => tracing::debug!(stage = stage, bytes = bytes, "Pipe closed"),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            tracing::warn!(stage = stage, "Downstream stage closed its input");
            drop(to);
            // Keep reading so the upstream stage does not block on a full pipe
            let _ = tokio::io::copy(&mut from, &mut tokio::io::sink()).await;
        }
        Err(e) => tracing::warn!(stage = stage, error = %e, "Pipe failed"),
    }
}

async fn log_lines<R>(stage: &'static str, stream: &'static str, pid: Option<u32>, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                tracing::debug!(stage = stage, stream = stream, pid = ?pid, "{}", text.trim_end());
            }
            Err(e) => {
                tracing::debug!(stage = stage, stream = stream, error = %e, "Output read failed");
                break;
            }
        }
    }
}
