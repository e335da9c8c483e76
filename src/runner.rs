#![forbid(unsafe_code)]

//! Subprocess runner for the fetch tool.
//!
//! [`spawn`] starts the process and hands back a [`ProcessHandle`]. A watcher
//! task pushes output chunks and, last, a single [`ProcessEvent::Exited`] into
//! the handle's channel. Dropping the handle kills the process.

use std::{
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{FetchError, Result};

const EVENT_BUFFER: usize = 64;
const READ_BUFFER: usize = 8 * 1024;
/// Grace period for output pumps after the process itself has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Used in log lines only.
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub killed: bool,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.timed_out && !self.killed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { stream: OutputStream, chunk: String },
    Exited(ProcessExit),
}

pub struct ProcessHandle {
    events: mpsc::Receiver<ProcessEvent>,
    /// Kill switch shared with the watcher task.
    cancel: CancellationToken,
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Next event, or `None` once the exit event has been delivered.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }

    /// Safe to call any number of times, before or after exit.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn spawn(spec: CommandSpec) -> Result<ProcessHandle> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|err| {
        FetchError::ProcessFailure(format!("launching {}: {err}", spec.program.display()))
    })?;
    let pid = child.id();
    debug!(label = %spec.label, pid, "spawned fetch process");

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let token = CancellationToken::new();
    let pumps = [
        spawn_pump(child.stdout.take(), OutputStream::Stdout, &tx, &spec.label),
        spawn_pump(child.stderr.take(), OutputStream::Stderr, &tx, &spec.label),
    ];

    tokio::spawn(watch(child, pumps, tx, token.clone(), spec));

    Ok(ProcessHandle {
        events: rx,
        cancel: token,
        pid,
    })
}

async fn watch(
    mut child: Child,
    pumps: [Option<JoinHandle<()>>; 2],
    tx: mpsc::Sender<ProcessEvent>,
    token: CancellationToken,
    spec: CommandSpec,
) {
    let mut timed_out = false;
    let mut killed = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = token.cancelled() => {
            killed = true;
            terminate(&mut child).await
        }
        _ = tokio::time::sleep(spec.timeout) => {
            timed_out = true;
            warn!(
                label = %spec.label,
                timeout_secs = spec.timeout.as_secs(),
                "fetch process timed out, killing"
            );
            terminate(&mut child).await
        }
    };

    // Output always precedes the exit event. Pumps of a killed process are cut
    // short; grandchildren may keep the pipes open otherwise.
    for pump in pumps.into_iter().flatten() {
        if killed || timed_out {
            pump.abort();
        } else if tokio::time::timeout(DRAIN_GRACE, pump).await.is_err() {
            debug!(label = %spec.label, "output pump did not drain in time");
        }
    }

    let exit = match status {
        Ok(status) => exit_from_status(status, timed_out, killed),
        Err(err) => {
            warn!(label = %spec.label, "waiting for fetch process failed: {err}");
            ProcessExit {
                code: None,
                signal: None,
                timed_out,
                killed,
            }
        }
    };
    debug!(label = %spec.label, ?exit, "fetch process finished");
    let _ = tx.send(ProcessEvent::Exited(exit)).await;
}

async fn terminate(child: &mut Child) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Ok(raw) = i32::try_from(pid) {
            // The process leads its own group; take ffmpeg helpers down with it.
            let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
        }
    }
    if let Err(err) = child.start_kill() {
        debug!("start_kill after exit: {err}");
    }
    child.wait().await
}

fn exit_from_status(status: ExitStatus, timed_out: bool, killed: bool) -> ProcessExit {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;
    ProcessExit {
        code: status.code(),
        signal,
        timed_out,
        killed,
    }
}

fn spawn_pump<R>(
    reader: Option<R>,
    stream: OutputStream,
    tx: &mpsc::Sender<ProcessEvent>,
    label: &str,
) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    reader.map(|reader| tokio::spawn(pump(reader, stream, tx.clone(), label.to_string())))
}

async fn pump<R>(
    mut reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<ProcessEvent>,
    label: String,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER];
    let mut lines = LineBuffer::default();
    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                debug!(%label, ?stream, "reading process output failed: {err}");
                break;
            }
        };
        if let Some(chunk) = lines.push(&buf[..read])
            && !forward(&tx, stream, chunk, &label).await
        {
            return;
        }
    }
    if let Some(rest) = lines.finish() {
        forward(&tx, stream, rest, &label).await;
    }
}

async fn forward(
    tx: &mpsc::Sender<ProcessEvent>,
    stream: OutputStream,
    chunk: String,
    label: &str,
) -> bool {
    if stream == OutputStream::Stderr {
        for line in chunk.lines().filter(|line| !line.trim().is_empty()) {
            debug!(target: "ytdlp_stderr", %label, "{line}");
        }
    }
    tx.send(ProcessEvent::Output { stream, chunk }).await.is_ok()
}

/// Re-chunks raw reads on line boundaries (`\n` or `\r`) so a progress line is
/// never split between two chunks.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let end = self
            .pending
            .iter()
            .rposition(|b| *b == b'\n' || *b == b'\r')?;
        let complete: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&complete).replace('\r', "\n"))
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
