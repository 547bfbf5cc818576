//! Transport: owns a child process and its three standard streams.
//!
//! Each stream gets its own task: a writer fed by a bounded channel (so
//! concurrent sends never interleave), a stdout reader producing frames, and
//! a stderr drain. [`Transport`] keeps the write side and the process;
//! [`Inbound`] hands the read side to whoever pumps incoming frames.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::OnceLock;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{Frame, FrameReader, FrameWriter};
use crate::config::ServerConfig;
use crate::error::{LspError, is_closed_pipe};

const WRITER_CHANNEL_CAPACITY: usize = 64;

const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Longer stderr lines are delivered in pieces of at most this many bytes.
pub const MAX_STDERR_LINE_BYTES: u64 = 64 * 1024;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Terminating,
    Exited,
}

enum WriterCommand {
    Send {
        frame: Frame,
        ack: oneshot::Sender<io::Result<()>>,
    },
    Close,
}

/// Outcome of a bounded frame read. A timeout is an expected result, not an
/// error.
#[derive(Debug)]
pub enum Received {
    Frame(Frame),
    Timeout,
}

/// Something that arrived on the child's output streams.
#[derive(Debug)]
pub enum InboundEvent {
    Frame(Result<Frame, LspError>),
    Stderr(String),
    /// Stdout reached EOF or failed; no more frames will arrive.
    StdoutClosed,
}

/// Owns the child. Signals are only sent while the child is unreaped, so the
/// pid cannot have been recycled.
pub struct ProcessHandle {
    command: String,
    pid: Option<u32>,
    child: Mutex<Child>,
    state: watch::Sender<ProcessState>,
    exit_status: OnceLock<ExitStatus>,
}

impl ProcessHandle {
    fn new(command: String, child: Child) -> Self {
        let (state, _) = watch::channel(ProcessState::Starting);
        Self {
            command,
            pid: child.id(),
            child: Mutex::new(child),
            state,
            exit_status: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status.get().copied()
    }

    fn mark_exited(&self, status: ExitStatus) {
        if self.exit_status.set(status).is_ok() {
            tracing::info!(command = %self.command, %status, "Language server exited");
        }
        self.state.send_replace(ProcessState::Exited);
    }

    fn poll_exit(&self, child: &mut Child) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.exit_status() {
            return Ok(Some(status));
        }
        let status = child.try_wait()?;
        if let Some(status) = status {
            self.mark_exited(status);
        }
        Ok(status)
    }

    pub async fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        let mut child = self.child.lock().await;
        self.poll_exit(&mut child)
    }

    /// Ask the process to exit. No-op once it has exited.
    pub async fn terminate(&self) -> io::Result<()> {
        let mut child = self.child.lock().await;
        if self.poll_exit(&mut child)?.is_some() {
            return Ok(());
        }
        self.state.send_replace(ProcessState::Terminating);
        send_terminate(&mut child)
    }

    /// Force the process to exit. No-op once it has exited.
    pub async fn kill(&self) -> io::Result<()> {
        let mut child = self.child.lock().await;
        if self.poll_exit(&mut child)?.is_some() {
            return Ok(());
        }
        self.state.send_replace(ProcessState::Terminating);
        match child.start_kill() {
            // Already reaped by someone else.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    /// Wait up to `timeout` for the process to exit.
    ///
    /// Polls, releasing the child between attempts so `terminate`/`kill`
    /// from another task are not held up.
    pub async fn wait(&self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait().await? {
                return Ok(Some(status));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(EXIT_POLL_INTERVAL)).await;
        }
    }

    /// Two-phase termination: terminate, wait `grace`, then kill and wait
    /// again.
    pub async fn shutdown(&self, grace: Duration) -> io::Result<Option<ExitStatus>> {
        if let Err(e) = self.terminate().await {
            tracing::warn!(command = %self.command, "Terminate failed, escalating to kill: {e}");
        } else if let Some(status) = self.wait(grace).await? {
            return Ok(Some(status));
        }

        tracing::warn!(
            command = %self.command,
            "Language server didn't exit within {grace:?}, killing"
        );
        self.kill().await?;
        self.wait(grace).await
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return child.start_kill();
    };
    // SAFETY: kill(2) takes no pointers. The child is unreaped (checked by the
    // caller under the same lock), so `pid` still names it.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

/// Write side and process control for one language server.
pub struct Transport {
    process: ProcessHandle,
    writer_tx: mpsc::Sender<WriterCommand>,
    writer_task: JoinHandle<()>,
}

/// Read side: frames from stdout and lines from stderr.
pub struct Inbound {
    frames: mpsc::Receiver<Result<Frame, LspError>>,
    stderr: mpsc::UnboundedReceiver<String>,
    frames_open: bool,
    stderr_open: bool,
}

impl Transport {
    /// Spawn the configured server with all three streams piped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &ServerConfig) -> Result<(Self, Inbound), LspError> {
        let spawn_failure = |source: io::Error| LspError::SpawnFailure {
            command: config.command().to_string(),
            source,
        };

        let resolved = which::which(config.command()).map_err(|e| {
            spawn_failure(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found in PATH: {e}", config.command()),
            ))
        })?;

        let mut cmd = Command::new(&resolved);
        cmd.args(config.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = config.working_dir() {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(spawn_failure)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failure(io::Error::other("no stdin from child")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failure(io::Error::other("no stdout from child")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_failure(io::Error::other("no stderr from child")))?;

        let process = ProcessHandle::new(config.command().to_string(), child);

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_task = tokio::spawn(async move {
            let mut writer = FrameWriter::new(stdin);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send { frame, ack } => {
                        let result = writer.write_frame(&frame).await;
                        let failed = result.is_err();
                        if let Err(e) = &result {
                            tracing::warn!("LSP write error: {e}");
                        }
                        let _ = ack.send(result);
                        if failed {
                            break;
                        }
                    }
                    WriterCommand::Close => break,
                }
            }
            // Dropping `writer` closes the child's stdin.
        });

        let frames = spawn_stdout_reader(stdout, config.max_frame_bytes());
        let stderr = spawn_stderr_drain(stderr);

        process.state.send_replace(ProcessState::Running);
        tracing::info!(
            command = %resolved.display(),
            pid = ?process.pid(),
            "Spawned language server"
        );

        let inbound = Inbound {
            frames,
            stderr,
            frames_open: true,
            stderr_open: true,
        };
        Ok((
            Self {
                process,
                writer_tx,
                writer_task,
            },
            inbound,
        ))
    }

    /// Write one frame and flush.
    ///
    /// Waits as long as the child takes to read the bytes; callers that must
    /// not hang bound this with a timeout. Dropping the future does not
    /// cancel a write already handed to the writer.
    pub async fn send(&self, frame: Frame) -> Result<(), LspError> {
        let (ack, ack_rx) = oneshot::channel();
        self.writer_tx
            .send(WriterCommand::Send { frame, ack })
            .await
            .map_err(|_| LspError::TransportClosed)?;
        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if is_closed_pipe(&e) => Err(LspError::TransportClosed),
            Ok(Err(e)) => Err(LspError::Io(e)),
            Err(_) => Err(LspError::TransportClosed),
        }
    }

    /// Stop the writer and close the child's stdin. Never waits.
    ///
    /// Frames already queued are written first. If the queue is full the
    /// child is not reading, so the writer is aborted and stdin dropped at
    /// once.
    pub fn close_stdin(&self) {
        match self.writer_tx.try_send(WriterCommand::Close) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("Writer backlogged; dropping language server stdin");
                self.writer_task.abort();
            }
        }
    }

    #[must_use]
    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    pub async fn terminate(&self) -> io::Result<()> {
        self.process.terminate().await
    }

    pub async fn kill(&self) -> io::Result<()> {
        self.process.kill().await
    }

    pub async fn wait(&self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        self.process.wait(timeout).await
    }

    pub async fn shutdown(&self, grace: Duration) -> io::Result<Option<ExitStatus>> {
        self.process.shutdown(grace).await
    }
}

fn spawn_stdout_reader(
    stdout: ChildStdout,
    max_frame_bytes: usize,
) -> mpsc::Receiver<Result<Frame, LspError>> {
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut reader = FrameReader::with_max_frame_bytes(stdout, max_frame_bytes);
        loop {
            let item = match reader.read_frame().await {
                Ok(Some(frame)) => Ok(frame),
                Ok(None) => {
                    tracing::debug!("Language server closed stdout");
                    break;
                }
                Err(e) => Err(e),
            };
            // MalformedFrame leaves the reader aligned; anything else means
            // the stream is unusable.
            let fatal = matches!(&item, Err(e) if !matches!(e, LspError::MalformedFrame(_)));
            if frame_tx.send(item).await.is_err() || fatal {
                break;
            }
        }
    });
    frame_rx
}

fn spawn_stderr_drain(stderr: ChildStderr) -> mpsc::UnboundedReceiver<String> {
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let mut limited = (&mut reader).take(MAX_STDERR_LINE_BYTES);
            match limited.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    // Keep draining even with no listener so the child never
                    // blocks on a full pipe.
                    let _ = line_tx.send(line);
                }
                Err(e) => {
                    tracing::debug!("Language server stderr read error: {e}");
                    break;
                }
            }
        }
    });
    line_rx
}

impl Inbound {
    /// Read the next frame, waiting at most `timeout`.
    pub async fn receive_frame(&mut self, timeout: Duration) -> Result<Received, LspError> {
        match tokio::time::timeout(timeout, self.frames.recv()).await {
            Err(_) => Ok(Received::Timeout),
            Ok(None) => {
                self.frames_open = false;
                Err(LspError::TransportClosed)
            }
            Ok(Some(Ok(frame))) => Ok(Received::Frame(frame)),
            Ok(Some(Err(e))) => Err(e),
        }
    }

    /// Next line written to stderr, waiting at most `timeout`.
    pub async fn receive_stderr(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.stderr.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next event from either stream, in the order each stream produced them.
    ///
    /// Yields [`InboundEvent::StdoutClosed`] once, then keeps returning stderr
    /// lines until that stream also ends. Returns `None` when both are done.
    pub async fn next(&mut self) -> Option<InboundEvent> {
        loop {
            tokio::select! {
                frame = self.frames.recv(), if self.frames_open => {
                    return Some(match frame {
                        Some(item) => InboundEvent::Frame(item),
                        None => {
                            self.frames_open = false;
                            InboundEvent::StdoutClosed
                        }
                    });
                }
                line = self.stderr.recv(), if self.stderr_open => {
                    match line {
                        Some(line) => return Some(InboundEvent::Stderr(line)),
                        None => self.stderr_open = false,
                    }
                }
                else => return None,
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_spawn_failure_for_missing_executable() {
        let config = ServerConfig::new("definitely-not-a-language-server-xyz");
        let err = Transport::start(&config).err().expect("spawn must fail");
        assert!(matches!(
            err,
            LspError::SpawnFailure { ref command, .. } if command.contains("xyz")
        ));
    }

    #[tokio::test]
    async fn test_send_and_receive_through_cat() {
        let (transport, mut inbound) = Transport::start(&ServerConfig::new("cat")).unwrap();
        assert_eq!(transport.process().state(), ProcessState::Running);

        let frame = Frame::new(br#"{"jsonrpc":"2.0","method":"ping"}"#.to_vec());
        transport.send(frame.clone()).await.unwrap();

        match inbound.receive_frame(WAIT).await.unwrap() {
            Received::Frame(echoed) => assert_eq!(echoed, frame),
            Received::Timeout => panic!("cat should echo the frame"),
        }

        transport.shutdown(WAIT).await.unwrap();
        assert_eq!(transport.process().state(), ProcessState::Exited);
    }

    #[tokio::test]
    async fn test_receive_times_out_without_error() {
        let (transport, mut inbound) = Transport::start(&ServerConfig::new("cat")).unwrap();
        let received = inbound
            .receive_frame(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(matches!(received, Received::Timeout));
        transport.shutdown(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_stderr_is_a_side_channel() {
        let config = ServerConfig::new("sh").with_args(["-c", "echo oops >&2; sleep 5"]);
        let (transport, mut inbound) = Transport::start(&config).unwrap();

        assert_eq!(inbound.receive_stderr(WAIT).await.as_deref(), Some("oops"));
        let received = inbound
            .receive_frame(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(matches!(received, Received::Timeout));
        transport.shutdown(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_next_reports_stdout_closed() {
        let config = ServerConfig::new("sh").with_args(["-c", "exit 0"]);
        let (_transport, mut inbound) = Transport::start(&config).unwrap();

        let mut saw_closed = false;
        while let Some(event) = tokio::time::timeout(WAIT, inbound.next()).await.unwrap() {
            if matches!(event, InboundEvent::StdoutClosed) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }

    #[tokio::test]
    async fn test_send_after_close_is_transport_closed() {
        let (transport, _inbound) = Transport::start(&ServerConfig::new("cat")).unwrap();
        transport.close_stdin();
        // Give the writer task a moment to drop its receiver.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = transport
            .send(Frame::new(b"{}".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::TransportClosed));
        transport.shutdown(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_and_kill_are_idempotent() {
        let config = ServerConfig::new("sleep").with_args(["30"]);
        let (transport, _inbound) = Transport::start(&config).unwrap();

        let status = transport.shutdown(WAIT).await.unwrap();
        assert!(status.is_some());
        assert_eq!(transport.process().state(), ProcessState::Exited);

        transport.terminate().await.unwrap();
        transport.kill().await.unwrap();
        assert_eq!(transport.wait(WAIT).await.unwrap(), status);
    }

    #[tokio::test]
    async fn test_wait_times_out_on_running_process() {
        let config = ServerConfig::new("sleep").with_args(["30"]);
        let (transport, _inbound) = Transport::start(&config).unwrap();

        assert!(
            transport
                .wait(Duration::from_millis(20))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(transport.process().state(), ProcessState::Running);
        transport.kill().await.unwrap();
        assert!(transport.wait(WAIT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_kill_is_not_blocked_by_a_pending_wait() {
        let config = ServerConfig::new("sleep").with_args(["30"]);
        let (transport, _inbound) = Transport::start(&config).unwrap();

        let (status, killed) = tokio::join!(transport.wait(Duration::from_secs(20)), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tokio::time::timeout(Duration::from_secs(1), transport.kill()).await
        });

        assert!(killed.expect("kill waited on the child lock").is_ok());
        assert!(status.unwrap().is_some());
        assert_eq!(transport.process().state(), ProcessState::Exited);
    }

    #[tokio::test]
    async fn test_stderr_without_newlines_is_split() {
        let config = ServerConfig::new("sh").with_args([
            "-c",
            "head -c 10000000 /dev/zero >&2; echo >&2; echo done >&2; sleep 5",
        ]);
        let (transport, mut inbound) = Transport::start(&config).unwrap();

        let mut pieces = 0;
        loop {
            let line = inbound
                .receive_stderr(WAIT)
                .await
                .expect("stderr ended before the marker line");
            assert!(line.len() as u64 <= MAX_STDERR_LINE_BYTES);
            if line == "done" {
                break;
            }
            pieces += 1;
        }
        assert!(pieces > 1);
        transport.shutdown(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_stdin_does_not_wait_for_a_stuck_writer() {
        // `sleep` never reads stdin, so a large frame fills the pipe.
        let config = ServerConfig::new("sleep").with_args(["30"]);
        let (transport, _inbound) = Transport::start(&config).unwrap();

        let frame = Frame::new(vec![b' '; 1024 * 1024]);
        let stuck = tokio::time::timeout(Duration::from_millis(200), transport.send(frame)).await;
        assert!(stuck.is_err());

        transport.close_stdin();
        let status = tokio::time::timeout(WAIT, transport.shutdown(Duration::from_millis(500)))
            .await
            .expect("shutdown hung behind the writer")
            .unwrap();
        assert!(status.is_some());
    }
}
