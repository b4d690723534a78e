//! Interactive exec sessions (`GET /v1/ws/exec`).
//!
//! A session binds at most one process to one WebSocket connection. Frames
//! from the peer drive an [`Session`] state machine, and everything sent
//! back funnels through a single writer task that owns the socket's sink.
//!
//! ```text
//!   peer ──text──▶ Session ──stdin──▶ feeder ──▶ child
//!                    │                  │ stdout/stderr
//!                    ▼                  ▼
//!               mpsc<SessionMessage> ◀─ streamers, stdin feeder, completion
//!                    │
//!                    ▼
//!                 writer ──text──▶ peer
//! ```

use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt, future};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use vsock_proto::{SessionMessage, Termination};

use crate::error::{ExecError, ExecResult};
use crate::exec::{ExecService, truncate_preview};
use crate::reap::{ChildHandle, TrackedChild};

/// Read buffer size for stdout/stderr pumps.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Outbound frames buffered before producers wait on the writer.
pub const OUTBOUND_QUEUE: usize = 64;

/// Stdin frames buffered for a child that is not reading. Frames beyond
/// this are refused with an error reply.
const STDIN_QUEUE: usize = 256;

/// How long output pumps may keep draining pipes after the child exits.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long cleanup waits for the completion task.
const COMPLETION_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the writer may take to flush and close the socket.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Run an interactive session over an upgraded WebSocket until the peer
/// disconnects or the process exits.
pub async fn serve_websocket(socket: WebSocket, exec: ExecService) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let session = Session::new(exec, tx);
    let id = session.id();
    info!(session = id, "session opened");

    let mut writer = tokio::spawn(write_frames(sink, rx, id));

    let inbound = stream
        .take_while(move |frame| {
            let open = match frame {
                Ok(Message::Close(_)) => false,
                Ok(_) => true,
                Err(e) => {
                    debug!(session = id, error = %e, "websocket read failed");
                    false
                }
            };
            future::ready(open)
        })
        .filter_map(move |frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(text),
                Ok(Message::Binary(_)) => {
                    debug!(session = id, "ignoring binary frame");
                    None
                }
                _ => None,
            })
        });
    let inbound = std::pin::pin!(inbound);

    session.run(inbound).await;

    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        warn!(session = id, "writer did not finish, dropping connection");
        writer.abort();
    }
    info!(session = id, "session closed");
}

/// Sole owner of the socket's sink. Ends once every sender is dropped,
/// closing the connection with a Close frame.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<SessionMessage>,
    session: u64,
) {
    while let Some(msg) = rx.recv().await {
        let text = match msg.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!(session, error = %e, "failed to encode session message");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!(session, error = %e, "websocket write failed");
            return;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(session, error = %e, "websocket close failed");
    }
}

enum State {
    Idle,
    Running(Running),
    Closed,
}

struct Running {
    child: ChildHandle,
    stdin: Option<mpsc::Sender<Vec<u8>>>,
    feeder: AbortHandle,
    streamers: Vec<AbortHandle>,
    completion: JoinHandle<()>,
}

/// Per-connection session state machine.
pub struct Session {
    id: u64,
    exec: ExecService,
    outbound: Option<mpsc::Sender<SessionMessage>>,
    exited: Option<oneshot::Receiver<()>>,
    state: State,
}

impl Session {
    pub fn new(exec: ExecService, outbound: mpsc::Sender<SessionMessage>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            exec,
            outbound: Some(outbound),
            exited: None,
            state: State::Idle,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Process inbound text frames until the stream ends or the process
    /// exits, then clean up.
    pub async fn run<S>(mut self, mut inbound: S)
    where
        S: Stream<Item = String> + Unpin,
    {
        loop {
            let event = tokio::select! {
                frame = inbound.next() => frame,
                () = process_finished(&mut self.exited) => None,
            };
            match event {
                Some(text) => self.handle_frame(&text).await,
                None => break,
            }
        }
        self.cleanup().await;
    }

    async fn handle_frame(&mut self, text: &str) {
        let msg = match SessionMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                self.send(SessionMessage::error(format!("Invalid message: {e}")))
                    .await;
                return;
            }
        };
        match msg {
            SessionMessage::Init { cmd, tty, .. } => self.handle_init(cmd, tty).await,
            SessionMessage::Stdin { data } => self.handle_stdin(data.as_bytes()).await,
            SessionMessage::Resize { cols, rows } => self.handle_resize(cols, rows).await,
            other => warn!(
                session = self.id,
                kind = other.kind(),
                "ignoring unexpected message"
            ),
        }
    }

    async fn handle_init(&mut self, cmd: Vec<String>, tty: bool) {
        if matches!(self.state, State::Running(_)) {
            self.send(SessionMessage::error("Process already running"))
                .await;
            return;
        }
        if cmd.is_empty() {
            self.send(SessionMessage::error("Command cannot be empty"))
                .await;
            return;
        }
        if tty {
            self.send(SessionMessage::error("TTY mode not yet implemented"))
                .await;
            return;
        }
        if let Err(e) = self.start(cmd).await {
            warn!(session = self.id, error = %e, "failed to start process");
            self.send(SessionMessage::error(format!("Failed to start process: {e}")))
                .await;
        }
    }

    /// Queue `data` for the stdin feeder. Never waits on the child, so a
    /// child that stops reading cannot stall the session loop.
    async fn handle_stdin(&mut self, data: &[u8]) {
        let queued = match &self.state {
            State::Running(Running {
                stdin: Some(stdin), ..
            }) => Some(stdin.try_send(data.to_vec())),
            _ => None,
        };
        match queued {
            None => self.send(SessionMessage::error("No active process")).await,
            Some(Err(e)) => {
                if matches!(e, TrySendError::Full(_)) {
                    warn!(session = self.id, "stdin queue full, dropping input");
                }
                self.send(SessionMessage::error("Failed to write to process stdin"))
                    .await;
            }
            Some(Ok(())) => {}
        }
    }

    async fn handle_resize(&mut self, cols: Option<i32>, rows: Option<i32>) {
        if matches!(self.state, State::Running(_)) {
            // No pty backs a pipe session; nothing to resize.
            debug!(session = self.id, ?cols, ?rows, "resize ignored");
        } else {
            self.send(SessionMessage::error("No active process")).await;
        }
    }

    async fn start(&mut self, argv: Vec<String>) -> ExecResult<()> {
        let Some(outbound) = self.outbound.clone() else {
            return Ok(());
        };
        let mut cmd = self.exec.command(&argv)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so cleanup can take down the whole tree.
        cmd.process_group(0);

        let reap = self.exec.reap_lock().clone();
        let mut child = tokio::task::spawn_blocking(move || reap.spawn(&mut cmd))
            .await?
            .map_err(|e| ExecError::spawn(argv.first().map_or("", String::as_str), e))?;

        let (stdin, stdout, stderr) = match adopt_pipes(&mut child) {
            Ok(pipes) => pipes,
            Err(e) => {
                let handle = child.handle();
                tokio::task::spawn_blocking(move || {
                    handle.kill();
                    child.wait()
                })
                .await?;
                return Err(ExecError::spawn(argv.first().map_or("", String::as_str), e));
            }
        };

        let pid = child.id();
        let handle = child.handle();
        let stdout_task = tokio::spawn(pump_output(stdout, OutputKind::Stdout, outbound.clone()));
        let stderr_task = tokio::spawn(pump_output(stderr, OutputKind::Stderr, outbound.clone()));
        let streamers = vec![stdout_task.abort_handle(), stderr_task.abort_handle()];
        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE);
        let feeder = tokio::spawn(feed_stdin(stdin, stdin_rx, outbound.clone(), self.id));

        let (done_tx, done_rx) = oneshot::channel();
        let completion = tokio::spawn(complete(
            child,
            [stdout_task, stderr_task],
            outbound,
            done_tx,
            self.id,
        ));

        info!(
            session = self.id,
            pid,
            cmd = %truncate_preview(&argv.join(" ")),
            "process started"
        );
        self.exited = Some(done_rx);
        self.state = State::Running(Running {
            child: handle,
            stdin: Some(stdin_tx),
            feeder: feeder.abort_handle(),
            streamers,
            completion,
        });
        Ok(())
    }

    /// Tear down the session: close stdin, kill the process unless it was
    /// already reaped, stop the output pumps and release the writer.
    ///
    /// Stdin is closed by aborting the feeder, which owns the pipe and may
    /// be parked on a full one.
    ///
    /// Safe to call more than once.
    pub async fn cleanup(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Closed);
        if let State::Running(mut running) = state {
            drop(running.stdin.take());
            running.feeder.abort();

            let child = running.child.clone();
            match tokio::task::spawn_blocking(move || child.kill()).await {
                Ok(true) => info!(
                    session = self.id,
                    pid = %running.child.pid(),
                    "killed process on session close"
                ),
                Ok(false) => {}
                Err(e) => warn!(session = self.id, error = %e, "kill task failed"),
            }

            for streamer in &running.streamers {
                streamer.abort();
            }
            if tokio::time::timeout(COMPLETION_JOIN_TIMEOUT, &mut running.completion)
                .await
                .is_err()
            {
                warn!(session = self.id, "completion task did not finish");
            }
        }
        self.exited = None;
        self.outbound = None;
    }

    async fn send(&self, msg: SessionMessage) {
        if let Some(tx) = &self.outbound {
            if tx.send(msg).await.is_err() {
                debug!(session = self.id, "writer gone, dropping message");
            }
        }
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed) && self.outbound.is_none()
    }
}

async fn process_finished(exited: &mut Option<oneshot::Receiver<()>>) {
    match exited {
        Some(rx) => {
            let _ = rx.await;
        }
        None => future::pending().await,
    }
}

/// Sole writer of the child's stdin. Write failures are reported to the
/// peer and do not end the session.
async fn feed_stdin(
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<SessionMessage>,
    session: u64,
) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = stdin.write_all(&data).await {
            warn!(session, error = %e, "stdin write failed");
            let reply = SessionMessage::error("Failed to write to process stdin");
            if outbound.send(reply).await.is_err() {
                return;
            }
        }
    }
}

fn adopt_pipes(child: &mut TrackedChild) -> std::io::Result<(ChildStdin, ChildStdout, ChildStderr)> {
    let missing = || std::io::Error::other("child pipe was not captured");
    let stdin = ChildStdin::from_std(child.take_stdin().ok_or_else(missing)?)?;
    let stdout = ChildStdout::from_std(child.take_stdout().ok_or_else(missing)?)?;
    let stderr = ChildStderr::from_std(child.take_stderr().ok_or_else(missing)?)?;
    Ok((stdin, stdout, stderr))
}

/// Harvest the child, let the pumps flush what is left in the pipes, then
/// report the exit.
async fn complete(
    child: TrackedChild,
    streams: [JoinHandle<()>; 2],
    outbound: mpsc::Sender<SessionMessage>,
    done: oneshot::Sender<()>,
    session: u64,
) {
    let pid = child.id();
    let termination = match tokio::task::spawn_blocking(move || child.wait()).await {
        Ok(termination) => termination,
        Err(e) => {
            error!(session, pid, error = %e, "wait task failed");
            Termination::Unknown
        }
    };

    for stream in streams {
        let abort = stream.abort_handle();
        if tokio::time::timeout(STREAM_DRAIN_TIMEOUT, stream)
            .await
            .is_err()
        {
            debug!(session, pid, "output still open after exit, abandoning it");
            abort.abort();
        }
    }

    info!(session, pid, status = %termination, "process exited");
    if outbound
        .send(SessionMessage::exit(termination))
        .await
        .is_err()
    {
        debug!(session, pid, "connection gone before exit was reported");
    }
    let _ = done.send(());
}

#[derive(Clone, Copy)]
enum OutputKind {
    Stdout,
    Stderr,
}

impl OutputKind {
    fn message(self, data: String) -> SessionMessage {
        match self {
            Self::Stdout => SessionMessage::Stdout { data },
            Self::Stderr => SessionMessage::Stderr { data },
        }
    }
}

async fn pump_output<R>(mut reader: R, kind: OutputKind, outbound: mpsc::Sender<SessionMessage>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut chunker = Utf8Chunker::default();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "output read failed");
                break;
            }
        };
        let text = chunker.push(buf.get(..n).unwrap_or_default());
        if !text.is_empty() && outbound.send(kind.message(text)).await.is_err() {
            return;
        }
    }
    let rest = chunker.finish();
    if !rest.is_empty() {
        let _ = outbound.send(kind.message(rest)).await;
    }
}

/// Turns a byte stream into text without splitting multi-byte characters
/// across chunk boundaries. Invalid sequences are replaced.
#[derive(Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let split = self.pending.len() - incomplete_suffix_len(&self.pending);
        let tail = self.pending.split_off(split);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing, not yet complete UTF-8 sequence.
fn incomplete_suffix_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let Some(&byte) = bytes.get(bytes.len() - back) else {
            break;
        };
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}
