#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::unreachable
)]

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use vsock_guest::{ExecService, Listener, ReapLock};
use vsock_host::{GuestClient, HostError, Session, SessionOutput};
use vsock_proto::{SessionMessage, Termination};

const SESSION_DEADLINE: Duration = Duration::from_secs(10);

/// Test harness: serves the exec API on a Unix socket in a temp dir and
/// hands out clients for it.
///
/// The server task is aborted on drop; the temp dir goes with it.
struct Harness {
    _dir: TempDir,
    socket: PathBuf,
    server: JoinHandle<()>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let socket = dir.path().join("exec.sock");
        let listener = Listener::unix(&socket).expect("failed to bind exec socket");
        let exec = ExecService::new(
            [
                ("PATH", "/usr/local/bin:/usr/bin:/bin"),
                ("GREETING", "from-guest"),
            ],
            ReapLock::new(),
        );
        let server = tokio::spawn(vsock_guest::run(listener, exec));
        Self {
            _dir: dir,
            socket,
            server,
        }
    }

    fn client(&self) -> GuestClient {
        GuestClient::unix(&self.socket).with_timeout(Duration::from_secs(10))
    }

    async fn session(&self) -> Session {
        self.client()
            .open_session()
            .await
            .expect("failed to open session")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn collect(session: &mut Session) -> SessionOutput {
    tokio::time::timeout(SESSION_DEADLINE, session.collect())
        .await
        .expect("session did not finish in time")
        .expect("session failed")
}

async fn next_frame(session: &mut Session) -> SessionMessage {
    tokio::time::timeout(SESSION_DEADLINE, session.next())
        .await
        .expect("no frame in time")
        .expect("session failed")
        .expect("session closed early")
}

fn process_alive(pid: i32) -> bool {
    // A reaped process has no /proc entry; a zombie's state is `Z`.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .is_some_and(|(_, rest)| !rest.starts_with('Z')),
        Err(_) => false,
    }
}

// ── status / sysinfo ────────────────────────────────────────────────

#[tokio::test]
async fn test_status() {
    let h = Harness::new();
    let status = h.client().status().await.expect("status failed");
    assert_eq!(status.status, "OK");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_sysinfo() {
    let h = Harness::new();
    let info = h.client().sysinfo().await.expect("sysinfo failed");
    assert!(info["memory"]["mem_total"].as_u64().unwrap() > 0);
    assert!(info["cpus"].as_object().is_some_and(|cpus| !cpus.is_empty()));
    assert!(info["load_average"].is_object());
}

// ── exec ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_exec_echo() {
    let h = Harness::new();
    let result = h
        .client()
        .exec(["echo", "hello world"])
        .await
        .expect("exec failed");

    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.exit_signal, None);
    assert_eq!(result.stdout, b"hello world\n");
    assert!(result.stderr.is_empty());
}

#[tokio::test]
async fn test_exec_missing_directory() {
    let h = Harness::new();
    let result = h
        .client()
        .exec(["ls", "/nonexistent-directory"])
        .await
        .expect("exec failed");

    assert!(matches!(result.exit_code, Some(code) if code != 0));
    assert!(result.stdout.is_empty());
    assert!(!result.stderr.is_empty());
}

#[tokio::test]
async fn test_exec_signal() {
    let h = Harness::new();
    let result = h
        .client()
        .exec(["sh", "-c", "kill -TERM $$"])
        .await
        .expect("exec failed");

    assert_eq!(result.termination(), Termination::Signaled(15));
    assert_eq!(result.exit_code, None);
}

#[tokio::test]
async fn test_exec_uses_configured_env() {
    let h = Harness::new();
    let result = h
        .client()
        .exec(["sh", "-c", "echo $GREETING"])
        .await
        .expect("exec failed");

    assert_eq!(result.stdout, b"from-guest\n");
}

#[tokio::test]
async fn test_exec_concurrent() {
    let h = Harness::new();
    let client = h.client();
    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let result = client
                    .exec(["sh", "-c", &format!("echo {i}; exit {i}")])
                    .await
                    .expect("exec failed");
                (i, result)
            })
        })
        .collect();

    for task in tasks {
        let (i, result) = task.await.unwrap();
        assert_eq!(result.exit_code, Some(i));
        assert_eq!(result.stdout, format!("{i}\n").into_bytes());
    }
}

#[tokio::test]
async fn test_exec_empty_command_is_rejected() {
    let h = Harness::new();
    let err = h.client().exec(Vec::<String>::new()).await.unwrap_err();
    match err {
        HostError::Status { status, message } => {
            assert_eq!(status.as_u16(), 400);
            assert_eq!(message, "command cannot be empty");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn test_exec_malformed_body_is_rejected() {
    let h = Harness::new();
    let err = h
        .client()
        .request(
            vsock_host::Method::POST,
            vsock_proto::EXEC_PATH,
            Some(b"{\"cmd\":".to_vec()),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, HostError::Status { status, .. } if status.as_u16() == 400),
        "{err}"
    );
}

#[tokio::test]
async fn test_exec_unknown_program_is_server_error() {
    let h = Harness::new();
    let err = h
        .client()
        .exec(["/nonexistent/program"])
        .await
        .unwrap_err();
    assert!(
        matches!(err, HostError::Status { status, .. } if status.as_u16() == 500),
        "{err}"
    );
}

// ── sessions ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_session_positional_args() {
    let h = Harness::new();
    let mut session = h.session().await;
    session
        .init(["sh", "-c", "echo $1 $2", "_", "hello", "world"])
        .await
        .unwrap();

    let output = collect(&mut session).await;
    assert_eq!(output.stdout, "hello world\n");
    assert_eq!(output.exits, vec![Termination::Exited(0)]);
    assert!(output.errors.is_empty(), "{:?}", output.errors);
}

#[tokio::test]
async fn test_session_exit_is_last_frame() {
    let h = Harness::new();
    let mut session = h.session().await;
    session
        .init(["sh", "-c", "echo out; echo err >&2; exit 4"])
        .await
        .unwrap();

    let mut frames = Vec::new();
    while let Some(frame) = tokio::time::timeout(SESSION_DEADLINE, session.next())
        .await
        .unwrap()
        .unwrap()
    {
        frames.push(frame);
    }
    assert_eq!(
        frames.last(),
        Some(&SessionMessage::Exit {
            code: Some(4),
            signal: None
        })
    );
    let exits = frames
        .iter()
        .filter(|f| matches!(f, SessionMessage::Exit { .. }))
        .count();
    assert_eq!(exits, 1);
    assert!(frames.contains(&SessionMessage::Stderr {
        data: "err\n".into()
    }));
}

#[tokio::test]
async fn test_session_stdin() {
    let h = Harness::new();
    let mut session = h.session().await;
    session.init(["head", "-n", "1"]).await.unwrap();
    session.stdin("ping\n").await.unwrap();

    let output = collect(&mut session).await;
    assert_eq!(output.stdout, "ping\n");
    assert_eq!(output.exit(), Some(Termination::Exited(0)));
}

#[tokio::test]
async fn test_session_resize_is_accepted() {
    let h = Harness::new();
    let mut session = h.session().await;
    session.init(["head", "-n", "1"]).await.unwrap();
    session.resize(120, 40).await.unwrap();
    session.stdin("done\n").await.unwrap();

    let output = collect(&mut session).await;
    assert_eq!(output.stdout, "done\n");
    assert!(output.errors.is_empty(), "{:?}", output.errors);
}

#[tokio::test]
async fn test_session_stdin_without_process() {
    let h = Harness::new();
    let mut session = h.session().await;
    session.stdin("hello").await.unwrap();
    assert_eq!(
        next_frame(&mut session).await,
        SessionMessage::error("No active process")
    );
    session.resize(80, 24).await.unwrap();
    assert_eq!(
        next_frame(&mut session).await,
        SessionMessage::error("No active process")
    );
}

#[tokio::test]
async fn test_session_rejects_tty() {
    let h = Harness::new();
    let mut session = h.session().await;
    session
        .send(&SessionMessage::Init {
            cmd: vec!["sh".into()],
            tty: true,
            cols: Some(80),
            rows: Some(24),
        })
        .await
        .unwrap();
    assert_eq!(
        next_frame(&mut session).await,
        SessionMessage::error("TTY mode not yet implemented")
    );
}

#[tokio::test]
async fn test_session_rejects_empty_command() {
    let h = Harness::new();
    let mut session = h.session().await;
    session.init(Vec::<String>::new()).await.unwrap();
    assert_eq!(
        next_frame(&mut session).await,
        SessionMessage::error("Command cannot be empty")
    );

    // The session stays usable.
    session.init(["echo", "again"]).await.unwrap();
    let output = collect(&mut session).await;
    assert_eq!(output.stdout, "again\n");
}

#[tokio::test]
async fn test_session_rejects_second_init() {
    let h = Harness::new();
    let mut session = h.session().await;
    session.init(["head", "-n", "1"]).await.unwrap();
    session.init(["echo", "second"]).await.unwrap();
    assert_eq!(
        next_frame(&mut session).await,
        SessionMessage::error("Process already running")
    );
    session.stdin("first\n").await.unwrap();

    let output = collect(&mut session).await;
    assert_eq!(output.stdout, "first\n");
    assert_eq!(output.exits.len(), 1);
}

/// Start `sleep` in a session, optionally flood its unread stdin, close the
/// connection and wait for the process to disappear.
async fn assert_peer_close_kills(flood: Option<usize>) {
    let h = Harness::new();
    let mut session = h.session().await;
    session.init(["sh", "-c", "echo $$; exec sleep 60"]).await.unwrap();

    let pid = match next_frame(&mut session).await {
        SessionMessage::Stdout { data } => data.trim().parse::<i32>().unwrap(),
        other => panic!("expected pid on stdout, got {other:?}"),
    };
    assert!(process_alive(pid));

    if let Some(len) = flood {
        session.stdin("x".repeat(len)).await.unwrap();
    }
    session.close().await.unwrap();

    let deadline = tokio::time::Instant::now() + SESSION_DEADLINE;
    while process_alive(pid) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "process {pid} survived peer close"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_session_peer_close_kills_process() {
    assert_peer_close_kills(None).await;
}

#[tokio::test]
async fn test_session_peer_close_with_full_stdin_pipe() {
    // Well past the pipe buffer; `sleep` never reads it.
    assert_peer_close_kills(Some(1024 * 1024)).await;
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let h = Harness::new();
    let mut first = h.session().await;
    let mut second = h.session().await;
    first.init(["echo", "one"]).await.unwrap();
    second.init(["echo", "two"]).await.unwrap();

    assert_eq!(collect(&mut first).await.stdout, "one\n");
    assert_eq!(collect(&mut second).await.stdout, "two\n");
}
