//! Host-side client for the guest exec service.
//!
//! Connects over a Unix domain socket, either directly (tests, local runs)
//! or through Firecracker's hybrid vsock UDS, which needs a
//! `CONNECT <port>\n` / `OK <port>\n` handshake before the stream carries
//! guest traffic.
//!
//! ## Operations
//!
//! - [`GuestClient::status`], [`GuestClient::sysinfo`], [`GuestClient::exec`]:
//!   one HTTP/1.1 request per connection
//! - [`GuestClient::open_session`]: a WebSocket carrying [`SessionMessage`]
//!   frames for an interactive process

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::Request;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use vsock_proto::{
    EXEC_PATH, ErrorBody, ExecRequest, ExecResponse, ProtocolError, STATUS_PATH, SYSINFO_PATH,
    SessionMessage, StatusResponse, Termination, VSOCK_PORT, WS_EXEC_PATH,
};

pub use hyper::{Method, StatusCode};

/// Default deadline for connecting and for one-shot requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest handshake reply line accepted from Firecracker.
const MAX_HANDSHAKE_LINE: usize = 64;

/// Host header value; the guest serves a single virtual host.
const GUEST_HOST: &str = "guest";

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("vsock handshake failed: {0}")]
    Handshake(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("guest returned {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type HostResult<T> = Result<T, HostError>;

/// How to reach the guest.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// A Unix socket the exec service listens on directly.
    Unix(PathBuf),
    /// Firecracker's vsock UDS; `port` is the guest vsock port.
    Firecracker { uds: PathBuf, port: u32 },
}

/// Client for the guest exec service. Cheap to clone; every call opens its
/// own connection.
#[derive(Debug, Clone)]
pub struct GuestClient {
    endpoint: Endpoint,
    timeout: Duration,
}

impl GuestClient {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: Endpoint::Unix(path.into()),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Reach the guest's exec port through a Firecracker vsock UDS.
    pub fn firecracker(uds: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: Endpoint::Firecracker {
                uds: uds.into(),
                port: VSOCK_PORT,
            },
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Deadline for connecting and for each one-shot request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect(&self) -> HostResult<UnixStream> {
        let connect = async {
            match &self.endpoint {
                Endpoint::Unix(path) => open(path).await,
                Endpoint::Firecracker { uds, port } => {
                    let mut stream = open(uds).await?;
                    firecracker_handshake(&mut stream, *port).await?;
                    Ok(stream)
                }
            }
        };
        deadline(self.timeout, connect).await
    }

    pub async fn status(&self) -> HostResult<StatusResponse> {
        let body = self.request(Method::GET, STATUS_PATH, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// System metrics snapshot, as the raw JSON document.
    pub async fn sysinfo(&self) -> HostResult<serde_json::Value> {
        let body = self.request(Method::GET, SYSINFO_PATH, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Run a command to completion on the guest.
    pub async fn exec<I, S>(&self, cmd: I) -> HostResult<ExecResponse>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = serde_json::to_vec(&ExecRequest::new(cmd))?;
        let body = self.request(Method::POST, EXEC_PATH, Some(request)).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Send a raw HTTP request and return the body of a 2xx response.
    ///
    /// Non-2xx responses become [`HostError::Status`] carrying the guest's
    /// error message.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> HostResult<Bytes> {
        let stream = self.connect().await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "guest connection closed with error");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, GUEST_HOST);
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder.body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        let response = deadline(self.timeout, async {
            let response = sender.send_request(request).await?;
            let status = response.status();
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, HostError>((status, body))
        })
        .await?;

        match response {
            (status, body) if status.is_success() => Ok(body),
            (status, body) => {
                let message = serde_json::from_slice::<ErrorBody>(&body)
                    .map(|e| e.error)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
                Err(HostError::Status { status, message })
            }
        }
    }

    /// Open an interactive session. Send `init` next to start a process.
    pub async fn open_session(&self) -> HostResult<Session> {
        let stream = self.connect().await?;
        let url = format!("ws://{GUEST_HOST}{WS_EXEC_PATH}");
        let (ws, _response) =
            deadline(self.timeout, async {
                Ok(tokio_tungstenite::client_async(url, stream).await?)
            })
            .await?;
        Ok(Session { ws })
    }
}

async fn open(path: &Path) -> HostResult<UnixStream> {
    UnixStream::connect(path)
        .await
        .map_err(|source| HostError::Connect {
            path: path.to_path_buf(),
            source,
        })
}

async fn deadline<T>(
    timeout: Duration,
    fut: impl Future<Output = HostResult<T>>,
) -> HostResult<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| HostError::Timeout(timeout))?
}

/// Ask Firecracker to forward this connection to guest `port`.
///
/// The reply is read one byte at a time so nothing past the newline is
/// consumed from the stream.
pub async fn firecracker_handshake(stream: &mut UnixStream, port: u32) -> HostResult<()> {
    stream
        .write_all(format!("CONNECT {port}\n").as_bytes())
        .await?;

    let mut line = Vec::with_capacity(MAX_HANDSHAKE_LINE);
    loop {
        let byte = stream.read_u8().await.map_err(|e| {
            HostError::Handshake(format!("connection closed during handshake: {e}"))
        })?;
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_HANDSHAKE_LINE {
            return Err(HostError::Handshake("reply line too long".into()));
        }
        line.push(byte);
    }

    let reply = String::from_utf8_lossy(&line);
    if reply.starts_with("OK ") {
        debug!(port, reply = %reply, "vsock handshake complete");
        Ok(())
    } else {
        Err(HostError::Handshake(format!("unexpected reply {reply:?}")))
    }
}

/// An open interactive session.
pub struct Session {
    ws: WebSocketStream<UnixStream>,
}

/// Everything a session produced, gathered by [`Session::collect`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOutput {
    pub stdout: String,
    pub stderr: String,
    pub errors: Vec<String>,
    /// Every `exit` frame received; a well-behaved guest sends one.
    pub exits: Vec<Termination>,
}

impl SessionOutput {
    pub fn exit(&self) -> Option<Termination> {
        self.exits.last().copied()
    }
}

impl Session {
    pub async fn send(&mut self, msg: &SessionMessage) -> HostResult<()> {
        self.ws.send(Message::text(msg.to_json()?)).await?;
        Ok(())
    }

    pub async fn init<I, S>(&mut self, cmd: I) -> HostResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(&SessionMessage::init(cmd)).await
    }

    pub async fn stdin(&mut self, data: impl Into<String>) -> HostResult<()> {
        self.send(&SessionMessage::Stdin { data: data.into() })
            .await
    }

    pub async fn resize(&mut self, cols: i32, rows: i32) -> HostResult<()> {
        self.send(&SessionMessage::Resize {
            cols: Some(cols),
            rows: Some(rows),
        })
        .await
    }

    /// Next frame from the guest, or `None` once the guest closed the
    /// session. Non-text frames are skipped.
    pub async fn next(&mut self) -> HostResult<Option<SessionMessage>> {
        while let Some(frame) = self.ws.next().await {
            match frame? {
                Message::Text(text) => return Ok(Some(SessionMessage::from_json(text.as_str())?)),
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }

    /// Read frames until the guest closes the session.
    pub async fn collect(&mut self) -> HostResult<SessionOutput> {
        let mut output = SessionOutput::default();
        while let Some(msg) = self.next().await? {
            match msg {
                SessionMessage::Stdout { data } => output.stdout.push_str(&data),
                SessionMessage::Stderr { data } => output.stderr.push_str(&data),
                SessionMessage::Error { message } => output.errors.push(message),
                SessionMessage::Exit { code, signal } => {
                    output.exits.push(Termination::from_parts(code, signal));
                }
                other => debug!(kind = other.kind(), "unexpected frame from guest"),
            }
        }
        Ok(output)
    }

    /// Close the connection from the host side.
    pub async fn close(mut self) -> HostResult<()> {
        match self.ws.close(None).await {
            Ok(()) | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
