//! Wire types for host-guest communication with the guest exec service.
//!
//! The guest serves HTTP/1.1 on vsock port [`VSOCK_PORT`].
//!
//! ## Endpoints
//!
//! | Method | Path          | Body             | Response                         |
//! |--------|---------------|------------------|----------------------------------|
//! | GET    | `/status`     | -                | `{"status":"OK"}`                |
//! | GET    | `/v1/sysinfo` | -                | metrics snapshot                 |
//! | POST   | `/v1/exec`    | [`ExecRequest`]  | [`ExecResponse`]                 |
//! | GET    | `/v1/ws/exec` | WebSocket        | [`SessionMessage`] text frames   |
//!
//! ## Session frames
//!
//! Every frame is a flat JSON object with a `type` field:
//!
//! | Type     | Direction | Fields                          |
//! |----------|-----------|---------------------------------|
//! | `init`   | H→G       | `cmd`, `tty`, `cols`, `rows`    |
//! | `stdin`  | H→G       | `data`                          |
//! | `resize` | H→G       | `cols`, `rows`                  |
//! | `stdout` | G→H       | `data`                          |
//! | `stderr` | G→H       | `data`                          |
//! | `exit`   | G→H       | `code` or `signal`              |
//! | `error`  | G→H       | `data`                          |

use serde::{Deserialize, Serialize};

/// Guest-side vsock port the exec service listens on.
pub const VSOCK_PORT: u32 = 1000;

pub const STATUS_PATH: &str = "/status";
pub const SYSINFO_PATH: &str = "/v1/sysinfo";
pub const EXEC_PATH: &str = "/v1/exec";
pub const WS_EXEC_PATH: &str = "/v1/ws/exec";

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("command cannot be empty")]
    EmptyCommand,
}

/// How a child process terminated.
///
/// A process either exited with a code, was killed by a signal, or its status
/// could not be observed (for example because it was reaped elsewhere).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    Unknown,
}

impl Termination {
    /// Rebuild from the wire's `(code, signal)` pair. Anything other than
    /// exactly one of the two is [`Termination::Unknown`].
    pub fn from_parts(code: Option<i32>, signal: Option<i32>) -> Self {
        match (code, signal) {
            (Some(code), None) => Self::Exited(code),
            (None, Some(sig)) => Self::Signaled(sig),
            _ => Self::Unknown,
        }
    }

    pub fn code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn signal(self) -> Option<i32> {
        match self {
            Self::Signaled(sig) => Some(sig),
            _ => None,
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled(sig) => write!(f, "signal {sig}"),
            Self::Unknown => f.write_str("unknown status"),
        }
    }
}

// ---------------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------------

/// Body of `POST /v1/exec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
}

impl ExecRequest {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
        }
    }

    /// Decode and validate a request body. The command must be non-empty.
    pub fn from_json(body: &[u8]) -> Result<Self, ProtocolError> {
        let req: Self = serde_json::from_slice(body)?;
        if req.cmd.is_empty() {
            return Err(ProtocolError::EmptyCommand);
        }
        Ok(req)
    }
}

/// Response of `POST /v1/exec`.
///
/// At most one of `exit_code` / `exit_signal` is set. `stdout` and `stderr`
/// travel as base64 strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    #[serde(default, with = "base64_bytes")]
    pub stdout: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub stderr: Vec<u8>,
}

impl ExecResponse {
    pub fn new(termination: Termination, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            exit_code: termination.code(),
            exit_signal: termination.signal(),
            stdout,
            stderr,
        }
    }

    pub fn termination(&self) -> Termination {
        Termination::from_parts(self.exit_code, self.exit_signal)
    }
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "OK".to_string(),
        }
    }
}

/// JSON body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Session frames
// ---------------------------------------------------------------------------

/// One frame on the interactive exec WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionMessage {
    Init {
        #[serde(default)]
        cmd: Vec<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        tty: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<i32>,
    },
    Stdin {
        #[serde(default)]
        data: String,
    },
    Resize {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<i32>,
    },
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    Exit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    Error {
        #[serde(rename = "data")]
        message: String,
    },
    /// Any `type` this side does not understand.
    #[serde(other)]
    Unknown,
}

impl SessionMessage {
    /// `init` for a plain (non-TTY) process.
    pub fn init<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Init {
            cmd: cmd.into_iter().map(Into::into).collect(),
            tty: false,
            cols: None,
            rows: None,
        }
    }

    pub fn exit(termination: Termination) -> Self {
        Self::Exit {
            code: termination.code(),
            signal: termination.signal(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Stdin { .. } => "stdin",
            Self::Resize { .. } => "resize",
            Self::Stdout { .. } => "stdout",
            Self::Stderr { .. } => "stderr",
            Self::Exit { .. } => "exit",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Byte buffers as base64 strings. `null` decodes to an empty buffer.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exec_request_accepts_command() {
        let req = ExecRequest::from_json(br#"{"cmd":["echo","hi"]}"#).unwrap();
        assert_eq!(req.cmd, vec!["echo", "hi"]);
    }

    #[test]
    fn exec_request_rejects_empty_command() {
        let err = ExecRequest::from_json(br#"{"cmd":[]}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyCommand));
    }

    #[test]
    fn exec_request_rejects_missing_command() {
        let err = ExecRequest::from_json(b"{}").unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn exec_request_rejects_garbage() {
        let err = ExecRequest::from_json(b"not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn exec_response_encodes_bytes_as_base64_and_nulls() {
        let resp = ExecResponse::new(
            Termination::Exited(0),
            b"hello world\n".to_vec(),
            Vec::new(),
        );
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            value,
            json!({
                "exit_code": 0,
                "exit_signal": null,
                "stdout": "aGVsbG8gd29ybGQK",
                "stderr": "",
            })
        );
    }

    #[test]
    fn exec_response_decodes_null_output() {
        let resp: ExecResponse = serde_json::from_value(json!({
            "exit_code": null,
            "exit_signal": 9,
            "stdout": null,
            "stderr": null,
        }))
        .unwrap();
        assert_eq!(resp.termination(), Termination::Signaled(9));
        assert!(resp.stdout.is_empty());
        assert!(resp.stderr.is_empty());
    }

    #[test]
    fn termination_never_sets_both() {
        for t in [
            Termination::Exited(3),
            Termination::Signaled(15),
            Termination::Unknown,
        ] {
            let resp = ExecResponse::new(t, Vec::new(), Vec::new());
            assert!(!(resp.exit_code.is_some() && resp.exit_signal.is_some()));
            assert_eq!(resp.termination(), t);
        }
    }

    #[test]
    fn init_frame_decodes_flat_object() {
        let msg = SessionMessage::from_json(
            r#"{"type":"init","cmd":["sh","-c","echo $1 $2","_","hello","world"]}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            SessionMessage::init(["sh", "-c", "echo $1 $2", "_", "hello", "world"])
        );
    }

    #[test]
    fn init_frame_carries_tty_and_dimensions() {
        let msg = SessionMessage::from_json(
            r#"{"type":"init","cmd":["bash"],"tty":true,"cols":80,"rows":24}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            SessionMessage::Init {
                cmd: vec!["bash".to_string()],
                tty: true,
                cols: Some(80),
                rows: Some(24),
            }
        );
    }

    #[test]
    fn out_of_range_dimensions_still_decode() {
        let msg = SessionMessage::from_json(r#"{"type":"resize","cols":70000,"rows":-1}"#).unwrap();
        assert_eq!(
            msg,
            SessionMessage::Resize {
                cols: Some(70000),
                rows: Some(-1)
            }
        );
    }

    #[test]
    fn exit_frame_omits_unset_fields() {
        let text = SessionMessage::exit(Termination::Exited(0)).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "exit", "code": 0}));

        let text = SessionMessage::exit(Termination::Signaled(9))
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "exit", "signal": 9}));

        let text = SessionMessage::exit(Termination::Unknown).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "exit"}));
    }

    #[test]
    fn error_frame_uses_data_field() {
        let text = SessionMessage::error("No active process").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "error", "data": "No active process"}));
    }

    #[test]
    fn unknown_type_decodes_to_unknown() {
        let msg = SessionMessage::from_json(r#"{"type":"signal","data":"x"}"#).unwrap();
        assert_eq!(msg, SessionMessage::Unknown);
        assert_eq!(msg.kind(), "unknown");
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(SessionMessage::from_json(r#"{"data":"x"}"#).is_err());
    }

    #[test]
    fn stdin_without_data_is_empty() {
        let msg = SessionMessage::from_json(r#"{"type":"stdin"}"#).unwrap();
        assert_eq!(
            msg,
            SessionMessage::Stdin {
                data: String::new()
            }
        );
    }
}
