//! One-shot command execution (`POST /v1/exec`).

use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::info;
use vsock_proto::ExecResponse;

use crate::error::{ExecError, ExecResult};
use crate::reap::{ReapLock, classify};

/// Maximum length for command preview in logs
const COMMAND_PREVIEW_MAX_LEN: usize = 100;

/// Builds and runs commands with a fixed environment.
///
/// Commands see exactly the configured overlay, never the init's own
/// environment. Both the one-shot endpoint and interactive sessions build
/// their commands here.
#[derive(Clone)]
pub struct ExecService {
    env: Arc<Vec<(String, String)>>,
    reap: ReapLock,
}

impl ExecService {
    pub fn new<I, K, V>(env: I, reap: ReapLock) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            env: Arc::new(env.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
            reap,
        }
    }

    pub fn reap_lock(&self) -> &ReapLock {
        &self.reap
    }

    /// Build a [`Command`] for `argv` with a cleared environment plus the
    /// overlay. The program name is resolved by the default search path.
    pub fn command(&self, argv: &[String]) -> ExecResult<Command> {
        let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        Ok(cmd)
    }

    /// Run `argv` to completion and capture its output.
    ///
    /// The whole spawn, read and wait sequence runs on the blocking pool
    /// while holding the reap lock, so no zombie drain can interleave.
    pub async fn execute(&self, argv: Vec<String>) -> ExecResult<ExecResponse> {
        let mut cmd = self.command(&argv)?;
        cmd.stdin(Stdio::null());

        let preview = truncate_preview(&argv.join(" "));
        info!(cmd = %preview, "exec");

        let reap = self.reap.clone();
        let output = tokio::task::spawn_blocking(move || reap.output(&mut cmd))
            .await?
            .map_err(|e| ExecError::spawn(argv.first().map_or("", String::as_str), e))?;

        let termination = classify(output.status);
        info!(
            cmd = %preview,
            status = %termination,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            "exec finished"
        );
        Ok(ExecResponse::new(termination, output.stdout, output.stderr))
    }
}

/// Truncate a command string for logging, preserving UTF-8 boundaries
pub(crate) fn truncate_preview(s: &str) -> String {
    if s.len() <= COMMAND_PREVIEW_MAX_LEN {
        return s.to_string();
    }
    let end = s
        .char_indices()
        .take_while(|(i, _)| *i < COMMAND_PREVIEW_MAX_LEN)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(COMMAND_PREVIEW_MAX_LEN);
    format!("{}...", s.get(..end).unwrap_or(s))
}
