use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure to run a command.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command cannot be empty")]
    EmptyCommand,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("exec task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ExecError {
    pub(crate) fn spawn(program: &str, source: io::Error) -> Self {
        Self::Spawn {
            program: program.to_string(),
            source,
        }
    }
}

/// Failure to collect system metrics from procfs.
#[derive(Debug, Error)]
pub enum SysinfoError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed {}: {detail}", path.display())]
    Parse { path: PathBuf, detail: String },

    #[error("sysinfo task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Failure to set up the exec service's listening socket.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

pub type ExecResult<T> = Result<T, ExecError>;
