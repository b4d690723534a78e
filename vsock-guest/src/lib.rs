//! Guest side of the host-guest exec service.
//!
//! The exec service runs inside the VM next to the supervisor. It answers
//! HTTP on vsock port 1000 (or a Unix socket in tests): one-shot command
//! execution, interactive sessions over WebSocket, health and system
//! metrics. Every child status wait in the process is serialized through
//! [`ReapLock`], shared with the supervisor's zombie drain.
//!
//! Wire types live in the `vsock-proto` crate.

pub mod error;
pub mod exec;
pub mod listener;
pub mod reap;
pub mod server;
pub mod session;
pub mod sysinfo;

pub use error::{ExecError, ServeError, SysinfoError};
pub use exec::ExecService;
pub use listener::Listener;
pub use reap::{ReapLock, Reaped};

/// Serve the exec API on `listener` until the process exits.
pub async fn run(listener: Listener, exec: ExecService) {
    listener::serve(listener, server::router(exec)).await;
}
