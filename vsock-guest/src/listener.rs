//! Listening sockets and the per-connection HTTP loop.

use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::time::Duration;

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::error::ServeError;

/// Pause after a failed accept, so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Pending-connection queue length for the vsock socket.
#[cfg(target_os = "linux")]
const LISTEN_BACKLOG: libc::c_int = 128;

/// Where the exec service accepts connections.
pub enum Listener {
    /// AF_VSOCK on (any CID, port), for the host.
    Vsock(VsockListener),
    /// Unix domain socket, for tests and local development.
    Unix(UnixListener),
}

impl Listener {
    pub fn vsock(port: u32) -> Result<Self, ServeError> {
        VsockListener::bind(port)
            .map(Self::Vsock)
            .map_err(|source| ServeError::Bind {
                addr: format!("vsock port {port}"),
                source,
            })
    }

    /// Bind a Unix socket, replacing a stale socket file left at `path`.
    pub fn unix(path: impl AsRef<Path>) -> Result<Self, ServeError> {
        let path = path.as_ref();
        let bind_error = |source| ServeError::Bind {
            addr: path.display().to_string(),
            source,
        };
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_error(e)),
        }
        UnixListener::bind(path).map(Self::Unix).map_err(bind_error)
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        match self {
            Self::Vsock(listener) => listener.accept().await,
            Self::Unix(listener) => listener.accept().await.map(|(stream, _)| stream),
        }
    }
}

/// Non-blocking AF_VSOCK listening socket registered with the tokio reactor.
pub struct VsockListener {
    fd: AsyncFd<OwnedFd>,
}

impl VsockListener {
    #[cfg(target_os = "linux")]
    pub fn bind(port: u32) -> io::Result<Self> {
        use std::os::fd::{AsRawFd, FromRawFd};

        // SAFETY: plain socket(2) call; the result is checked before use.
        let raw = unsafe {
            libc::socket(
                libc::AF_VSOCK,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a freshly created socket owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_vm is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_vm = unsafe { std::mem::zeroed() };
        addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
        addr.svm_port = port;
        addr.svm_cid = libc::VMADDR_CID_ANY;

        // SAFETY: addr is a valid sockaddr_vm and the length matches it.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: fd is a bound stream socket.
        if unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: AsyncFd::with_interest(fd, Interest::READABLE)?,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn bind(_port: u32) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "vsock is only supported on Linux",
        ))
    }

    /// Accept one connection as a stream socket.
    #[cfg(target_os = "linux")]
    pub async fn accept(&self) -> io::Result<UnixStream> {
        use std::os::fd::{AsRawFd, FromRawFd};

        loop {
            let mut guard = self.fd.readable().await?;
            let accepted = guard.try_io(|fd| {
                // SAFETY: fd is a listening socket; peer address is not requested.
                let conn = unsafe {
                    libc::accept4(
                        fd.as_raw_fd(),
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    )
                };
                if conn < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(conn)
                }
            });
            match accepted {
                Ok(Ok(conn)) => {
                    // SAFETY: accept4 returned a new connected socket that we own.
                    // Stream I/O on it is the same as on a Unix stream socket.
                    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(conn) };
                    return UnixStream::from_std(stream);
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub async fn accept(&self) -> io::Result<UnixStream> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "vsock is only supported on Linux",
        ))
    }
}

/// Accept connections forever, serving each with `router` on its own task.
pub async fn serve(listener: Listener, router: Router) {
    info!("exec service accepting connections");
    loop {
        match listener.accept().await {
            Ok(stream) => {
                let router = router.clone();
                tokio::spawn(serve_connection(stream, router));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn serve_connection(stream: UnixStream, router: Router) {
    let service = TowerToHyperService::new(router);
    let result = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await;
    if let Err(e) = result {
        debug!(error = %e, "connection ended with error");
    }
}
