//! PID 1 responsibilities: run the workload, forward termination to it and
//! reap every orphan that gets re-parented to us.
//!
//! Zombies are drained on each SIGCHLD with a non-blocking wait-any, under
//! the same [`ReapLock`] the exec service takes around its own waits, so a
//! status is never collected twice.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::WaitStatus;
use nix::unistd::{Gid, Pid, Uid, User};
use thiserror::Error;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::{JoinError, JoinHandle};
use tracing::{info, warn};
use vsock_guest::{ReapLock, Reaped};

use crate::config::WorkloadDescriptor;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no command specified to run")]
    EmptyCommand,

    #[error("unknown user {0}")]
    UnknownUser(String),

    #[error("failed to look up user {user}: {source}")]
    UserLookup {
        user: String,
        #[source]
        source: Errno,
    },

    #[error("failed to start workload {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to register signal handler: {0}")]
    Signals(#[source] io::Error),

    #[error("supervisor task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Why [`Supervisor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Terminate,
    Interrupt,
}

pub struct Supervisor {
    reap: ReapLock,
    workload: Pid,
    workload_status: Option<WaitStatus>,
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
    sigchld: tokio::signal::unix::Signal,
}

impl Supervisor {
    /// Register signal streams, then start the workload under the reap lock.
    ///
    /// Signals are registered first so an early SIGCHLD is not lost.
    pub async fn start(workload: &WorkloadDescriptor, reap: ReapLock) -> SupervisorResult<Self> {
        let sigterm = signal(SignalKind::terminate()).map_err(SupervisorError::Signals)?;
        let sigint = signal(SignalKind::interrupt()).map_err(SupervisorError::Signals)?;
        let sigchld = signal(SignalKind::child()).map_err(SupervisorError::Signals)?;

        let mut cmd = workload_command(workload)?;
        let program = workload.command.first().cloned().unwrap_or_default();
        let lock = reap.clone();
        let child = tokio::task::spawn_blocking(move || {
            let _guard = lock.acquire();
            cmd.spawn()
        })
        .await?
        .map_err(|source| SupervisorError::Spawn { program, source })?;

        let pid = Pid::from_raw(child.id() as i32);
        // The drain collects the workload's status; the handle is not waited on.
        drop(child);
        info!(pid = %pid, cmd = ?workload.command, "workload started");

        Ok(Self {
            reap,
            workload: pid,
            workload_status: None,
            sigterm,
            sigint,
            sigchld,
        })
    }

    /// Handle signals until SIGTERM or SIGINT, which are forwarded to the
    /// workload as SIGTERM.
    ///
    /// Drains run on the blocking pool while the loop keeps listening: a
    /// drain can wait behind a synchronous exec holding the reap lock. A
    /// SIGCHLD arriving mid-drain schedules one more drain.
    pub async fn run(mut self) -> SupervisorResult<Shutdown> {
        info!("init ready, entering signal loop");
        // Children may have exited before the SIGCHLD stream was polled.
        let mut in_flight = Some(self.spawn_drain());
        let mut rerun = false;

        loop {
            tokio::select! {
                _ = self.sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    self.terminate_workload();
                    return Ok(Shutdown::Terminate);
                }
                _ = self.sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    self.terminate_workload();
                    return Ok(Shutdown::Interrupt);
                }
                _ = self.sigchld.recv() => {
                    if in_flight.is_some() {
                        rerun = true;
                    } else {
                        in_flight = Some(self.spawn_drain());
                    }
                }
                reaped = drain_finished(&mut in_flight) => {
                    in_flight = None;
                    self.record(reaped?);
                    if std::mem::take(&mut rerun) {
                        in_flight = Some(self.spawn_drain());
                    }
                }
            }
        }
    }

    fn spawn_drain(&self) -> JoinHandle<Vec<Reaped>> {
        let reap = self.reap.clone();
        tokio::task::spawn_blocking(move || reap.reap_zombies())
    }

    /// Collect every exited child, noting the workload's status if it is
    /// among them.
    pub async fn drain(&mut self) -> SupervisorResult<()> {
        let reaped = self.spawn_drain().await?;
        self.record(reaped);
        Ok(())
    }

    fn record(&mut self, reaped: Vec<Reaped>) {
        for zombie in reaped {
            info!(pid = %zombie.pid, status = ?zombie.status, "reaped zombie process");
            if zombie.pid == self.workload {
                info!(pid = %zombie.pid, status = ?zombie.status, "workload exited");
                self.workload_status = Some(zombie.status);
            }
        }
    }

    /// Send SIGTERM to the workload. Failure is logged, not retried.
    pub fn terminate_workload(&self) {
        if self.workload_status.is_some() {
            return;
        }
        info!(pid = %self.workload, "terminating workload");
        if let Err(e) = kill(self.workload, Signal::SIGTERM) {
            warn!(pid = %self.workload, error = %e, "failed to signal workload");
        }
    }
}

async fn drain_finished(
    in_flight: &mut Option<JoinHandle<Vec<Reaped>>>,
) -> Result<Vec<Reaped>, JoinError> {
    match in_flight {
        Some(drain) => drain.await,
        None => std::future::pending().await,
    }
}

/// Workload command: init's environment plus the configured overlay, in the
/// configured directory, as the configured user.
fn workload_command(workload: &WorkloadDescriptor) -> SupervisorResult<Command> {
    let (program, args) = workload
        .command
        .split_first()
        .ok_or(SupervisorError::EmptyCommand)?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(workload.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(&workload.working_dir);
    if let Some((uid, gid)) = resolve_user(&workload.user)? {
        cmd.uid(uid.as_raw()).gid(gid.as_raw());
    }
    Ok(cmd)
}

/// Resolve `name`, `uid` or `uid:gid`. `root` (and empty) means no switch.
fn resolve_user(user: &str) -> SupervisorResult<Option<(Uid, Gid)>> {
    if user.is_empty() || user == "root" {
        return Ok(None);
    }
    let lookup_error = |source| SupervisorError::UserLookup {
        user: user.to_string(),
        source,
    };

    if let Some((uid, gid)) = user.split_once(':') {
        if let (Ok(uid), Ok(gid)) = (uid.parse(), gid.parse()) {
            return Ok(Some((Uid::from_raw(uid), Gid::from_raw(gid))));
        }
    }
    if let Ok(raw) = user.parse() {
        let uid = Uid::from_raw(raw);
        let gid = User::from_uid(uid)
            .map_err(lookup_error)?
            .map_or(Gid::from_raw(raw), |user| user.gid);
        return Ok(Some((uid, gid)));
    }
    match User::from_name(user).map_err(lookup_error)? {
        Some(user) => Ok(Some((user.uid, user.gid))),
        None => Err(SupervisorError::UnknownUser(user.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn workload(command: &[&str]) -> WorkloadDescriptor {
        WorkloadDescriptor {
            command: command.iter().map(|s| s.to_string()).collect(),
            env: vec![("GREETING".into(), "hi".into())],
            working_dir: PathBuf::from("/"),
            user: "root".into(),
            hostname: "localhost".into(),
        }
    }

    async fn drain_until_exited(supervisor: &mut Supervisor) -> WaitStatus {
        for _ in 0..200 {
            supervisor.drain().await.unwrap();
            if let Some(status) = supervisor.workload_status {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("workload was never reaped");
    }

    #[test]
    fn resolve_user_variants() {
        assert_eq!(resolve_user("root").unwrap(), None);
        assert_eq!(resolve_user("").unwrap(), None);
        assert_eq!(
            resolve_user("1000:1001").unwrap(),
            Some((Uid::from_raw(1000), Gid::from_raw(1001)))
        );
        assert!(matches!(
            resolve_user("no-such-user-for-init-tests"),
            Err(SupervisorError::UnknownUser(_))
        ));
    }

    #[test]
    fn empty_workload_is_rejected() {
        assert!(matches!(
            workload_command(&workload(&[])),
            Err(SupervisorError::EmptyCommand)
        ));
    }

    // Drains reap every child of the test binary, so all supervisor
    // lifecycles run inside this one test.
    #[tokio::test]
    async fn supervises_workload_lifecycle() {
        let reap = ReapLock::new();

        let mut exiting = Supervisor::start(
            &workload(&["sh", "-c", "test \"$GREETING\" = hi && exit 3"]),
            reap.clone(),
        )
        .await
        .unwrap();
        let status = drain_until_exited(&mut exiting).await;
        assert_eq!(status, WaitStatus::Exited(exiting.workload, 3));

        let mut sleeping = Supervisor::start(&workload(&["sleep", "30"]), reap.clone())
            .await
            .unwrap();
        sleeping.terminate_workload();
        let status = drain_until_exited(&mut sleeping).await;
        assert_eq!(
            status,
            WaitStatus::Signaled(sleeping.workload, Signal::SIGTERM, false)
        );

        let missing = Supervisor::start(&workload(&["/nonexistent/workload"]), reap.clone()).await;
        assert!(matches!(missing, Err(SupervisorError::Spawn { .. })));

        // SIGTERM is handled while a drain waits behind a held reap lock.
        let supervisor = Supervisor::start(&workload(&["sleep", "30"]), reap.clone())
            .await
            .unwrap();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let reap = reap.clone();
            std::thread::spawn(move || {
                let _guard = reap.acquire();
                locked_tx.send(()).unwrap();
                let _ = release_rx.recv();
            })
        };
        locked_rx.recv().unwrap();

        let running = tokio::spawn(supervisor.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        kill(nix::unistd::getpid(), Signal::SIGTERM).unwrap();
        let reason = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("SIGTERM was not handled while the reap lock was held")
            .unwrap()
            .unwrap();
        assert_eq!(reason, Shutdown::Terminate);

        release_tx.send(()).unwrap();
        holder.join().unwrap();
    }
}
