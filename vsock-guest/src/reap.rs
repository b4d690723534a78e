//! Child reaping coordination.
//!
//! As PID 1 the supervisor drains zombies with a non-selective
//! `waitpid(-1, WNOHANG)`. A concurrent wait on one specific child can lose
//! its status to that drain, so every status-collecting wait in the process
//! goes through a single [`ReapLock`].
//!
//! Synchronous runs hold the lock from spawn to exit. Interactive children
//! are registered at spawn instead: the drain parks their statuses under the
//! lock, and the owner's [`TrackedChild::wait`] takes them from there, so a
//! status is delivered exactly once whichever side collects it.
//!
//! Spawning takes the lock too: when `exec` fails after `fork`, the standard
//! library waits on the half-started child before returning the error.

use std::collections::HashMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Output};
use std::sync::{Arc, Mutex, MutexGuard};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::Pid;
use tracing::{debug, warn};
use vsock_proto::Termination;

/// Process-wide mutual exclusion for every operation that collects child
/// exit statuses.
///
/// Clones share the same lock.
#[derive(Clone, Default)]
pub struct ReapLock {
    inner: Arc<Mutex<Registry>>,
}

/// State guarded by [`ReapLock`]: children spawned through
/// [`ReapLock::spawn`] that have not been harvested by their owner yet.
///
/// A tracked child collected by the zombie drain has its status parked
/// here until the owning [`TrackedChild::wait`] picks it up.
#[derive(Default)]
pub struct Registry {
    children: HashMap<Pid, Option<WaitStatus>>,
}

impl Registry {
    fn is_live(&self, pid: Pid) -> bool {
        matches!(self.children.get(&pid), Some(None))
    }

    /// Take `pid`'s status if it is available, parked or still a zombie.
    /// `None` means the child is still running.
    fn harvest(&mut self, pid: Pid) -> Option<Termination> {
        if let Some(Some(status)) = self.children.get(&pid) {
            let termination = classify_wait(*status);
            self.children.remove(&pid);
            return Some(termination);
        }
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => None,
            Ok(status) => {
                self.children.remove(&pid);
                Some(classify_wait(status))
            }
            Err(e) => {
                warn!(pid = %pid, error = %e, "child status was collected elsewhere");
                self.children.remove(&pid);
                Some(Termination::Unknown)
            }
        }
    }
}

/// A child collected by [`ReapLock::reap_zombies`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub pid: Pid,
    pub status: WaitStatus,
}

impl ReapLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, blocking the calling thread.
    ///
    /// A panic while holding the lock leaves the registry consistent (every
    /// update is a single map operation), so a poisoned lock is recovered.
    pub fn acquire(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn `cmd`, collect its output and wait for it, all under the lock.
    ///
    /// Blocks for the whole lifetime of the child. Call from a blocking
    /// context.
    pub fn output(&self, cmd: &mut Command) -> io::Result<Output> {
        let _guard = self.acquire();
        cmd.output()
    }

    /// Spawn `cmd` under the lock and register it, so the zombie drain
    /// keeps its status for [`TrackedChild::wait`].
    pub fn spawn(&self, cmd: &mut Command) -> io::Result<TrackedChild> {
        let mut registry = self.acquire();
        let child = cmd.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);
        registry.children.insert(pid, None);
        drop(registry);

        let handle = ChildHandle {
            pid,
            lock: self.clone(),
        };
        Ok(TrackedChild { child, handle })
    }

    /// Collect every exited child without blocking.
    ///
    /// Stops when no more exited children remain (`StillAlive` or `ECHILD`).
    /// Tracked children are parked for their owners and not returned.
    pub fn reap_zombies(&self) -> Vec<Reaped> {
        let mut registry = self.acquire();
        let mut reaped = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                Ok(status) => match status.pid() {
                    Some(pid) => match registry.children.get_mut(&pid) {
                        Some(slot) => {
                            debug!(pid = %pid, "parked status of tracked child");
                            *slot = Some(status);
                        }
                        None => reaped.push(Reaped { pid, status }),
                    },
                    None => break,
                },
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "waitpid failed while draining zombies");
                    break;
                }
            }
        }
        reaped
    }
}

/// A child spawned through [`ReapLock::spawn`].
///
/// Its exit status is delivered exactly once, by [`TrackedChild::wait`].
pub struct TrackedChild {
    child: Child,
    handle: ChildHandle,
}

impl TrackedChild {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// A cloneable handle for signalling the child from elsewhere.
    pub fn handle(&self) -> ChildHandle {
        self.handle.clone()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Block until the child exits, then harvest its status under the lock.
    ///
    /// The blocking part uses `WNOWAIT` and collects nothing, so the lock is
    /// free while the child runs. If the zombie drain got there first, the
    /// status it parked in the registry is returned instead.
    pub fn wait(self) -> Termination {
        let pid = self.handle.pid;
        loop {
            match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                // ECHILD: the drain already collected it.
                Ok(_) | Err(Errno::ECHILD) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => debug!(pid = %pid, error = %e, "waitid before harvest failed"),
            }
            if let Some(termination) = self.handle.lock.acquire().harvest(pid) {
                return termination;
            }
        }
    }
}

/// Signalling side of a [`TrackedChild`].
#[derive(Clone)]
pub struct ChildHandle {
    pid: Pid,
    lock: ReapLock,
}

impl ChildHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether the child's status has been collected, by its owner or by
    /// the zombie drain.
    pub fn is_reaped(&self) -> bool {
        !self.lock.acquire().is_live(self.pid)
    }

    /// SIGKILL the child's process group unless the child was already
    /// collected.
    ///
    /// The check and the signal happen under the lock. An uncollected child
    /// still holds its PID and process group ID, so neither can have been
    /// recycled. The child must have been spawned as a process group leader.
    /// Returns whether a signal was sent.
    pub fn kill(&self) -> bool {
        let registry = self.lock.acquire();
        if !registry.is_live(self.pid) {
            return false;
        }
        match killpg(self.pid, Signal::SIGKILL) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                warn!(pid = %self.pid, error = %e, "failed to kill process group");
                false
            }
        }
    }
}

/// Map an OS exit status to a [`Termination`].
pub fn classify(status: ExitStatus) -> Termination {
    if let Some(signal) = status.signal() {
        Termination::Signaled(signal)
    } else if let Some(code) = status.code() {
        Termination::Exited(code)
    } else {
        Termination::Unknown
    }
}

fn classify_wait(status: WaitStatus) -> Termination {
    match status {
        WaitStatus::Exited(_, code) => Termination::Exited(code),
        WaitStatus::Signaled(_, signal, _) => Termination::Signaled(signal as i32),
        _ => Termination::Unknown,
    }
}
