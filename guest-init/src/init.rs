//! Boot-time system setup: pseudo filesystems, configured mounts, hostname
//! and the `/etc` files derived from the run config.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{MsFlags, mount};
use nix::sys::signal::{SigHandler, Signal, signal};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{EtcHost, EtcResolv, MountConfig, RunConfig};

const ETC_HOSTS: &str = "/etc/hosts";
const ETC_RESOLV: &str = "/etc/resolv.conf";

/// Errors that abort boot.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("must run as PID 1, currently running as PID {0}")]
    NotPid1(i32),

    #[error("failed to create mount target {}: {source}", path.display())]
    Mkdir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to mount {fstype} on {}: {source}", target.display())]
    Mount {
        target: PathBuf,
        fstype: String,
        #[source]
        source: Errno,
    },

    #[error("failed to set hostname to {name}: {source}")]
    Hostname {
        name: String,
        #[source]
        source: Errno,
    },

    #[error("failed to write {}: {source}", path.display())]
    WriteFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to configure signal {signal}: {source}")]
    Signal {
        signal: Signal,
        #[source]
        source: Errno,
    },
}

pub type InitResult<T> = Result<T, InitError>;

pub fn ensure_pid1() -> InitResult<()> {
    let pid = std::process::id() as i32;
    if pid != 1 {
        return Err(InitError::NotPid1(pid));
    }
    Ok(())
}

/// Run every boot step in order.
pub fn setup(config: &RunConfig) -> InitResult<()> {
    mount_essential()?;
    mount_extra(&config.mounts)?;
    set_hostname(config.hostname())?;
    if !config.etc_hosts.is_empty() {
        write_file(Path::new(ETC_HOSTS), &render_hosts(&config.etc_hosts))?;
    }
    if let Some(resolv) = &config.etc_resolv {
        write_file(Path::new(ETC_RESOLV), &render_resolv(resolv))?;
    }
    for ip in &config.ip_configs {
        if let Some(addr) = &ip.ip {
            let gateway = ip.gateway.map_or_else(|| "-".to_string(), |g| g.to_string());
            info!(ip = %addr, gateway = %gateway, "interface addressing is left to the host");
        }
    }
    if config.tty {
        warn!("tty requested but not supported, workload runs without a terminal");
    }
    ignore_job_control_signals()?;
    info!("system setup complete");
    Ok(())
}

struct PseudoMount {
    target: &'static str,
    fstype: &'static str,
    flags: MsFlags,
    data: Option<&'static str>,
    required: bool,
}

fn essential_mounts() -> [PseudoMount; 6] {
    let common = MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID;
    [
        PseudoMount {
            target: "/proc",
            fstype: "proc",
            flags: common,
            data: None,
            required: true,
        },
        PseudoMount {
            target: "/dev/pts",
            fstype: "devpts",
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            data: Some("mode=0620,gid=5,ptmxmode=666"),
            required: true,
        },
        PseudoMount {
            target: "/dev/mqueue",
            fstype: "mqueue",
            flags: common,
            data: None,
            required: true,
        },
        PseudoMount {
            target: "/dev/shm",
            fstype: "tmpfs",
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            data: None,
            required: true,
        },
        PseudoMount {
            target: "/sys",
            fstype: "sysfs",
            flags: common,
            data: None,
            required: true,
        },
        // cgroup v1 without a controller list is refused by some kernels.
        PseudoMount {
            target: "/sys/fs/cgroup",
            fstype: "cgroup",
            flags: common,
            data: None,
            required: false,
        },
    ]
}

/// Mount the pseudo filesystems every workload expects.
pub fn mount_essential() -> InitResult<()> {
    for m in essential_mounts() {
        match mount_at(Path::new(m.target), "none", m.fstype, m.flags, m.data) {
            Ok(()) => debug!(mountpoint = m.target, fstype = m.fstype, "mounted"),
            Err(e) if !m.required => warn!(error = %e, "optional mount failed"),
            Err(e) => return Err(e),
        }
    }
    info!("essential filesystems mounted");
    Ok(())
}

/// Mount the block devices listed in the config.
pub fn mount_extra(mounts: &[MountConfig]) -> InitResult<()> {
    for m in mounts {
        let fstype = m.fs_type.as_deref().unwrap_or("ext4");
        mount_at(
            Path::new(&m.mount_path),
            &m.device_path,
            fstype,
            MsFlags::empty(),
            m.options.as_deref(),
        )?;
        info!(device = %m.device_path, mountpoint = %m.mount_path, fstype, "mounted volume");
    }
    Ok(())
}

fn mount_at(
    target: &Path,
    source: &str,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> InitResult<()> {
    fs::create_dir_all(target).map_err(|source| InitError::Mkdir {
        path: target.to_path_buf(),
        source,
    })?;
    match mount(Some(source), target, Some(fstype), flags, data) {
        Ok(()) => Ok(()),
        // Already mounted, e.g. by the kernel or an initramfs.
        Err(Errno::EBUSY) => {
            debug!(mountpoint = %target.display(), "already mounted");
            Ok(())
        }
        Err(source) => Err(InitError::Mount {
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
            source,
        }),
    }
}

pub fn set_hostname(name: &str) -> InitResult<()> {
    nix::unistd::sethostname(name).map_err(|source| InitError::Hostname {
        name: name.to_string(),
        source,
    })?;
    info!(hostname = name, "hostname set");
    Ok(())
}

/// SIGTTIN/SIGTTOU would stop init when a child touches the console.
/// SIGCHLD stays at its default so wait calls keep observing children.
fn ignore_job_control_signals() -> InitResult<()> {
    for sig in [Signal::SIGTTIN, Signal::SIGTTOU] {
        // SAFETY: SIG_IGN installs no handler code.
        unsafe { signal(sig, SigHandler::SigIgn) }.map_err(|source| InitError::Signal {
            signal: sig,
            source,
        })?;
    }
    Ok(())
}

fn write_file(path: &Path, contents: &str) -> InitResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| InitError::Mkdir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, contents).map_err(|source| InitError::WriteFile {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "wrote file");
    Ok(())
}

pub fn render_hosts(hosts: &[EtcHost]) -> String {
    let mut out = String::from("127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost ip6-loopback\n");
    for host in hosts {
        let _ = write!(out, "{}\t{}", host.ip, host.host);
        if let Some(description) = host.description.as_deref().filter(|d| !d.is_empty()) {
            let _ = write!(out, "\t# {description}");
        }
        out.push('\n');
    }
    out
}

pub fn render_resolv(resolv: &EtcResolv) -> String {
    let mut out = String::new();
    for ns in &resolv.nameservers {
        let _ = writeln!(out, "nameserver {ns}");
    }
    if !resolv.search.is_empty() {
        let _ = writeln!(out, "search {}", resolv.search.join(" "));
    }
    if !resolv.options.is_empty() {
        let _ = writeln!(out, "options {}", resolv.options.join(" "));
    }
    out
}
