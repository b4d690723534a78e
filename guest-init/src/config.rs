//! Run configuration loaded from `/fly/run.json`.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/fly/run.json";

const DEFAULT_USER: &str = "root";
const DEFAULT_WORKING_DIR: &str = "/";
const DEFAULT_HOSTNAME: &str = "localhost";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config JSON {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration validation failed: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Image defaults baked into the root filesystem.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageConfig {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunConfig {
    pub image_config: Option<ImageConfig>,
    pub exec_override: Vec<String>,
    pub extra_env: BTreeMap<String, String>,
    pub user_override: Option<String>,
    pub cmd_override: Option<String>,
    pub ip_configs: Vec<IpConfig>,
    pub tty: bool,
    pub hostname: Option<String>,
    pub mounts: Vec<MountConfig>,
    pub etc_resolv: Option<EtcResolv>,
    pub etc_hosts: Vec<EtcHost>,
}

/// An address in CIDR notation, e.g. `172.16.0.2/30`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid CIDR {s}: missing prefix length"))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|e| format!("invalid CIDR {s}: {e}"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| format!("invalid CIDR {s}: {e}"))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(format!("invalid CIDR {s}: prefix exceeds {max}"));
        }
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Interface addressing. Validated at load time; not applied by init.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawIpConfig")]
pub struct IpConfig {
    pub ip: Option<Cidr>,
    pub gateway: Option<Cidr>,
}

#[derive(Deserialize)]
struct RawIpConfig {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    gateway: String,
}

impl TryFrom<RawIpConfig> for IpConfig {
    type Error = String;

    fn try_from(raw: RawIpConfig) -> Result<Self, Self::Error> {
        let parse = |s: &str| -> Result<Option<Cidr>, String> {
            if s.is_empty() { Ok(None) } else { s.parse().map(Some) }
        };
        Ok(Self {
            ip: parse(&raw.ip)?,
            gateway: parse(&raw.gateway)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MountConfig {
    pub mount_path: String,
    pub device_path: String,
    pub fs_type: Option<String>,
    pub options: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EtcResolv {
    pub nameservers: Vec<String>,
    pub search: Vec<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EtcHost {
    pub host: String,
    pub ip: String,
    pub description: Option<String>,
}

/// What the supervisor runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadDescriptor {
    pub command: Vec<String>,
    /// Added on top of init's own environment.
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
    pub user: String,
    pub hostname: String,
}

impl RunConfig {
    /// Read and parse the config file. Does not validate.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let data = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Command resolution: execOverride, then cmdOverride (whitespace split),
    /// then image entrypoint + cmd.
    pub fn command(&self) -> Vec<String> {
        if !self.exec_override.is_empty() {
            return self.exec_override.clone();
        }
        if let Some(cmd) = self.cmd_override.as_deref().filter(|c| !c.trim().is_empty()) {
            return cmd.split_whitespace().map(str::to_string).collect();
        }
        match &self.image_config {
            Some(image) => image
                .entrypoint
                .iter()
                .chain(image.cmd.iter())
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Image env followed by extraEnv. Entries without `=` are skipped.
    pub fn environment(&self) -> Vec<(String, String)> {
        let image_env = self.image_config.iter().flat_map(|image| &image.env);
        let mut env: Vec<(String, String)> = image_env
            .filter_map(|entry| match entry.split_once('=') {
                Some((key, value)) => Some((key.to_string(), value.to_string())),
                None => {
                    warn!(entry = %entry, "ignoring image env entry without '='");
                    None
                }
            })
            .collect();
        env.extend(
            self.extra_env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env
    }

    pub fn user(&self) -> String {
        non_empty(self.user_override.as_deref())
            .or_else(|| non_empty(self.image_config.as_ref()?.user.as_deref()))
            .unwrap_or(DEFAULT_USER)
            .to_string()
    }

    pub fn working_dir(&self) -> PathBuf {
        let dir = self
            .image_config
            .as_ref()
            .and_then(|image| non_empty(image.working_dir.as_deref()))
            .unwrap_or(DEFAULT_WORKING_DIR);
        PathBuf::from(dir)
    }

    pub fn hostname(&self) -> &str {
        non_empty(self.hostname.as_deref()).unwrap_or(DEFAULT_HOSTNAME)
    }

    pub fn workload(&self) -> WorkloadDescriptor {
        WorkloadDescriptor {
            command: self.command(),
            env: self.environment(),
            working_dir: self.working_dir(),
            user: self.user(),
            hostname: self.hostname().to_string(),
        }
    }

    /// The exec service's environment overlay.
    pub fn exec_env(&self) -> Vec<(String, String)> {
        self.extra_env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.command().is_empty() {
            return invalid("no command specified to run".into());
        }
        for (i, ip) in self.ip_configs.iter().enumerate() {
            if ip.ip.is_none() {
                return invalid(format!("IP config {i}: IP address is required"));
            }
        }
        for (i, mount) in self.mounts.iter().enumerate() {
            if mount.mount_path.is_empty() {
                return invalid(format!("mount {i}: mountPath is required"));
            }
            if mount.device_path.is_empty() {
                return invalid(format!("mount {i}: devicePath is required"));
            }
        }
        for (i, host) in self.etc_hosts.iter().enumerate() {
            if host.host.is_empty() {
                return invalid(format!("etcHosts {i}: host is required"));
            }
            if host.ip.parse::<IpAddr>().is_err() {
                return invalid(format!("etcHosts {i}: invalid IP address {}", host.ip));
            }
        }
        if let Some(resolv) = &self.etc_resolv {
            for (i, ns) in resolv.nameservers.iter().enumerate() {
                if ns.parse::<IpAddr>().is_err() {
                    return invalid(format!(
                        "etcResolv nameserver {i}: invalid IP address {ns}"
                    ));
                }
            }
        }
        Ok(())
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}
