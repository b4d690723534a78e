//! Point-in-time system metrics read from procfs (`GET /v1/sysinfo`).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Serialize;

use crate::error::SysinfoError;

const PROC_ROOT: &str = "/proc";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfo {
    pub memory: Memory,
    pub net: Vec<NetworkDevice>,
    pub cpus: BTreeMap<usize, Cpu>,
    pub load_average: LoadAverage,
    pub filefd: FileFd,
}

/// `/proc/meminfo`, in bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Memory {
    pub mem_total: u64,
    pub mem_free: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_available: Option<u64>,
    pub buffers: u64,
    pub cached: u64,
    pub swap_cached: u64,
    pub active: u64,
    pub inactive: u64,
    pub swap_total: u64,
    pub swap_free: u64,
    pub dirty: u64,
    pub writeback: u64,
    pub slab: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shmem: Option<u64>,
    pub vmalloc_total: u64,
    pub vmalloc_used: u64,
    pub vmalloc_chunk: u64,
}

/// One row of `/proc/net/dev`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkDevice {
    pub name: String,
    pub recv_bytes: u64,
    pub recv_packets: u64,
    pub recv_errs: u64,
    pub recv_drop: u64,
    pub recv_fifo: u64,
    pub recv_frame: u64,
    pub recv_compressed: u64,
    pub recv_multicast: u64,
    pub sent_bytes: u64,
    pub sent_packets: u64,
    pub sent_errs: u64,
    pub sent_drop: u64,
    pub sent_fifo: u64,
    pub sent_colls: u64,
    pub sent_carrier: u64,
    pub sent_compressed: u64,
}

/// Cumulative per-CPU times in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Cpu {
    pub user: f64,
    pub nice: f64,
    pub system: f64,
    pub idle: f64,
    pub iowait: f64,
    pub irq: f64,
    pub softirq: f64,
    pub steal: f64,
    pub guest: f64,
    pub guest_nice: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadAverage {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileFd {
    pub allocated: u64,
    pub maximum: u64,
}

/// Collect a snapshot from `/proc`. Blocking.
pub fn collect() -> Result<SystemInfo, SysinfoError> {
    collect_from(Path::new(PROC_ROOT), clock_ticks())
}

/// Collect a snapshot from a procfs tree rooted at `root`.
pub fn collect_from(root: &Path, ticks_per_second: f64) -> Result<SystemInfo, SysinfoError> {
    Ok(SystemInfo {
        memory: read_with(root, "meminfo", parse_meminfo)?,
        net: read_with(root, "net/dev", parse_net_dev)?,
        cpus: read_with(root, "stat", |text| parse_stat(text, ticks_per_second))?,
        load_average: read_with(root, "loadavg", parse_loadavg)?,
        filefd: read_with(root, "sys/fs/file-nr", parse_file_nr)?,
    })
}

fn read_with<T>(
    root: &Path,
    name: &str,
    parse: impl FnOnce(&str) -> Result<T, String>,
) -> Result<T, SysinfoError> {
    let path = root.join(name);
    let text = std::fs::read_to_string(&path).map_err(|source| SysinfoError::Read {
        path: path.clone(),
        source,
    })?;
    parse(&text).map_err(|detail| SysinfoError::Parse { path, detail })
}

fn clock_ticks() -> f64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as f64 } else { 100.0 }
}

fn parse_u64(field: &str, what: &str) -> Result<u64, String> {
    field
        .parse()
        .map_err(|_| format!("invalid {what}: {field:?}"))
}

pub(crate) fn parse_meminfo(text: &str) -> Result<Memory, String> {
    let mut fields = HashMap::new();
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let Some(value) = parts.next() else {
            continue;
        };
        let value = parse_u64(value, key)?;
        let bytes = match parts.next() {
            Some("kB") => value.saturating_mul(1024),
            _ => value,
        };
        fields.insert(key.trim(), bytes);
    }

    let total = *fields.get("MemTotal").ok_or("missing MemTotal")?;
    let get = |key: &str| fields.get(key).copied().unwrap_or(0);
    Ok(Memory {
        mem_total: total,
        mem_free: get("MemFree"),
        mem_available: fields.get("MemAvailable").copied(),
        buffers: get("Buffers"),
        cached: get("Cached"),
        swap_cached: get("SwapCached"),
        active: get("Active"),
        inactive: get("Inactive"),
        swap_total: get("SwapTotal"),
        swap_free: get("SwapFree"),
        dirty: get("Dirty"),
        writeback: get("Writeback"),
        slab: get("Slab"),
        shmem: fields.get("Shmem").copied(),
        vmalloc_total: get("VmallocTotal"),
        vmalloc_used: get("VmallocUsed"),
        vmalloc_chunk: get("VmallocChunk"),
    })
}

pub(crate) fn parse_net_dev(text: &str) -> Result<Vec<NetworkDevice>, String> {
    let mut devices = Vec::new();
    // Two header lines precede the per-interface rows.
    for line in text.lines().skip(2) {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name == "lo" {
            continue;
        }
        let values = counters
            .split_whitespace()
            .map(|field| parse_u64(field, name))
            .collect::<Result<Vec<_>, _>>()?;
        let Ok([
            recv_bytes,
            recv_packets,
            recv_errs,
            recv_drop,
            recv_fifo,
            recv_frame,
            recv_compressed,
            recv_multicast,
            sent_bytes,
            sent_packets,
            sent_errs,
            sent_drop,
            sent_fifo,
            sent_colls,
            sent_carrier,
            sent_compressed,
        ]) = <[u64; 16]>::try_from(values.as_slice())
        else {
            return Err(format!("expected 16 counters for {name}, got {}", values.len()));
        };
        devices.push(NetworkDevice {
            name: name.to_string(),
            recv_bytes,
            recv_packets,
            recv_errs,
            recv_drop,
            recv_fifo,
            recv_frame,
            recv_compressed,
            recv_multicast,
            sent_bytes,
            sent_packets,
            sent_errs,
            sent_drop,
            sent_fifo,
            sent_colls,
            sent_carrier,
            sent_compressed,
        });
    }
    Ok(devices)
}

pub(crate) fn parse_stat(text: &str, ticks_per_second: f64) -> Result<BTreeMap<usize, Cpu>, String> {
    let mut cpus = BTreeMap::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let Some(label) = parts.next() else {
            continue;
        };
        // "cpu" alone is the aggregate row.
        let Some(index) = label.strip_prefix("cpu").filter(|n| !n.is_empty()) else {
            continue;
        };
        let index: usize = index
            .parse()
            .map_err(|_| format!("invalid cpu label {label:?}"))?;
        let mut times = [0.0f64; 10];
        for (slot, field) in times.iter_mut().zip(parts) {
            *slot = parse_u64(field, label)? as f64 / ticks_per_second;
        }
        let [user, nice, system, idle, iowait, irq, softirq, steal, guest, guest_nice] = times;
        cpus.insert(
            index,
            Cpu {
                user,
                nice,
                system,
                idle,
                iowait,
                irq,
                softirq,
                steal,
                guest,
                guest_nice,
            },
        );
    }
    Ok(cpus)
}

pub(crate) fn parse_loadavg(text: &str) -> Result<LoadAverage, String> {
    let mut fields = text.split_whitespace().map(|field| {
        field
            .parse::<f64>()
            .map_err(|_| format!("invalid load average {field:?}"))
    });
    let mut next = || fields.next().unwrap_or(Err("truncated loadavg".to_string()));
    Ok(LoadAverage {
        load1: next()?,
        load5: next()?,
        load15: next()?,
    })
}

/// `file-nr` holds `allocated free maximum`.
pub(crate) fn parse_file_nr(text: &str) -> Result<FileFd, String> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    match fields.as_slice() {
        [allocated, _, maximum, ..] => Ok(FileFd {
            allocated: parse_u64(allocated, "allocated")?,
            maximum: parse_u64(maximum, "maximum")?,
        }),
        _ => Err(format!("expected 3 fields, got {}", fields.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "\
MemTotal:        2030468 kB
MemFree:         1627492 kB
MemAvailable:    1789392 kB
Buffers:           10388 kB
Cached:           218060 kB
SwapCached:            0 kB
Active:           120608 kB
Inactive:         171744 kB
SwapTotal:             0 kB
SwapFree:              0 kB
Dirty:                 8 kB
Writeback:             0 kB
Slab:              40916 kB
VmallocTotal:   34359738367 kB
VmallocUsed:        5252 kB
VmallocChunk:          0 kB
HugePages_Total:       0
";

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    1200      12    0    0    0     0          0         0     1200      12    0    0    0     0       0          0
  eth0: 9001472    6789    1    2    0     0          0         3   544321    4321    0    0    0     0       0          0
";

    const STAT: &str = "\
cpu  200 0 100 1000 10 0 5 0 0 0
cpu0 100 0 50 500 5 0 2 0 0 0
cpu1 100 0 50 500 5 0 3 0 0 0
intr 12345 0 0
ctxt 678
";

    #[test]
    fn meminfo_converts_kib_to_bytes() {
        let mem = parse_meminfo(MEMINFO).unwrap();
        assert_eq!(mem.mem_total, 2030468 * 1024);
        assert_eq!(mem.mem_available, Some(1789392 * 1024));
        assert_eq!(mem.slab, 40916 * 1024);
        assert_eq!(mem.shmem, None);
    }

    #[test]
    fn meminfo_requires_total() {
        assert!(parse_meminfo("MemFree: 10 kB\n").is_err());
    }

    #[test]
    fn net_dev_skips_loopback() {
        let devices = parse_net_dev(NET_DEV).unwrap();
        assert_eq!(devices.len(), 1);
        let eth0 = &devices[0];
        assert_eq!(eth0.name, "eth0");
        assert_eq!(eth0.recv_bytes, 9001472);
        assert_eq!(eth0.recv_errs, 1);
        assert_eq!(eth0.recv_multicast, 3);
        assert_eq!(eth0.sent_packets, 4321);
    }

    #[test]
    fn net_dev_rejects_short_rows() {
        let text = "h1\nh2\n eth0: 1 2 3\n";
        assert!(parse_net_dev(text).is_err());
    }

    #[test]
    fn stat_yields_per_cpu_seconds() {
        let cpus = parse_stat(STAT, 100.0).unwrap();
        assert_eq!(cpus.len(), 2);
        assert_eq!(cpus[&0].user, 1.0);
        assert_eq!(cpus[&0].idle, 5.0);
        assert_eq!(cpus[&1].softirq, 0.03);
    }

    #[test]
    fn loadavg_parses_three_values() {
        let load = parse_loadavg("0.50 0.25 0.10 1/123 4567\n").unwrap();
        assert_eq!(
            load,
            LoadAverage {
                load1: 0.5,
                load5: 0.25,
                load15: 0.1
            }
        );
        assert!(parse_loadavg("0.5\n").is_err());
    }

    #[test]
    fn file_nr_takes_first_and_last() {
        let fd = parse_file_nr("1184\t0\t9223372036854775807\n").unwrap();
        assert_eq!(fd.allocated, 1184);
        assert_eq!(fd.maximum, 9223372036854775807);
    }

    #[test]
    fn collect_from_fixture_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("net")).unwrap();
        std::fs::create_dir_all(root.join("sys/fs")).unwrap();
        std::fs::write(root.join("meminfo"), MEMINFO).unwrap();
        std::fs::write(root.join("net/dev"), NET_DEV).unwrap();
        std::fs::write(root.join("stat"), STAT).unwrap();
        std::fs::write(root.join("loadavg"), "1.00 2.00 3.00 1/1 1\n").unwrap();
        std::fs::write(root.join("sys/fs/file-nr"), "10 0 100\n").unwrap();

        let info = collect_from(root, 100.0).unwrap();
        assert_eq!(info.cpus.len(), 2);
        assert_eq!(info.filefd.maximum, 100);

        let json = serde_json::to_value(&info).unwrap();
        for key in ["memory", "net", "cpus", "load_average", "filefd"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert!(json["cpus"].get("0").is_some());
    }

    #[test]
    fn missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = collect_from(dir.path(), 100.0).unwrap_err();
        assert!(matches!(err, SysinfoError::Read { ref path, .. } if path.ends_with("meminfo")));
    }
}
