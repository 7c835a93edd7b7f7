//! Host health sampling.
//!
//! Reads disk, memory, load and uptime from the OS and derives a
//! healthy/unhealthy verdict. Any counter that cannot be read degrades to zero
//! instead of failing the heartbeat.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::statvfs::statvfs;
use tracing::debug;

use super::types::NodeRole;

pub const DISK_THRESHOLD_PCT: f64 = 90.0;
pub const MEMORY_THRESHOLD_PCT: f64 = 95.0;
pub const LOAD_THRESHOLD: f64 = 98.0;
pub const NOMINAL_SUMMARY: &str = "All systems nominal";

/// Raw host counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostMetrics {
    pub disk_used_pct: f64,
    pub mem_used_pct: f64,
    pub cpu_load_1m: f64,
    pub uptime: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub disk_used_pct: f64,
    pub mem_used_pct: f64,
    pub cpu_load_1m: f64,
    pub uptime: Duration,
    pub disk_ok: bool,
    pub mem_ok: bool,
    pub cpu_ok: bool,
    /// Only evaluated on gateways.
    pub proxy_ok: Option<bool>,
    pub healthy: bool,
    pub summary: String,
}

impl HealthSnapshot {
    pub fn evaluate(metrics: HostMetrics, role: NodeRole, last_reload_ok: bool) -> Self {
        let disk_ok = metrics.disk_used_pct < DISK_THRESHOLD_PCT;
        let mem_ok = metrics.mem_used_pct < MEMORY_THRESHOLD_PCT;
        let cpu_ok = metrics.cpu_load_1m < LOAD_THRESHOLD;
        let proxy_ok = (role == NodeRole::Gateway).then_some(last_reload_ok);

        let mut failing = Vec::new();
        if !disk_ok {
            failing.push("Disk space critical");
        }
        if !mem_ok {
            failing.push("Memory usage critical");
        }
        if !cpu_ok {
            failing.push("CPU load critical");
        }
        if proxy_ok == Some(false) {
            failing.push("Caddy reload failed");
        }

        let healthy = failing.is_empty();
        let summary = if healthy {
            NOMINAL_SUMMARY.to_string()
        } else {
            failing.join(", ")
        };

        Self {
            disk_used_pct: metrics.disk_used_pct,
            mem_used_pct: metrics.mem_used_pct,
            cpu_load_1m: metrics.cpu_load_1m,
            uptime: metrics.uptime,
            disk_ok,
            mem_ok,
            cpu_ok,
            proxy_ok,
            healthy,
            summary,
        }
    }
}

pub struct HealthSampler {
    proc_root: PathBuf,
    disk_path: PathBuf,
}

impl Default for HealthSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthSampler {
    pub fn new() -> Self {
        Self::with_paths("/proc", "/")
    }

    /// Sample from an alternate procfs root and filesystem.
    pub fn with_paths(proc_root: impl Into<PathBuf>, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            disk_path: disk_path.into(),
        }
    }

    pub async fn sample(&self, role: NodeRole, last_reload_ok: bool) -> HealthSnapshot {
        HealthSnapshot::evaluate(self.read_metrics().await, role, last_reload_ok)
    }

    pub async fn read_metrics(&self) -> HostMetrics {
        let (meminfo, loadavg, uptime) = tokio::join!(
            tokio::fs::read_to_string(self.proc_root.join("meminfo")),
            tokio::fs::read_to_string(self.proc_root.join("loadavg")),
            tokio::fs::read_to_string(self.proc_root.join("uptime")),
        );

        let disk_used_pct = disk_used_pct(&self.disk_path).unwrap_or_else(|e| {
            debug!(path = %self.disk_path.display(), error = %e, "disk usage unavailable");
            0.0
        });

        HostMetrics {
            disk_used_pct,
            mem_used_pct: meminfo
                .ok()
                .and_then(|s| parse_meminfo_used_pct(&s))
                .unwrap_or(0.0),
            cpu_load_1m: loadavg.ok().and_then(|s| parse_loadavg(&s)).unwrap_or(0.0),
            uptime: uptime.ok().and_then(|s| parse_uptime(&s)).unwrap_or_default(),
        }
    }
}

fn disk_used_pct(path: &Path) -> nix::Result<f64> {
    let stat = statvfs(path)?;
    let block = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * block;
    let free = stat.blocks_free() as u64 * block;
    Ok(used_pct(total, free))
}

fn used_pct(total: u64, free: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    total.saturating_sub(free) as f64 / total as f64 * 100.0
}

fn parse_meminfo_kb(meminfo: &str, field: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|l| l.split(':').next() == Some(field))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

/// Used memory based on `MemAvailable`, which accounts for reclaimable cache.
fn parse_meminfo_used_pct(meminfo: &str) -> Option<f64> {
    let total = parse_meminfo_kb(meminfo, "MemTotal")?;
    if total == 0 {
        return Some(0.0);
    }
    let available = parse_meminfo_kb(meminfo, "MemAvailable")?;
    Some(total.saturating_sub(available) as f64 / total as f64 * 100.0)
}

fn parse_loadavg(loadavg: &str) -> Option<f64> {
    loadavg.split_whitespace().next()?.parse().ok()
}

fn parse_uptime(uptime: &str) -> Option<Duration> {
    let secs: f64 = uptime.split_whitespace().next()?.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

pub fn fmt_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let days = secs / 86400;
    let hours = (secs % 86400) / 3600;
    let mins = (secs % 3600) / 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, mins)
    } else if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else {
        format!("{}m", mins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(disk: f64, mem: f64, load: f64) -> HostMetrics {
        HostMetrics {
            disk_used_pct: disk,
            mem_used_pct: mem,
            cpu_load_1m: load,
            uptime: Duration::from_secs(3600),
        }
    }

    #[test]
    fn nominal_when_below_all_thresholds() {
        let snap = HealthSnapshot::evaluate(metrics(89.9, 94.9, 97.9), NodeRole::Gateway, true);
        assert!(snap.healthy);
        assert_eq!(snap.summary, NOMINAL_SUMMARY);
        assert_eq!(snap.proxy_ok, Some(true));
    }

    #[test]
    fn thresholds_are_inclusive() {
        let snap = HealthSnapshot::evaluate(metrics(90.0, 10.0, 1.0), NodeRole::Server, true);
        assert!(!snap.healthy);
        assert_eq!(snap.summary, "Disk space critical");

        let snap = HealthSnapshot::evaluate(metrics(10.0, 95.0, 98.0), NodeRole::Server, true);
        assert_eq!(snap.summary, "Memory usage critical, CPU load critical");
        assert!(snap.disk_ok);
        assert!(!snap.mem_ok);
        assert!(!snap.cpu_ok);
    }

    #[test]
    fn reload_failure_only_counts_on_gateways() {
        let server = HealthSnapshot::evaluate(metrics(1.0, 1.0, 1.0), NodeRole::Server, false);
        assert!(server.healthy);
        assert_eq!(server.proxy_ok, None);

        let gateway = HealthSnapshot::evaluate(metrics(1.0, 1.0, 1.0), NodeRole::Gateway, false);
        assert!(!gateway.healthy);
        assert_eq!(gateway.summary, "Caddy reload failed");
    }

    #[test]
    fn all_reasons_listed_in_order() {
        let snap = HealthSnapshot::evaluate(metrics(99.0, 99.0, 120.0), NodeRole::Gateway, false);
        assert_eq!(
            snap.summary,
            "Disk space critical, Memory usage critical, CPU load critical, Caddy reload failed"
        );
    }

    #[test]
    fn parses_proc_files() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        assert_eq!(parse_meminfo_used_pct(meminfo), Some(75.0));
        assert_eq!(parse_loadavg("1.52 0.98 0.40 2/345 6789\n"), Some(1.52));
        assert_eq!(
            parse_uptime("93784.51 180000.00\n").map(|d| d.as_secs()),
            Some(93784)
        );
        assert_eq!(parse_meminfo_used_pct("garbage"), None);
    }

    #[test]
    fn formats_uptime() {
        assert_eq!(fmt_uptime(Duration::from_secs(93784)), "1d 2h 3m");
        assert_eq!(fmt_uptime(Duration::from_secs(7260)), "2h 1m");
        assert_eq!(fmt_uptime(Duration::from_secs(59)), "0m");
    }

    #[tokio::test]
    async fn sampler_reads_fake_procfs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("meminfo"),
            "MemTotal: 1024 kB\nMemAvailable: 24 kB\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("loadavg"), "0.50 0.40 0.30 1/100 42\n").unwrap();
        std::fs::write(dir.path().join("uptime"), "120.00 240.00\n").unwrap();

        let sampler = HealthSampler::with_paths(dir.path(), dir.path());
        let snap = sampler.sample(NodeRole::Server, true).await;
        assert_eq!(snap.mem_used_pct, 97.65625);
        assert_eq!(snap.cpu_load_1m, 0.5);
        assert_eq!(snap.uptime, Duration::from_secs(120));
        assert!(!snap.healthy);
        assert!(snap.summary.contains("Memory usage critical"));
    }

    #[test]
    fn disk_usage_of_real_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let pct = disk_used_pct(dir.path()).unwrap();
        assert!((0.0..=100.0).contains(&pct));
        assert!(disk_used_pct(Path::new("/nonexistent/disk")).is_err());
        assert_eq!(used_pct(0, 0), 0.0);
        assert_eq!(used_pct(200, 50), 75.0);
    }

    #[tokio::test]
    async fn unreadable_counters_degrade_to_zero() {
        let sampler = HealthSampler::with_paths("/nonexistent/proc", "/nonexistent/disk");
        let metrics = sampler.read_metrics().await;
        assert_eq!(metrics, HostMetrics::default());
    }
}
