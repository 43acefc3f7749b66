//! Per-process resource sampling.
//!
//! Given a PID, [`sample`] blocks for the sampling window and returns CPU
//! utilization over that window, resident memory (percent and bytes) and
//! thread count. Linux reads `/proc` directly; macOS falls back to `ps` and
//! `sysctl`; other platforms report nothing.

use std::time::Duration;

/// One point-in-time resource reading for a monitored process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcSample {
    /// CPU utilization percentage over the sampling window.
    pub cpu: f64,
    /// Resident memory as a percentage of total system memory.
    pub ram: f64,
    /// Resident set size in bytes.
    pub ram_bytes: u64,
    /// Thread count.
    pub threads: u64,
}

/// Sample a process, blocking for `window` to compute the CPU percentage.
///
/// Returns `None` when the process cannot be observed (it exited, or the
/// platform has no process-info facility).
pub async fn sample(pid: u32, window: Duration) -> Option<ProcSample> {
    sample_impl(pid, window).await
}

// ── Linux: /proc ────────────────────────────────────────────────────────

/// Kernel USER_HZ; fixed at 100 on Linux.
#[cfg(target_os = "linux")]
const USER_HZ: f64 = 100.0;

#[cfg(target_os = "linux")]
async fn sample_impl(pid: u32, window: Duration) -> Option<ProcSample> {
    let before = read_cpu_ticks(pid)?;
    tokio::time::sleep(window).await;
    let after = read_cpu_ticks(pid)?;

    let window_secs = window.as_secs_f64().max(f64::EPSILON);
    let cpu = (after.saturating_sub(before)) as f64 / USER_HZ / window_secs * 100.0;

    let (ram_bytes, threads) = read_status(pid)?;
    let total = system_memory_total();
    let ram = if total == 0 {
        0.0
    } else {
        ram_bytes as f64 / total as f64 * 100.0
    };

    Some(ProcSample {
        cpu,
        ram,
        ram_bytes,
        threads,
    })
}

/// Combined utime+stime from `/proc/<pid>/stat`, in clock ticks.
#[cfg(target_os = "linux")]
fn read_cpu_ticks(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_ticks(&stat)
}

/// Parse utime+stime out of a stat line. The comm field is parenthesized
/// and may itself contain spaces or parens, so fields are counted from the
/// last closing paren: state is field 3, utime field 14, stime field 15.
#[cfg(target_os = "linux")]
fn parse_stat_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// (rss bytes, thread count) from `/proc/<pid>/status`.
#[cfg(target_os = "linux")]
fn read_status(pid: u32) -> Option<(u64, u64)> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;

    let mut rss_bytes = None;
    let mut threads = None;
    for line in status.lines() {
        if let Some(val) = line.strip_prefix("VmRSS:") {
            rss_bytes = parse_kb_value(val).map(|kb| kb * 1024);
        } else if let Some(val) = line.strip_prefix("Threads:") {
            threads = val.trim().parse().ok();
        }
    }
    Some((rss_bytes.unwrap_or(0), threads?))
}

/// Total system memory in bytes from `/proc/meminfo`.
#[cfg(target_os = "linux")]
fn system_memory_total() -> u64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    for line in meminfo.lines() {
        if let Some(val) = line.strip_prefix("MemTotal:") {
            if let Some(kb) = parse_kb_value(val) {
                return kb * 1024;
            }
        }
    }
    0
}

/// Parse a value like "  12345 kB" → Some(12345).
#[cfg(target_os = "linux")]
fn parse_kb_value(s: &str) -> Option<u64> {
    s.trim().strip_suffix("kB")?.trim().parse().ok()
}

// ── macOS: ps / sysctl fallback ─────────────────────────────────────────

#[cfg(target_os = "macos")]
async fn sample_impl(pid: u32, window: Duration) -> Option<ProcSample> {
    // ps reports lifetime-average CPU rather than a windowed figure; the
    // sleep keeps the one-blocking-call-per-interval cadence regardless.
    tokio::time::sleep(window).await;

    let output = std::process::Command::new("ps")
        .args(["-o", "pcpu=,rss=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let parts: Vec<&str> = text.split_whitespace().collect();
    let cpu: f64 = parts.first()?.parse().ok()?;
    let rss_kb: u64 = parts.get(1)?.parse().ok()?;
    let ram_bytes = rss_kb * 1024;

    let threads = std::process::Command::new("ps")
        .args(["-M", "-p", &pid.to_string()])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map_or(1, |o| {
            // One header line, then one line per thread
            String::from_utf8_lossy(&o.stdout)
                .lines()
                .count()
                .saturating_sub(1) as u64
        });

    let total = std::process::Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8_lossy(&o.stdout).trim().parse::<u64>().ok())
        .unwrap_or(0);
    let ram = if total == 0 {
        0.0
    } else {
        ram_bytes as f64 / total as f64 * 100.0
    };

    Some(ProcSample {
        cpu,
        ram,
        ram_bytes,
        threads,
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn sample_impl(_pid: u32, window: Duration) -> Option<ProcSample> {
    tokio::time::sleep(window).await;
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn parse_stat_ticks_handles_comm_with_spaces() {
        // pid (comm with space) state ppid pgrp session tty tpgid flags
        // minflt cminflt majflt cmajflt utime stime ...
        let stat = "1234 (my (player)) S 1 1 1 0 -1 4194560 500 0 0 0 150 50 0 0 20 0 9 0 100 0 0";
        assert_eq!(parse_stat_ticks(stat), Some(200));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parse_kb_values() {
        assert_eq!(parse_kb_value("  12345 kB"), Some(12345));
        assert_eq!(parse_kb_value("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn sample_own_process() {
        let reading = sample(std::process::id(), Duration::from_millis(50))
            .await
            .expect("own process is observable");
        assert!(reading.threads >= 1);
        assert!(reading.ram_bytes > 0);
        assert!(reading.cpu >= 0.0);
        assert!(reading.ram >= 0.0 && reading.ram <= 100.0);
    }

    #[tokio::test]
    async fn sample_missing_process_is_none() {
        // PID near the default pid_max ceiling; extremely unlikely to exist.
        let reading = sample(4_194_000, Duration::from_millis(10)).await;
        assert!(reading.is_none());
    }
}
