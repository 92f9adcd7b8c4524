//! System-wide CPU time accounting from `/proc/stat`.
//!
//! Snapshots the aggregate `cpu` line at run start and end; the delta shows
//! how much of the machine the workload (and the controller) actually used.

use std::fs;
use std::io::{Error, ErrorKind, Result};

use serde::{Deserialize, Serialize};

/// The first seven fields of the aggregate `cpu` line, in USER_HZ ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq
    }

    /// User-mode time including niced tasks.
    pub fn user_time(&self) -> u64 {
        self.user + self.nice
    }

    /// Kernel-mode time including interrupt handling.
    pub fn kernel_time(&self) -> u64 {
        self.system + self.irq + self.softirq
    }

    pub fn idle_time(&self) -> u64 {
        self.idle + self.iowait
    }

    /// Field-wise difference `later − self`.
    pub fn delta(&self, later: &CpuTimes) -> CpuTimes {
        CpuTimes {
            user: later.user - self.user,
            nice: later.nice - self.nice,
            system: later.system - self.system,
            idle: later.idle - self.idle,
            iowait: later.iowait - self.iowait,
            irq: later.irq - self.irq,
            softirq: later.softirq - self.softirq,
        }
    }
}

/// Snapshot the aggregate CPU times.
pub fn read_cpu_times() -> Result<CpuTimes> {
    let text = fs::read_to_string("/proc/stat")?;
    let first = text
        .lines()
        .next()
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "/proc/stat is empty"))?;
    parse_cpu_line(first)
}

/// Parse an aggregate `cpu  user nice system idle iowait irq softirq …` line.
fn parse_cpu_line(line: &str) -> Result<CpuTimes> {
    let mut fields = line.split_whitespace();
    match fields.next() {
        Some("cpu") => {}
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("not an aggregate cpu line: {line}"),
            ));
        }
    }

    let mut values = [0u64; 7];
    for value in &mut values {
        *value = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| {
                Error::new(ErrorKind::InvalidData, format!("short cpu line: {line}"))
            })?;
    }

    Ok(CpuTimes {
        user: values[0],
        nice: values[1],
        system: values[2],
        idle: values[3],
        iowait: values[4],
        irq: values[5],
        softirq: values[6],
    })
}

/// Print the raw, aggregated, and percentage views of a usage delta.
pub fn print_usage(delta: &CpuTimes) {
    println!(
        "cpu_usage_stat_raw: {} {} {} {} {} {} {}",
        delta.user, delta.nice, delta.system, delta.idle, delta.iowait, delta.irq, delta.softirq
    );
    let total = delta.total();
    println!(
        "cpu_usage_stat_aggr: total: {total} user: {} kernel: {} idle: {}",
        delta.user_time(),
        delta.kernel_time(),
        delta.idle_time()
    );
    if total > 0 {
        println!(
            "cpu_usage_stat: user: {:.3} kernel: {:.3} idle: {:.3}",
            delta.user_time() as f64 * 100.0 / total as f64,
            delta.kernel_time() as f64 * 100.0 / total as f64,
            delta.idle_time() as f64 * 100.0 / total as f64
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_line() {
        let times =
            parse_cpu_line("cpu  40778349 14841 205307 1845440400 224071 0 10536 0 0 0").unwrap();
        assert_eq!(times.user, 40778349);
        assert_eq!(times.nice, 14841);
        assert_eq!(times.system, 205307);
        assert_eq!(times.idle, 1845440400);
        assert_eq!(times.iowait, 224071);
        assert_eq!(times.irq, 0);
        assert_eq!(times.softirq, 10536);
    }

    #[test]
    fn test_parse_rejects_per_cpu_lines() {
        assert!(parse_cpu_line("cpu0 1 2 3 4 5 6 7").is_err());
    }

    #[test]
    fn test_parse_rejects_short_lines() {
        assert!(parse_cpu_line("cpu 1 2 3").is_err());
    }

    #[test]
    fn test_delta_and_aggregates() {
        let before = parse_cpu_line("cpu 100 10 50 1000 20 5 15").unwrap();
        let after = parse_cpu_line("cpu 160 12 70 1500 26 6 26").unwrap();
        let delta = before.delta(&after);
        assert_eq!(delta.user, 60);
        assert_eq!(delta.user_time(), 62);
        assert_eq!(delta.kernel_time(), 20 + 1 + 11);
        assert_eq!(delta.idle_time(), 500 + 6);
        assert_eq!(delta.total(), 62 + 32 + 506);
    }

    #[test]
    fn test_read_cpu_times_on_linux() {
        let times = read_cpu_times().unwrap();
        assert!(times.total() > 0);
    }
}
