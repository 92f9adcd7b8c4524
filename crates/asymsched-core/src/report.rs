//! Final command table and machine-readable run report.

use std::fs;
use std::io::Result;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::stat::CpuTimes;
use crate::workload::Command;

/// Per-command results for the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReport {
    pub num: usize,
    pub name: String,
    pub argv: Vec<String>,
    pub num_threads: u32,
    pub speedup: f32,
    pub fast_round_slice: u32,
    pub slow_round_slice: u32,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
}

impl CommandReport {
    pub fn from_command(command: &Command) -> Self {
        let slice = command.cell.slice();
        Self {
            num: command.num,
            name: command.name.clone(),
            argv: command.argv.clone(),
            num_threads: command.num_threads,
            speedup: command.cell.speedup(),
            fast_round_slice: slice.fast,
            slow_round_slice: slice.slow,
            finished: command.finished,
            runtime_secs: command.first_runtime,
            exit_status: command.status,
        }
    }
}

/// The run report written next to the merged output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub version: u32,
    pub mode: String,
    pub policy: String,
    pub core_types: String,
    pub num_fast_core: u32,
    pub num_slow_core: u32,
    pub interval_ms: u64,
    pub commands: Vec<CommandReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<CpuTimes>,
    pub asymsched_version: String,
}

impl RunReport {
    /// Write as pretty-printed JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, json)
    }
}

/// Print the final fixed-width command table, in `num` order.
pub fn print_command_table(commands: &[Command]) {
    println!("Command Table {}", commands.len());
    println!(
        "{:<2} {:<20} {:>7} {:>8} {:>16} {:>16} {:>5} {:>9}",
        "id", "name", "speedup", "#threads", "fast_round_slice", "slow_round_slice", "pid", "time"
    );
    println!("{}", "=".repeat(91));

    let mut by_num: Vec<&Command> = commands.iter().collect();
    by_num.sort_by_key(|c| c.num);
    for command in by_num {
        let slice = command.cell.slice();
        println!(
            "{:<2} {:<20} {:>7.3} {:>8} {:>16} {:>16} {:>5} {:>9.3}",
            command.num,
            command.name,
            command.cell.speedup(),
            command.num_threads,
            slice.fast,
            slice.slow,
            command.cell.pid(),
            command.first_runtime.unwrap_or(-1.0)
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{CommandSpec, RoundSlice};

    fn sample_command() -> Command {
        let mut command = Command::new(
            3,
            CommandSpec {
                name: "bench".to_string(),
                argv: vec!["./bench".to_string(), "--x".to_string()],
                num_threads: 2,
                speedup: 1.0,
            },
        );
        command.cell.set_speedup(2.25);
        command.cell.set_slice(RoundSlice::new(10_000_000, 20_000_000));
        command.finished = true;
        command.first_runtime = Some(12.5);
        command.status = Some(0);
        command
    }

    #[test]
    fn test_command_report_snapshot() {
        let report = CommandReport::from_command(&sample_command());
        assert_eq!(report.num, 3);
        assert_eq!(report.speedup, 2.25);
        assert_eq!(report.fast_round_slice, 10_000_000);
        assert_eq!(report.slow_round_slice, 20_000_000);
        assert_eq!(report.runtime_secs, Some(12.5));
    }

    #[test]
    fn test_run_report_roundtrip() {
        let report = RunReport {
            version: 1,
            mode: "normal".to_string(),
            policy: "max_fair base: fair_share".to_string(),
            core_types: "FFSS (fast: 2 / slow: 2)".to_string(),
            num_fast_core: 2,
            num_slow_core: 2,
            interval_ms: 2000,
            commands: vec![CommandReport::from_command(&sample_command())],
            cpu_usage: None,
            asymsched_version: env!("CARGO_PKG_VERSION").to_string(),
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.output.json");
        report.write(&path).unwrap();

        let parsed: RunReport =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.commands.len(), 1);
        assert_eq!(parsed.commands[0].name, "bench");
        assert_eq!(parsed.interval_ms, 2000);
    }

    #[test]
    fn test_table_prints_in_num_order() {
        // Smoke test: must not panic with unfinished commands.
        let mut second = sample_command();
        second.num = 0;
        second.finished = false;
        second.first_runtime = None;
        print_command_table(&[sample_command(), second]);
    }
}
