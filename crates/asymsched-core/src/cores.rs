//! Core-type setup: hotplug, kernel tagging, frequency pinning, affinity.
//!
//! A run is configured with a per-CPU type vector — fast, slow, or offline.
//! Fast and slow cores are emulated by pinning DVFS frequencies: fast cores
//! run at the highest available frequency, slow cores at the lowest.

use std::fs;
use std::io::{Error, ErrorKind, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::syscall::FairampKernel;
use crate::workload::{Command, RunConfig};

/// Type of one CPU in the run configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreType {
    Offline,
    Slow,
    Fast,
}

/// The per-CPU type vector plus derived counts.
#[derive(Debug, Clone)]
pub struct CoreLayout {
    pub types: Vec<CoreType>,
    pub num_fast: u32,
    pub num_slow: u32,
}

impl CoreLayout {
    pub fn new(types: Vec<CoreType>) -> Self {
        let num_fast = types.iter().filter(|t| **t == CoreType::Fast).count() as u32;
        let num_slow = types.iter().filter(|t| **t == CoreType::Slow).count() as u32;
        Self {
            types,
            num_fast,
            num_slow,
        }
    }

    pub fn num_core(&self) -> usize {
        self.types.len()
    }

    /// Render as the CLI's `F`/`S`/`X` string plus counts.
    pub fn describe(&self) -> String {
        let mut s = String::with_capacity(self.types.len() + 24);
        for t in &self.types {
            s.push(match t {
                CoreType::Offline => 'X',
                CoreType::Slow => 'S',
                CoreType::Fast => 'F',
            });
        }
        s.push_str(&format!(" (fast: {} / slow: {})", self.num_fast, self.num_slow));
        s
    }
}

/// Count CPUs from `/proc/cpuinfo`.
pub fn detect_num_cores() -> Result<usize> {
    let text = fs::read_to_string("/proc/cpuinfo")?;
    let count = count_processors(&text);
    if count == 0 {
        return Err(Error::new(
            ErrorKind::NotFound,
            "no core detected from /proc/cpuinfo",
        ));
    }
    Ok(count)
}

fn count_processors(cpuinfo: &str) -> usize {
    cpuinfo
        .lines()
        .filter(|line| line.starts_with("processor"))
        .count()
}

/// Fast and slow frequencies as sysfs strings: the first and last entries of
/// `scaling_available_frequencies` on cpu0.
pub fn read_frequency_bounds() -> Result<(String, String)> {
    let text = fs::read_to_string(
        "/sys/devices/system/cpu/cpu0/cpufreq/scaling_available_frequencies",
    )?;
    frequency_bounds(&text).ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidData,
            "failed to read scaling_available_frequencies",
        )
    })
}

fn frequency_bounds(list: &str) -> Option<(String, String)> {
    let mut tokens = list.split_whitespace();
    let fast = tokens.next()?.to_string();
    let slow = tokens.last().map(str::to_string).unwrap_or_else(|| fast.clone());
    Some((fast, slow))
}

/// Parse the CLI's per-CPU type string: one of `F`/`f`/`1`, `S`/`s`/`0`, or
/// `X`/`x` per core.
pub fn parse_core_config(config: &str, num_core: usize) -> Result<CoreLayout> {
    if config.len() != num_core {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!(
                "{} core types specified but this machine has {num_core} cores",
                config.len()
            ),
        ));
    }
    let mut types = Vec::with_capacity(num_core);
    for (i, c) in config.chars().enumerate() {
        types.push(match c {
            '0' | 'S' | 's' => CoreType::Slow,
            '1' | 'F' | 'f' => CoreType::Fast,
            'X' | 'x' => CoreType::Offline,
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("bad core type '{c}' at position {i} in {config}"),
                ));
            }
        });
    }
    Ok(CoreLayout::new(types))
}

/// Default typing when none is given: the first ⌈n/3⌉ cores fast, the rest
/// slow.
pub fn default_core_layout(num_core: usize) -> CoreLayout {
    let num_fast = num_core.div_ceil(3);
    let types = (0..num_core)
        .map(|i| if i < num_fast { CoreType::Fast } else { CoreType::Slow })
        .collect();
    CoreLayout::new(types)
}

// ---------------------------------------------------------------------------
// Sysfs application
// ---------------------------------------------------------------------------

const SYSFS_RETRIES: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

fn sysfs_cpu(cpu: usize, leaf: &str) -> PathBuf {
    PathBuf::from(format!("/sys/devices/system/cpu/cpu{cpu}/{leaf}"))
}

fn read_trimmed(path: &PathBuf) -> Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

/// Write `value` until reading it back matches, with a one-second backoff.
fn write_verified(path: &PathBuf, value: &str) -> Result<()> {
    for attempt in 0..SYSFS_RETRIES {
        if read_trimmed(path)? == value {
            return Ok(());
        }
        if attempt > 0 {
            log::warn!("{} still not {value}; retrying", path.display());
            std::thread::sleep(RETRY_BACKOFF);
        }
        fs::write(path, value)?;
    }
    if read_trimmed(path)? == value {
        return Ok(());
    }
    Err(Error::other(format!(
        "failed to set {} to {value}",
        path.display()
    )))
}

/// Apply a core layout: hotplug, kernel fast/slow tags, pinned frequencies.
/// Returns the list of active (schedulable) CPU ids.
///
/// CPU 0 cannot be hotplugged; when typed offline it is excluded from the
/// affinity mask instead.
pub fn apply_core_layout(
    layout: &CoreLayout,
    run: &RunConfig,
    asymmetry_aware: bool,
    frequencies: Option<&(String, String)>,
    kernel: &dyn FairampKernel,
) -> Result<Vec<usize>> {
    let hotplug = sysfs_cpu(0, "online").exists();
    let mut active = Vec::new();

    for (cpu, core_type) in layout.types.iter().enumerate() {
        match core_type {
            CoreType::Offline => {
                if !hotplug || cpu == 0 {
                    println!("cpu{cpu}: offline by affinity");
                } else {
                    write_verified(&sysfs_cpu(cpu, "online"), "0")?;
                    println!("cpu{cpu}: offline");
                }
            }
            CoreType::Fast | CoreType::Slow => {
                active.push(cpu);
                if hotplug && cpu != 0 {
                    write_verified(&sysfs_cpu(cpu, "online"), "1")?;
                }

                if run.do_fairamp {
                    let tagged = if *core_type == CoreType::Fast && asymmetry_aware {
                        kernel.set_fast_core(cpu as i32)
                    } else {
                        kernel.set_slow_core(cpu as i32)
                    };
                    if let Err(e) = tagged {
                        log::warn!("tagging cpu{cpu} failed: {e}");
                    }
                }

                if run.adjust_frequency {
                    let (fast, slow) = frequencies.ok_or_else(|| {
                        Error::new(ErrorKind::InvalidInput, "no frequency bounds available")
                    })?;
                    let frequency = if *core_type == CoreType::Fast { fast } else { slow };
                    pin_frequency(cpu, frequency)?;
                    println!(
                        "cpu{cpu}: {} cur_freq: {frequency}",
                        if *core_type == CoreType::Fast { "fast core" } else { "slow core" }
                    );
                }
            }
        }
    }

    println!("num_active_cores: {}", active.len());
    Ok(active)
}

/// Switch the governor to `userspace` and pin min/max frequencies, retrying
/// the whole sequence until the current frequency reads back as requested.
fn pin_frequency(cpu: usize, frequency: &str) -> Result<()> {
    for attempt in 0..SYSFS_RETRIES {
        if attempt > 0 {
            log::warn!("cpu{cpu}: frequency not yet {frequency}; retrying");
            std::thread::sleep(RETRY_BACKOFF);
        }
        write_verified(&sysfs_cpu(cpu, "cpufreq/scaling_governor"), "userspace")?;
        write_verified(&sysfs_cpu(cpu, "cpufreq/scaling_max_freq"), frequency)?;
        write_verified(&sysfs_cpu(cpu, "cpufreq/scaling_min_freq"), frequency)?;
        if read_trimmed(&sysfs_cpu(cpu, "cpufreq/scaling_cur_freq"))? == frequency {
            return Ok(());
        }
    }
    Err(Error::other(format!(
        "cpu{cpu}: frequency did not settle at {frequency}"
    )))
}

/// Restrict the controller itself to the active cores.
pub fn set_self_affinity(cpus: &[usize]) -> Result<()> {
    // SAFETY: cpu_set_t is a plain bitmask; zeroed is its empty value.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for &cpu in cpus {
        unsafe { libc::CPU_SET(cpu, &mut set) };
    }
    // SAFETY: set points to a valid mask of the advertised size.
    if unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Deal the active CPUs to the commands in order, `num_threads` CPUs each.
///
/// Running out of CPUs is fatal only when some command is in pin mode —
/// pinning without a full CPU set cannot be honoured.
pub fn assign_command_cpus(commands: &mut [Command], active: &[usize]) -> Result<()> {
    let mut next = active.iter().copied();
    let mut exhausted = false;
    for command in commands.iter_mut() {
        command.cpus.clear();
        for _ in 0..command.num_threads {
            match next.next() {
                Some(cpu) => command.cpus.push(cpu),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }
    }

    if exhausted && commands.iter().any(|c| c.pinned()) {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "commands want to be pinned, but there are fewer CPUs than threads",
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::CommandSpec;

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_core_config() {
        let layout = parse_core_config("FFSS", 4).unwrap();
        assert_eq!(layout.num_fast, 2);
        assert_eq!(layout.num_slow, 2);
        assert_eq!(layout.types[0], CoreType::Fast);
        assert_eq!(layout.types[3], CoreType::Slow);
    }

    #[test]
    fn test_parse_core_config_aliases() {
        let layout = parse_core_config("1f0sXx", 6).unwrap();
        assert_eq!(layout.num_fast, 2);
        assert_eq!(layout.num_slow, 2);
        assert_eq!(layout.types[4], CoreType::Offline);
        assert_eq!(layout.types[5], CoreType::Offline);
    }

    #[test]
    fn test_parse_core_config_length_mismatch() {
        assert!(parse_core_config("FFS", 4).is_err());
    }

    #[test]
    fn test_parse_core_config_bad_char() {
        let err = parse_core_config("FFQS", 4).unwrap_err();
        assert!(err.to_string().contains("position 2"));
    }

    #[test]
    fn test_default_layout_is_one_third_fast() {
        let layout = default_core_layout(4);
        assert_eq!(layout.num_fast, 2); // ceil(4/3)
        assert_eq!(layout.num_slow, 2);

        let layout = default_core_layout(6);
        assert_eq!(layout.num_fast, 2);
        assert_eq!(layout.num_slow, 4);
    }

    #[test]
    fn test_describe() {
        let layout = parse_core_config("FSX", 3).unwrap();
        assert_eq!(layout.describe(), "FSX (fast: 1 / slow: 1)");
    }

    #[test]
    fn test_count_processors() {
        let cpuinfo = "processor\t: 0\nmodel name\t: x\n\nprocessor\t: 1\nmodel name\t: x\n";
        assert_eq!(count_processors(cpuinfo), 2);
    }

    #[test]
    fn test_frequency_bounds_first_and_last() {
        let (fast, slow) = frequency_bounds("2400000 1800000 1200000 800000\n").unwrap();
        assert_eq!(fast, "2400000");
        assert_eq!(slow, "800000");
    }

    #[test]
    fn test_frequency_bounds_single_entry() {
        let (fast, slow) = frequency_bounds("1200000").unwrap();
        assert_eq!(fast, slow);
    }

    // -----------------------------------------------------------------------
    // CPU dealing
    // -----------------------------------------------------------------------

    fn command(num: usize, num_threads: u32, speedup: f32) -> Command {
        Command::new(
            num,
            CommandSpec {
                name: format!("c{num}"),
                argv: vec![format!("c{num}")],
                num_threads,
                speedup,
            },
        )
    }

    #[test]
    fn test_assign_command_cpus_in_order() {
        let mut commands = vec![command(0, 2, 1.0), command(1, 1, 1.0)];
        assign_command_cpus(&mut commands, &[0, 1, 3]).unwrap();
        assert_eq!(commands[0].cpus, vec![0, 1]);
        assert_eq!(commands[1].cpus, vec![3]);
    }

    #[test]
    fn test_assign_command_cpus_exhaustion_fails_only_for_pinning() {
        let mut commands = vec![command(0, 2, 1.0), command(1, 2, 1.0)];
        assert!(assign_command_cpus(&mut commands, &[0, 1, 2]).is_ok());

        let mut commands = vec![command(0, 2, 1.0), command(1, 2, -1.0)];
        assert!(assign_command_cpus(&mut commands, &[0, 1, 2]).is_err());
    }
}
