//! Workload and run-environment model.
//!
//! A run is a fixed vector of commands parsed once from the command file.
//! Command slots are never added or removed; a slot's pid cycles
//! `-1 → >0 → 0 → >0 …` across respawns. Scheduling state crosses the
//! supervisor/estimator thread boundary through [`SharedCell`] — three
//! atomics replacing the per-field ownership comments of a classic
//! two-thread controller, so neither thread ever takes a lock on the hot
//! path.

use std::fs;
use std::io::{Error, ErrorKind, Result};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default per-task round quota: 30 ms, split between fast and slow cores.
pub const BASE_ROUND_SLICE: u32 = 30_000_000;

/// Smallest slice on either side that still yields a usable IPS sample (4%).
/// Shorter runs are dominated by cold caches.
pub const MINIMAL_ROUND_SLICE: u32 = 1_200_000;

/// Default scheduling interval between estimator ticks.
pub const DEFAULT_SCHED_INTERVAL_MS: u64 = 2000;

/// Default ceiling on the fast/slow IPS ratio; samples above it (or below
/// 1.0) are dropped as measurement outliers. Tunable via the CLI.
pub const DEFAULT_MAX_IPS_RATIO: f64 = 4.0;

/// Maximum length of the short command label.
pub const MAX_COMM_NAME_LEN: usize = 20;

// ---------------------------------------------------------------------------
// Round slice
// ---------------------------------------------------------------------------

/// A per-task time quota on fast and slow cores, in nanoseconds.
///
/// For every active task the pair sums to [`BASE_ROUND_SLICE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundSlice {
    pub fast: u32,
    pub slow: u32,
}

impl RoundSlice {
    pub const fn new(fast: u32, slow: u32) -> Self {
        Self { fast, slow }
    }

    /// Initial quota before any estimation: slow-core only.
    pub const fn initial() -> Self {
        Self::new(0, BASE_ROUND_SLICE)
    }

    fn pack(self) -> u64 {
        (u64::from(self.fast) << 32) | u64::from(self.slow)
    }

    fn unpack(raw: u64) -> Self {
        Self::new((raw >> 32) as u32, raw as u32)
    }
}

// ---------------------------------------------------------------------------
// Cross-thread cell
// ---------------------------------------------------------------------------

/// Lifecycle view of a command slot, derived from its pid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Never spawned.
    NeverStarted,
    /// Spawned at least once, not currently running.
    Idle,
    /// Live child with the given pid.
    Running(i32),
}

/// Scheduling state shared between the supervisor and the estimator.
///
/// Ownership is partitioned by field: `pid` is written only by the
/// supervisor, `speedup` only by the estimator, `slice` only by the policy
/// engine (which runs in exactly one thread at a time). The packed-u64 slice
/// keeps the `(fast, slow)` pair consistent without a lock.
pub struct SharedCell {
    pid: AtomicI32,
    speedup: AtomicU32,
    slice: AtomicU64,
}

impl SharedCell {
    pub fn new(speedup: f32) -> Self {
        Self {
            pid: AtomicI32::new(-1),
            speedup: AtomicU32::new(speedup.to_bits()),
            slice: AtomicU64::new(RoundSlice::initial().pack()),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn state(&self) -> TaskState {
        match self.pid() {
            -1 => TaskState::NeverStarted,
            0 => TaskState::Idle,
            pid => TaskState::Running(pid),
        }
    }

    pub fn speedup(&self) -> f32 {
        f32::from_bits(self.speedup.load(Ordering::Acquire))
    }

    pub fn set_speedup(&self, speedup: f32) {
        self.speedup.store(speedup.to_bits(), Ordering::Release);
    }

    pub fn slice(&self) -> RoundSlice {
        RoundSlice::unpack(self.slice.load(Ordering::Acquire))
    }

    pub fn set_slice(&self, slice: RoundSlice) {
        self.slice.store(slice.pack(), Ordering::Release);
    }
}

/// Monotonic run-wide stop flag: transitions once, `false → true`.
pub type DoneFlag = Arc<AtomicBool>;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A workload unit as parsed from the command file.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Short label derived from the executable name.
    pub name: String,
    /// Executable and arguments.
    pub argv: Vec<String>,
    /// Software threads the program runs with.
    pub num_threads: u32,
    /// Offline speedup hint; negative means pin-to-cores mode.
    pub speedup: f32,
}

/// A command slot owned by the supervisor.
///
/// Static configuration plus supervisor-only runtime fields; everything the
/// estimator needs lives behind `cell`.
pub struct Command {
    pub num: usize,
    pub name: String,
    pub argv: Vec<String>,
    pub num_threads: u32,
    /// Offline speedup hint; negative means pin-to-cores mode.
    pub offline_speedup: f32,
    /// CPUs assigned for pin mode.
    pub cpus: Vec<usize>,
    pub cell: Arc<SharedCell>,
    /// Redirect target for the child's stdout/stderr.
    pub output: Option<fs::File>,
    /// Begin time of the most recent spawn.
    pub last_begin: Option<Instant>,
    /// Wall time of the first completion, seconds.
    pub first_runtime: Option<f64>,
    /// Pid of the first completed run.
    pub first_pid: i32,
    /// Exit status of the first completion.
    pub status: Option<i32>,
    pub finished: bool,
}

impl Command {
    pub fn new(num: usize, spec: CommandSpec) -> Self {
        let cell = Arc::new(SharedCell::new(spec.speedup));
        Self {
            num,
            name: spec.name,
            argv: spec.argv,
            num_threads: spec.num_threads,
            offline_speedup: spec.speedup,
            cpus: Vec::new(),
            cell,
            output: None,
            last_begin: None,
            first_runtime: None,
            first_pid: 0,
            status: None,
            finished: false,
        }
    }

    /// True when the command bypasses scheduling and is pinned to its CPUs.
    pub fn pinned(&self) -> bool {
        self.offline_speedup < 0.0
    }

    pub fn view(&self) -> CommandView {
        CommandView {
            num: self.num,
            num_threads: self.num_threads,
            cell: Arc::clone(&self.cell),
        }
    }
}

/// The estimator/policy-engine view of a command: static identity plus the
/// shared cell. Cheap to clone across the thread boundary.
#[derive(Clone)]
pub struct CommandView {
    pub num: usize,
    pub num_threads: u32,
    pub cell: Arc<SharedCell>,
}

/// Build the shared views for a command vector.
pub fn views_of(commands: &[Command]) -> Vec<CommandView> {
    commands.iter().map(Command::view).collect()
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// The five run-time booleans preset by a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    /// Run the estimator thread and update speedups every interval.
    pub periodic_update: bool,
    /// Talk to the fairamp kernel at all.
    pub do_fairamp: bool,
    /// Pin core frequencies (and trust IPS ratios to stay within bounds).
    pub adjust_frequency: bool,
    /// Prefer filling fast cores when threads are scarce.
    pub fast_core_first: bool,
    /// Respawn finished commands until the whole workload completes once.
    pub repeated_run: bool,
}

impl RunConfig {
    const fn new(p: bool, d: bool, a: bool, f: bool, r: bool) -> Self {
        Self {
            periodic_update: p,
            do_fairamp: d,
            adjust_frequency: a,
            fast_core_first: f,
            repeated_run: r,
        }
    }

    /// Periodic speedup updates require the fairamp kernel; repair the
    /// combination with a warning rather than failing the run.
    pub fn repaired(mut self) -> Self {
        if self.periodic_update && !self.do_fairamp {
            log::warn!("periodic speedup update requires fairamp; enabling do_fairamp");
            self.do_fairamp = true;
        }
        self
    }
}

/// Predefined run modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Static,
    SpeedupTest,
    WoOverhead,
    OverheadCs,
    OverheadCsPmu,
    Pinning,
    Repeat,
    No,
}

impl Mode {
    pub const ALL: &'static [(&'static str, Mode)] = &[
        ("normal", Mode::Normal),
        ("static", Mode::Static),
        ("speeduptest", Mode::SpeedupTest),
        ("wo_overhead", Mode::WoOverhead),
        ("overhead_cs", Mode::OverheadCs),
        ("overhead_cs_pmu", Mode::OverheadCsPmu),
        ("pinning", Mode::Pinning),
        ("unaware", Mode::Pinning),
        ("repeat", Mode::Repeat),
        ("no", Mode::No),
    ];

    pub fn parse(name: &str) -> Result<Mode> {
        Mode::ALL
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, m)| *m)
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, format!("unknown mode: {name}")))
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Static => "static",
            Mode::SpeedupTest => "speeduptest",
            Mode::WoOverhead => "wo_overhead",
            Mode::OverheadCs => "overhead_cs",
            Mode::OverheadCsPmu => "overhead_cs_pmu",
            Mode::Pinning => "pinning",
            Mode::Repeat => "repeat",
            Mode::No => "no",
        }
    }

    /// The config quintuple `{periodic_update, do_fairamp, adjust_frequency,
    /// fast_core_first, repeated_run}` this mode presets.
    pub fn config(self) -> RunConfig {
        match self {
            Mode::Normal => RunConfig::new(true, true, true, true, true),
            Mode::Static => RunConfig::new(false, true, true, false, true),
            Mode::SpeedupTest => RunConfig::new(true, true, false, false, true),
            Mode::WoOverhead => RunConfig::new(false, false, false, false, true),
            Mode::OverheadCs => RunConfig::new(false, true, false, true, true),
            Mode::OverheadCsPmu => RunConfig::new(true, true, false, true, true),
            Mode::Pinning => RunConfig::new(false, false, true, false, true),
            Mode::Repeat => RunConfig::new(false, false, false, false, true),
            Mode::No => RunConfig::new(false, false, false, false, false),
        }
    }
}

/// Scheduling interval from a millisecond count.
pub fn sched_interval_from_ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

// ---------------------------------------------------------------------------
// Command file parsing
// ---------------------------------------------------------------------------

/// Parse a command file.
///
/// Line-oriented: lines starting with `#` are comments. Each other line is
/// `[speedup: <float>] [num: <int>] cmd: <argv...>`; `cmd:` is mandatory,
/// must come last, and must be followed by at least one token.
pub fn parse_command_file(path: &Path) -> Result<Vec<CommandSpec>> {
    let text = fs::read_to_string(path)?;
    let mut specs = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let spec = parse_command_line(line)
            .map_err(|e| Error::new(ErrorKind::InvalidData, format!("line {}: {e}", lineno + 1)))?;
        specs.push(spec);
    }
    if specs.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("{}: no commands found", path.display()),
        ));
    }
    Ok(specs)
}

/// Parse one non-comment command-file line.
pub fn parse_command_line(line: &str) -> std::result::Result<CommandSpec, String> {
    let mut speedup = 1.0f32;
    let mut num_threads = 1u32;

    let mut tokens = line.split_whitespace();
    let argv: Vec<String> = loop {
        match tokens.next() {
            Some("speedup:") => {
                let value = tokens.next().ok_or("speedup: needs a value")?;
                speedup = value
                    .parse::<f32>()
                    .map_err(|_| format!("bad speedup value: {value}"))?;
                if !speedup.is_finite() {
                    return Err(format!("bad speedup value: {value}"));
                }
            }
            Some("num:") => {
                let value = tokens.next().ok_or("num: needs a value")?;
                num_threads = value
                    .parse::<u32>()
                    .map_err(|_| format!("bad thread count: {value}"))?;
                if num_threads == 0 {
                    return Err("thread count must be at least 1".to_string());
                }
            }
            Some("cmd:") => {
                let argv: Vec<String> = tokens.map(str::to_string).collect();
                if argv.is_empty() {
                    // A trailing `cmd:` with nothing after it would spawn an
                    // empty argv; reject instead of silently accepting.
                    return Err("cmd: must be followed by a command".to_string());
                }
                break argv;
            }
            Some(other) => return Err(format!("unexpected token: {other}")),
            None => return Err("no cmd: token found".to_string()),
        }
    };

    let name = short_name(&argv[0]);
    Ok(CommandSpec {
        name,
        argv,
        num_threads,
        speedup,
    })
}

/// Short label for a command: the executable name, truncated to the *last*
/// [`MAX_COMM_NAME_LEN`] − 1 characters so the distinguishing tail of long
/// paths survives.
fn short_name(argv0: &str) -> String {
    let chars: Vec<char> = argv0.chars().collect();
    if chars.len() < MAX_COMM_NAME_LEN - 1 {
        argv0.to_string()
    } else {
        chars[chars.len() - (MAX_COMM_NAME_LEN - 1)..]
            .iter()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
