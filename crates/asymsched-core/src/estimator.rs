//! Periodic speedup estimation.
//!
//! Every scheduling interval the estimator takes one kernel counter sample
//! per active command and maintains a smoothed estimate of its fast-core and
//! slow-core instruction rates, CPU utilisation, and derived speedup. The
//! speedup lands in the command's shared cell, where the policy engine picks
//! it up.
//!
//! Sampling rules:
//! - an IPS side only counts when the previously published slice gave that
//!   side at least the minimal sampling slice and the side accrued runtime;
//! - when frequency adjustment pins the cores, a sample with
//!   `IPS_fast < IPS_slow` or `IPS_fast > max_ips_ratio · IPS_slow` is
//!   physically implausible and dropped;
//! - the first [`INITIAL_SAMPLES`] valid samples per side form an
//!   equal-weight running mean, later samples a 7:3 weighted update.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::engine::PolicyEngine;
use crate::syscall::{FairampKernel, ThreadsInfo};
use crate::workload::{CommandView, DoneFlag, MINIMAL_ROUND_SLICE};

/// Number of leading samples averaged with equal weight before the smoother
/// switches to weighted updates.
pub const INITIAL_SAMPLES: u32 = 5;

/// Slice granularity of the interruptible interval sleep.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Static parameters of the estimator.
#[derive(Debug, Clone, Copy)]
pub struct EstimatorConfig {
    /// Scheduling interval between ticks.
    pub interval: Duration,
    /// Number of online cores.
    pub num_core: usize,
    /// Number of fast cores (parallelism ceiling of the speedup formula).
    pub num_fast_core: u32,
    /// Ceiling on plausible `IPS_fast / IPS_slow`.
    pub max_ips_ratio: f64,
    /// Whether core frequencies are pinned; gates the outlier filter and the
    /// `speedup ≥ 1` clamp.
    pub adjust_frequency: bool,
}

/// Smoothed per-command observation state.
#[derive(Debug, Clone, Copy, Default)]
struct SmoothState {
    /// Pid the state belongs to; 0 marks the slot empty.
    pid: i32,
    ips_fast: f64,
    ips_slow: f64,
    cpu_util: f64,
    samples_fast: u32,
    samples_slow: u32,
}

impl SmoothState {
    fn init(pid: i32, ips_fast: f64, ips_slow: f64) -> Self {
        Self {
            pid,
            ips_fast,
            ips_slow,
            cpu_util: 1.0,
            samples_fast: u32::from(ips_fast > 0.0),
            samples_slow: u32::from(ips_slow > 0.0),
        }
    }
}

/// Equal-weight mean for the first [`INITIAL_SAMPLES`] samples, then a 7:3
/// weighted update.
fn smooth(value: f64, sample: f64, samples_seen: u32) -> f64 {
    if samples_seen < INITIAL_SAMPLES {
        (f64::from(samples_seen) * value + sample) / f64::from(samples_seen + 1)
    } else {
        (value * 7.0 + sample * 3.0) / 10.0
    }
}

/// One sample's worth of raw observations for a command.
#[derive(Debug, Clone, Copy)]
struct RawSample {
    ips_fast: f64,
    ips_slow: f64,
    cpu_util: f64,
}

/// The speedup estimator. Scratch buffers are allocated once.
pub struct SpeedupEstimator {
    cfg: EstimatorConfig,
    views: Vec<CommandView>,
    state: Vec<SmoothState>,
    scratch: Vec<ThreadsInfo>,
    ticks: u64,
}

impl SpeedupEstimator {
    pub fn new(cfg: EstimatorConfig, views: Vec<CommandView>) -> Self {
        let n = views.len();
        Self {
            cfg,
            views,
            state: vec![SmoothState::default(); n],
            scratch: vec![ThreadsInfo::default(); n],
            ticks: 0,
        }
    }

    /// Number of completed sampling ticks.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Take one counter sample per active command and fold it into the
    /// smoothed estimates. Publishes nothing; the caller decides whether to
    /// invoke the policy engine afterwards.
    pub fn tick(&mut self, kernel: &dyn FairampKernel) {
        self.ticks += 1;

        let mut threads_running = 0u64;
        for view in &self.views {
            let entry = &mut self.scratch[view.num];
            let pid = view.cell.pid();
            if pid > 0 {
                *entry = ThreadsInfo {
                    num: view.num as i32,
                    pid,
                    ..ThreadsInfo::default()
                };
                threads_running += u64::from(view.num_threads);
            } else {
                *entry = ThreadsInfo {
                    num: -1,
                    ..ThreadsInfo::default()
                };
            }
        }

        // Every thread-unit gets a full core until the machine is
        // oversubscribed; then cores are shared evenly.
        let interval_ns = self.cfg.interval.as_nanos() as u64 * self.cfg.num_core as u64;
        let full_runtime = interval_ns as f64 / (self.cfg.num_core as u64).max(threads_running) as f64;

        match kernel.get_threads_info(&mut self.scratch) {
            Ok(filled) if filled < self.scratch.len() => {
                log::warn!(
                    "kernel filled {filled} of {} thread info entries",
                    self.scratch.len()
                );
            }
            Ok(_) => {}
            Err(e) => {
                // Stale estimates carry this tick; sampling resumes next one.
                log::warn!("get_threads_info failed: {e}");
                return;
            }
        }

        for i in 0..self.views.len() {
            let view = self.views[i].clone();
            let info = self.scratch[view.num];
            if info.pid == 0 || info.num < 0 {
                // Not running: forget the smoothing state so a respawn
                // starts fresh.
                self.state[view.num] = SmoothState::default();
                continue;
            }
            self.update_command(&view, info, full_runtime);
        }
    }

    fn update_command(&mut self, view: &CommandView, info: ThreadsInfo, full_runtime: f64) {
        let slice = view.cell.slice();
        let raw = extract_sample(&self.cfg, &info, slice, view.num_threads, full_runtime);

        if raw.ips_fast == 0.0 || raw.ips_slow == 0.0 {
            log::debug!(
                "command{:02} pid {}: one-sided sample (fast {:.4} slow {:.4})",
                view.num,
                info.pid,
                raw.ips_fast,
                raw.ips_slow
            );
        }

        let state = &mut self.state[view.num];
        if state.pid == 0 {
            *state = SmoothState::init(info.pid, raw.ips_fast, raw.ips_slow);
        } else {
            if raw.ips_fast > 0.0 {
                state.ips_fast = smooth(state.ips_fast, raw.ips_fast, state.samples_fast);
                state.samples_fast += 1;
            }
            if raw.ips_slow > 0.0 {
                state.ips_slow = smooth(state.ips_slow, raw.ips_slow, state.samples_slow);
                state.samples_slow += 1;
            }
            state.cpu_util = (state.cpu_util * 7.0 + raw.cpu_util * 3.0) / 10.0;
        }

        if state.ips_fast > 0.0 && state.ips_slow > 0.0 {
            let mut speedup = derive_speedup(
                state.ips_fast,
                state.ips_slow,
                state.cpu_util,
                view.num_threads,
                f64::from(self.cfg.num_fast_core),
            );
            if self.cfg.adjust_frequency && speedup < 1.0 {
                speedup = 1.0;
            }
            view.cell.set_speedup(speedup as f32);
        }
        // Otherwise the previous estimate (initially 1.0) stands.
    }
}

/// Compute the raw per-tick observations from one kernel sample.
fn extract_sample(
    cfg: &EstimatorConfig,
    info: &ThreadsInfo,
    slice: crate::workload::RoundSlice,
    num_threads: u32,
    full_runtime: f64,
) -> RawSample {
    let sum_exec = info.sum_fast_exec_runtime + info.sum_slow_exec_runtime;

    let mut ips_fast = if info.sum_fast_exec_runtime > 0 && slice.fast >= MINIMAL_ROUND_SLICE {
        info.insts_fast as f64 / info.sum_fast_exec_runtime as f64
    } else {
        0.0
    };
    let mut ips_slow = if info.sum_slow_exec_runtime > 0 && slice.slow >= MINIMAL_ROUND_SLICE {
        info.insts_slow as f64 / info.sum_slow_exec_runtime as f64
    } else {
        0.0
    };

    let mut cpu_util = if sum_exec > 0 {
        sum_exec as f64 / (full_runtime * f64::from(num_threads))
    } else {
        1.0
    };
    if cpu_util > 1.0 && num_threads == 1 {
        cpu_util = 1.0;
    }

    // With pinned frequencies a fast core is never slower than a slow one,
    // and the speedup is physically bounded; outside those bounds the sample
    // is a measurement artifact.
    if cfg.adjust_frequency
        && ips_fast > 0.0
        && ips_slow > 0.0
        && (ips_fast < ips_slow || ips_fast > cfg.max_ips_ratio * ips_slow)
    {
        log::debug!(
            "dropped outlier sample: IPS_fast {ips_fast:.4} IPS_slow {ips_slow:.4}"
        );
        ips_fast = 0.0;
        ips_slow = 0.0;
    }

    RawSample {
        ips_fast,
        ips_slow,
        cpu_util,
    }
}

/// Parallelism-adjusted speedup: of the `CPU_util` thread-units of demand,
/// `min(util, F)` run on fast cores and the remainder on slow ones.
fn derive_speedup(
    ips_fast: f64,
    ips_slow: f64,
    cpu_util: f64,
    num_threads: u32,
    num_fast_core: f64,
) -> f64 {
    let ratio = ips_fast / ips_slow;
    if num_threads == 1 || cpu_util <= 1.0 {
        ratio
    } else {
        ratio * (cpu_util.min(num_fast_core) + (cpu_util - num_fast_core).max(0.0)) / cpu_util
    }
}

/// The estimator thread body: tick every interval until `done`, then take a
/// final sample so the run totals are complete. Returns the tick count.
///
/// Estimation runs whenever the policy is asymmetry-aware — manual policies
/// included, where the estimates only inform the final report. The engine
/// additionally recomputes and publishes quotas after every tick when the
/// policy is speedup-aware.
pub fn run_periodic(
    mut estimator: SpeedupEstimator,
    mut engine: Option<PolicyEngine>,
    kernel: Arc<dyn FairampKernel>,
    done: DoneFlag,
    measuring: Arc<AtomicBool>,
    asymmetry_aware: bool,
) -> u64 {
    let views = estimator.views.clone();
    let speedup_aware = engine
        .as_ref()
        .is_some_and(|e| e.policy().speedup_aware());

    if asymmetry_aware {
        measuring.store(true, Ordering::SeqCst);
        if let Err(e) = kernel.start_measuring_ips_type() {
            log::warn!("start_measuring_ips_type failed: {e}");
        }
    }

    let mut me = [ThreadsInfo::self_entry()];
    let _ = kernel.get_threads_info(&mut me);

    while !done.load(Ordering::SeqCst) {
        sleep_interruptible(estimator.cfg.interval, &done);
        if done.load(Ordering::SeqCst) {
            break;
        }

        if asymmetry_aware {
            estimator.tick(kernel.as_ref());
            if speedup_aware
                && let Some(engine) = engine.as_mut()
            {
                engine.set_round_slice(&views, kernel.as_ref());
            }
        }
    }

    // Final counter read so the reported totals cover the whole run.
    let mut me = [ThreadsInfo::self_entry()];
    let _ = kernel.get_threads_info(&mut me);
    println!(
        "Scheduling_time: {} num_called: {}",
        me[0].sum_fast_exec_runtime + me[0].sum_slow_exec_runtime,
        estimator.ticks()
    );

    estimator.ticks()
}

/// Sleep for `interval`, waking early when `done` is raised. The flag is
/// observed at worst one [`SLEEP_SLICE`] after it is set.
fn sleep_interruptible(interval: Duration, done: &DoneFlag) {
    let deadline = std::time::Instant::now() + interval;
    while !done.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        std::thread::sleep(SLEEP_SLICE.min(remaining));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
