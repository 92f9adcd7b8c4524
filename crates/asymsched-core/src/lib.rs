//! # asymsched-core
//!
//! **Fair scheduling for asymmetric multicores, driven from user space.**
//!
//! `asymsched-core` is the controller library behind the `asymsched` CLI: it
//! runs a workload of commands on a machine whose cores are pinned to fast
//! and slow DVFS frequencies, periodically reads per-command instruction
//! counters through the custom `fairamp` syscall, smooths them into
//! per-command speedup estimates, and publishes per-command
//! `(fast, slow)` round-slice quotas computed under a configurable
//! fairness/throughput criterion.
//!
//! ## Architecture
//!
//! Supervisor (spawn/reap) ⇄ shared cells ⇄ Estimator (sample/smooth)
//! → Policy engine (criteria math) → kernel publish
//!
//! - [`syscall`] — typed wrappers over the `fairamp` syscall, behind the
//!   [`syscall::FairampKernel`] trait so everything above it is testable.
//! - [`workload`] — the command model, command-file parsing, run modes, and
//!   the lock-free cells shared between the two controller threads.
//! - [`cores`] — core-type vectors, sysfs hotplug and frequency pinning.
//! - [`estimator`] — periodic counter sampling and speedup smoothing.
//! - [`policy`] / [`engine`] — the scheduling policy representation and the
//!   round-slice computation (unaware, manual, max-perf, max-fair over three
//!   bases, minF, uniformity, similarity grouping).
//! - [`supervisor`] — process lifecycle: spawn, reap, respawn, kill.
//! - [`output`] / [`report`] / [`stat`] / [`ftrace`] — output capture and
//!   merging, the JSON run report, `/proc/stat` accounting, and optional
//!   `sched_switch` tracing.

pub mod cores;
pub mod engine;
pub mod estimator;
pub mod ftrace;
pub mod output;
pub mod policy;
pub mod report;
pub mod stat;
pub mod supervisor;
pub mod syscall;
pub mod workload;

pub use engine::PolicyEngine;
pub use estimator::{EstimatorConfig, SpeedupEstimator};
pub use policy::{Base, Criteria, Metric, Policy, PolicyBuilder};
pub use supervisor::Supervisor;
pub use syscall::{FairampKernel, FairampSyscall};
pub use workload::{Command, CommandView, Mode, RoundSlice, RunConfig, SharedCell};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
