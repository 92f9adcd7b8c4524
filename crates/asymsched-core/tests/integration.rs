//! Closed-loop integration tests: estimator ticks feed the policy engine,
//! whose published quotas gate what the estimator can observe next tick —
//! all against a simulated fairamp kernel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asymsched_core::engine::PolicyEngine;
use asymsched_core::estimator::{EstimatorConfig, SpeedupEstimator};
use asymsched_core::policy::PolicyBuilder;
use asymsched_core::syscall::{FairampKernel, ThreadsInfo, UnitVruntime};
use asymsched_core::workload::{
    BASE_ROUND_SLICE, CommandView, MINIMAL_ROUND_SLICE, Mode, SharedCell,
};

const B: u32 = BASE_ROUND_SLICE;
const INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Sample,
    Publish,
}

/// Per-command ground truth: instructions per nanosecond on each core type.
#[derive(Debug, Clone, Copy)]
struct Profile {
    ips_fast: f64,
    ips_slow: f64,
}

/// A kernel whose counters follow the most recently published quotas: a
/// command runs `slice/B` of the interval on each core type at its profile's
/// instruction rate.
struct SimulatedKernel {
    profiles: Vec<Profile>,
    slices: Mutex<HashMap<i32, (u32, u32)>>,
    published: Mutex<Vec<Vec<UnitVruntime>>>,
    events: Mutex<Vec<Event>>,
}

impl SimulatedKernel {
    fn new(profiles: Vec<Profile>) -> Self {
        Self {
            profiles,
            slices: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    fn last_published(&self) -> Vec<UnitVruntime> {
        self.published.lock().unwrap().last().cloned().unwrap()
    }
}

impl FairampKernel for SimulatedKernel {
    fn set_fast_core(&self, _cpu: i32) -> std::io::Result<()> {
        Ok(())
    }

    fn set_slow_core(&self, _cpu: i32) -> std::io::Result<()> {
        Ok(())
    }

    fn set_unit_vruntime(&self, info: &[UnitVruntime]) -> std::io::Result<()> {
        let mut slices = self.slices.lock().unwrap();
        for entry in info {
            slices.insert(entry.num, (entry.unit_fast_vruntime, entry.unit_slow_vruntime));
        }
        self.published.lock().unwrap().push(info.to_vec());
        self.events.lock().unwrap().push(Event::Publish);
        Ok(())
    }

    fn get_threads_info(&self, info: &mut [ThreadsInfo]) -> std::io::Result<usize> {
        let slices = self.slices.lock().unwrap();
        let interval_ns = INTERVAL.as_nanos() as u64;
        for entry in info.iter_mut() {
            if entry.pid <= 0 {
                continue;
            }
            let (fast, slow) = slices
                .get(&entry.num)
                .copied()
                .unwrap_or((0, B));
            let profile = self.profiles[entry.num as usize];
            let fast_runtime = interval_ns * u64::from(fast) / u64::from(B);
            let slow_runtime = interval_ns * u64::from(slow) / u64::from(B);
            entry.sum_fast_exec_runtime = fast_runtime;
            entry.sum_slow_exec_runtime = slow_runtime;
            entry.insts_fast = (profile.ips_fast * fast_runtime as f64) as i64;
            entry.insts_slow = (profile.ips_slow * slow_runtime as f64) as i64;
        }
        self.events.lock().unwrap().push(Event::Sample);
        Ok(info.len())
    }

    fn start_measuring_ips_type(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn stop_measuring_ips_type(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn pin(&self, _pid: i32, _cpu: i32) -> std::io::Result<()> {
        Ok(())
    }
}

fn views(count: usize) -> Vec<CommandView> {
    (0..count)
        .map(|num| {
            let cell = Arc::new(SharedCell::new(1.0));
            cell.set_pid(1000 + num as i32);
            CommandView {
                num,
                num_threads: 1,
                cell,
            }
        })
        .collect()
}

fn estimator_config(num_core: usize, num_fast: u32) -> EstimatorConfig {
    EstimatorConfig {
        interval: INTERVAL,
        num_core,
        num_fast_core: num_fast,
        max_ips_ratio: 4.0,
        adjust_frequency: true,
    }
}

/// Drive `ticks` estimator+engine rounds.
fn run_loop(
    kernel: &SimulatedKernel,
    estimator: &mut SpeedupEstimator,
    engine: &mut PolicyEngine,
    views: &[CommandView],
    ticks: usize,
) {
    for _ in 0..ticks {
        estimator.tick(kernel);
        engine.set_round_slice(views, kernel);
    }
}

#[test]
fn test_closed_loop_converges_to_true_speedups() {
    // Two single-threaded commands: a 3x program and a memory-bound 1.2x one.
    let kernel = SimulatedKernel::new(vec![
        Profile {
            ips_fast: 3.0,
            ips_slow: 1.0,
        },
        Profile {
            ips_fast: 1.2,
            ips_slow: 1.0,
        },
    ]);
    let views = views(2);

    let mut builder = PolicyBuilder::new();
    builder.criteria("max_fair").unwrap();
    let policy = builder.build().unwrap();

    let mut engine = PolicyEngine::new(policy, Mode::Normal.config(), 1, 1, &views);
    let mut estimator = SpeedupEstimator::new(estimator_config(2, 1), views.clone());

    // The initial quota pass gives both commands a slice on each side (the
    // minimal-sampling floor), so both IPS sides become observable.
    engine.set_round_slice(&views, &kernel);
    run_loop(&kernel, &mut estimator, &mut engine, &views, 12);

    let s0 = f64::from(views[0].cell.speedup());
    let s1 = f64::from(views[1].cell.speedup());
    assert!((s0 - 3.0).abs() < 0.05, "speedup 0 converged to {s0}");
    assert!((s1 - 1.2).abs() < 0.05, "speedup 1 converged to {s1}");
}

#[test]
fn test_closed_loop_minf_orders_fast_time_by_speedup() {
    let kernel = SimulatedKernel::new(vec![
        Profile {
            ips_fast: 2.8,
            ips_slow: 1.0,
        },
        Profile {
            ips_fast: 2.0,
            ips_slow: 1.0,
        },
        Profile {
            ips_fast: 1.1,
            ips_slow: 1.0,
        },
    ]);
    let views = views(3);

    let mut builder = PolicyBuilder::new();
    builder.criteria("minF").unwrap();
    builder.target("80").unwrap();
    let policy = builder.build().unwrap();

    let mut engine = PolicyEngine::new(policy, Mode::Normal.config(), 1, 2, &views);
    let mut estimator = SpeedupEstimator::new(estimator_config(3, 1), views.clone());

    engine.set_round_slice(&views, &kernel);
    run_loop(&kernel, &mut estimator, &mut engine, &views, 15);

    // Fast time follows the speedup ordering, and every published quota
    // keeps both sides observable.
    let published = kernel.last_published();
    assert!(published[0].unit_fast_vruntime >= published[1].unit_fast_vruntime);
    assert!(published[1].unit_fast_vruntime >= published[2].unit_fast_vruntime);
    for entry in &published {
        assert_eq!(entry.unit_fast_vruntime + entry.unit_slow_vruntime, B);
        assert!(entry.unit_fast_vruntime >= MINIMAL_ROUND_SLICE);
        assert!(entry.unit_slow_vruntime >= MINIMAL_ROUND_SLICE);
    }
}

#[test]
fn test_publish_strictly_follows_sample() {
    let kernel = SimulatedKernel::new(vec![Profile {
        ips_fast: 2.0,
        ips_slow: 1.0,
    }]);
    let views = views(1);

    let mut builder = PolicyBuilder::new();
    builder.criteria("max_fair").unwrap();
    let policy = builder.build().unwrap();

    let mut engine = PolicyEngine::new(policy, Mode::Normal.config(), 1, 1, &views);
    let mut estimator = SpeedupEstimator::new(estimator_config(2, 1), views.clone());

    run_loop(&kernel, &mut estimator, &mut engine, &views, 5);

    // Each tick is one counter read followed by one publish.
    let events = kernel.events.lock().unwrap();
    assert_eq!(events.len(), 10);
    for pair in events.chunks(2) {
        assert_eq!(pair, [Event::Sample, Event::Publish]);
    }
}

#[test]
fn test_command_exit_reenters_with_fresh_estimate() {
    let kernel = SimulatedKernel::new(vec![
        Profile {
            ips_fast: 3.0,
            ips_slow: 1.0,
        },
        Profile {
            ips_fast: 1.5,
            ips_slow: 1.0,
        },
    ]);
    let views = views(2);

    let mut builder = PolicyBuilder::new();
    builder.criteria("max_perf").unwrap();
    let policy = builder.build().unwrap();

    let mut engine = PolicyEngine::new(policy, Mode::Normal.config(), 1, 1, &views);
    let mut estimator = SpeedupEstimator::new(estimator_config(2, 1), views.clone());

    engine.set_round_slice(&views, &kernel);
    run_loop(&kernel, &mut estimator, &mut engine, &views, 8);

    // The faster command owns the fast core.
    let published = kernel.last_published();
    assert!(published[0].unit_fast_vruntime > published[1].unit_fast_vruntime);

    // It exits; the remaining command inherits the fast core.
    views[0].cell.set_pid(0);
    run_loop(&kernel, &mut estimator, &mut engine, &views, 2);
    let published = kernel.last_published();
    assert_eq!(published[0].pid, 0);
    assert!(published[1].unit_fast_vruntime > published[1].unit_slow_vruntime);
}
