//! Round-slice policy engine.
//!
//! Converts per-command speedup estimates into per-thread `(fast, slow)`
//! round slices under the selected criterion, then publishes the per-command
//! mean to the kernel. One invocation:
//!
//! 1. Snapshot the shared cells and sort: active commands first, descending
//!    speedup.
//! 2. Expand commands into one record per software thread.
//! 3. Run the criterion routine.
//! 4. Guarantee the minimal sampling slice on both sides.
//! 5. Fold thread slices back to per-command means and publish.
//!
//! The engine is invoked from at most one thread at a time: the estimator on
//! the periodic path, or the supervisor on command exit when the estimator
//! is not running.

use crate::policy::{Base, Criteria, Policy};
use crate::syscall::{FairampKernel, UnitVruntime};
use crate::workload::{
    BASE_ROUND_SLICE, CommandView, MINIMAL_ROUND_SLICE, RoundSlice, RunConfig,
};

const B: u32 = BASE_ROUND_SLICE;

/// Snapshot of one command taken at the start of an engine pass.
#[derive(Debug, Clone, Copy)]
pub struct TaskSnapshot {
    pub num: usize,
    pub pid: i32,
    pub active: bool,
    pub num_threads: u32,
    pub speedup: f64,
}

/// One software thread of an active command.
#[derive(Debug, Clone, Copy)]
pub struct ThreadRecord {
    /// Index into the sorted task snapshot.
    pub idx: usize,
    pub speedup: f64,
    pub slice: RoundSlice,
}

/// Fairness/throughput metrics of a slice vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyMetrics {
    pub throughput: f64,
    pub min_fairness: f64,
    pub uniformity: f64,
}

/// Sort tasks: active first, then descending speedup. Stable, so an
/// already-ordered vector is untouched. Returns the active count.
pub fn sort_tasks(tasks: &mut [TaskSnapshot]) -> usize {
    tasks.sort_by(|a, b| {
        b.active
            .cmp(&a.active)
            .then(b.speedup.total_cmp(&a.speedup))
    });
    tasks.iter().filter(|t| t.active).count()
}

/// The policy engine. Scratch buffers are allocated once at initialisation
/// and reused on every pass.
pub struct PolicyEngine {
    policy: Policy,
    run: RunConfig,
    num_fast_core: u32,
    num_slow_core: u32,

    tasks: Vec<TaskSnapshot>,
    threads: Vec<ThreadRecord>,
    num_active: usize,

    max_fair: Vec<RoundSlice>,
    max_perf: Vec<RoundSlice>,
    perf: Vec<f64>,
    perf_base: Vec<f64>,
    class: Vec<f64>,
    coef_h: Vec<f64>,
    coef_m: Vec<f64>,
    reclassified: Vec<bool>,
    max_min_f: f64,

    publish: Vec<UnitVruntime>,
}

impl PolicyEngine {
    pub fn new(
        policy: Policy,
        run: RunConfig,
        num_fast_core: u32,
        num_slow_core: u32,
        views: &[CommandView],
    ) -> Self {
        let total_threads: usize = views.iter().map(|v| v.num_threads as usize).sum();
        Self {
            policy,
            run,
            num_fast_core,
            num_slow_core,
            tasks: Vec::with_capacity(views.len()),
            threads: Vec::with_capacity(total_threads),
            num_active: 0,
            max_fair: vec![RoundSlice::new(0, 0); total_threads],
            max_perf: vec![RoundSlice::new(0, 0); total_threads],
            perf: vec![0.0; total_threads],
            perf_base: vec![0.0; total_threads],
            class: vec![0.0; total_threads],
            coef_h: vec![0.0; total_threads],
            coef_m: vec![0.0; total_threads],
            reclassified: vec![false; total_threads],
            max_min_f: 1.0,
            publish: Vec::with_capacity(views.len()),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Equal fairness achievable by max-fair under the current base, from
    /// the most recent pass.
    pub fn max_min_fairness(&self) -> f64 {
        self.max_min_f
    }

    /// Per-thread `(speedup, slice)` of the most recent pass, for inspection.
    pub fn thread_slices(&self) -> Vec<(f64, RoundSlice)> {
        self.threads.iter().map(|t| (t.speedup, t.slice)).collect()
    }

    /// Number of active tasks in the most recent pass.
    pub fn num_active_tasks(&self) -> usize {
        self.num_active
    }

    /// Metrics of the most recent pass's slice vector.
    pub fn metrics(&mut self) -> PolicyMetrics {
        self.calculate_perf();
        let t = self.threads.len();
        PolicyMetrics {
            throughput: throughput_of(&self.perf[..t], &self.perf_base[..t]),
            min_fairness: min_fairness_of(&self.perf[..t], &self.perf_base[..t]),
            uniformity: uniformity_of(&self.perf[..t], &self.perf_base[..t]),
        }
    }

    /// Recompute slices from current speedups and publish to the kernel.
    pub fn set_round_slice(&mut self, views: &[CommandView], kernel: &dyn FairampKernel) {
        self.compute(views, false);
        self.build_publish(views);
        if let Err(e) = kernel.set_unit_vruntime(&self.publish) {
            log::warn!("set_unit_vruntime failed: {e}");
        }
    }

    /// The initial pass before any command is started: every command is
    /// treated as active so static modes get their quotas up front. Nothing
    /// is published — each command carries its quota into the kernel when it
    /// is spawned.
    pub fn set_round_slice_before_run(&mut self, views: &[CommandView]) {
        self.compute(views, true);
    }

    // -----------------------------------------------------------------------
    // Pass skeleton
    // -----------------------------------------------------------------------

    fn compute(&mut self, views: &[CommandView], treat_all_active: bool) {
        self.snapshot(views, treat_all_active);
        self.expand_threads();
        if !self.threads.is_empty() {
            self.run_criterion();
            if self.policy.speedup_aware() && self.run.periodic_update {
                self.guarantee_minimal_round_slice();
            }
        }
        self.fold_to_commands(views);
    }

    fn snapshot(&mut self, views: &[CommandView], treat_all_active: bool) {
        self.tasks.clear();
        for view in views {
            let pid = view.cell.pid();
            self.tasks.push(TaskSnapshot {
                num: view.num,
                pid: pid.max(0),
                active: pid > 0 || treat_all_active,
                num_threads: view.num_threads,
                speedup: f64::from(view.cell.speedup()),
            });
        }
        self.num_active = sort_tasks(&mut self.tasks);
    }

    fn expand_threads(&mut self) {
        self.threads.clear();
        for (idx, task) in self.tasks[..self.num_active].iter().enumerate() {
            for _ in 0..task.num_threads {
                self.threads.push(ThreadRecord {
                    idx,
                    speedup: task.speedup,
                    slice: RoundSlice::new(0, 0),
                });
            }
        }
    }

    fn run_criterion(&mut self) {
        match self.policy.criteria {
            Criteria::Unaware => self.slices_unaware(),
            Criteria::Manual => self.slices_manual(),
            Criteria::MaxPerf => {
                self.slices_max_perf();
                if self.policy.similarity > 0.0 {
                    self.apply_similarity();
                }
            }
            Criteria::MaxFair => self.slices_max_fair(),
            Criteria::MinF | Criteria::Uniformity | Criteria::MinFUniformity => {
                self.slices_max_fair();

                let criteria = self.policy.criteria;
                if criteria == Criteria::MinF && self.policy.throughput > 0.0 {
                    self.apply_minf_throughput();
                    return;
                }
                if matches!(criteria, Criteria::MinF | Criteria::MinFUniformity) {
                    self.apply_minf(self.policy.min_f);
                } else {
                    self.slices_max_perf();
                }

                // Similarity never hurts the minF guarantee: grouped threads
                // trade fast time among near-equal speedups.
                if self.policy.similarity > 0.0 {
                    self.apply_similarity();
                }

                if matches!(criteria, Criteria::Uniformity | Criteria::MinFUniformity) {
                    if self.policy.throughput > 0.0 {
                        // No throughput form of the blend search exists; the
                        // max-perf slices stand.
                    } else {
                        self.apply_uniformity();
                    }
                }
            }
        }
    }

    fn fold_to_commands(&mut self, views: &[CommandView]) {
        let mut ti = 0;
        for i in 0..self.num_active {
            let n = u64::from(self.tasks[i].num_threads);
            let mut sum_fast = 0u64;
            let mut sum_slow = 0u64;
            for _ in 0..n {
                sum_fast += u64::from(self.threads[ti].slice.fast);
                sum_slow += u64::from(self.threads[ti].slice.slow);
                ti += 1;
            }
            let slice = RoundSlice::new((sum_fast / n) as u32, (sum_slow / n) as u32);
            views[self.tasks[i].num].cell.set_slice(slice);
        }
    }

    fn build_publish(&mut self, views: &[CommandView]) {
        self.publish.clear();
        for view in views {
            let slice = view.cell.slice();
            self.publish.push(UnitVruntime {
                num: view.num as i32,
                pid: view.cell.pid().max(0),
                unit_fast_vruntime: slice.fast,
                unit_slow_vruntime: slice.slow,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Criterion routines
    // -----------------------------------------------------------------------

    fn slices_unaware(&mut self) {
        for th in &mut self.threads {
            th.slice = RoundSlice::new(0, B);
        }
    }

    fn slices_manual(&mut self) {
        for th in &mut self.threads {
            // The offline hint is the fraction of the round to spend on fast
            // cores; a hint above 1.0 saturates at a full fast slice.
            let fast = ((f64::from(B) * th.speedup) as i64).clamp(0, i64::from(B)) as u32;
            th.slice = RoundSlice::new(fast, B - fast);
        }
    }

    fn slices_max_perf(&mut self) {
        let fast_slots = self.num_fast_core as usize;
        for (i, th) in self.threads.iter_mut().enumerate() {
            th.slice = if i < fast_slots {
                RoundSlice::new(B, 0)
            } else {
                RoundSlice::new(0, B)
            };
        }
    }

    fn copy_max_fair_to_threads(&mut self) {
        for (i, th) in self.threads.iter_mut().enumerate() {
            th.slice = self.max_fair[i];
        }
    }

    fn slices_max_fair(&mut self) {
        match self.policy.base {
            Base::FairShare => self.max_fair_fair_share(),
            Base::SlowCore => self.max_fair_slow_core(),
            Base::FastCore => self.max_fair_fast_core(),
        }
        self.copy_max_fair_to_threads();
    }

    /// Fair-share base: every thread gets its proportional share of both
    /// core types, with a fast-core-first rule when threads are scarce.
    fn max_fair_fair_share(&mut self) {
        let t = self.threads.len() as u64;
        let fast_cores = u64::from(self.num_fast_core);
        let slow_cores = u64::from(self.num_slow_core);
        let b = u64::from(B);

        let (fast, slow) = if !self.run.fast_core_first {
            let fast = (b * fast_cores / (fast_cores + slow_cores)) as u32;
            let slow = (b * slow_cores / (fast_cores + slow_cores)) as u32;
            (fast, slow)
        } else if t < fast_cores {
            (B, 0)
        } else if t < fast_cores + slow_cores {
            let fast = (b * fast_cores / t) as u32;
            (fast, B - fast)
        } else {
            let fast = (b * fast_cores / (fast_cores + slow_cores)) as u32;
            let slow = (b * slow_cores / (fast_cores + slow_cores)) as u32;
            (fast, slow)
        };

        for i in 0..self.threads.len() {
            self.max_fair[i] = RoundSlice::new(fast, slow);
            self.perf_base[i] = self.threads[i].speedup * f64::from(fast) + f64::from(slow);
        }
        self.max_min_f = 1.0;
    }

    /// Slow-core base: equalise `F_i = (speedup_i·f_i + B − f_i)/B` using
    /// `H_i = 1/(speedup_i − 1)`; `max_minF = F/ΣH + 1`. Threads fall into
    /// three classes — pin-mode placeholders (speedup < 0, full fast slice),
    /// small speedups (≤ 1, slow-only unless fast cores would sit idle), and
    /// the general formula. A computed `f_i > B` reclassifies the thread as
    /// fast-only and the fixed point is retried; T rounds bound it.
    fn max_fair_slow_core(&mut self) {
        let t = self.threads.len();
        let b = i64::from(B);

        for i in 0..t {
            let s = self.threads[i].speedup;
            self.class[i] = s;
            self.coef_h[i] = 1.0 / (s - 1.0);
            self.perf_base[i] = f64::from(B);
            self.reclassified[i] = false;
        }

        for _round in 0..=t {
            let mut num_small = 0i64;
            let mut num_fast_only = 0i64;
            let mut h_sum = 0.0f64;
            for i in 0..t {
                let c = self.class[i];
                if c > 1.0 {
                    h_sum += self.coef_h[i];
                } else if c < 0.0 {
                    num_fast_only += 1;
                } else {
                    num_small += 1;
                }
            }

            self.max_min_f = f64::from(self.num_fast_core) / h_sum + 1.0;

            let mut small_excess = (num_small - i64::from(self.num_slow_core)).max(0);
            let total_fast =
                (i64::from(self.num_fast_core) - num_fast_only - small_excess) * b;

            if total_fast <= 0 {
                self.assign_exhausted_fast(num_fast_only, small_excess);
                break;
            }

            let mut retry = false;
            for i in 0..t {
                let c = self.class[i];
                if c < 0.0 {
                    self.max_fair[i] = RoundSlice::new(B, 0);
                } else if c <= 1.0 {
                    self.max_fair[i] = if small_excess > 0 {
                        RoundSlice::new(B, 0)
                    } else {
                        RoundSlice::new(0, B)
                    };
                    small_excess -= 1;
                } else {
                    let fast = (total_fast as f64 * self.coef_h[i] / h_sum) as i64;
                    if fast > b {
                        retry = true;
                        self.reclassified[i] = true;
                        self.class[i] = -1.0;
                        self.max_fair[i] = RoundSlice::new(B, 0);
                    } else {
                        let fast = fast.max(0) as u32;
                        self.max_fair[i] = RoundSlice::new(fast, B - fast);
                    }
                }
            }
            if !retry {
                break;
            }
        }

        self.lower_max_min_f_for_reclassified();
        log::debug!("max_fair(slow_core): max_minF: {:.2}", self.max_min_f);
    }

    /// Fast-core base: `perf_base = speedup·B`; with
    /// `M_i = speedup_i/(speedup_i − 1)`,
    /// `max_minF = (F + ΣH)/ΣM` and
    /// `f_i = total_fast·M_i/ΣM + B·M_i·ΣH/ΣM − B·H_i`. A negative `f_i`
    /// reclassifies the thread as small-speedup, an `f_i > B` as fast-only.
    fn max_fair_fast_core(&mut self) {
        let t = self.threads.len();
        let b = i64::from(B);

        for i in 0..t {
            let s = self.threads[i].speedup;
            self.class[i] = s;
            self.coef_h[i] = 1.0 / (s - 1.0);
            self.coef_m[i] = s / (s - 1.0);
            self.perf_base[i] = s * f64::from(B);
            self.reclassified[i] = false;
        }

        for _round in 0..=t {
            let mut num_small = 0i64;
            let mut num_fast_only = 0i64;
            let mut h_sum = 0.0f64;
            let mut m_sum = 0.0f64;
            for i in 0..t {
                let c = self.class[i];
                if c > 1.0 {
                    h_sum += self.coef_h[i];
                    m_sum += self.coef_m[i];
                } else if c < 0.0 {
                    num_fast_only += 1;
                } else {
                    num_small += 1;
                }
            }

            self.max_min_f = (f64::from(self.num_fast_core) + h_sum) / m_sum;

            let mut small_excess = (num_small - i64::from(self.num_slow_core)).max(0);
            let total_fast =
                (i64::from(self.num_fast_core) - num_fast_only - small_excess) * b;

            if total_fast <= 0 {
                self.assign_exhausted_fast(num_fast_only, small_excess);
                break;
            }

            let mut retry = false;
            for i in 0..t {
                let c = self.class[i];
                if c < 0.0 {
                    self.max_fair[i] = RoundSlice::new(B, 0);
                } else if c <= 1.0 {
                    self.max_fair[i] = if small_excess > 0 {
                        RoundSlice::new(B, 0)
                    } else {
                        RoundSlice::new(0, B)
                    };
                    small_excess -= 1;
                } else {
                    let gross = total_fast as f64 * self.coef_m[i] / m_sum
                        + f64::from(B) * self.coef_m[i] * h_sum / m_sum;
                    let debt = f64::from(B) * self.coef_h[i];
                    if gross > debt {
                        let fast = (gross - debt) as i64;
                        if fast > b {
                            retry = true;
                            self.reclassified[i] = true;
                            self.class[i] = -1.0;
                            self.max_fair[i] = RoundSlice::new(B, 0);
                        } else {
                            let fast = fast as u32;
                            self.max_fair[i] = RoundSlice::new(fast, B - fast);
                        }
                    } else {
                        retry = true;
                        self.reclassified[i] = true;
                        self.class[i] = 1.0;
                        self.max_fair[i] = RoundSlice::new(0, B);
                    }
                }
            }
            if !retry {
                break;
            }
        }

        self.lower_max_min_f_for_reclassified();
        log::debug!("max_fair(fast_core): max_minF: {:.2}", self.max_min_f);
    }

    /// Corner case shared by the slow/fast-core bases: no general fast
    /// budget remains. Pin-mode threads split the fast cores fairly, excess
    /// small-speedup threads go fast-only, everyone else slow-only.
    fn assign_exhausted_fast(&mut self, num_fast_only: i64, mut small_excess: i64) {
        let b = i64::from(B);
        for i in 0..self.threads.len() {
            let c = self.class[i];
            self.max_fair[i] = if c < 0.0 {
                let fast = if num_fast_only < i64::from(self.num_fast_core) {
                    B
                } else {
                    (b * i64::from(self.num_fast_core) / num_fast_only) as u32
                };
                RoundSlice::new(fast, B - fast)
            } else if c <= 1.0 && small_excess > 0 {
                small_excess -= 1;
                RoundSlice::new(B, 0)
            } else {
                RoundSlice::new(0, B)
            };
        }
    }

    /// A reclassified thread no longer participates in the equal-fairness
    /// closed form; its achieved ratio caps `max_minF` instead.
    fn lower_max_min_f_for_reclassified(&mut self) {
        for i in 0..self.threads.len() {
            if self.reclassified[i] {
                let slice = self.max_fair[i];
                let perf = self.threads[i].speedup * f64::from(slice.fast) + f64::from(slice.slow);
                let ratio = perf / self.perf_base[i];
                if ratio < self.max_min_f {
                    self.max_min_f = ratio;
                }
            }
        }
    }

    /// Raise every thread to the minimum fast slice that sustains the
    /// fairness target, then hand the remaining fast budget to the highest
    /// speedups. Requires `perf_base`/`max_minF` from a preceding max-fair
    /// pass.
    fn apply_minf(&mut self, target: f64) {
        if target >= self.max_min_f {
            log::debug!(
                "minF target {target:.3} >= max_minF {:.3}; keeping max-fair",
                self.max_min_f
            );
            return;
        }

        let b = i64::from(B);
        let mut remaining = i64::from(self.num_fast_core) * b;
        for i in 0..self.threads.len() {
            let s = self.threads[i].speedup;
            // speedup·a + (B − a) ≥ target·perf_base  ⇒
            // a ≥ (target·perf_base − B)/(speedup − 1)
            let amount = if s > 1.0 {
                (((target * self.perf_base[i] - b as f64) / (s - 1.0)) as i64).clamp(0, b)
            } else {
                0
            };
            remaining -= amount;
            self.threads[i].slice = RoundSlice::new(amount as u32, (b - amount) as u32);
        }

        // Threads are in descending speedup order.
        for th in &mut self.threads {
            if remaining <= 0 {
                break;
            }
            let amount = i64::from(B - th.slice.fast).min(remaining);
            th.slice.fast += amount as u32;
            th.slice.slow -= amount as u32;
            remaining -= amount;
        }
    }

    /// Binary search over minF values for a throughput target interpolated
    /// between max-fair (lowest) and max-perf (highest). Invariant: the
    /// lower bound achieves the target, the upper does not.
    fn apply_minf_throughput(&mut self) {
        let t = self.threads.len();

        // Max-fair slices are in place.
        self.calculate_perf();
        let thr_lo = throughput_of(&self.perf[..t], &self.perf_base[..t]);
        let mut minf_upper = self.max_min_f;
        if self.policy.throughput == 0.0 {
            return;
        }

        self.slices_max_perf();
        self.calculate_perf();
        let thr_hi = throughput_of(&self.perf[..t], &self.perf_base[..t]);
        let mut minf_lower = min_fairness_of(&self.perf[..t], &self.perf_base[..t]);
        if self.policy.throughput == 1.0 {
            return;
        }

        log::debug!(
            "minF search: throughput {thr_lo:.3} ~ {thr_hi:.3} minF {minf_lower:.3} ~ {minf_upper:.3}"
        );

        if thr_lo >= thr_hi {
            self.copy_max_fair_to_threads();
            return;
        }

        let target = thr_lo + self.policy.throughput * (thr_hi - thr_lo);

        let mut minf = minf_upper;
        while (minf_upper - minf_lower).abs() >= 0.005 {
            minf = (minf_lower + minf_upper) / 2.0;
            self.apply_minf(minf);
            self.calculate_perf();
            let thr = throughput_of(&self.perf[..t], &self.perf_base[..t]);
            if thr >= target {
                minf_lower = minf;
            } else {
                minf_upper = minf;
            }
        }

        // Terminate on the bound that satisfied the throughput.
        if minf == minf_upper {
            self.apply_minf(minf_lower);
        }
    }

    /// Group consecutive threads whose speedup is within the similarity
    /// threshold of the group leader and equalise their slices. Only groups
    /// holding more than their max-fair share are touched, so the pass never
    /// applies to fair vectors.
    fn apply_similarity(&mut self) {
        let eps = self.policy.similarity;
        let t = self.threads.len();
        let mut i = 0;
        while i < t {
            if self.threads[i].slice.fast > self.max_fair[i].fast {
                let start = i;
                let mut total_fast = u64::from(self.threads[start].slice.fast);
                let mut total_slow = u64::from(self.threads[start].slice.slow);
                i += 1;
                while i < t && self.threads[start].speedup - self.threads[i].speedup <= eps {
                    total_fast += u64::from(self.threads[i].slice.fast);
                    total_slow += u64::from(self.threads[i].slice.slow);
                    i += 1;
                }
                let n = (i - start) as u64;
                let mean_fast = (total_fast / n) as u32;
                // Derive the slow side from the round so the division
                // remainder cannot break the per-thread sum.
                let mean = RoundSlice::new(mean_fast, B - mean_fast);
                for th in &mut self.threads[start..i] {
                    th.slice = mean;
                }
            } else {
                i += 1;
            }
        }
    }

    /// Blend between the max-perf and max-fair vectors until the uniformity
    /// target is met: `slice(α) = α·max_perf + (1−α)·max_fair` at per-cent
    /// granularity, starting from an analytic estimate of α and stepping
    /// down. Falls back to max-fair when α underflows.
    fn apply_uniformity(&mut self) {
        let t = self.threads.len();
        let target = self.policy.uniformity;

        self.calculate_perf();
        let mut uniformity = uniformity_of(&self.perf[..t], &self.perf_base[..t]);
        let uniformity_init = uniformity;
        if uniformity >= target {
            log::debug!("uniformity {uniformity_init:.3} already meets target {target:.3}");
            return;
        }

        // target ≤ 1 and uniformity < target here, so both ratios are in
        // (0, 1] and α lands in [0, 100).
        let mut alpha: i64 = ((1.0 - target) / (1.0 - uniformity) * 100.0) as i64;
        let alpha_init = alpha;
        for i in 0..t {
            self.max_perf[i] = self.threads[i].slice;
        }

        while uniformity < target && alpha >= 0 {
            for i in 0..t {
                let fast = (u64::from(self.max_perf[i].fast) * alpha as u64
                    + u64::from(self.max_fair[i].fast) * (100 - alpha) as u64
                    + 50)
                    / 100;
                let fast = fast as u32;
                self.threads[i].slice = RoundSlice::new(fast, B - fast);
            }
            self.calculate_perf();
            uniformity = uniformity_of(&self.perf[..t], &self.perf_base[..t]);
            if uniformity >= target {
                break;
            }
            // The analytic α is only an estimate; walk down to the match.
            alpha -= 1;
        }

        if alpha < 0 {
            self.copy_max_fair_to_threads();
        }

        log::debug!(
            "uniformity: alpha: {alpha} alpha_init: {alpha_init} uniformity: {uniformity:.3} init: {uniformity_init:.3}"
        );
    }

    // -----------------------------------------------------------------------
    // Minimal sampling slice
    // -----------------------------------------------------------------------

    /// Both IPS sides need observation time or the estimator permanently
    /// lacks data on one side. Raise every deficient side to the minimum,
    /// then repay the debt proportionally from threads holding surplus on
    /// the other side.
    fn guarantee_minimal_round_slice(&mut self) {
        let minimal = MINIMAL_ROUND_SLICE;
        let mut steal_fast: i64 = 0;

        for th in &mut self.threads {
            if th.slice.fast < minimal {
                let amount = minimal - th.slice.fast;
                th.slice.fast += amount;
                th.slice.slow -= amount;
                steal_fast += i64::from(amount);
            } else if th.slice.slow < minimal {
                let amount = minimal - th.slice.slow;
                th.slice.fast -= amount;
                th.slice.slow += amount;
                steal_fast -= i64::from(amount);
            }
        }

        if steal_fast > 0 {
            let donor: u64 = self
                .threads
                .iter()
                .filter(|th| th.slice.fast > minimal)
                .map(|th| u64::from(th.slice.fast - minimal))
                .sum();
            // An unsatisfiable minimum means the workload is rejected, not
            // silently violated.
            assert!(
                (steal_fast as u64) < donor,
                "minimal round slice unsatisfiable: steal {steal_fast} >= donors {donor}"
            );
            // Scale by 1000 to keep the per-thread quotient in 32-bit range.
            let donor_scaled = (donor / 1000).max(1);
            for th in &mut self.threads {
                if th.slice.fast > minimal {
                    let share = u64::from(th.slice.fast - minimal) / donor_scaled;
                    let amount = (steal_fast as u64 * share / 1000) as u32;
                    th.slice.fast -= amount;
                    th.slice.slow += amount;
                }
            }
        } else if steal_fast < 0 {
            let steal_slow = -steal_fast;
            let donor: u64 = self
                .threads
                .iter()
                .filter(|th| th.slice.slow > minimal)
                .map(|th| u64::from(th.slice.slow - minimal))
                .sum();
            assert!(
                (steal_slow as u64) < donor,
                "minimal round slice unsatisfiable: steal {steal_slow} >= donors {donor}"
            );
            let donor_scaled = (donor / 1000).max(1);
            for th in &mut self.threads {
                if th.slice.slow > minimal {
                    let share = u64::from(th.slice.slow - minimal) / donor_scaled;
                    let amount = (steal_slow as u64 * share / 1000) as u32;
                    th.slice.fast += amount;
                    th.slice.slow -= amount;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    fn calculate_perf(&mut self) {
        for (i, th) in self.threads.iter().enumerate() {
            self.perf[i] = th.speedup * f64::from(th.slice.fast) + f64::from(th.slice.slow);
        }
    }
}

/// Mean normalised throughput of a slice vector.
pub fn throughput_of(perf: &[f64], perf_base: &[f64]) -> f64 {
    if perf.is_empty() {
        return 0.0;
    }
    let sum: f64 = perf.iter().zip(perf_base).map(|(p, b)| p / b).sum();
    sum / perf.len() as f64
}

/// Minimum normalised throughput. May exceed 1.0 under the slow-core base.
pub fn min_fairness_of(perf: &[f64], perf_base: &[f64]) -> f64 {
    if perf.is_empty() {
        return 1.0;
    }
    perf.iter()
        .zip(perf_base)
        .map(|(p, b)| p / b)
        .fold(f64::INFINITY, f64::min)
}

/// `1 − σ/μ` of the normalised throughputs, clamped to 1 under numerical
/// noise.
pub fn uniformity_of(perf: &[f64], perf_base: &[f64]) -> f64 {
    if perf.is_empty() {
        return 1.0;
    }
    let n = perf.len() as f64;
    let mut avg = 0.0;
    let mut square_avg = 0.0;
    for (p, b) in perf.iter().zip(perf_base) {
        let ratio = p / b;
        avg += ratio;
        square_avg += ratio * ratio;
    }
    avg /= n;
    square_avg /= n;
    if square_avg > avg * avg {
        1.0 - (square_avg - avg * avg).sqrt() / avg
    } else {
        1.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyBuilder;
    use crate::workload::SharedCell;
    use std::sync::{Arc, Mutex};

    // -----------------------------------------------------------------------
    // Test fixtures
    // -----------------------------------------------------------------------

    /// Kernel mock that records every published vruntime vector.
    struct RecordingKernel {
        published: Mutex<Vec<Vec<UnitVruntime>>>,
    }

    impl RecordingKernel {
        fn new() -> Self {
            Self {
                published: Mutex::new(Vec::new()),
            }
        }

        fn last(&self) -> Vec<UnitVruntime> {
            self.published.lock().unwrap().last().cloned().unwrap()
        }

        fn count(&self) -> usize {
            self.published.lock().unwrap().len()
        }
    }

    impl FairampKernel for RecordingKernel {
        fn set_fast_core(&self, _cpu: i32) -> std::io::Result<()> {
            Ok(())
        }
        fn set_slow_core(&self, _cpu: i32) -> std::io::Result<()> {
            Ok(())
        }
        fn set_unit_vruntime(&self, info: &[UnitVruntime]) -> std::io::Result<()> {
            self.published.lock().unwrap().push(info.to_vec());
            Ok(())
        }
        fn get_threads_info(
            &self,
            info: &mut [crate::syscall::ThreadsInfo],
        ) -> std::io::Result<usize> {
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

    /// Running single/multi-threaded commands with the given speedups.
    fn running_views(specs: &[(f32, u32)]) -> Vec<CommandView> {
        specs
            .iter()
            .enumerate()
            .map(|(num, &(speedup, num_threads))| {
                let cell = Arc::new(SharedCell::new(speedup));
                cell.set_pid(100 + num as i32);
                CommandView {
                    num,
                    num_threads,
                    cell,
                }
            })
            .collect()
    }

    fn run_config(periodic: bool) -> RunConfig {
        let mode = if periodic {
            crate::workload::Mode::Normal
        } else {
            crate::workload::Mode::Static
        };
        mode.config()
    }

    fn policy(criteria: &str, base: &str, target: Option<&str>) -> Policy {
        let mut builder = PolicyBuilder::new();
        builder.base(base).unwrap();
        builder.criteria(criteria).unwrap();
        if let Some(t) = target {
            builder.target(t).unwrap();
        }
        builder.build().unwrap()
    }

    fn compute(
        policy: Policy,
        periodic: bool,
        fast: u32,
        slow: u32,
        views: &[CommandView],
    ) -> PolicyEngine {
        let mut engine = PolicyEngine::new(policy, run_config(periodic), fast, slow, views);
        let kernel = RecordingKernel::new();
        engine.set_round_slice(views, &kernel);
        engine
    }

    fn assert_thread_invariants(engine: &PolicyEngine) {
        for (speedup, slice) in engine.thread_slices() {
            assert_eq!(
                slice.fast + slice.slow,
                B,
                "slice must sum to the base round (speedup {speedup})"
            );
            assert!(slice.fast <= B && slice.slow <= B);
            assert!(
                slice.fast >= MINIMAL_ROUND_SLICE || slice.slow >= MINIMAL_ROUND_SLICE,
                "one side must stay observable"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Sorting
    // -----------------------------------------------------------------------

    #[test]
    fn test_sort_active_first_descending_speedup() {
        let mut tasks = vec![
            TaskSnapshot {
                num: 0,
                pid: 0,
                active: false,
                num_threads: 1,
                speedup: 3.0,
            },
            TaskSnapshot {
                num: 1,
                pid: 11,
                active: true,
                num_threads: 1,
                speedup: 1.2,
            },
            TaskSnapshot {
                num: 2,
                pid: 12,
                active: true,
                num_threads: 1,
                speedup: 2.5,
            },
        ];
        let active = sort_tasks(&mut tasks);
        assert_eq!(active, 2);
        assert!(tasks[..active].iter().all(|t| t.active));
        assert!(!tasks[2].active);
        assert!(tasks[0].speedup >= tasks[1].speedup);
    }

    #[test]
    fn test_sort_is_stable_for_ordered_input() {
        let mut tasks: Vec<TaskSnapshot> = [(2.0, 10), (2.0, 11), (1.5, 12)]
            .iter()
            .enumerate()
            .map(|(num, &(speedup, pid))| TaskSnapshot {
                num,
                pid,
                active: true,
                num_threads: 1,
                speedup,
            })
            .collect();
        sort_tasks(&mut tasks);
        assert_eq!(
            tasks.iter().map(|t| t.pid).collect::<Vec<_>>(),
            vec![10, 11, 12]
        );
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    /// S1: unaware gives every command a slow-only slice.
    #[test]
    fn test_unaware_all_slow() {
        let views = running_views(&[(2.0, 1), (1.5, 1), (1.2, 1), (1.0, 1)]);
        let kernel = RecordingKernel::new();
        let mut engine = PolicyEngine::new(
            policy("unaware", "fair_share", None),
            run_config(true),
            2,
            2,
            &views,
        );
        engine.set_round_slice(&views, &kernel);

        for entry in kernel.last() {
            assert_eq!(entry.unit_fast_vruntime, 0);
            assert_eq!(entry.unit_slow_vruntime, B);
        }
    }

    /// S2: max-perf fills the fast cores with the highest speedups.
    #[test]
    fn test_max_perf_greedy() {
        let views = running_views(&[(2.0, 1), (1.5, 1), (1.2, 1), (1.0, 1)]);
        let engine = compute(policy("max_perf", "fair_share", None), false, 2, 2, &views);

        let slices = engine.thread_slices();
        assert_eq!(slices[0].1, RoundSlice::new(B, 0));
        assert_eq!(slices[1].1, RoundSlice::new(B, 0));
        assert_eq!(slices[2].1, RoundSlice::new(0, B));
        assert_eq!(slices[3].1, RoundSlice::new(0, B));

        // Invariant 4: fast time never exceeds the fast-core supply.
        let total_fast: u64 = slices.iter().map(|(_, s)| u64::from(s.fast)).sum();
        assert!(total_fast <= 2 * u64::from(B));
    }

    /// S3: max-fair on the fair-share base gives everyone the same split and
    /// `perf_base = 0.5·speedup + 0.5` (scaled by the round).
    #[test]
    fn test_max_fair_fair_share_equal_split() {
        let views = running_views(&[(2.0, 1), (1.5, 1), (1.2, 1), (1.0, 1)]);
        let kernel = RecordingKernel::new();
        let mut engine = PolicyEngine::new(
            policy("max_fair", "fair_share", None),
            run_config(true),
            2,
            2,
            &views,
        );
        engine.set_round_slice(&views, &kernel);

        // Invariant 5: identical slices for every thread.
        for entry in kernel.last() {
            assert_eq!(entry.unit_fast_vruntime, B / 2);
            assert_eq!(entry.unit_slow_vruntime, B / 2);
        }
        assert_eq!(engine.max_min_fairness(), 1.0);

        let metrics = engine.metrics();
        assert!((metrics.min_fairness - 1.0).abs() < 1e-9);
        assert!((metrics.uniformity - 1.0).abs() < 1e-9);
    }

    /// S4: minF on the slow-core base. Speedups {3, 2, 1.5, 1} on F=2/S=2:
    /// the first fixed-point round computes f = {2B·0.5/3.5, 2B·1/3.5,
    /// 2B·2/3.5 > B}, so the speedup-1.5 thread is reclassified fast-only
    /// and the retry yields f = {B/3, 2B/3} for the remaining general
    /// threads. max_minF = min(2/1.5 + 1, reclassified ratio 1.5) = 1.5.
    #[test]
    fn test_minf_slow_core_closed_form() {
        let views = running_views(&[(3.0, 1), (2.0, 1), (1.5, 1), (1.0, 1)]);
        let engine = compute(policy("minF", "slow_core", Some("90")), false, 2, 2, &views);

        assert!((engine.max_min_fairness() - 1.5).abs() < 1e-9);

        // The fast budget is fully assigned to the two highest speedups.
        let slices = engine.thread_slices();
        let total_fast: u64 = slices.iter().map(|(_, s)| u64::from(s.fast)).sum();
        assert_eq!(total_fast, 2 * u64::from(B));
        assert_eq!(slices[0].1, RoundSlice::new(B, 0));
        assert_eq!(slices[1].1, RoundSlice::new(B, 0));
        assert_eq!(slices[3].1, RoundSlice::new(0, B));
    }

    /// The max-fair slow-core assignment itself (before any minF target).
    #[test]
    fn test_max_fair_slow_core_equalises_fairness() {
        let views = running_views(&[(3.0, 1), (2.0, 1)]);
        let engine = compute(policy("max_fair", "slow_core", None), false, 1, 1, &views);

        // H = {0.5, 1.0}; f_i = B·H_i/1.5.
        let slices = engine.thread_slices();
        let f0 = f64::from(slices[0].1.fast);
        let f1 = f64::from(slices[1].1.fast);
        assert!((f0 - f64::from(B) / 3.0).abs() < 2.0);
        assert!((f1 - f64::from(B) * 2.0 / 3.0).abs() < 2.0);

        // Equal fairness: (s·f + B − f)/B identical across threads.
        let r0 = (3.0 * f0 + f64::from(B) - f0) / f64::from(B);
        let r1 = (2.0 * f1 + f64::from(B) - f1) / f64::from(B);
        assert!((r0 - r1).abs() < 1e-6);
        assert!((engine.max_min_fairness() - (1.0 / 1.5 + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_max_fair_fast_core_base() {
        let views = running_views(&[(3.0, 1), (2.0, 1)]);
        let engine = compute(policy("max_fair", "fast_core", None), false, 1, 1, &views);

        // H = {0.5, 1.0}, M = {1.5, 2.0}; max_minF = (1 + 1.5)/3.5.
        assert!((engine.max_min_fairness() - 2.5 / 3.5).abs() < 1e-9);

        // Fairness equalised against the fast-core-only base.
        let slices = engine.thread_slices();
        let r: Vec<f64> = slices
            .iter()
            .map(|(s, slice)| {
                (s * f64::from(slice.fast) + f64::from(slice.slow)) / (s * f64::from(B))
            })
            .collect();
        assert!((r[0] - r[1]).abs() < 1e-6);
        assert!((r[0] - engine.max_min_fairness()).abs() < 1e-4);
    }

    /// S5: similarity groups near-equal speedups and averages their slices.
    #[test]
    fn test_similarity_grouping() {
        let views = running_views(&[(2.00, 1), (1.95, 1), (1.20, 1), (1.10, 1)]);
        let mut p = policy("max_perf", "fair_share", None);
        p.similarity = 0.1;
        let engine = compute(p, false, 2, 2, &views);

        let slices = engine.thread_slices();
        // Top two are within the threshold and already equal; unchanged.
        assert_eq!(slices[0].1, RoundSlice::new(B, 0));
        assert_eq!(slices[1].1, RoundSlice::new(B, 0));
        // Bottom two hold no more than their (zero) fair share; untouched.
        assert_eq!(slices[2].1, RoundSlice::new(0, B));
        assert_eq!(slices[3].1, RoundSlice::new(0, B));
    }

    #[test]
    fn test_similarity_averages_unequal_group() {
        // One fast-heavy thread followed by a near-equal one with less:
        // minF gives descending fast slices, similarity evens them out.
        let views = running_views(&[(2.0, 1), (1.98, 1), (1.0, 1)]);
        let mut p = policy("minF", "fair_share", Some("80"));
        p.similarity = 0.05;
        let engine = compute(p, false, 1, 2, &views);

        let slices = engine.thread_slices();
        assert_eq!(slices[0].1, slices[1].1);
        assert_thread_invariants(&engine);
    }

    // -----------------------------------------------------------------------
    // Manual
    // -----------------------------------------------------------------------

    #[test]
    fn test_manual_uses_offline_hint() {
        let views = running_views(&[(0.5, 1), (0.25, 1)]);
        let engine = compute(policy("manual", "fair_share", None), false, 2, 2, &views);
        let slices = engine.thread_slices();
        assert_eq!(slices[0].1, RoundSlice::new(B / 2, B / 2));
        assert_eq!(slices[1].1, RoundSlice::new(B / 4, 3 * B / 4));
    }

    // -----------------------------------------------------------------------
    // Minimal sampling slice
    // -----------------------------------------------------------------------

    #[test]
    fn test_minimal_slice_enforced_under_periodic_update() {
        let views = running_views(&[(2.0, 1), (1.5, 1), (1.2, 1), (1.0, 1)]);
        let engine = compute(policy("max_perf", "fair_share", None), true, 2, 2, &views);

        for (_, slice) in engine.thread_slices() {
            assert!(slice.fast >= MINIMAL_ROUND_SLICE);
            assert!(slice.slow >= MINIMAL_ROUND_SLICE);
            assert_eq!(slice.fast + slice.slow, B);
        }
    }

    #[test]
    fn test_minimal_slice_donation_is_proportional() {
        // Three threads: two fast-only donors, one slow-only debtor.
        let views = running_views(&[(3.0, 1), (2.0, 1), (1.0, 1)]);
        let engine = compute(policy("max_perf", "fair_share", None), true, 2, 1, &views);

        let slices = engine.thread_slices();
        // The two fast-only threads give up exactly the minimal slow slice.
        assert_eq!(slices[0].1, slices[1].1);
        assert_eq!(slices[0].1.slow, MINIMAL_ROUND_SLICE);
        // The slow-only thread is first raised to the minimal fast slice,
        // then — as the only thread with slow surplus — repays the whole
        // slow-side debt from its slow time, doubling its fast slice.
        assert_eq!(slices[2].1.fast, 2 * MINIMAL_ROUND_SLICE);
        assert_thread_invariants(&engine);
    }

    // -----------------------------------------------------------------------
    // Idempotence (invariant 8)
    // -----------------------------------------------------------------------

    #[test]
    fn test_recompute_with_unchanged_inputs_is_idempotent() {
        let views = running_views(&[(2.4, 2), (1.7, 1), (1.0, 1)]);
        let kernel = RecordingKernel::new();
        let mut engine = PolicyEngine::new(
            policy("minF", "fair_share", Some("85")),
            run_config(true),
            2,
            2,
            &views,
        );
        engine.set_round_slice(&views, &kernel);
        engine.set_round_slice(&views, &kernel);

        assert_eq!(kernel.count(), 2);
        let published = kernel.published.lock().unwrap();
        assert_eq!(published[0], published[1]);
    }

    // -----------------------------------------------------------------------
    // minF / throughput (invariant 9)
    // -----------------------------------------------------------------------

    #[test]
    fn test_throughput_monotone_in_minf_target() {
        let specs = [(3.0f32, 1u32), (2.2, 1), (1.6, 1), (1.1, 1)];
        let mut last = f64::INFINITY;
        for target in ["10", "30", "50", "70", "90", "100"] {
            let views = running_views(&specs);
            let mut engine = compute(
                policy("minF", "fair_share", Some(target)),
                false,
                2,
                2,
                &views,
            );
            let throughput = engine.metrics().throughput;
            assert!(
                throughput <= last + 1e-9,
                "throughput must not increase with the minF target"
            );
            last = throughput;
        }
    }

    #[test]
    fn test_minf_fairness_guarantee_holds() {
        let views = running_views(&[(3.0, 1), (2.2, 1), (1.6, 1), (1.1, 1)]);
        let mut engine = compute(policy("minF", "fair_share", Some("80")), false, 2, 2, &views);
        let metrics = engine.metrics();
        // Integer truncation of the per-thread amounts costs at most a few
        // nanoseconds of the guarantee.
        assert!(metrics.min_fairness >= 0.8 - 1e-6);
    }

    #[test]
    fn test_minf_throughput_bisection_hits_target() {
        let specs = [(3.0f32, 1u32), (2.2, 1), (1.6, 1), (1.1, 1)];

        // Bounds of the throughput range.
        let views = running_views(&specs);
        let mut fair = compute(policy("max_fair", "fair_share", None), false, 2, 2, &views);
        let thr_lo = fair.metrics().throughput;
        let views = running_views(&specs);
        let mut perf = compute(policy("max_perf", "fair_share", None), false, 2, 2, &views);
        let thr_hi = perf.metrics().throughput;
        assert!(thr_lo < thr_hi);

        let views = running_views(&specs);
        let mut builder = PolicyBuilder::new();
        builder.criteria("minF").unwrap();
        builder.metric("throughput").unwrap();
        builder.target("50").unwrap();
        let mut engine = compute(builder.build().unwrap(), false, 2, 2, &views);
        let throughput = engine.metrics().throughput;

        let target = thr_lo + 0.5 * (thr_hi - thr_lo);
        assert!(
            throughput >= target - 0.01,
            "the search terminates on a bound satisfying the target"
        );
        assert!(throughput <= thr_hi + 1e-9);
    }

    #[test]
    fn test_minf_throughput_extremes() {
        let specs = [(3.0f32, 1u32), (1.5, 1)];

        let views = running_views(&specs);
        let mut builder = PolicyBuilder::new();
        builder.criteria("minF").unwrap();
        builder.metric("throughput").unwrap();
        builder.target("100").unwrap();
        let mut engine = compute(builder.build().unwrap(), false, 1, 1, &views);
        let views2 = running_views(&specs);
        let mut perf = compute(policy("max_perf", "fair_share", None), false, 1, 1, &views2);
        assert!((engine.metrics().throughput - perf.metrics().throughput).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // Uniformity (invariant 10)
    // -----------------------------------------------------------------------

    #[test]
    fn test_uniformity_reaches_target() {
        let views = running_views(&[(3.0, 1), (1.5, 1)]);
        let mut engine = compute(
            policy("uniformity", "fair_share", Some("90")),
            false,
            1,
            1,
            &views,
        );
        let metrics = engine.metrics();
        assert!(metrics.uniformity >= 0.9 - 1e-9);
        assert_thread_invariants(&engine);
    }

    #[test]
    fn test_uniformity_never_below_max_perf() {
        let specs = [(3.0f32, 1u32), (1.5, 1)];
        let views = running_views(&specs);
        let mut perf = compute(policy("max_perf", "fair_share", None), false, 1, 1, &views);
        let u_max_perf = perf.metrics().uniformity;

        for target in ["20", "50", "80", "95"] {
            let views = running_views(&specs);
            let mut engine = compute(
                policy("uniformity", "fair_share", Some(target)),
                false,
                1,
                1,
                &views,
            );
            assert!(engine.metrics().uniformity >= u_max_perf - 1e-9);
        }
    }

    #[test]
    fn test_uniformity_low_target_keeps_max_perf() {
        let views = running_views(&[(3.0, 1), (1.5, 1)]);
        let engine = compute(
            policy("uniformity", "fair_share", Some("10")),
            false,
            1,
            1,
            &views,
        );
        let slices = engine.thread_slices();
        assert_eq!(slices[0].1, RoundSlice::new(B, 0));
        assert_eq!(slices[1].1, RoundSlice::new(0, B));
    }

    // -----------------------------------------------------------------------
    // minF ∧ uniformity
    // -----------------------------------------------------------------------

    #[test]
    fn test_minf_uniformity_preserves_minf() {
        let views = running_views(&[(3.0, 1), (2.2, 1), (1.6, 1), (1.1, 1)]);
        let mut engine = compute(
            policy("minF_uniformity", "fair_share", Some("70_80")),
            false,
            2,
            2,
            &views,
        );
        let metrics = engine.metrics();
        assert!(metrics.min_fairness >= 0.7 - 1e-6);
        assert!(metrics.uniformity >= 0.8 - 1e-9);
        assert_thread_invariants(&engine);
    }

    // -----------------------------------------------------------------------
    // Multi-threaded commands and inactive slots
    // -----------------------------------------------------------------------

    #[test]
    fn test_published_slice_is_thread_mean() {
        // One 2-thread command on one fast core: its first thread gets the
        // fast slice, the second the slow one; the published quota is the
        // mean.
        let views = running_views(&[(2.0, 2)]);
        let kernel = RecordingKernel::new();
        let mut engine = PolicyEngine::new(
            policy("max_perf", "fair_share", None),
            run_config(false),
            1,
            1,
            &views,
        );
        engine.set_round_slice(&views, &kernel);

        let entry = kernel.last()[0];
        assert_eq!(entry.unit_fast_vruntime, B / 2);
        assert_eq!(entry.unit_slow_vruntime, B / 2);
    }

    #[test]
    fn test_inactive_commands_sort_last_and_keep_slices() {
        let views = running_views(&[(1.2, 1), (2.5, 1)]);
        views[0].cell.set_pid(0);
        views[0].cell.set_slice(RoundSlice::new(7, B - 7));

        let kernel = RecordingKernel::new();
        let mut engine = PolicyEngine::new(
            policy("max_perf", "fair_share", None),
            run_config(false),
            1,
            1,
            &views,
        );
        engine.set_round_slice(&views, &kernel);

        assert_eq!(engine.num_active_tasks(), 1);
        // The idle slot is published with pid 0 and an untouched slice.
        let published = kernel.last();
        assert_eq!(published[0].pid, 0);
        assert_eq!(published[0].unit_fast_vruntime, 7);
        // The active command won the fast core.
        assert_eq!(published[1].pid, 101);
        assert_eq!(published[1].unit_fast_vruntime, B);
    }

    #[test]
    fn test_before_run_treats_everything_as_active() {
        let views = running_views(&[(2.0, 1), (1.5, 1)]);
        views[0].cell.set_pid(-1);
        views[1].cell.set_pid(-1);

        let mut engine = PolicyEngine::new(
            policy("max_perf", "fair_share", None),
            run_config(false),
            1,
            1,
            &views,
        );
        engine.set_round_slice_before_run(&views);

        assert_eq!(engine.num_active_tasks(), 2);
        assert_eq!(views[0].cell.slice(), RoundSlice::new(B, 0));
        assert_eq!(views[1].cell.slice(), RoundSlice::new(0, B));
    }

    // -----------------------------------------------------------------------
    // Exhausted-fast corner case
    // -----------------------------------------------------------------------

    #[test]
    fn test_pin_placeholders_consume_the_fast_budget() {
        // Two pin-mode placeholders on a single fast core: they share it,
        // everyone else runs slow-only.
        let views = running_views(&[(-1.0, 1), (-1.0, 1), (2.0, 1)]);
        let engine = compute(policy("max_fair", "slow_core", None), false, 1, 2, &views);

        // Sorted order: the speedup-2.0 thread first, then the two
        // placeholders splitting the single fast core.
        let slices = engine.thread_slices();
        assert_eq!(slices[0].1, RoundSlice::new(0, B));
        assert_eq!(slices[1].1, RoundSlice::new(B / 2, B / 2));
        assert_eq!(slices[2].1, RoundSlice::new(B / 2, B / 2));
    }
}
