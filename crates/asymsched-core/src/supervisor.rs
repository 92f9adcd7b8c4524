//! Command supervision: spawning, reaping, respawning, and shutdown.
//!
//! The supervisor runs on the main thread. Each command is spawned into its
//! own process group (so the whole tree can be killed with one signal) with
//! stdout/stderr redirected to its per-command output file. The reap loop
//! blocks in `wait(2)`, drains with `WNOHANG` after every exit, respawns
//! finished commands until the whole workload has completed once, and — when
//! the estimator is not running — recomputes quotas on every exit.

use std::io::Error;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::engine::PolicyEngine;
use crate::syscall::{FairampKernel, UnitVruntime};
use crate::workload::{Command, CommandView, DoneFlag, RunConfig, TaskState, views_of};

/// Build a `cpu_set_t` from a CPU id list.
fn cpu_set_of(cpus: &[usize]) -> libc::cpu_set_t {
    // SAFETY: cpu_set_t is a plain bitmask; zeroed is its empty value.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for &cpu in cpus {
        unsafe { libc::CPU_SET(cpu, &mut set) };
    }
    set
}

/// Outcome of one reap.
enum Reaped {
    Command(usize, i32),
    Unknown(i32),
}

/// The command supervisor.
pub struct Supervisor {
    commands: Vec<Command>,
    views: Vec<CommandView>,
    run: RunConfig,
    kernel: Arc<dyn FairampKernel>,
    done: DoneFlag,
    interval: Duration,
    /// Present when quotas are recomputed on command exit (estimator off).
    engine: Option<PolicyEngine>,
    finished: usize,
}

impl Supervisor {
    pub fn new(
        commands: Vec<Command>,
        run: RunConfig,
        kernel: Arc<dyn FairampKernel>,
        done: DoneFlag,
        interval: Duration,
        engine: Option<PolicyEngine>,
    ) -> Self {
        let views = views_of(&commands);
        Self {
            commands,
            views,
            run,
            kernel,
            done,
            interval,
            engine,
            finished: 0,
        }
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    /// Spawn every command once. Returns the number of live children.
    pub fn spawn_all(&mut self) -> usize {
        let mut running = 0;
        for i in 0..self.commands.len() {
            if self.spawn_one(i) {
                running += 1;
            }
        }
        running
    }

    /// Spawn command `i` into its own process group.
    ///
    /// Pin-mode commands get their CPU affinity applied in the child and are
    /// left to the OS; otherwise, when the fairamp kernel is driven, the
    /// child publishes its current round slice as its initial unit vruntime
    /// before exec.
    ///
    /// A spawn failure is recorded as an instant completion with a failure
    /// status, mirroring what a failed exec in the child looks like.
    fn spawn_one(&mut self, i: usize) -> bool {
        let command = &mut self.commands[i];
        let output = command
            .output
            .as_ref()
            .and_then(|f| f.try_clone().ok().zip(f.try_clone().ok()));

        let mut child = std::process::Command::new(&command.argv[0]);
        child.args(&command.argv[1..]);
        match output {
            Some((out, err)) => {
                child.stdout(Stdio::from(out));
                child.stderr(Stdio::from(err));
            }
            None => {
                child.stdout(Stdio::null());
                child.stderr(Stdio::null());
            }
        }

        let pinned = command.pinned();
        let cpus = command.cpus.clone();
        let slice = command.cell.slice();
        let do_fairamp = self.run.do_fairamp;
        let kernel = Arc::clone(&self.kernel);
        // SAFETY: the hook only calls async-signal-safe libc functions and
        // raw syscalls.
        unsafe {
            child.pre_exec(move || {
                let pid = libc::getpid();
                // The process group id is what the shutdown path signals.
                if libc::setpgid(pid, pid) != 0 {
                    return Err(Error::last_os_error());
                }
                if pinned {
                    let set = cpu_set_of(&cpus);
                    if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
                        != 0
                    {
                        return Err(Error::last_os_error());
                    }
                } else if do_fairamp {
                    let info = UnitVruntime {
                        num: 0,
                        pid: 0, // the calling task
                        unit_fast_vruntime: slice.fast,
                        unit_slow_vruntime: slice.slow,
                    };
                    let _ = kernel.set_unit_vruntime(std::slice::from_ref(&info));
                }
                Ok(())
            });
        }

        command.last_begin = Some(Instant::now());
        match child.spawn() {
            Ok(child) => {
                let pid = child.id() as i32;
                command.cell.set_pid(pid);
                if pinned {
                    println!(
                        "run(num: {} name: {} pid: {pid}) pinned to cpus {:?}",
                        command.num, command.name, command.cpus
                    );
                } else {
                    println!("run(num: {} name: {} pid: {pid})", command.num, command.name);
                }
                true
            }
            Err(e) => {
                log::error!("failed to spawn command {} ({}): {e}", command.num, command.name);
                command.cell.set_pid(0);
                if !command.finished {
                    command.finished = true;
                    command.status = Some(-1);
                    command.first_runtime = Some(0.0);
                    self.finished += 1;
                }
                false
            }
        }
    }

    /// Block on child exits until every command has completed once (or no
    /// children remain). Returns the number of still-running commands.
    pub fn supervise(&mut self, mut running: usize) -> usize {
        let total = self.commands.len();

        'reap: while running > 0 {
            let mut status: libc::c_int = 0;
            // SAFETY: plain blocking wait; status is a valid out-pointer.
            let pid = unsafe { libc::wait(&mut status) };
            if pid == -1 {
                let err = Error::last_os_error();
                if err.raw_os_error() == Some(libc::ECHILD) {
                    log::warn!("no unwaited-for children left");
                    break;
                }
                log::warn!("wait failed: {err}");
                continue;
            }

            let mut next = Some((pid, status));
            while let Some((pid, status)) = next.take() {
                match self.locate(pid) {
                    Reaped::Unknown(pid) => {
                        log::warn!("reaped pid {pid} matching no command (status {status})");
                    }
                    Reaped::Command(i, pid) => {
                        self.record_exit(i, pid, status, &mut running);
                    }
                }

                if self.finished == total {
                    break 'reap;
                }

                if running > 0 {
                    // Drain anything that exited while we were bookkeeping.
                    let mut status: libc::c_int = 0;
                    // SAFETY: non-blocking reap of any child.
                    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
                    if pid > 0 {
                        next = Some((pid, status));
                    } else if pid == -1 {
                        let err = Error::last_os_error();
                        if err.raw_os_error() == Some(libc::ECHILD) {
                            break 'reap;
                        }
                        log::warn!("waitpid failed: {err}");
                    }
                }
            }

            // Without the estimator, exits are the only points where the
            // quota vector can change.
            if self.run.do_fairamp
                && !self.run.periodic_update
                && let Some(engine) = self.engine.as_mut()
            {
                engine.set_round_slice(&self.views, self.kernel.as_ref());
            }
        }

        running
    }

    fn locate(&self, pid: i32) -> Reaped {
        let found = self
            .commands
            .iter()
            .position(|c| c.cell.state() == TaskState::Running(pid));
        match found {
            Some(i) => Reaped::Command(i, pid),
            None => Reaped::Unknown(pid),
        }
    }

    fn record_exit(&mut self, i: usize, pid: i32, status: i32, running: &mut usize) {
        let total = self.commands.len();
        let command = &mut self.commands[i];
        let runtime = command
            .last_begin
            .map(|begin| begin.elapsed().as_secs_f64());
        command.cell.set_pid(0);

        if !command.finished {
            command.finished = true;
            command.first_pid = pid;
            command.first_runtime = runtime;
            command.status = Some(status);
            self.finished += 1;
            log::debug!(
                "newly finished command: num: {} name: {} pid: {pid} time: {:.3}",
                command.num,
                command.name,
                runtime.unwrap_or(-1.0)
            );
        } else {
            log::debug!(
                "finished command (repeat run): num: {} name: {} pid: {pid}",
                command.num,
                command.name
            );
        }

        if self.finished < total && self.run.repeated_run {
            self.spawn_one(i);
        } else {
            *running -= 1;
        }
    }

    /// Stop the run: raise `done`, give the estimator two intervals to
    /// observe it at a sleep boundary, join it, then kill whatever is still
    /// running.
    pub fn shutdown(&mut self, estimator: Option<JoinHandle<u64>>, measuring: &Arc<AtomicBool>) {
        if let Some(handle) = estimator {
            self.done.store(true, Ordering::SeqCst);
            std::thread::sleep(self.interval);
            std::thread::sleep(self.interval);
            match handle.join() {
                Ok(ticks) => log::debug!("estimator joined after {ticks} ticks"),
                Err(_) => log::error!("estimator thread panicked"),
            }
        } else {
            self.done.store(true, Ordering::SeqCst);
        }

        self.kill_remaining();

        if measuring.swap(false, Ordering::SeqCst)
            && let Err(e) = self.kernel.stop_measuring_ips_type()
        {
            log::warn!("stop_measuring_ips_type failed: {e}");
        }
    }

    /// SIGKILL the process group of every live command, re-checking on a
    /// one-second backoff until all are reaped.
    pub fn kill_remaining(&mut self) {
        let mut running = self
            .commands
            .iter()
            .filter(|c| matches!(c.cell.state(), TaskState::Running(_)))
            .count();
        if running == 0 {
            return;
        }

        log::info!("killing {running} remaining command(s)");
        while running > 0 {
            for command in &self.commands {
                let pid = command.cell.pid();
                if pid > 0 {
                    // Negative pid addresses the whole process group.
                    // SAFETY: plain kill(2).
                    if unsafe { libc::kill(-pid, libc::SIGKILL) } != 0 {
                        log::warn!(
                            "kill -{pid} ({}) failed: {}",
                            command.name,
                            Error::last_os_error()
                        );
                    }
                }
            }

            std::thread::sleep(Duration::from_secs(1));

            for command in &mut self.commands {
                let pid = command.cell.pid();
                if pid <= 0 {
                    continue;
                }
                let mut status: libc::c_int = 0;
                // SAFETY: non-blocking reap of a specific child.
                let reaped = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
                if reaped == pid {
                    command.cell.set_pid(0);
                    if !command.finished {
                        command.finished = true;
                        command.status = Some(status);
                        command.first_runtime =
                            command.last_begin.map(|b| b.elapsed().as_secs_f64());
                    }
                    running -= 1;
                    log::debug!("killed command: name: {} pid: {pid}", command.name);
                } else if reaped == -1 {
                    let err = Error::last_os_error();
                    if err.raw_os_error() == Some(libc::ECHILD) {
                        command.cell.set_pid(0);
                        running = running.saturating_sub(1);
                    } else {
                        log::warn!("waitpid {pid} failed: {err}");
                    }
                }
            }
        }
    }
}

/// Kill every live process group in `cells` once and reap with a one-second
/// backoff. Used by the signal-handler cleanup path, which owns no
/// [`Supervisor`].
pub fn kill_process_groups(cells: &[Arc<crate::workload::SharedCell>]) {
    let live: Vec<i32> = cells.iter().map(|c| c.pid()).filter(|&p| p > 0).collect();
    if live.is_empty() {
        return;
    }
    for &pid in &live {
        // SAFETY: plain kill(2).
        unsafe { libc::kill(-pid, libc::SIGKILL) };
    }
    let mut remaining = live;
    for _ in 0..10 {
        std::thread::sleep(Duration::from_secs(1));
        remaining.retain(|&pid| {
            let mut status: libc::c_int = 0;
            // SAFETY: non-blocking reap of a specific child.
            let reaped = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            reaped != pid && reaped != -1
        });
        if remaining.is_empty() {
            break;
        }
        for &pid in &remaining {
            // SAFETY: plain kill(2).
            unsafe { libc::kill(-pid, libc::SIGKILL) };
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
