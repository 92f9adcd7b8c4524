//! Typed wrappers over the `fairamp` syscall.
//!
//! The kernel side of the controller is a custom syscall multiplexing seven
//! operations: tagging CPUs as fast or slow, publishing per-task unit
//! vruntimes, reading per-task instruction/runtime counters, toggling
//! per-core-type IPS measurement, and pinning a task to a core.
//!
//! The adapter is a pure pass-through: it never interprets payloads, and
//! every operation is non-fatal — callers log the error and continue with
//! stale data on the next tick.

use std::io::{Error, Result};

/// Syscall number of the `fairamp` kernel extension (x86-64 only).
pub const SYS_FAIRAMP: libc::c_long = 313;

/// Operation codes of the `fairamp` syscall.
mod op {
    pub const SET_FAST_CORE: libc::c_long = 0;
    pub const SET_SLOW_CORE: libc::c_long = 1;
    pub const SET_UNIT_VRUNTIME: libc::c_long = 2;
    pub const GET_THREADS_INFO: libc::c_long = 3;
    pub const START_MEASURING_IPS_TYPE: libc::c_long = 4;
    pub const STOP_MEASURING_IPS_TYPE: libc::c_long = 5;
    pub const CORE_PINNING: libc::c_long = 6;
}

/// Per-task counter sample returned by `GET_THREADS_INFO`.
///
/// `insts_*` and `sum_*_exec_runtime` (nanoseconds) pair up to define the
/// instructions-per-second rate on each core type. Layout matches the kernel
/// ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadsInfo {
    pub num: i32,
    pub pid: i32,
    pub insts_fast: i64,
    pub insts_slow: i64,
    pub sum_fast_exec_runtime: u64,
    pub sum_slow_exec_runtime: u64,
    pub err: i32,
}

impl ThreadsInfo {
    /// Entry requesting the calling task's own counters.
    pub fn self_entry() -> Self {
        Self {
            num: -1,
            ..Self::default()
        }
    }
}

/// Per-task round-slice quota published via `SET_UNIT_VRUNTIME`.
///
/// `pid == 0` addresses the calling task (used by a child between fork and
/// exec). Layout matches the kernel ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitVruntime {
    pub num: i32,
    pub pid: i32,
    pub unit_fast_vruntime: u32,
    pub unit_slow_vruntime: u32,
}

/// The seam between the controller and the `fairamp` kernel.
///
/// The production implementation is [`FairampSyscall`]; tests drive the
/// estimator and policy engine against mocks.
pub trait FairampKernel: Send + Sync {
    /// Tag `cpu` as a fast core.
    fn set_fast_core(&self, cpu: i32) -> Result<()>;

    /// Tag `cpu` as a slow core.
    fn set_slow_core(&self, cpu: i32) -> Result<()>;

    /// Publish round-slice quotas for the given tasks.
    fn set_unit_vruntime(&self, info: &[UnitVruntime]) -> Result<()>;

    /// Fill `info` with per-task counter samples.
    ///
    /// Returns the number of entries the kernel filled; fewer than
    /// `info.len()` is a warning condition, not an error.
    fn get_threads_info(&self, info: &mut [ThreadsInfo]) -> Result<usize>;

    /// Start per-core-type IPS measurement.
    fn start_measuring_ips_type(&self) -> Result<()>;

    /// Stop per-core-type IPS measurement.
    fn stop_measuring_ips_type(&self) -> Result<()>;

    /// Pin `pid` to `cpu`.
    fn pin(&self, pid: i32, cpu: i32) -> Result<()>;
}

/// Production kernel adapter backed by the raw syscall.
///
/// Do not use without a `fairamp`-patched kernel: on a stock kernel every
/// call fails with `ENOSYS`.
pub struct FairampSyscall;

impl FairampSyscall {
    fn call(op: libc::c_long, a: libc::c_long, b: libc::c_long, ptr: *mut libc::c_void) -> i64 {
        // SAFETY: the kernel either rejects the opcode or reads/writes the
        // payload within the bounds the caller passed along.
        unsafe { libc::syscall(SYS_FAIRAMP, op, a, b, ptr) }
    }
}

impl FairampKernel for FairampSyscall {
    fn set_fast_core(&self, cpu: i32) -> Result<()> {
        match Self::call(op::SET_FAST_CORE, cpu as libc::c_long, 0, std::ptr::null_mut()) {
            0 => Ok(()),
            _ => Err(Error::last_os_error()),
        }
    }

    fn set_slow_core(&self, cpu: i32) -> Result<()> {
        match Self::call(op::SET_SLOW_CORE, cpu as libc::c_long, 0, std::ptr::null_mut()) {
            0 => Ok(()),
            _ => Err(Error::last_os_error()),
        }
    }

    fn set_unit_vruntime(&self, info: &[UnitVruntime]) -> Result<()> {
        let ret = Self::call(
            op::SET_UNIT_VRUNTIME,
            0,
            info.len() as libc::c_long,
            info.as_ptr() as *mut libc::c_void,
        );
        if ret == info.len() as i64 {
            Ok(())
        } else if ret < 0 {
            Err(Error::last_os_error())
        } else {
            Err(Error::other(format!(
                "kernel applied {ret} of {} unit vruntimes",
                info.len()
            )))
        }
    }

    fn get_threads_info(&self, info: &mut [ThreadsInfo]) -> Result<usize> {
        let ret = Self::call(
            op::GET_THREADS_INFO,
            0,
            info.len() as libc::c_long,
            info.as_mut_ptr() as *mut libc::c_void,
        );
        if ret < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }

    fn start_measuring_ips_type(&self) -> Result<()> {
        match Self::call(op::START_MEASURING_IPS_TYPE, 0, 0, std::ptr::null_mut()) {
            0 => Ok(()),
            _ => Err(Error::last_os_error()),
        }
    }

    fn stop_measuring_ips_type(&self) -> Result<()> {
        match Self::call(op::STOP_MEASURING_IPS_TYPE, 0, 0, std::ptr::null_mut()) {
            0 => Ok(()),
            _ => Err(Error::last_os_error()),
        }
    }

    fn pin(&self, pid: i32, cpu: i32) -> Result<()> {
        match Self::call(
            op::CORE_PINNING,
            cpu as libc::c_long,
            pid as libc::c_long,
            std::ptr::null_mut(),
        ) {
            0 => Ok(()),
            _ => Err(Error::last_os_error()),
        }
    }
}
