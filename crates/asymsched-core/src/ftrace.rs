//! Scheduler context-switch tracing via ftrace.
//!
//! When a trace file is requested, the run toggles the kernel's
//! `sched_switch` event around the workload and streams the trace buffer to
//! the user's file at the end. The debugfs mount point follows the fairamp
//! kernel's convention of `/debug`.

use std::fs::{self, File};
use std::io::{Error, Read, Result, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

const TRACE: &str = "/debug/tracing/trace";
const BUFFER_SIZE_KB: &str = "/debug/tracing/buffer_size_kb";
const SCHED_SWITCH_ENABLE: &str = "/debug/tracing/events/sched/sched_switch/enable";

/// A prepared ftrace session writing to a user-chosen file.
pub struct Ftrace {
    out_path: PathBuf,
}

impl Ftrace {
    /// Mount debugfs if needed, clear the trace buffer, grow it to 64 MiB,
    /// and create the output file.
    pub fn new(out_path: &Path) -> Result<Self> {
        if !Path::new(TRACE).exists() {
            mount_debugfs()?;
        }

        // Empty the previous trace and make room for a long run.
        fs::write(TRACE, "")?;
        fs::write(BUFFER_SIZE_KB, format!("{}", 1024 * 64))?;

        File::create(out_path)?;
        println!("ftrace: {}", out_path.display());
        Ok(Self {
            out_path: out_path.to_path_buf(),
        })
    }

    pub fn start(&self) {
        if let Err(e) = fs::write(SCHED_SWITCH_ENABLE, "1") {
            log::error!("failed to enable sched_switch tracing: {e}");
        }
    }

    pub fn stop(&self) {
        if let Err(e) = fs::write(SCHED_SWITCH_ENABLE, "0") {
            log::error!("failed to disable sched_switch tracing: {e}");
        }
    }

    /// Stream the trace buffer into the output file.
    pub fn save(&self) -> Result<()> {
        let mut trace = File::open(TRACE)?;
        let mut out = File::create(&self.out_path)?;
        let mut buf = vec![0u8; 1 << 20];
        let mut total = 0u64;
        print!("Save ftrace");
        loop {
            let n = trace.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            total += n as u64;
            if total.is_multiple_of(1 << 20) {
                print!(".");
            }
        }
        println!();
        Ok(())
    }
}

fn mount_debugfs() -> Result<()> {
    if !Path::new("/debug").exists() {
        fs::create_dir("/debug")?;
    }
    let status = Command::new("mount")
        .args(["-t", "debugfs", "nodev", "/debug"])
        .status()?;
    if !status.success() {
        return Err(Error::other("failed to mount debugfs on /debug"));
    }
    Ok(())
}
