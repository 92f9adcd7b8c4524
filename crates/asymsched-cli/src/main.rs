//! CLI for asymsched — run workloads under a fair asymmetric-multicore
//! scheduling policy.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;

use asymsched_core::estimator::{self, EstimatorConfig, SpeedupEstimator};
use asymsched_core::ftrace::Ftrace;
use asymsched_core::report::{CommandReport, RunReport};
use asymsched_core::syscall::FairampKernel;
use asymsched_core::workload::{
    self, Command, DEFAULT_MAX_IPS_RATIO, DEFAULT_SCHED_INTERVAL_MS, DoneFlag, SharedCell,
};
use asymsched_core::{
    FairampSyscall, Mode, Policy, PolicyBuilder, PolicyEngine, Supervisor, cores, output, report,
    stat, supervisor,
};

#[derive(Parser)]
#[command(name = "asymsched")]
#[command(about = "asymsched — fair scheduling for asymmetric multicores, driven from user space")]
#[command(version = asymsched_core::VERSION)]
#[command(after_help = COMMAND_FILE_HELP)]
struct Cli {
    /// Command file: one workload entry per line
    #[arg(short = 'c', long = "comm", value_name = "PATH")]
    comm: Option<PathBuf>,

    /// Run mode: normal static speeduptest wo_overhead overhead_cs
    /// overhead_cs_pmu pinning unaware repeat no
    #[arg(short = 'm', long, default_value = "normal")]
    mode: String,

    /// Per-CPU core types, one of F/S/X per core (e.g. FFSS)
    #[arg(short = 't', long = "type", value_name = "TYPES")]
    core_types: Option<String>,

    /// Legacy policy name (overrides base/criteria/metric/target/similarity)
    #[arg(short = 'p', long)]
    policy: Option<String>,

    /// Fairness base: fair_share slow_core fast_core
    #[arg(long)]
    base: Option<String>,

    /// Criterion: unaware manual max_perf max_fair minF uniformity
    /// minF_uniformity
    #[arg(long)]
    criteria: Option<String>,

    /// Target metric: fairness or throughput
    #[arg(long)]
    metric: Option<String>,

    /// Target value in per cent; minF_uniformity takes two as MINF_UNI
    #[arg(long, value_name = "PERCENT")]
    target: Option<String>,

    /// Speedup-difference threshold for the similarity grouping post-pass
    #[arg(long)]
    similarity: Option<f64>,

    /// Merged output file; per-command temporaries are <OUTPUT>.NN
    #[arg(short = 'o', long, default_value = "output/temp.output")]
    output: PathBuf,

    /// Save the scheduler context-switch trace to this file
    #[arg(short = 'f', long, value_name = "PATH")]
    ftrace: Option<PathBuf>,

    /// Scheduling interval in milliseconds
    #[arg(short = 'i', long, default_value_t = DEFAULT_SCHED_INTERVAL_MS)]
    interval: u64,

    /// Do not respawn finished commands
    #[arg(long)]
    norepeat: bool,

    /// Ignore the efficiency setting
    #[arg(long)]
    noeffi: bool,

    /// Stop measuring per-core-type IPS and exit
    #[arg(long)]
    stop: bool,

    /// Ceiling on plausible IPS_fast/IPS_slow before a sample is dropped
    #[arg(long, default_value_t = DEFAULT_MAX_IPS_RATIO)]
    max_ips_ratio: f64,

    /// `stop` is also accepted as a bare word
    #[arg(value_name = "COMMAND", hide = true)]
    command: Option<String>,
}

const COMMAND_FILE_HELP: &str = "\
Command file format (one entry per line, '#' starts a comment):
  speedup: <float> num: <threads> cmd: <argv...>
  cmd: <argv...>

cmd: must come last and cannot be omitted; everything after it is the
command to execute. speedup: is the offline hint (default 1.0; negative
runs the command pinned to its CPUs). num: is the thread count (default 1).";

/// Everything the signal handler needs to unwind a partial run.
struct Cleanup {
    cells: Vec<Arc<SharedCell>>,
    output: PathBuf,
    num_comm: usize,
    ftrace: Option<Arc<Ftrace>>,
    measuring: Arc<AtomicBool>,
    kernel: Arc<FairampSyscall>,
    ran: AtomicBool,
}

impl Cleanup {
    /// Idempotent: stop tracing, kill every live process group, stop IPS
    /// measurement, merge and delete the temporary outputs.
    fn run(&self) {
        if self.ran.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(ftrace) = &self.ftrace {
            ftrace.stop();
        }
        supervisor::kill_process_groups(&self.cells);
        if self.measuring.load(Ordering::SeqCst) {
            let _ = self.kernel.stop_measuring_ips_type();
        }
        if let Err(e) = output::merge_temp_outputs(&self.output, self.num_comm) {
            eprintln!("failed to merge outputs: {e}");
        }
        output::delete_temp_outputs(&self.output, self.num_comm);
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let kernel = Arc::new(FairampSyscall);

    if cli.stop || cli.command.as_deref() == Some("stop") {
        if let Err(e) = kernel.stop_measuring_ips_type() {
            eprintln!("stop measuring IPS failed: {e}");
            std::process::exit(1);
        }
        println!("stop measuring IPS");
        return;
    }

    if let Some(other) = cli.command.as_deref() {
        eprintln!("error: unexpected argument: {other}");
        std::process::exit(2);
    }

    // SAFETY: geteuid has no failure modes.
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("ERROR! Please run as root!");
        std::process::exit(1);
    }

    if let Err(e) = run(cli, kernel) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn build_policy(cli: &Cli) -> std::io::Result<Policy> {
    let mut builder = PolicyBuilder::new();
    if let Some(name) = &cli.policy {
        builder.policy_name(name)?;
    }
    if let Some(base) = &cli.base {
        builder.base(base)?;
    }
    if let Some(criteria) = &cli.criteria {
        builder.criteria(criteria)?;
    }
    if let Some(metric) = &cli.metric {
        builder.metric(metric)?;
    }
    if let Some(target) = &cli.target {
        builder.target(target)?;
    }
    if let Some(similarity) = cli.similarity {
        builder.similarity(similarity)?;
    }
    builder.build()
}

fn run(cli: Cli, kernel: Arc<FairampSyscall>) -> std::io::Result<()> {
    let mode = Mode::parse(&cli.mode)?;
    let mut run = mode.config();
    if cli.norepeat {
        run.repeated_run = false;
    }
    let run = run.repaired();

    let policy = build_policy(&cli)?;
    let interval = workload::sched_interval_from_ms(cli.interval);

    let num_core = cores::detect_num_cores()?;
    let layout = match &cli.core_types {
        Some(types) => cores::parse_core_config(types, num_core)?,
        None => cores::default_core_layout(num_core),
    };
    let frequencies = if run.adjust_frequency {
        Some(cores::read_frequency_bounds()?)
    } else {
        None
    };

    let comm_path = cli.comm.as_deref().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "a command file must be given (--comm PATH)",
        )
    })?;

    output::check_output_path(&cli.output)?;
    let specs = workload::parse_command_file(comm_path)?;

    let mut commands = Vec::with_capacity(specs.len());
    for (num, spec) in specs.into_iter().enumerate() {
        let mut command = Command::new(num, spec);
        // The estimator learns speedups from scratch; offline hints only
        // matter to unaware/manual policies.
        if run.periodic_update && policy.speedup_aware() {
            command.cell.set_speedup(1.0);
        }
        command.output = Some(output::create_temp(&cli.output, num)?);
        commands.push(command);
    }
    let num_comm = commands.len();
    let views = workload::views_of(&commands);

    println!("mode: {}", mode.name());
    println!("core_type: {}", layout.describe());
    println!("sched_policy: {policy}");
    println!("comm_file: {}", comm_path.display());
    println!("output_file: {}", cli.output.display());
    if cli.noeffi {
        println!("efficiency setting will be ignored.");
    }
    println!("num_comm: {num_comm}");

    // Initial quota pass before anything is spawned; each command carries
    // its quota into the kernel at exec time.
    let mut engine = run.do_fairamp.then(|| {
        PolicyEngine::new(policy.clone(), run, layout.num_fast, layout.num_slow, &views)
    });
    if let Some(engine) = engine.as_mut() {
        engine.set_round_slice_before_run(&views);
    }

    let active = cores::apply_core_layout(
        &layout,
        &run,
        policy.asymmetry_aware(),
        frequencies.as_ref(),
        kernel.as_ref(),
    )?;
    cores::assign_command_cpus(&mut commands, &active)?;
    cores::set_self_affinity(&active)?;

    let ftrace = match &cli.ftrace {
        Some(path) => Some(Arc::new(Ftrace::new(path)?)),
        None => None,
    };

    let done: DoneFlag = Arc::new(AtomicBool::new(false));
    let measuring = Arc::new(AtomicBool::new(false));

    let cleanup = Arc::new(Cleanup {
        cells: commands.iter().map(|c| Arc::clone(&c.cell)).collect(),
        output: cli.output.clone(),
        num_comm,
        ftrace: ftrace.clone(),
        measuring: Arc::clone(&measuring),
        kernel: Arc::clone(&kernel),
        ran: AtomicBool::new(false),
    });
    {
        let cleanup = Arc::clone(&cleanup);
        ctrlc::set_handler(move || {
            eprintln!("termination signal received");
            cleanup.run();
            std::process::exit(1);
        })
        .map_err(std::io::Error::other)?;
    }

    let stat_begin = stat::read_cpu_times()?;
    if let Some(ftrace) = &ftrace {
        ftrace.start();
    }

    // The estimator owns the policy engine while it runs; otherwise the
    // supervisor recomputes quotas on command exits.
    let estimator_handle = if run.periodic_update {
        let est = SpeedupEstimator::new(
            EstimatorConfig {
                interval,
                num_core: active.len(),
                num_fast_core: layout.num_fast,
                max_ips_ratio: cli.max_ips_ratio,
                adjust_frequency: run.adjust_frequency,
            },
            views.clone(),
        );
        let est_engine = if policy.speedup_aware() {
            engine.take()
        } else {
            None
        };
        let kernel = Arc::clone(&kernel) as Arc<dyn FairampKernel>;
        let done = Arc::clone(&done);
        let measuring = Arc::clone(&measuring);
        let asymmetry_aware = policy.asymmetry_aware();
        Some(std::thread::spawn(move || {
            estimator::run_periodic(est, est_engine, kernel, done, measuring, asymmetry_aware)
        }))
    } else {
        None
    };

    let mut sup = Supervisor::new(
        commands,
        run,
        Arc::clone(&kernel) as Arc<dyn FairampKernel>,
        Arc::clone(&done),
        interval,
        engine,
    );
    let running = sup.spawn_all();
    sup.supervise(running);

    if let Some(ftrace) = &ftrace {
        ftrace.stop();
    }
    let stat_end = stat::read_cpu_times()?;

    sup.shutdown(estimator_handle, &measuring);

    if let Some(ftrace) = &ftrace {
        ftrace.save()?;
    }

    let mut commands = sup.into_commands();

    report::print_command_table(&commands);

    let usage = stat_begin.delta(&stat_end);
    let run_report = RunReport {
        version: 1,
        mode: mode.name().to_string(),
        policy: policy.to_string(),
        core_types: layout.describe(),
        num_fast_core: layout.num_fast,
        num_slow_core: layout.num_slow,
        interval_ms: cli.interval,
        commands: commands.iter().map(CommandReport::from_command).collect(),
        cpu_usage: Some(usage),
        asymsched_version: asymsched_core::VERSION.to_string(),
    };
    run_report.write(&report_path(&cli.output))?;

    // Close the redirect targets before merging.
    for command in &mut commands {
        command.output.take();
    }
    output::merge_temp_outputs(&cli.output, num_comm)?;
    output::delete_temp_outputs(&cli.output, num_comm);

    stat::print_usage(&usage);

    // The normal path has unwound everything; disarm the signal handler's
    // copy so a late signal cannot merge twice.
    cleanup.ran.store(true, Ordering::SeqCst);

    Ok(())
}

/// `<output>.json`, next to the merged output.
fn report_path(base: &Path) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(".json");
    PathBuf::from(s)
}
