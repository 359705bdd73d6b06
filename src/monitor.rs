//! Record the CPU cycles spent by `ksmd` per reporting interval, alongside system memory usage and
//! the KSM page counters, until told to stop.
//!
//! A run goes through the states of `State`. It creates a fresh run directory with three tables
//! (see `tables`), finds the target thread, attaches `perf stat -I` to it and appends one row to
//! each table for every interval `perf` reports. It stops when something is written to the
//! control pipe, when the target disappears, when `perf` exits, or on Ctrl-C. Whatever happens,
//! `perf` is stopped and the control listener is joined before returning.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::clap_app;

use crossbeam::channel::{select, unbounded, Receiver};

use failure::ResultExt;

use log::{debug, info, warn};

use serde::Serialize;

use crate::{
    control::ControlListener,
    ksm::KsmStats,
    output::{run_dir_prefix, select_run_dir, TRIAL_TAG_VAR},
    parse::try_parse_interval_line,
    paths::*,
    procfs::ProcessTable,
    resolve_program, running_as_root, settings,
    stop::{self, StopSignal},
    supervisor::{Shutdown, ShutdownPolicy, Started, Supervisor, ToolInvocation},
    tables::{CycleRow, MemoryRow, PageStatRow, RunTables},
    MonitorError,
};

/// The kernel thread monitored by default.
pub const DEFAULT_TARGET: &str = "ksmd";

/// The `perf` event counted by default.
pub const DEFAULT_EVENT: &str = "cycles";

/// The default reporting interval of `perf`, in milliseconds.
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Everything a run needs to know. All paths the run touches are here, so a run can be pointed at
/// fake process tables, sysfs trees and tools.
#[derive(Clone, Debug, Serialize)]
pub struct MonitorConfig {
    /// The sampling tool and its arguments.
    pub tool: ToolInvocation,
    /// The metric name that ends each interval line of the tool.
    pub metric: String,
    /// The name of the process to attach to.
    pub target_name: String,
    /// The control pipe.
    pub pipe: PathBuf,
    /// The directory in which the run directory is created.
    pub out_base: PathBuf,
    /// The trial tag, embedded in the run directory name.
    pub tag: Option<String>,
    pub ksm_sysfs: PathBuf,
    pub procfs: PathBuf,
    /// How long any wait in the loop or the listener may block before re-checking the stop signal.
    pub poll_timeout: Duration,
    /// How long teardown waits for the control listener.
    pub listener_join_timeout: Duration,
    pub shutdown: ShutdownPolicy,
    /// Print a progress marker every this many recorded intervals.
    pub progress_every: u64,
}

impl MonitorConfig {
    /// A config with the default paths and timeouts for the given tool, whose interval lines end
    /// in `metric`.
    pub fn new(tool: ToolInvocation, metric: &str) -> Self {
        MonitorConfig {
            tool,
            metric: metric.into(),
            target_name: DEFAULT_TARGET.into(),
            pipe: CONTROL_PIPE.into(),
            out_base: ".".into(),
            tag: None,
            ksm_sysfs: KSM_SYSFS.into(),
            procfs: PROCFS.into(),
            poll_timeout: Duration::from_millis(500),
            listener_join_timeout: Duration::from_millis(1500),
            shutdown: ShutdownPolicy::default(),
            progress_every: 20,
        }
    }
}

/// The states of a run, in order. A run may skip straight to `Stopped` from any state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Initializing,
    Attaching,
    Running,
    Draining,
    Stopped,
}

/// Why the recording loop ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The stop signal was raised, normally via the control pipe.
    Signalled,
    /// The target process no longer exists.
    TargetVanished,
    /// The tool exited by itself, with the given code.
    ToolExited(Option<i32>),
    /// The tool closed its report stream.
    StreamEnded,
    /// This process got SIGINT or SIGTERM.
    Interrupted,
}

/// What a completed run did.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub run_dir: PathBuf,
    pub target_pid: u32,
    pub tool_pid: u32,
    /// The number of intervals for which rows were recorded.
    pub intervals: u64,
    pub reason: StopReason,
    pub shutdown: Shutdown,
}

/// The state of one run, from `Initializing` until `Stopped`.
pub struct RunContext<'c> {
    cfg: &'c MonitorConfig,
    state: State,
    stop: StopSignal,
    start: Instant,
    run_dir: PathBuf,
    tables: RunTables,
    procs: ProcessTable,
    supervisor: Supervisor,
    listener: Option<ControlListener>,
    intervals: u64,
}

impl<'c> RunContext<'c> {
    /// Create the run directory and its tables and start listening on the control pipe.
    pub fn init(cfg: &'c MonitorConfig) -> Result<Self, failure::Error> {
        let start = Instant::now();

        let prefix = run_dir_prefix(cfg.tag.as_ref().map(String::as_str));
        let run_dir = select_run_dir(&cfg.out_base, &prefix).with_context(|_| {
            format!("creating a run directory in {}", cfg.out_base.display())
        })?;

        let tables = RunTables::new(&run_dir);
        tables.init()?;

        let stop = StopSignal::new();
        let listener = ControlListener::spawn(&cfg.pipe, stop.clone(), cfg.poll_timeout)?;

        println!("Recording to {}", run_dir.display());

        Ok(RunContext {
            cfg,
            state: State::Initializing,
            stop,
            start,
            run_dir,
            tables,
            procs: ProcessTable::new(&cfg.procfs),
            supervisor: Supervisor::new(cfg.tool.clone(), cfg.shutdown),
            listener: Some(listener),
            intervals: 0,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    fn enter(&mut self, state: State) {
        debug!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Find the target process and record the settings of the run. Returns the target's pid.
    pub fn attach(&mut self) -> Result<u32, failure::Error> {
        self.enter(State::Attaching);

        let target = match self.procs.find_by_name(&self.cfg.target_name)? {
            Some(pid) => pid,
            None => {
                return Err(MonitorError::TargetNotFound {
                    name: self.cfg.target_name.clone(),
                }
                .into())
            }
        };

        info!("Found {} with pid {}", self.cfg.target_name, target);

        let settings = settings! {
            config: self.cfg,
            target_pid: target,
            command_line: self.cfg.tool.command_line(target),
            run_dir: self.run_dir,
        }?;
        if !settings.write_params(&self.run_dir)? {
            debug!("Keeping the existing params file in {}", self.run_dir.display());
        }

        Ok(target)
    }

    /// Start the tool on `target` and record until something stops the run.
    pub fn record(&mut self, target: u32) -> Result<(u32, StopReason), failure::Error> {
        self.enter(State::Running);

        let tool_pid = match self.supervisor.start(target)? {
            Started::Launched(pid) | Started::AlreadyRunning(pid) => pid,
        };

        let output = self
            .supervisor
            .take_output()
            .ok_or_else(|| failure::format_err!("the sampling tool has no report stream"))?;
        let lines = spawn_line_reader(output)?;

        println!("Monitoring {} (pid {}) started.", self.cfg.target_name, target);

        let stopped = self.stop.receiver().clone();
        let poll_timeout = self.cfg.poll_timeout;

        let reason = loop {
            if stop::interrupted() {
                break StopReason::Interrupted;
            }
            if self.stop.is_raised() {
                break StopReason::Signalled;
            }

            select! {
                recv(lines) -> line => match line {
                    Ok(Ok(line)) => { self.record_line(&line, target)?; }
                    Ok(Err(err)) => {
                        failure::bail!("unable to read the sampling tool's output: {}", err)
                    }
                    Err(..) => break StopReason::StreamEnded,
                },
                recv(stopped) -> _ => break StopReason::Signalled,
                default(poll_timeout) => {
                    if !self.procs.pid_exists(target) {
                        warn!("Target pid {} disappeared.", target);
                        break StopReason::TargetVanished;
                    }
                    if let Some(status) = self
                        .supervisor
                        .exit_status()
                        .context("checking the sampling tool")?
                    {
                        warn!("Sampling tool exited unexpectedly: {}", status);
                        break StopReason::ToolExited(status.code());
                    }
                }
            }
        };

        info!("Recording stopped: {:?}", reason);

        Ok((tool_pid, reason))
    }

    /// Handle one line of the tool's output. Returns true if rows were recorded for it.
    fn record_line(&mut self, line: &str, target: u32) -> Result<bool, failure::Error> {
        let delta = match try_parse_interval_line(line, &self.cfg.metric)? {
            Some(delta) => delta,
            None => {
                debug!("Skipping line: {:?}", line);
                return Ok(false);
            }
        };

        let second = self.start.elapsed().as_secs();

        self.tables.cycles.append(&CycleRow {
            second,
            ksmd_cycles_delta: delta,
            ksmd_pid: target,
        })?;

        match self.procs.meminfo() {
            Ok(mem) => self.tables.memory.append(&MemoryRow::new(second, &mem))?,
            Err(err) => warn!("Skipping memory usage for second {}: {}", second, err),
        }

        let stats = KsmStats::read(&self.cfg.ksm_sysfs);
        self.tables
            .pages
            .append(&PageStatRow::new(second, &stats))?;

        self.intervals += 1;
        if self.cfg.progress_every > 0 && self.intervals % self.cfg.progress_every == 0 {
            print!(".");
            let _ = std::io::stdout().flush();
        }

        Ok(true)
    }

    /// Stop everything. Safe to call in any state, and more than once.
    pub fn teardown(&mut self) -> Shutdown {
        if self.state == State::Stopped {
            return Shutdown::NotRunning;
        }
        self.enter(State::Draining);

        self.stop.raise();
        let shutdown = self.supervisor.stop();

        if let Some(listener) = self.listener.take() {
            listener.join(self.cfg.listener_join_timeout);
        }

        self.enter(State::Stopped);

        shutdown
    }
}

impl Drop for RunContext<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Forward the lines of `output` to a channel from a side thread, so that the loop can wait for
/// output and the stop signal at the same time. The channel disconnects at end-of-stream.
fn spawn_line_reader<R: std::io::Read + Send + 'static>(
    output: R,
) -> Result<Receiver<std::io::Result<String>>, failure::Error> {
    let (lines_s, lines_r) = unbounded();

    std::thread::Builder::new()
        .name("tool-output".into())
        .spawn(move || {
            for line in BufReader::new(output).lines() {
                let failed = line.is_err();

                // Receiver may have closed
                if lines_s.send(line).is_err() || failed {
                    break;
                }
            }
        })
        .context("spawning output reader")?;

    Ok(lines_r)
}

/// Perform one complete run: initialize, attach, record, and tear down (always).
pub fn run_monitor(cfg: &MonitorConfig) -> Result<RunSummary, failure::Error> {
    let mut ctx = RunContext::init(cfg)?;

    let recorded = ctx
        .attach()
        .and_then(|target| ctx.record(target).map(|rec| (target, rec)));

    let shutdown = ctx.teardown();

    let (target_pid, (tool_pid, reason)) = recorded?;

    Ok(RunSummary {
        run_dir: ctx.run_dir.clone(),
        target_pid,
        tool_pid,
        intervals: ctx.intervals,
        reason,
        shutdown,
    })
}

pub fn cli_options() -> clap::App<'static, 'static> {
    fn is_u64(s: String) -> Result<(), String> {
        s.as_str()
            .parse::<u64>()
            .map(|_| ())
            .map_err(|e| format!("{:?}", e))
    }

    clap_app! { monitor =>
        (about: "Record ksmd's CPU cycles, memory usage and KSM counters until stopped via the \
                 control pipe. Usually needs `sudo`.")
        (@arg PERF: --perf +takes_value
         "The perf executable (default: perf on the $PATH)")
        (@arg EVENT: --event +takes_value
         "The perf event to count (default: cycles)")
        (@arg INTERVAL: --interval +takes_value {is_u64}
         "The reporting interval in milliseconds (default: 1000)")
        (@arg PIPE: --pipe +takes_value
         "The control pipe (default: /tmp/ram_monitor_pipe)")
        (@arg TARGET: --target +takes_value
         "The name of the process to monitor (default: ksmd)")
        (@arg OUT: --out +takes_value
         "The directory in which to create the run directory (default: .)")
        (@arg KSM_SYSFS: --("ksm-sysfs") +takes_value
         "Where to read the KSM counters (default: /sys/kernel/mm/ksm)")
        (@arg PROCFS: --procfs +takes_value
         "Where procfs is mounted (default: /proc)")
        (@arg TAG: --tag +takes_value
         "The trial tag for the run directory name (default: $MY_CLOUD_TRIAL)")
    }
}

pub fn run(sub_m: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let perf = sub_m.value_of("PERF").unwrap_or(PERF);
    let event = sub_m.value_of("EVENT").unwrap_or(DEFAULT_EVENT);
    let interval = sub_m
        .value_of("INTERVAL")
        .map(str::parse::<u64>)
        .transpose()?
        .unwrap_or(DEFAULT_INTERVAL_MS);

    let perf = resolve_program(Path::new(perf)).ok_or_else(|| MonitorError::ToolNotExecutable {
        program: perf.into(),
    })?;

    if !running_as_root() {
        warn!("Not running as root. perf may not be allowed to attach to {}.", DEFAULT_TARGET);
    }

    let mut cfg = MonitorConfig::new(ToolInvocation::perf_stat(perf, event, interval), event);
    if let Some(pipe) = sub_m.value_of("PIPE") {
        cfg.pipe = pipe.into();
    }
    if let Some(target) = sub_m.value_of("TARGET") {
        cfg.target_name = target.into();
    }
    if let Some(out) = sub_m.value_of("OUT") {
        cfg.out_base = out.into();
    }
    if let Some(sysfs) = sub_m.value_of("KSM_SYSFS") {
        cfg.ksm_sysfs = sysfs.into();
    }
    if let Some(procfs) = sub_m.value_of("PROCFS") {
        cfg.procfs = procfs.into();
    }
    cfg.tag = sub_m
        .value_of("TAG")
        .map(Into::into)
        .or_else(|| std::env::var(TRIAL_TAG_VAR).ok());

    stop::install_interrupt_handler().context("installing the Ctrl-C handler")?;

    let summary = run_monitor(&cfg)?;

    println!();
    println!(
        "Monitoring stopped ({:?}) after {} intervals. Sampling tool: {:?}.",
        summary.reason, summary.intervals, summary.shutdown
    );
    println!("Data saved in {}", summary.run_dir.display());

    Ok(())
}
