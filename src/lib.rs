//! A library of routines for monitoring the kernel same-page merging daemon (`ksmd`) while cloud
//! and Redis/YCSB workloads run, and for summarizing the data those runs record.
//!
//! The centerpiece is the `monitor` routine, which attaches `perf stat -I` to `ksmd`, records the
//! per-interval cycle counts alongside memory usage and the KSM sysfs counters, and stops when an
//! external writer pokes the control pipe. The other routines post-process the recorded tables.

// Must be declared first because the other submodules use the macros defined therein.
#[macro_use]
pub mod output;

pub mod control;
pub mod failures;
pub mod ksm;
pub mod monitor;
pub mod parse;
pub mod procfs;
pub mod readiness;
pub mod sharing;
pub mod stats;
pub mod stop;
pub mod supervisor;
pub mod tables;
pub mod tail;
pub mod throughput;
pub mod utilization;

use std::path::{Path, PathBuf};

use failure::Fail;

/// Common paths.
pub mod paths {
    /// The named pipe an external script writes to in order to stop a running monitor.
    pub const CONTROL_PIPE: &str = "/tmp/ram_monitor_pipe";

    /// Where the kernel exposes the KSM counters.
    pub const KSM_SYSFS: &str = "/sys/kernel/mm/ksm";

    /// Mount point of procfs.
    pub const PROCFS: &str = "/proc";

    /// The `perf` executable. Resolved against `$PATH` unless it contains a `/`.
    pub const PERF: &str = "perf";

    /// The file in each run directory recording the settings of the run.
    pub const RUN_PARAMS_FILE: &str = "run.params";
}

/// Conditions that abort a routine before (or instead of) doing any useful work.
#[derive(Debug, Fail)]
pub enum MonitorError {
    #[fail(display = "`{}` does not exist or is not executable", program)]
    ToolNotExecutable { program: String },

    #[fail(display = "unable to launch `{}`: {}", program, reason)]
    ToolSpawn { program: String, reason: String },

    #[fail(
        display = "sampling tool terminated immediately (code {:?}); check permissions and the \
                   target pid. Its output was:\n{}",
        code, diagnostics
    )]
    ToolExitedImmediately {
        code: Option<i32>,
        diagnostics: String,
    },

    #[fail(display = "no process named `{}` found", name)]
    TargetNotFound { name: String },

    #[fail(display = "{} exists but is not a named pipe", path)]
    NotAFifo { path: String },

    #[fail(display = "nobody is listening on {}", path)]
    NoListener { path: String },
}

/// Find an executable the way a shell would: names containing a `/` are taken as paths, anything
/// else is looked up in `$PATH`. Returns `None` if nothing executable is found.
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return if is_executable(program) {
            Some(program.to_owned())
        } else {
            None
        };
    }

    std::env::var_os("PATH").and_then(|path| {
        std::env::split_paths(&path)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    })
}

/// Returns true if `path` is a regular file with any execute bit set.
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(..) => false,
    }
}

/// Returns true if this process runs with root privileges.
pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
