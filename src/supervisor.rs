//! Launching and stopping the external sampling tool (`perf stat`) attached to the target process.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use itertools::Itertools;

use log::{debug, info, warn};

use serde::Serialize;

use crate::MonitorError;

/// Replaced by the target pid in the arguments of a `ToolInvocation`.
pub const PID_PLACEHOLDER: &str = "{pid}";

/// How often to check whether the tool has exited while waiting for it.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The program to run and its arguments. Occurrences of `{pid}` in the arguments are replaced with
/// the pid of the process being monitored.
#[derive(Clone, Debug, Serialize)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ToolInvocation {
    pub fn new<P: Into<PathBuf>>(program: P, args: &[&str]) -> Self {
        ToolInvocation {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    /// `perf stat` counting `event` in the target process, reporting the delta every
    /// `interval_ms` milliseconds on stderr.
    pub fn perf_stat<P: Into<PathBuf>>(perf: P, event: &str, interval_ms: u64) -> Self {
        let interval = interval_ms.to_string();
        Self::new(
            perf,
            &[
                "stat",
                "-p",
                PID_PLACEHOLDER,
                "-e",
                event,
                "-I",
                &interval,
                "--log-fd",
                "2",
            ],
        )
    }

    /// The arguments with the pid filled in.
    pub fn args_for(&self, pid: u32) -> Vec<String> {
        let pid = pid.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PID_PLACEHOLDER, &pid))
            .collect()
    }

    /// A human-readable command line, for logs and the params file.
    pub fn command_line(&self, pid: u32) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args_for(pid))
            .join(" ")
    }

    fn command(&self, pid: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args_for(pid))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

/// How long to wait at each step of starting and stopping the tool.
#[derive(Copy, Clone, Debug, Serialize)]
pub struct ShutdownPolicy {
    /// After launching, how long to wait before checking that the tool did not die right away.
    pub startup_grace: Duration,
    /// How long to wait for the tool to exit after SIGINT.
    pub interrupt_wait: Duration,
    /// How long to wait for the tool to exit after SIGTERM.
    pub terminate_wait: Duration,
    /// How long to wait for the tool to be reaped after SIGKILL.
    pub kill_wait: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        ShutdownPolicy {
            startup_grace: Duration::from_millis(200),
            interrupt_wait: Duration::from_millis(1500),
            terminate_wait: Duration::from_millis(1000),
            kill_wait: Duration::from_millis(1000),
        }
    }
}

/// The result of `Supervisor::start`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Started {
    /// A new tool process with the given pid is running.
    Launched(u32),
    /// A tool process was already running; nothing was spawned.
    AlreadyRunning(u32),
}

/// How the tool ended when `Supervisor::stop` was called.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Shutdown {
    /// There was no tool to stop.
    NotRunning,
    /// The tool had already exited by itself.
    Exited,
    /// The tool exited after SIGINT.
    Interrupted,
    /// The tool exited after SIGTERM.
    Terminated,
    /// The tool was killed with SIGKILL.
    Killed,
    /// The tool was still around after SIGKILL. It is abandoned.
    Survived,
}

/// Owns at most one running instance of the sampling tool.
#[derive(Debug)]
pub struct Supervisor {
    tool: ToolInvocation,
    policy: ShutdownPolicy,
    child: Option<Child>,
    target: Option<u32>,
}

impl Supervisor {
    pub fn new(tool: ToolInvocation, policy: ShutdownPolicy) -> Self {
        Supervisor {
            tool,
            policy,
            child: None,
            target: None,
        }
    }

    pub fn tool(&self) -> &ToolInvocation {
        &self.tool
    }

    /// The pid of the running tool, if any.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// The pid the running tool is attached to, if any.
    pub fn target(&self) -> Option<u32> {
        self.target
    }

    /// Launch the tool attached to `target_pid`.
    ///
    /// After launching, waits for the startup grace period and fails if the tool has already
    /// exited (typically a permission problem or a bad pid), capturing whatever it printed.
    pub fn start(&mut self, target_pid: u32) -> Result<Started, MonitorError> {
        if let Some(pid) = self.running_pid() {
            warn!("Sampling tool already running (pid {}).", pid);
            return Ok(Started::AlreadyRunning(pid));
        }

        info!(
            "Starting sampling tool: {}",
            self.tool.command_line(target_pid)
        );

        let mut child =
            self.tool
                .command(target_pid)
                .spawn()
                .map_err(|err| MonitorError::ToolSpawn {
                    program: self.tool.program.display().to_string(),
                    reason: err.to_string(),
                })?;

        std::thread::sleep(self.policy.startup_grace);

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                let mut diagnostics = String::new();
                if let Some(mut stderr) = child.stderr.take() {
                    // The tool is gone, so this reads until end-of-file.
                    let _ = stderr.read_to_string(&mut diagnostics);
                }
                return Err(MonitorError::ToolExitedImmediately {
                    code: status.code(),
                    diagnostics,
                });
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(MonitorError::ToolSpawn {
                    program: self.tool.program.display().to_string(),
                    reason: err.to_string(),
                });
            }
        }

        let pid = child.id();
        info!(
            "Sampling tool started (pid {}) for target pid {}.",
            pid, target_pid
        );

        self.child = Some(child);
        self.target = Some(target_pid);

        Ok(Started::Launched(pid))
    }

    /// Take the tool's report stream. Returns `None` if there is no tool or the stream was
    /// already taken.
    pub fn take_output(&mut self) -> Option<ChildStderr> {
        self.child.as_mut().and_then(|child| child.stderr.take())
    }

    /// If the tool has exited, its exit status. Does not block.
    pub fn exit_status(&mut self) -> std::io::Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => child.try_wait(),
            None => Ok(None),
        }
    }

    /// Returns true if a tool process exists and has not exited.
    pub fn is_running(&mut self) -> bool {
        self.running_pid().is_some()
    }

    fn running_pid(&mut self) -> Option<u32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(None) => Some(child.id()),
            _ => None,
        }
    }

    /// Stop the tool: SIGINT, then SIGTERM, then SIGKILL, waiting a bounded time after each.
    ///
    /// Afterwards, the supervisor owns no tool and can be started again.
    pub fn stop(&mut self) -> Shutdown {
        self.target = None;

        let mut child = match self.child.take() {
            Some(child) => child,
            None => return Shutdown::NotRunning,
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("Sampling tool had already exited: {}", status);
            return Shutdown::Exited;
        }

        info!("Stopping sampling tool (pid {})...", child.id());

        let steps = [
            (libc::SIGINT, self.policy.interrupt_wait, Shutdown::Interrupted),
            (libc::SIGTERM, self.policy.terminate_wait, Shutdown::Terminated),
            (libc::SIGKILL, self.policy.kill_wait, Shutdown::Killed),
        ];

        for (signal, wait, outcome) in steps.iter() {
            if *signal == libc::SIGKILL {
                let _ = child.kill();
            } else {
                unsafe {
                    libc::kill(child.id() as libc::pid_t, *signal);
                }
            }

            match wait_for_exit(&mut child, *wait) {
                Ok(Some(status)) => {
                    info!("Sampling tool exited ({:?}): {}", outcome, status);
                    return *outcome;
                }
                Ok(None) => debug!(
                    "Sampling tool did not exit within {:?} of signal {}.",
                    wait, signal
                ),
                Err(err) => warn!("Unable to wait for the sampling tool: {}", err),
            }
        }

        Shutdown::Survived
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait up to `timeout` for `child` to exit.
fn wait_for_exit(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::time::Duration;

    use super::{Shutdown, ShutdownPolicy, Started, Supervisor, ToolInvocation};
    use crate::MonitorError;

    fn fast_policy() -> ShutdownPolicy {
        ShutdownPolicy {
            startup_grace: Duration::from_millis(200),
            interrupt_wait: Duration::from_millis(300),
            terminate_wait: Duration::from_millis(300),
            kill_wait: Duration::from_secs(2),
        }
    }

    fn sh(script: &str) -> ToolInvocation {
        ToolInvocation::new("/bin/sh", &["-c", script])
    }

    fn alive(pid: u32) -> bool {
        Path::new(&format!("/proc/{}", pid)).exists()
    }

    #[test]
    fn perf_stat_arguments() {
        let perf = ToolInvocation::perf_stat("/usr/bin/perf", "cycles", 1000);
        assert_eq!(
            perf.args_for(4242),
            vec!["stat", "-p", "4242", "-e", "cycles", "-I", "1000", "--log-fd", "2"]
        );
        assert_eq!(
            perf.command_line(7),
            "/usr/bin/perf stat -p 7 -e cycles -I 1000 --log-fd 2"
        );
    }

    #[test]
    fn start_then_interrupt() {
        let mut sup = Supervisor::new(sh("exec sleep 30"), fast_policy());

        let pid = match sup.start(1).unwrap() {
            Started::Launched(pid) => pid,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(sup.pid(), Some(pid));
        assert_eq!(sup.target(), Some(1));
        assert!(sup.is_running());

        assert_eq!(sup.stop(), Shutdown::Interrupted);
        assert!(!alive(pid));
        assert!(sup.pid().is_none());
        assert!(sup.target().is_none());
    }

    #[test]
    fn second_start_is_a_no_op() {
        let mut sup = Supervisor::new(sh("exec sleep 30"), fast_policy());

        let first = sup.start(1).unwrap();
        let second = sup.start(2).unwrap();

        match (first, second) {
            (Started::Launched(a), Started::AlreadyRunning(b)) => assert_eq!(a, b),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sup.target(), Some(1));

        sup.stop();
    }

    #[test]
    fn escalates_to_kill() {
        let mut sup = Supervisor::new(
            sh("trap '' INT TERM; while true; do sleep 1; done"),
            fast_policy(),
        );

        let pid = match sup.start(1).unwrap() {
            Started::Launched(pid) => pid,
            other => panic!("unexpected {:?}", other),
        };

        assert_eq!(sup.stop(), Shutdown::Killed);
        assert!(!alive(pid));
    }

    #[test]
    fn immediate_exit_is_reported() {
        let mut sup = Supervisor::new(
            sh("echo 'No permission to attach' >&2; exit 3"),
            fast_policy(),
        );

        match sup.start(1) {
            Err(MonitorError::ToolExitedImmediately { code, diagnostics }) => {
                assert_eq!(code, Some(3));
                assert!(diagnostics.contains("No permission to attach"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!sup.is_running());
        assert_eq!(sup.stop(), Shutdown::NotRunning);
    }

    #[test]
    fn missing_program() {
        let mut sup = Supervisor::new(
            ToolInvocation::new("/nonexistent/perf", &[]),
            fast_policy(),
        );

        match sup.start(1) {
            Err(MonitorError::ToolSpawn { program, .. }) => {
                assert_eq!(program, "/nonexistent/perf")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn stop_after_exit() {
        let mut sup = Supervisor::new(sh("sleep 0.5"), fast_policy());
        sup.start(1).unwrap();
        std::thread::sleep(Duration::from_millis(800));

        assert!(sup.exit_status().unwrap().is_some());
        assert_eq!(sup.stop(), Shutdown::Exited);
    }

    #[test]
    fn output_is_taken_once() {
        let mut sup = Supervisor::new(sh("exec sleep 30"), fast_policy());
        sup.start(1).unwrap();

        assert!(sup.take_output().is_some());
        assert!(sup.take_output().is_none());

        sup.stop();
    }
}
