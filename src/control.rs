//! The control pipe: a named pipe that external scripts write to (or just open and close) to stop
//! a running monitor.
//!
//! The monitor side is the `ControlListener`, a background thread that raises the run's
//! `StopSignal` as soon as anything happens on the pipe. The writer side is `send_stop`, also
//! available as the `stop` subcommand.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::{ffi::OsStrExt, fs::FileTypeExt, fs::OpenOptionsExt};
use std::path::Path;
use std::thread::JoinHandle;
use std::time::Duration;

use clap::clap_app;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};

use failure::ResultExt;

use log::{debug, error, info, warn};

use crate::{
    paths::CONTROL_PIPE,
    readiness::{wait_readable, Readiness},
    stop::StopSignal,
    MonitorError,
};

/// Make sure a named pipe exists at `path`. An existing pipe is reused; an existing file of any
/// other type is an error.
pub fn ensure_fifo(path: &Path) -> Result<(), failure::Error> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => {
            debug!("Reusing control pipe {}", path.display());
            return Ok(());
        }
        Ok(..) => {
            return Err(MonitorError::NotAFifo {
                path: path.display().to_string(),
            }
            .into())
        }
        Err(ref err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|_| format!("checking {}", path.display()))
                .map_err(Into::into)
        }
    }

    let cpath = CString::new(path.as_os_str().as_bytes())
        .with_context(|_| format!("bad pipe path {:?}", path))?;

    if unsafe { libc::mkfifo(cpath.as_ptr(), 0o666) } != 0 {
        let err = std::io::Error::last_os_error();
        // Someone else may have created it in the meantime.
        if err.kind() != ErrorKind::AlreadyExists {
            return Err(err)
                .with_context(|_| format!("creating control pipe {}", path.display()))
                .map_err(Into::into);
        }
    }

    info!("Created control pipe {}", path.display());

    Ok(())
}

/// A background thread watching the control pipe.
#[derive(Debug)]
pub struct ControlListener {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl ControlListener {
    /// Create the pipe if needed and start watching it. The listener raises `stop` when a byte
    /// arrives, when a writer closes its end, or when anything goes wrong with the pipe. It
    /// exits by itself once `stop` is raised by anyone, within `poll_timeout`.
    pub fn spawn(
        path: &Path,
        stop: StopSignal,
        poll_timeout: Duration,
    ) -> Result<Self, failure::Error> {
        ensure_fifo(path)?;

        // Opening for reading with O_NONBLOCK succeeds even with no writer connected.
        let pipe = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .with_context(|_| format!("opening control pipe {}", path.display()))?;

        let (done_tx, done) = bounded::<()>(0);
        let path = path.to_owned();

        let handle = std::thread::Builder::new()
            .name("control-listener".into())
            .spawn(move || {
                listen(pipe, &path, &stop, poll_timeout);
                stop.raise();

                // Dropping the sender tells `join` that we are done.
                drop(done_tx);
            })
            .context("spawning control listener")?;

        Ok(ControlListener { handle, done })
    }

    /// Wait up to `timeout` for the listener to exit. Returns false (and leaves the thread
    /// detached) if it does not.
    pub fn join(self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                if self.handle.join().is_err() {
                    error!("Control listener panicked.");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Control listener did not exit within {:?}.", timeout);
                false
            }
        }
    }
}

fn listen(mut pipe: std::fs::File, path: &Path, stop: &StopSignal, poll_timeout: Duration) {
    let mut buf = [0u8; 64];

    while !stop.is_raised() {
        match wait_readable(&pipe, poll_timeout) {
            Ok(Readiness::Idle) => continue,
            Ok(Readiness::Readable) | Ok(Readiness::HangUp) => {}
            Err(err) => {
                error!("Error waiting on control pipe {}: {}", path.display(), err);
                return;
            }
        }

        match pipe.read(&mut buf) {
            Ok(0) => {
                info!("Control pipe writer closed. Stopping monitoring.");
                return;
            }
            Ok(..) => {
                println!("Signal received on pipe. Stopping monitoring.");
                return;
            }
            Err(ref err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::Interrupted =>
            {
                continue
            }
            Err(err) => {
                error!("Error reading control pipe {}: {}", path.display(), err);
                return;
            }
        }
    }

    debug!("Control listener exiting: stop already raised.");
}

/// Ask the monitor listening on `path` to stop by writing one byte to the pipe.
pub fn send_stop(path: &Path) -> Result<(), failure::Error> {
    let no_listener = || MonitorError::NoListener {
        path: path.display().to_string(),
    };

    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => {}
        Ok(..) => {
            return Err(MonitorError::NotAFifo {
                path: path.display().to_string(),
            }
            .into())
        }
        Err(ref err) if err.kind() == ErrorKind::NotFound => return Err(no_listener().into()),
        Err(err) => {
            return Err(err)
                .with_context(|_| format!("checking {}", path.display()))
                .map_err(Into::into)
        }
    }

    // Opening a FIFO for writing with O_NONBLOCK fails with ENXIO if there is no reader.
    let mut pipe = match OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
    {
        Ok(pipe) => pipe,
        Err(ref err) if err.raw_os_error() == Some(libc::ENXIO) => {
            return Err(no_listener().into())
        }
        Err(err) => {
            return Err(err)
                .with_context(|_| format!("opening control pipe {}", path.display()))
                .map_err(Into::into)
        }
    };

    pipe.write_all(b"1")
        .with_context(|_| format!("writing to control pipe {}", path.display()))?;

    Ok(())
}

pub fn cli_options() -> clap::App<'static, 'static> {
    clap_app! { stop =>
        (about: "Stop a running monitor by writing to its control pipe.")
        (@arg PIPE: --pipe +takes_value
         "The control pipe of the monitor (default: /tmp/ram_monitor_pipe)")
    }
}

pub fn run(sub_m: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let pipe = Path::new(sub_m.value_of("PIPE").unwrap_or(CONTROL_PIPE));

    send_stop(pipe)?;

    println!("Stop request written to {}", pipe.display());

    Ok(())
}

#[cfg(test)]
mod test {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::FileTypeExt;
    use std::time::{Duration, Instant};

    use crate::stop::StopSignal;
    use crate::MonitorError;

    use super::{ensure_fifo, send_stop, ControlListener};

    const POLL: Duration = Duration::from_millis(50);

    /// Wait for the signal for up to a few seconds.
    fn wait_raised(stop: &StopSignal) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if stop.is_raised() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn creates_and_reuses_fifo() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pipe");

        ensure_fifo(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());

        ensure_fifo(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());
    }

    #[test]
    fn regular_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pipe");
        std::fs::write(&path, "").unwrap();

        let err = ensure_fifo(&path).unwrap_err();
        match err.downcast_ref::<MonitorError>() {
            Some(MonitorError::NotAFifo { .. }) => {}
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn byte_raises_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pipe");
        let stop = StopSignal::new();

        let listener = ControlListener::spawn(&path, stop.clone(), POLL).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert!(!stop.is_raised());

        send_stop(&path).unwrap();

        assert!(wait_raised(&stop));
        assert!(listener.join(Duration::from_secs(2)));
    }

    #[test]
    fn writer_closing_raises_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pipe");
        let stop = StopSignal::new();

        let listener = ControlListener::spawn(&path, stop.clone(), POLL).unwrap();

        // Open and close without writing anything.
        drop(OpenOptions::new().write(true).open(&path).unwrap());

        assert!(wait_raised(&stop));
        assert!(listener.join(Duration::from_secs(2)));
    }

    #[test]
    fn exits_when_stop_raised_elsewhere() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pipe");
        let stop = StopSignal::new();

        let listener = ControlListener::spawn(&path, stop.clone(), POLL).unwrap();
        stop.raise();

        assert!(listener.join(Duration::from_secs(2)));
    }

    #[test]
    fn stays_quiet_without_writers() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pipe");
        let stop = StopSignal::new();

        let listener = ControlListener::spawn(&path, stop.clone(), POLL).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert!(!stop.is_raised());

        let mut w = OpenOptions::new().write(true).open(&path).unwrap();
        w.write_all(b"stop").unwrap();

        assert!(wait_raised(&stop));
        assert!(listener.join(Duration::from_secs(2)));
    }

    #[test]
    fn send_without_listener() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pipe");

        // No pipe at all.
        let err = send_stop(&path).unwrap_err();
        match err.downcast_ref::<MonitorError>() {
            Some(MonitorError::NoListener { .. }) => {}
            other => panic!("unexpected error {:?}", other),
        }

        // A pipe with no reader.
        ensure_fifo(&path).unwrap();
        let err = send_stop(&path).unwrap_err();
        match err.downcast_ref::<MonitorError>() {
            Some(MonitorError::NoListener { .. }) => {}
            other => panic!("unexpected error {:?}", other),
        }
    }
}
