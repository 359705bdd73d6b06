//! Waiting for file descriptors to become readable, with a timeout.

use std::os::unix::io::AsRawFd;
use std::time::Duration;

/// The state of one source after a wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// There is data to read.
    Readable,
    /// The other end has gone away. A read will return end-of-file (after any buffered data).
    HangUp,
    /// Nothing happened before the timeout.
    Idle,
}

/// Wait until at least one of `sources` is readable or hung up, or until `timeout` expires.
/// Returns the state of each source, in order.
///
/// A wait interrupted by a signal is reported as a timeout (all sources idle) so that callers
/// simply go around their loop again.
pub fn wait_any(sources: &[&dyn AsRawFd], timeout: Duration) -> std::io::Result<Vec<Readiness>> {
    let mut fds: Vec<libc::pollfd> = sources
        .iter()
        .map(|source| libc::pollfd {
            fd: source.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms = timeout.as_millis().min(libc::c_int::max_value() as u128) as libc::c_int;

    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

    if ret < 0 {
        let err = std::io::Error::last_os_error();
        return if err.kind() == std::io::ErrorKind::Interrupted {
            Ok(vec![Readiness::Idle; fds.len()])
        } else {
            Err(err)
        };
    }

    fds.iter()
        .map(|fd| {
            if fd.revents & libc::POLLIN != 0 {
                Ok(Readiness::Readable)
            } else if fd.revents & libc::POLLHUP != 0 {
                Ok(Readiness::HangUp)
            } else if fd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("poll reported an error on fd {}", fd.fd),
                ))
            } else {
                Ok(Readiness::Idle)
            }
        })
        .collect()
}

/// `wait_any` for a single source.
pub fn wait_readable<S: AsRawFd>(source: &S, timeout: Duration) -> std::io::Result<Readiness> {
    let source: &dyn AsRawFd = source;
    Ok(wait_any(&[source], timeout)?
        .pop()
        .unwrap_or(Readiness::Idle))
}
