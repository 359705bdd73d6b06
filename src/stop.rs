//! The stop signal shared by the recording loop and the control-pipe listener, and the hook that
//! turns Ctrl-C into a stop request.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crossbeam::channel::{bounded, Receiver, Sender};

/// A one-shot, payload-free stop request.
///
/// Any clone may raise it; once raised it stays raised. Observers can either poll `is_raised` or
/// wait on `receiver()` inside a `select!`: the channel never carries a message, but it becomes
/// disconnected (and thus ready) the moment the signal is raised.
#[derive(Clone, Debug)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        StopSignal {
            raised: Arc::new(AtomicBool::new(false)),
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    /// Raise the signal. Raising an already raised signal does nothing.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);

        // Dropping the only sender disconnects every receiver.
        let mut sender = match self.sender.lock() {
            Ok(sender) => sender,
            Err(poisoned) => poisoned.into_inner(),
        };
        sender.take();
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// A channel that becomes ready (disconnected) once the signal is raised.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Set from the SIGINT/SIGTERM handler. Signal handlers cannot capture state, so this is the one
/// process-wide flag; the recording loop forwards it into its own `StopSignal`.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signum: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Catch SIGINT and SIGTERM so that Ctrl-C leads to an orderly teardown instead of leaving the
/// sampling tool running.
pub fn install_interrupt_handler() -> std::io::Result<()> {
    for signum in &[libc::SIGINT, libc::SIGTERM] {
        let handler = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
        if unsafe { libc::signal(*signum, handler) } == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }

    Ok(())
}

/// Has this process received SIGINT or SIGTERM since `install_interrupt_handler`?
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
