//! A cloneable stop flag, checked between iterations and while blocked on
//! the transport.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Set from the signal handler. A plain static is the only state a handler
/// may touch safely.
static PROCESS_STOP: AtomicBool = AtomicBool::new(false);

/// Tells every stage of a pipeline to wind down.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    watch_process: bool,
}

impl StopSignal {
    /// A stop signal only triggered through [StopSignal::stop].
    pub fn new() -> Self {
        Self::default()
    }

    /// A stop signal that also fires on SIGINT or SIGTERM. Installs the
    /// handlers; calling this more than once is harmless.
    pub fn from_process_signals() -> std::io::Result<Self> {
        install_handlers()?;
        Ok(Self {
            flag: Arc::new(AtomicBool::new(false)),
            watch_process: true,
        })
    }

    /// Raises the signal for every clone.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || (self.watch_process && PROCESS_STOP.load(Ordering::SeqCst))
    }
}

#[cfg(unix)]
extern "C" fn handle_signal(_signum: libc::c_int) {
    PROCESS_STOP.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_handlers() -> std::io::Result<()> {
    let handler = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for signum in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only stores to an atomic, which is
        // async-signal-safe.
        let previous = unsafe { libc::signal(signum, handler) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn install_handlers() -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let stop = StopSignal::new();
        let other = stop.clone();
        assert!(!other.is_stopped());
        stop.stop();
        assert!(other.is_stopped());
    }

    #[test]
    fn plain_signal_ignores_process_flag() {
        let stop = StopSignal::new();
        PROCESS_STOP.store(true, Ordering::SeqCst);
        let stopped = stop.is_stopped();
        PROCESS_STOP.store(false, Ordering::SeqCst);
        assert!(!stopped);
    }
}
