//! SIGIO handling for consumers that asked for asynchronous notification.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use super::ConsumerId;
use crate::error::DevResult;

/// Signal a notifying device would deliver.
pub const ASYNC_SIGNAL: Signal = Signal::SIGIO;

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);
static SIGNAL_COUNT: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_async_signal(_signo: nix::libc::c_int) {
    // Only async-signal-safe work here.
    SIGNAL_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Installs a handler for [`ASYNC_SIGNAL`] that counts deliveries.
///
/// Installing twice is a no-op.
pub fn install_async_handler() -> DevResult {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let action = SigAction::new(
        SigHandler::Handler(on_async_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only touches an atomic counter.
    if let Err(e) = unsafe { sigaction(ASYNC_SIGNAL, &action) } {
        HANDLER_INSTALLED.store(false, Ordering::SeqCst);
        return dev_err!(RegistrationFailure, format!("sigaction({ASYNC_SIGNAL}): {e}"));
    }
    debug!("signal: handler installed for {}", ASYNC_SIGNAL);
    Ok(())
}

/// Deliveries of [`ASYNC_SIGNAL`] since the handler was installed.
pub fn signal_count() -> usize {
    SIGNAL_COUNT.load(Ordering::Relaxed)
}

/// Identity of the calling process.
pub fn current_consumer() -> ConsumerId {
    nix::unistd::getpid().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_counts_deliveries() {
        install_async_handler().unwrap();
        install_async_handler().unwrap();

        let before = signal_count();
        nix::sys::signal::raise(ASYNC_SIGNAL).unwrap();
        assert!(signal_count() > before);
    }

    #[test]
    fn test_current_consumer_is_positive() {
        assert!(current_consumer().0 > 0);
    }
}
