//! Signal intake for the supervisor
//!
//! Handlers do nothing but set a pending-work flag and touch the latch; all
//! real work happens in the event loop. Shutdown severity is merged with
//! `fetch_max` so the most severe request wins no matter the arrival order.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use super::latch::wake_from_handler;
use super::lifecycle::ShutdownMode;

static PENDING_RELOAD: AtomicBool = AtomicBool::new(false);
static PENDING_SHUTDOWN: AtomicBool = AtomicBool::new(false);
static PENDING_CHILD_EXIT: AtomicBool = AtomicBool::new(false);
static PENDING_PMSIGNAL: AtomicBool = AtomicBool::new(false);
/// Highest severity seen so far, encoded as ShutdownMode discriminants.
static SHUTDOWN_SEVERITY: AtomicU8 = AtomicU8::new(0);

extern "C" fn handle_reload(_: libc::c_int) {
    PENDING_RELOAD.store(true, Ordering::SeqCst);
    wake_from_handler();
}

extern "C" fn handle_shutdown(signum: libc::c_int) {
    let severity = match signum {
        libc::SIGTERM => ShutdownMode::Smart as u8,
        libc::SIGINT => ShutdownMode::Fast as u8,
        _ => ShutdownMode::Immediate as u8,
    };
    SHUTDOWN_SEVERITY.fetch_max(severity, Ordering::SeqCst);
    PENDING_SHUTDOWN.store(true, Ordering::SeqCst);
    wake_from_handler();
}

extern "C" fn handle_child_exit(_: libc::c_int) {
    PENDING_CHILD_EXIT.store(true, Ordering::SeqCst);
    wake_from_handler();
}

extern "C" fn handle_pmsignal(_: libc::c_int) {
    PENDING_PMSIGNAL.store(true, Ordering::SeqCst);
    wake_from_handler();
}

/// Install the supervisor's handler set:
///
/// - SIGHUP: reload configuration
/// - SIGTERM / SIGINT / SIGQUIT: smart / fast / immediate shutdown
/// - SIGCHLD: reap
/// - SIGUSR1: inter-process signal channel
/// - SIGUSR2 reserved; SIGPIPE and the terminal/ulimit signals ignored
pub fn install_supervisor_handlers() -> Result<(), nix::errno::Errno> {
    let flags = SaFlags::SA_RESTART;
    let mask = SigSet::empty();

    let set = |sig: Signal, handler: extern "C" fn(libc::c_int)| unsafe {
        sigaction(sig, &SigAction::new(SigHandler::Handler(handler), flags, mask)).map(|_| ())
    };
    let ignore = |sig: Signal| unsafe {
        sigaction(sig, &SigAction::new(SigHandler::SigIgn, flags, mask)).map(|_| ())
    };

    set(Signal::SIGHUP, handle_reload)?;
    set(Signal::SIGTERM, handle_shutdown)?;
    set(Signal::SIGINT, handle_shutdown)?;
    set(Signal::SIGQUIT, handle_shutdown)?;
    set(Signal::SIGCHLD, handle_child_exit)?;
    set(Signal::SIGUSR1, handle_pmsignal)?;

    ignore(Signal::SIGUSR2)?;
    ignore(Signal::SIGPIPE)?;
    ignore(Signal::SIGTTIN)?;
    ignore(Signal::SIGTTOU)?;
    ignore(Signal::SIGXFSZ)?;
    Ok(())
}

/// Consume the pending-reload flag.
pub fn take_pending_reload() -> bool {
    PENDING_RELOAD.swap(false, Ordering::SeqCst)
}

/// Consume the pending-child-exit flag.
pub fn take_pending_child_exit() -> bool {
    PENDING_CHILD_EXIT.swap(false, Ordering::SeqCst)
}

/// Consume the pending-pmsignal flag.
pub fn take_pending_pmsignal() -> bool {
    PENDING_PMSIGNAL.swap(false, Ordering::SeqCst)
}

/// Consume the pending-shutdown flag, reporting the merged severity.
pub fn take_pending_shutdown() -> Option<ShutdownMode> {
    if PENDING_SHUTDOWN.swap(false, Ordering::SeqCst) {
        Some(ShutdownMode::from_severity(
            SHUTDOWN_SEVERITY.load(Ordering::SeqCst),
        ))
    } else {
        None
    }
}

/// Queue a shutdown request from inside the supervisor itself, as if the
/// corresponding signal had arrived.
pub fn post_shutdown_request(mode: ShutdownMode) {
    SHUTDOWN_SEVERITY.fetch_max(mode as u8, Ordering::SeqCst);
    PENDING_SHUTDOWN.store(true, Ordering::SeqCst);
    wake_from_handler();
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    PENDING_RELOAD.store(false, Ordering::SeqCst);
    PENDING_SHUTDOWN.store(false, Ordering::SeqCst);
    PENDING_CHILD_EXIT.store(false, Ordering::SeqCst);
    PENDING_PMSIGNAL.store(false, Ordering::SeqCst);
    SHUTDOWN_SEVERITY.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static SIGNAL_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_severity_merges_upward() {
        let _lock = SIGNAL_LOCK.lock().unwrap();
        reset_for_tests();

        handle_shutdown(libc::SIGTERM);
        assert_eq!(take_pending_shutdown(), Some(ShutdownMode::Smart));

        handle_shutdown(libc::SIGQUIT);
        handle_shutdown(libc::SIGTERM);
        // Immediate already latched; the later smart request cannot lower it.
        assert_eq!(take_pending_shutdown(), Some(ShutdownMode::Immediate));
    }

    #[test]
    fn test_flags_consume_once() {
        let _lock = SIGNAL_LOCK.lock().unwrap();
        reset_for_tests();

        handle_reload(libc::SIGHUP);
        assert!(take_pending_reload());
        assert!(!take_pending_reload());

        handle_child_exit(libc::SIGCHLD);
        assert!(take_pending_child_exit());
        assert!(!take_pending_child_exit());

        handle_pmsignal(libc::SIGUSR1);
        assert!(take_pending_pmsignal());
        assert!(!take_pending_pmsignal());
    }

    #[test]
    fn test_no_shutdown_pending_initially() {
        let _lock = SIGNAL_LOCK.lock().unwrap();
        reset_for_tests();
        assert_eq!(take_pending_shutdown(), None);
    }

    #[test]
    fn test_self_posted_shutdown() {
        let _lock = SIGNAL_LOCK.lock().unwrap();
        reset_for_tests();
        post_shutdown_request(ShutdownMode::Immediate);
        assert_eq!(take_pending_shutdown(), Some(ShutdownMode::Immediate));
    }
}
