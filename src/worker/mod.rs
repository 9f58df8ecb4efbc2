//! Worker processes
//!
//! Every child the supervisor creates is one of the kinds below. The
//! supervisor only arbitrates processes; this module is the thin
//! process-level shell around each worker: signal setup, shared-memory
//! attach, stderr redirection, and the exit protocol. The engine work a real
//! worker would do lives behind the per-kind `run` functions.

pub mod auxiliary;
pub mod deadend;
pub mod session;
pub mod syslogger;

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::shmem::pmsignal::{PmSignalReason, PmSignalTable};
use crate::shmem::{Segment, REGION_PMSIGNAL};

/// Exit status a worker uses for "clean fatal": the supervisor treats it as
/// an orderly death, anything above as a crash.
pub const EXIT_CLEAN_FATAL: i32 = 1;
/// Exit status for "quit now, leave no trace": taken on SIGQUIT, and read by
/// the supervisor as a crash.
pub const EXIT_CRASH: i32 = 2;

/// The kinds of child the supervisor knows how to run. Exhaustive and
/// disjoint; the discriminant doubles as the singleton-array index and the
/// kind-mask bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WorkerKind {
    Startup = 0,
    BgWriter = 1,
    Checkpointer = 2,
    WalWriter = 3,
    WalReceiver = 4,
    WalSummarizer = 5,
    AutoVacLauncher = 6,
    AutoVacWorker = 7,
    Archiver = 8,
    SysLogger = 9,
    SlotSync = 10,
    Session = 11,
    BgWorker = 12,
}

pub const WORKER_KIND_COUNT: usize = 13;

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::BgWriter => "bgwriter",
            Self::Checkpointer => "checkpointer",
            Self::WalWriter => "walwriter",
            Self::WalReceiver => "walreceiver",
            Self::WalSummarizer => "walsummarizer",
            Self::AutoVacLauncher => "autovacuum-launcher",
            Self::AutoVacWorker => "autovacuum-worker",
            Self::Archiver => "archiver",
            Self::SysLogger => "syslogger",
            Self::SlotSync => "slotsync",
            Self::Session => "session",
            Self::BgWorker => "bgworker",
        }
    }

    /// Singleton kinds are tracked in the typed slot array; the rest are
    /// multiplicities that live only in the registry.
    pub fn is_singleton(&self) -> bool {
        !matches!(self, Self::Session | Self::AutoVacWorker | Self::BgWorker)
    }

    pub fn all() -> impl Iterator<Item = WorkerKind> {
        [
            Self::Startup,
            Self::BgWriter,
            Self::Checkpointer,
            Self::WalWriter,
            Self::WalReceiver,
            Self::WalSummarizer,
            Self::AutoVacLauncher,
            Self::AutoVacWorker,
            Self::Archiver,
            Self::SysLogger,
            Self::SlotSync,
            Self::Session,
            Self::BgWorker,
        ]
        .into_iter()
    }
}

/// Everything a child needs to come up, independent of how it was created.
/// Forked children receive it in memory; spawned children read it back from
/// the payload file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBootstrap {
    pub kind: WorkerKind,
    pub config: Config,
    pub segment_name: String,
    pub supervisor_pid: i32,
    /// Read end of the death-watch pipe; EOF means the supervisor is gone.
    pub deathwatch_fd: Option<RawFd>,
    /// Shared slot index, for kinds that occupy one.
    pub slot: Option<usize>,
    pub cancel_token: Option<u32>,
    /// Accepted client socket, for sessions and dead-end children.
    pub client_fd: Option<RawFd>,
    /// Present exactly for dead-end children: the rejection to deliver.
    pub reject_reason: Option<String>,
    pub bgworker_name: Option<String>,
    /// The supervisor is restarting after a crash cycle.
    pub crash_recovery: bool,
    /// Write end of the log-collector pipe to point stderr at.
    pub logpipe_fd: Option<RawFd>,
}

impl WorkerBootstrap {
    pub fn plain(kind: WorkerKind, config: Config, segment_name: String, supervisor_pid: i32) -> Self {
        WorkerBootstrap {
            kind,
            config,
            segment_name,
            supervisor_pid,
            deathwatch_fd: None,
            slot: None,
            cancel_token: None,
            client_fd: None,
            reject_reason: None,
            bgworker_name: None,
            crash_recovery: false,
            logpipe_fd: None,
        }
    }
}

// Worker-side pending flags. In a forked child these shadow the copied
// supervisor statics once the handlers are reinstalled.
static W_TERM: AtomicBool = AtomicBool::new(false);
static W_INT: AtomicBool = AtomicBool::new(false);
static W_HUP: AtomicBool = AtomicBool::new(false);
static W_USR1: AtomicBool = AtomicBool::new(false);
static W_USR2: AtomicBool = AtomicBool::new(false);

extern "C" fn w_handle_term(_: libc::c_int) {
    W_TERM.store(true, Ordering::SeqCst);
}
extern "C" fn w_handle_int(_: libc::c_int) {
    W_INT.store(true, Ordering::SeqCst);
}
extern "C" fn w_handle_hup(_: libc::c_int) {
    W_HUP.store(true, Ordering::SeqCst);
}
extern "C" fn w_handle_usr1(_: libc::c_int) {
    W_USR1.store(true, Ordering::SeqCst);
}
extern "C" fn w_handle_usr2(_: libc::c_int) {
    W_USR2.store(true, Ordering::SeqCst);
}
extern "C" fn w_handle_quit(_: libc::c_int) {
    // quit-with-core semantics minus the core: get out without touching
    // shared state again
    unsafe { libc::_exit(EXIT_CRASH) }
}

pub fn term_pending() -> bool {
    W_TERM.load(Ordering::SeqCst)
}
pub fn take_int_pending() -> bool {
    W_INT.swap(false, Ordering::SeqCst)
}
pub fn take_hup_pending() -> bool {
    W_HUP.swap(false, Ordering::SeqCst)
}
pub fn take_usr1_pending() -> bool {
    W_USR1.swap(false, Ordering::SeqCst)
}
pub fn take_usr2_pending() -> bool {
    W_USR2.swap(false, Ordering::SeqCst)
}

fn reset_pending_flags() {
    for flag in [&W_TERM, &W_INT, &W_HUP, &W_USR1, &W_USR2] {
        flag.store(false, Ordering::SeqCst);
    }
}

/// Install the worker handler set. Deliberately without SA_RESTART so a
/// blocking read or poll returns EINTR and the loop can consult the flags.
fn install_worker_handlers(ignore_term: bool) -> Result<(), nix::errno::Errno> {
    let flags = SaFlags::empty();
    let mask = SigSet::empty();
    let set = |sig: Signal, handler: extern "C" fn(libc::c_int)| unsafe {
        sigaction(sig, &SigAction::new(SigHandler::Handler(handler), flags, mask)).map(|_| ())
    };

    if ignore_term {
        // the checkpointer outlives StopBackends; only its own finish signal
        // or a quit may take it down
        unsafe {
            sigaction(
                Signal::SIGTERM,
                &SigAction::new(SigHandler::SigIgn, flags, mask),
            )?;
        }
    } else {
        set(Signal::SIGTERM, w_handle_term)?;
    }
    set(Signal::SIGINT, w_handle_int)?;
    set(Signal::SIGHUP, w_handle_hup)?;
    set(Signal::SIGUSR1, w_handle_usr1)?;
    set(Signal::SIGUSR2, w_handle_usr2)?;
    set(Signal::SIGQUIT, w_handle_quit)?;
    unsafe {
        sigaction(
            Signal::SIGPIPE,
            &SigAction::new(SigHandler::SigIgn, flags, mask),
        )?;
        sigaction(
            Signal::SIGCHLD,
            &SigAction::new(SigHandler::SigDfl, flags, mask),
        )?;
    }

    // a forked child arrives with these blocked across the handoff; release
    // them only now that the handlers exist
    let handoff = crate::supervisor::launcher::handoff_sigset();
    nix::sys::signal::sigprocmask(
        nix::sys::signal::SigmaskHow::SIG_UNBLOCK,
        Some(&handoff),
        None,
    )?;
    Ok(())
}

/// Raise an inter-process signal toward the supervisor.
pub fn notify_supervisor(segment: &Segment, supervisor_pid: i32, reason: PmSignalReason) {
    if let Some(view) = segment.region(REGION_PMSIGNAL) {
        PmSignalTable::new(&view).set(reason);
    }
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(supervisor_pid),
        Signal::SIGUSR1,
    );
}

/// Child-side entry point for both launch strategies. Returns the exit code;
/// the caller exits the process with it.
pub fn child_main(bootstrap: WorkerBootstrap, inherited: Option<&Segment>) -> i32 {
    reset_pending_flags();
    let ignore_term = bootstrap.kind == WorkerKind::Checkpointer;
    if let Err(e) = install_worker_handlers(ignore_term) {
        log::error!("{}: signal setup failed: {e}", bootstrap.kind.as_str());
        return EXIT_CRASH;
    }

    // route stderr through the log collector when one is running
    if let Some(fd) = bootstrap.logpipe_fd {
        if bootstrap.kind != WorkerKind::SysLogger {
            unsafe {
                libc::dup2(fd, libc::STDERR_FILENO);
            }
        }
    }

    // dead-end children answer before touching anything else; they are
    // attached to shared memory (fork inheritance) but never use it
    if let Some(reason) = &bootstrap.reject_reason {
        return deadend::run(&bootstrap, reason);
    }

    // the log collector works the stderr pipe only; it never attaches
    if bootstrap.kind == WorkerKind::SysLogger {
        return syslogger::run(&bootstrap);
    }

    let attached;
    let segment: &Segment = match inherited {
        Some(seg) => seg,
        None => match Segment::attach(&bootstrap.segment_name, &bootstrap.config) {
            Ok(seg) => {
                attached = seg;
                &attached
            }
            Err(e) => {
                log::error!(
                    "{}: cannot attach shared memory {}: {e}",
                    bootstrap.kind.as_str(),
                    bootstrap.segment_name
                );
                return EXIT_CRASH;
            }
        },
    };

    match bootstrap.kind {
        WorkerKind::Session => session::run(&bootstrap, segment),
        _ => auxiliary::run(&bootstrap, segment),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_count_matches() {
        assert_eq!(WorkerKind::all().count(), WORKER_KIND_COUNT);
    }

    #[test]
    fn test_discriminants_are_dense() {
        for (i, kind) in WorkerKind::all().enumerate() {
            assert_eq!(kind as usize, i);
        }
    }

    #[test]
    fn test_singleton_split() {
        let multiplicities: Vec<_> = WorkerKind::all().filter(|k| !k.is_singleton()).collect();
        assert_eq!(
            multiplicities,
            vec![WorkerKind::AutoVacWorker, WorkerKind::Session, WorkerKind::BgWorker]
        );
    }

    #[test]
    fn test_bootstrap_serializes() {
        let b = WorkerBootstrap::plain(
            WorkerKind::Startup,
            Config::defaults(),
            "/seg".into(),
            1,
        );
        let json = serde_json::to_string(&b).unwrap();
        let back: WorkerBootstrap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, WorkerKind::Startup);
        assert_eq!(back.supervisor_pid, 1);
    }
}
