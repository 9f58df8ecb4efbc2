//! Auxiliary worker loops
//!
//! The long-lived singletons and the pooled internal workers. Each body here
//! is the process shell a real engine component would plug into: it obeys
//! the supervisor's signal protocol, keeps an eye on the death-watch pipe,
//! and performs the few state-file duties the rest of the system relies on
//! (recovery detection, the shutdown checkpoint's control-file update).

use std::os::fd::RawFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::control::{self, ClusterState};
use crate::shmem::pmsignal::PmSignalReason;
use crate::shmem::Segment;

use super::{
    notify_supervisor, take_hup_pending, take_usr2_pending, term_pending, WorkerBootstrap,
    WorkerKind, EXIT_CLEAN_FATAL,
};

/// Why the wait loop woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Terminate,
    FinishRequest,
    Reload,
    SupervisorGone,
}

/// Block until something requires attention. The poll timeout is short so a
/// flag raised between the check and the wait is never missed for long.
fn wait_for_wake(deathwatch: Option<RawFd>) -> Wake {
    loop {
        if term_pending() {
            return Wake::Terminate;
        }
        if take_usr2_pending() {
            return Wake::FinishRequest;
        }
        if take_hup_pending() {
            return Wake::Reload;
        }

        let timeout = PollTimeout::from(250u16);
        match deathwatch {
            Some(fd) => {
                let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
                let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
                match poll(&mut fds, timeout) {
                    Ok(n) if n > 0 => return Wake::SupervisorGone,
                    _ => {}
                }
            }
            None => {
                std::thread::sleep(Duration::from_millis(250));
            }
        }
    }
}

pub fn run(bootstrap: &WorkerBootstrap, segment: &Segment) -> i32 {
    match bootstrap.kind {
        WorkerKind::Startup => run_startup(bootstrap, segment),
        WorkerKind::Checkpointer => run_checkpointer(bootstrap),
        WorkerKind::Archiver => run_archiver(bootstrap),
        _ => run_idle(bootstrap),
    }
}

/// The startup worker: decide whether recovery is needed, drive it, and mark
/// the cluster in production. Exit 0 hands the supervisor the transition to
/// normal service.
fn run_startup(bootstrap: &WorkerBootstrap, segment: &Segment) -> i32 {
    let data_dir = &bootstrap.config.data_dir;

    let state = match control::read(data_dir) {
        Ok(data) => data.state,
        Err(e) => {
            log::error!("startup: {e}");
            return EXIT_CLEAN_FATAL;
        }
    };

    let needs_recovery = bootstrap.crash_recovery || state == ClusterState::InProduction;
    if needs_recovery {
        log::info!("database system was not shut down cleanly, running recovery");
        notify_supervisor(segment, bootstrap.supervisor_pid, PmSignalReason::RecoveryStarted);

        if bootstrap.config.hot_standby {
            std::thread::sleep(Duration::from_millis(50));
            notify_supervisor(segment, bootstrap.supervisor_pid, PmSignalReason::BeginHotStandby);
        }

        // redo would run here
        std::thread::sleep(Duration::from_millis(150));
        if term_pending() {
            return EXIT_CLEAN_FATAL;
        }
    }

    if let Err(e) = control::write(data_dir, ClusterState::InProduction) {
        log::error!("startup: {e}");
        return EXIT_CLEAN_FATAL;
    }
    log::info!("database system is ready");
    0
}

/// The checkpointer outlives every backend; SIGTERM is ignored and only the
/// finish request (or a quit) ends it. The shutdown checkpoint is what
/// stamps the cluster shut down cleanly.
fn run_checkpointer(bootstrap: &WorkerBootstrap) -> i32 {
    loop {
        match wait_for_wake(bootstrap.deathwatch_fd) {
            Wake::FinishRequest => {
                log::info!("checkpointer: writing shutdown checkpoint");
                if let Err(e) = control::write(&bootstrap.config.data_dir, ClusterState::ShutDown) {
                    log::error!("checkpointer: {e}");
                    return EXIT_CLEAN_FATAL;
                }
                return 0;
            }
            Wake::Reload => continue,
            Wake::Terminate => continue,
            Wake::SupervisorGone => return EXIT_CLEAN_FATAL,
        }
    }
}

/// The archiver drains on its own finish signal after the shutdown
/// checkpoint; a plain termination also ends it.
fn run_archiver(bootstrap: &WorkerBootstrap) -> i32 {
    loop {
        match wait_for_wake(bootstrap.deathwatch_fd) {
            Wake::FinishRequest => {
                log::info!("archiver: final archiving pass");
                return 0;
            }
            Wake::Terminate => return 0,
            Wake::Reload => continue,
            Wake::SupervisorGone => return EXIT_CLEAN_FATAL,
        }
    }
}

/// Generic shell for the workers whose engine body is elsewhere: wait until
/// the supervisor ends us.
fn run_idle(bootstrap: &WorkerBootstrap) -> i32 {
    loop {
        match wait_for_wake(bootstrap.deathwatch_fd) {
            Wake::Terminate => return 0,
            Wake::FinishRequest | Wake::Reload => continue,
            Wake::SupervisorGone => return EXIT_CLEAN_FATAL,
        }
    }
}
