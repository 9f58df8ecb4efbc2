//! The supervisor process
//!
//! A single-threaded, signal-driven parent that owns the cluster's shared
//! memory and listening sockets, spawns every worker, and drives the
//! lifecycle phase machine. It never evaluates queries and never takes a
//! shared-memory lock: everything it does runs to completion between two
//! iterations of one poll loop, which is what keeps it recoverable when a
//! child corrupts shared state.

pub mod admission;
pub mod bgworker;
pub mod latch;
pub mod launcher;
pub mod lifecycle;
mod machine;
pub mod pidfile;
pub mod registry;
pub mod signals;
pub mod sockets;

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use crate::config::Config;
use crate::control;
use crate::shmem::slots::SlotAllocator;
use crate::shmem::Segment;
use crate::worker::{WorkerKind, WORKER_KIND_COUNT};

use bgworker::BgWorkerScheduler;
use latch::{Latch, WaitEvent};
use lifecycle::{PmPhase, ShutdownMode, StartupStatus};
use pidfile::{PidFile, PidFileStatus};
use registry::ChildRegistry;
use sockets::ListenerSet;

/// Exit codes of the supervisor process.
pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_BADCONFIG: i32 = 2;

/// How long unresponsive children get after a quit-with-core before the
/// escalation to SIGKILL.
pub const KILL_CHILDREN_AFTER: Duration = Duration::from_secs(5);
/// Pidfile revalidation interval.
const PIDFILE_CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// Unix-socket file touch interval, under the common 1-hour tmp reaper.
const SOCKET_TOUCH_INTERVAL: Duration = Duration::from_secs(58 * 60);

pub struct Supervisor {
    cfg: Config,
    latch: Latch,
    listeners: ListenerSet,
    registry: ChildRegistry,
    /// One live pid per singleton kind, indexed by kind discriminant.
    singletons: [Option<i32>; WORKER_KIND_COUNT],
    phase: PmPhase,
    shutdown_mode: ShutdownMode,
    fatal_error: bool,
    conns_allowed: bool,
    startup_status: StartupStatus,
    segment: Option<Segment>,
    segment_name: String,
    slot_alloc: SlotAllocator,
    bgworkers: BgWorkerScheduler,
    pidfile: PidFile,
    /// Children inherit the read end; EOF there means we are gone.
    deathwatch_read: OwnedFd,
    #[allow(dead_code)]
    deathwatch_write: OwnedFd,
    /// Stderr capture pipe when the log collector is enabled.
    logpipe: Option<(OwnedFd, OwnedFd)>,
    /// SIGKILL escalation deadline, armed by crash and immediate shutdown.
    abort_deadline: Option<Instant>,
    next_pidfile_check: Instant,
    next_socket_touch: Instant,
    /// The archiver may be revived at most once per reap event.
    archiver_restarted_this_reap: bool,
    ready_announced: bool,
}

impl Supervisor {
    /// Bring the cluster up to the point where the event loop can take over:
    /// interlock, sockets, shared memory, the log collector, and the startup
    /// worker.
    pub fn boot(cfg: Config) -> Result<Supervisor, BootError> {
        // a data directory without a control file was never bootstrapped
        control::read(&cfg.data_dir).map_err(BootError::Control)?;

        let start_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut pidfile = PidFile::create(&cfg, start_epoch).map_err(BootError::PidFile)?;
        if let Err(e) = pidfile::write_opts_file(&cfg.data_dir) {
            log::warn!("could not write opts file: {e}");
        }

        let latch = Latch::new().map_err(BootError::Io)?;
        signals::install_supervisor_handlers().map_err(BootError::Signals)?;

        let (deathwatch_read, deathwatch_write) =
            pipe2(OFlag::empty()).map_err(BootError::Pipe)?;
        set_cloexec(deathwatch_write.as_raw_fd());

        let logpipe = if cfg.logging_collector {
            let (r, w) = pipe2(OFlag::empty()).map_err(BootError::Pipe)?;
            Some((r, w))
        } else {
            None
        };

        let listeners = ListenerSet::establish(&cfg).map_err(BootError::Sockets)?;

        let segment_name = Segment::object_name(cfg.port, std::process::id());
        let segment = Segment::create(&segment_name, &cfg).map_err(BootError::Shmem)?;
        pidfile
            .publish_segment(&segment_name)
            .map_err(BootError::PidFile)?;
        pidfile
            .publish_status(PidFileStatus::Starting)
            .map_err(BootError::PidFile)?;

        let slot_alloc = SlotAllocator::new(cfg.live_children_ceiling() as usize);

        let now = Instant::now();
        Ok(Supervisor {
            cfg,
            latch,
            listeners,
            registry: ChildRegistry::new(),
            singletons: [None; WORKER_KIND_COUNT],
            phase: PmPhase::Init,
            shutdown_mode: ShutdownMode::None,
            fatal_error: false,
            conns_allowed: true,
            startup_status: StartupStatus::NotRunning,
            segment: Some(segment),
            segment_name,
            slot_alloc,
            bgworkers: BgWorkerScheduler::new(),
            pidfile,
            deathwatch_read,
            deathwatch_write,
            logpipe,
            abort_deadline: None,
            next_pidfile_check: now + PIDFILE_CHECK_INTERVAL,
            next_socket_touch: now + SOCKET_TOUCH_INTERVAL,
            archiver_restarted_this_reap: false,
            ready_announced: false,
        })
    }

    /// The event loop. Never returns under normal operation; the state
    /// machine exits the process.
    pub fn run(&mut self) -> ! {
        log::info!(
            "supervisor started, pid {} port {} data directory {}",
            std::process::id(),
            self.cfg.port,
            self.cfg.data_dir.display()
        );

        if self.cfg.logging_collector {
            self.start_singleton(WorkerKind::SysLogger);
        }
        if let Err(e) = self.launch_startup(false) {
            log::error!("could not launch the startup worker: {e}");
            self.exit_supervisor(EXIT_FAILURE);
        }

        loop {
            let budget = self.sleep_budget();
            let socket_fds: Vec<RawFd> = if self.accepting_sockets() {
                self.listeners.raw_fds()
            } else {
                Vec::new()
            };

            let events = match latch::wait(&self.latch, &socket_fds, budget) {
                Ok(ev) => ev,
                Err(e) => {
                    log::error!("wait failed: {e}");
                    self.exit_supervisor(EXIT_FAILURE);
                }
            };

            if events.contains(&WaitEvent::Latch) {
                self.latch.clear();
            }

            // fixed priority, independent of which event woke us
            if let Some(mode) = signals::take_pending_shutdown() {
                self.process_shutdown_request(mode);
            }
            if signals::take_pending_reload() {
                self.process_reload();
            }
            if signals::take_pending_child_exit() {
                self.reap_children();
            }
            if signals::take_pending_pmsignal() {
                self.process_pmsignals();
            }
            for event in &events {
                if let WaitEvent::Accept(idx) = event {
                    self.drain_accepts(*idx);
                }
            }

            self.check_kill_escalation();
            self.advance_state_machine();
            self.launch_missing_singletons();
            self.run_bgworker_pass();
            self.periodic_housekeeping();
        }
    }

    /// Sessions and rejections are accepted until the dead-end drain begins.
    fn accepting_sockets(&self) -> bool {
        !matches!(self.phase, PmPhase::WaitDeadEnd | PmPhase::NoChildren)
    }

    fn sleep_budget(&self) -> Duration {
        if let Some(deadline) = self.abort_deadline {
            return deadline.saturating_duration_since(Instant::now());
        }
        self.bgworkers
            .sleep_budget(Instant::now(), self.cfg.bgworker_restart_floor)
    }

    fn periodic_housekeeping(&mut self) {
        let now = Instant::now();
        if now >= self.next_pidfile_check {
            self.next_pidfile_check = now + PIDFILE_CHECK_INTERVAL;
            if !self.pidfile.still_ours() {
                log::error!("pidfile vanished or was altered; shutting down immediately");
                signals::post_shutdown_request(ShutdownMode::Immediate);
            }
        }
        if now >= self.next_socket_touch {
            self.next_socket_touch = now + SOCKET_TOUCH_INTERVAL;
            self.listeners.touch_unix_files();
        }
    }

    /// Tear down in the order a successor depends on: listeners first, then
    /// socket files, then the pidfile, so a half-removed state is never
    /// observable as a live server.
    pub fn exit_supervisor(&mut self, code: i32) -> ! {
        let _ = self.pidfile.publish_status(PidFileStatus::Stopping);

        if let Some(segment) = self.segment.take() {
            segment.destroy();
        }
        self.listeners.close_all();
        self.listeners.remove_unix_files();
        self.pidfile.unlink();
        pidfile::remove_opts_file(&self.cfg.data_dir);

        log::info!("supervisor exiting with status {code}");
        std::process::exit(code);
    }

    pub(crate) fn deathwatch_fd(&self) -> RawFd {
        self.deathwatch_read.as_raw_fd()
    }

    pub(crate) fn logpipe_write_fd(&self) -> Option<RawFd> {
        self.logpipe.as_ref().map(|(_, w)| w.as_raw_fd())
    }

    pub(crate) fn logpipe_read_fd(&self) -> Option<RawFd> {
        self.logpipe.as_ref().map(|(r, _)| r.as_raw_fd())
    }
}

fn set_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error(transparent)]
    Control(#[from] crate::control::ControlError),

    #[error(transparent)]
    PidFile(#[from] pidfile::PidFileError),

    #[error(transparent)]
    Sockets(#[from] sockets::SocketError),

    #[error(transparent)]
    Shmem(#[from] crate::shmem::ShmemError),

    #[error("signal setup failed: {0}")]
    Signals(nix::errno::Errno),

    #[error("pipe setup failed: {0}")]
    Pipe(nix::errno::Errno),

    #[error("supervisor setup failed: {0}")]
    Io(std::io::Error),
}

impl BootError {
    /// Configuration-class failures exit 2, resource-class failures exit 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            BootError::Control(_) => EXIT_BADCONFIG,
            _ => EXIT_FAILURE,
        }
    }
}
