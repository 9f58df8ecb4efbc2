//! Lifecycle transitions and child-exit handling
//!
//! Everything here runs to completion inside one event-loop iteration. The
//! ordering contract: a reap pass drains every dead child before the phase
//! machine advances, so no stale pid is ever mistaken for a live child.

use std::time::Instant;

use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::shmem::pmsignal::{PmSignalReason, PmSignalTable};
use crate::shmem::slots::{SlotArray, SLOT_FLAG_WALSENDER};
use crate::shmem::{Segment, REGION_PMSIGNAL, REGION_PROC_SLOTS};
use crate::worker::{WorkerBootstrap, WorkerKind};

use super::admission::{self, AdmissionState, AdmissionVerdict, ConnectionKind};
use super::bgworker::BgwStartTime;
use super::launcher::{self, signal_child, LaunchEnv};
use super::lifecycle::{PmPhase, ShutdownMode, StartupStatus};
use super::pidfile::PidFileStatus;
use super::registry::{ChildRecord, KindMask};
use super::sockets::ClientStream;
use super::{Supervisor, EXIT_FAILURE, EXIT_OK, KILL_CHILDREN_AFTER};

use std::os::fd::{AsRawFd, RawFd};

/// How a child left, as reported by waitpid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildExit {
    Code(i32),
    Signal(Signal),
}

impl ChildExit {
    /// Status 0 is success and status 1 is a clean fatal; anything else,
    /// including any signal death, is a crash.
    fn crashed(&self) -> bool {
        match self {
            ChildExit::Code(code) => *code != 0 && *code != 1,
            ChildExit::Signal(_) => true,
        }
    }

    fn clean(&self) -> bool {
        matches!(self, ChildExit::Code(0))
    }

    fn describe(&self) -> String {
        match self {
            ChildExit::Code(code) => format!("exit status {code}"),
            ChildExit::Signal(sig) => format!("signal {sig}"),
        }
    }
}

impl Supervisor {
    // ----- singleton bookkeeping -------------------------------------------

    fn singleton(&self, kind: WorkerKind) -> Option<i32> {
        self.singletons[kind as usize]
    }

    fn set_singleton(&mut self, kind: WorkerKind, pid: i32) {
        self.singletons[kind as usize] = Some(pid);
    }

    fn clear_singleton(&mut self, kind: WorkerKind, pid: i32) {
        if self.singletons[kind as usize] == Some(pid) {
            self.singletons[kind as usize] = None;
        }
    }

    // ----- launch plumbing -------------------------------------------------

    fn base_bootstrap(&self, kind: WorkerKind) -> WorkerBootstrap {
        let mut bootstrap = WorkerBootstrap::plain(
            kind,
            self.cfg.clone(),
            self.segment_name.clone(),
            std::process::id() as i32,
        );
        bootstrap.deathwatch_fd = Some(self.deathwatch_fd());
        bootstrap.logpipe_fd = self.logpipe_write_fd();
        bootstrap.crash_recovery = self.fatal_error;
        bootstrap
    }

    /// Descriptors a forked child must not keep: the supervisor's listeners,
    /// the latch pipe, the death-watch write end, and the side of the log
    /// pipe it does not own.
    fn close_list(&self, kind: WorkerKind) -> Vec<RawFd> {
        let mut fds = self.listeners.raw_fds();
        fds.push(self.latch.read_fd());
        fds.push(self.latch.write_fd());
        fds.push(self.deathwatch_write.as_raw_fd());
        if kind == WorkerKind::SysLogger {
            if let Some(w) = self.logpipe_write_fd() {
                fds.push(w);
            }
        } else if let Some(r) = self.logpipe_read_fd() {
            fds.push(r);
        }
        fds
    }

    fn launch_child(&mut self, bootstrap: WorkerBootstrap) -> Result<i32, launcher::LaunchError> {
        let close = self.close_list(bootstrap.kind);
        let env = LaunchEnv {
            segment: self.segment.as_ref(),
            close_in_child: &close,
        };
        launcher::launch(self.cfg.launch_strategy, bootstrap, &env)
    }

    fn register_child(&mut self, record: ChildRecord) {
        if let Err(e) = self.registry.add(record) {
            // our pid bookkeeping diverged from the kernel's
            log::error!("internal error: {e}");
            self.exit_supervisor(EXIT_FAILURE);
        }
    }

    /// Start a singleton worker. SysLogger gets the read end of the log pipe
    /// instead of the write end and stays out of the registry: it is not
    /// attached to shared memory.
    pub(super) fn start_singleton(&mut self, kind: WorkerKind) -> Option<i32> {
        let mut bootstrap = self.base_bootstrap(kind);
        if kind == WorkerKind::SysLogger {
            bootstrap.logpipe_fd = self.logpipe_read_fd();
            bootstrap.logpipe_fd?;
        }

        match self.launch_child(bootstrap) {
            Ok(pid) => {
                self.set_singleton(kind, pid);
                if kind != WorkerKind::SysLogger {
                    self.register_child(ChildRecord {
                        pid,
                        kind,
                        slot: None,
                        cancel_token: 0,
                        dead_end: false,
                        bgworker_notify: false,
                    });
                }
                log::info!("started {} (pid {pid})", kind.as_str());
                Some(pid)
            }
            Err(e) => {
                log::error!("could not start {}: {e}", kind.as_str());
                None
            }
        }
    }

    /// Launch the startup worker and enter the Startup phase.
    pub(super) fn launch_startup(
        &mut self,
        crash_recovery: bool,
    ) -> Result<(), launcher::LaunchError> {
        let mut bootstrap = self.base_bootstrap(WorkerKind::Startup);
        bootstrap.crash_recovery = crash_recovery;

        let pid = self.launch_child(bootstrap)?;
        self.set_singleton(WorkerKind::Startup, pid);
        self.register_child(ChildRecord {
            pid,
            kind: WorkerKind::Startup,
            slot: None,
            cancel_token: 0,
            dead_end: false,
            bgworker_notify: false,
        });
        self.startup_status = StartupStatus::Running;
        self.phase = PmPhase::Startup;
        log::info!("started startup worker (pid {pid})");
        Ok(())
    }

    // ----- shared-memory views ---------------------------------------------

    fn with_slots<R>(&self, f: impl FnOnce(&SlotArray<'_>) -> R) -> Option<R> {
        let seg: &Segment = self.segment.as_ref()?;
        let view = seg.region(REGION_PROC_SLOTS)?;
        let slots = SlotArray::new(&view);
        Some(f(&slots))
    }

    fn slot_is_walsender(&self, slot: usize) -> bool {
        self.with_slots(|s| s.has_flag(slot, SLOT_FLAG_WALSENDER))
            .unwrap_or(false)
    }

    fn is_walsender(&self, rec: &ChildRecord) -> bool {
        rec.kind == WorkerKind::Session
            && !rec.dead_end
            && rec.slot.map(|s| self.slot_is_walsender(s)).unwrap_or(false)
    }

    fn session_count_excluding_walsenders(&self) -> usize {
        self.registry
            .iter(KindMask::of(WorkerKind::Session))
            .filter(|r| !r.dead_end && !self.is_walsender(r))
            .count()
    }

    fn walsender_pids(&self) -> Vec<i32> {
        self.registry
            .iter(KindMask::of(WorkerKind::Session))
            .filter(|r| self.is_walsender(r))
            .map(|r| r.pid)
            .collect()
    }

    // ----- shutdown requests -----------------------------------------------

    pub(super) fn process_shutdown_request(&mut self, requested: ShutdownMode) {
        let mode = self.shutdown_mode.merge(requested);
        if mode == ShutdownMode::None || mode == self.shutdown_mode {
            return;
        }
        self.shutdown_mode = mode;
        self.conns_allowed = false;
        let _ = self.pidfile.publish_status(PidFileStatus::Stopping);

        match mode {
            ShutdownMode::Smart => {
                log::info!("received smart shutdown request; waiting for sessions to end");
                // the phase machine moves on once the last session is gone
            }
            ShutdownMode::Fast => {
                log::info!("received fast shutdown request; terminating active sessions");
                if !self.phase.winding_down() {
                    self.enter_stop_backends();
                }
            }
            ShutdownMode::Immediate => {
                log::warn!("received immediate shutdown request; quitting all children");
                let sig = self.quit_signal();
                let pids: Vec<i32> = self.registry.iter(KindMask::ALL).map(|r| r.pid).collect();
                for pid in pids {
                    let _ = signal_child(pid, sig);
                }
                if self.singleton(WorkerKind::Startup).is_some() {
                    self.startup_status = StartupStatus::Signaled;
                }
                self.abort_deadline = Some(Instant::now() + KILL_CHILDREN_AFTER);
                if !matches!(self.phase, PmPhase::WaitDeadEnd | PmPhase::NoChildren) {
                    self.phase = PmPhase::WaitBackends;
                }
            }
            ShutdownMode::None => unreachable!(),
        }
    }

    fn quit_signal(&self) -> Signal {
        if self.cfg.send_abort_for_crash {
            Signal::SIGABRT
        } else {
            Signal::SIGQUIT
        }
    }

    /// Tell every ordinary child to terminate. The walsender class and the
    /// archiver outlive this point and are drained after the shutdown
    /// checkpoint; the checkpointer receives the signal but ignores it. The
    /// log collector is excluded so the deaths that follow are still logged.
    fn enter_stop_backends(&mut self) {
        self.phase = PmPhase::StopBackends;
        log::info!("telling server processes to shut down");

        let targets: Vec<i32> = self
            .registry
            .iter(KindMask::ALL.without(KindMask::of(WorkerKind::Archiver)))
            .filter(|r| !r.dead_end && !self.is_walsender(r))
            .map(|r| r.pid)
            .collect();
        for pid in targets {
            let _ = signal_child(pid, Signal::SIGTERM);
        }
        if self.singleton(WorkerKind::Startup).is_some() {
            self.startup_status = StartupStatus::Signaled;
        }
        self.phase = PmPhase::WaitBackends;
    }

    // ----- reload ----------------------------------------------------------

    pub(super) fn process_reload(&mut self) {
        log::info!("received reload request, re-reading configuration");
        match self.cfg.reload() {
            Ok(changed) if changed.is_empty() => {
                log::debug!("configuration unchanged");
            }
            Ok(changed) => {
                log::info!("configuration changed: {}", changed.join(", "));
            }
            Err(e) => {
                log::warn!("configuration reload failed, keeping previous values: {e}");
            }
        }
        self.registry.signal_many(KindMask::ALL, Signal::SIGHUP);
        if let Some(pid) = self.singleton(WorkerKind::SysLogger) {
            let _ = signal_child(pid, Signal::SIGHUP);
        }
    }

    // ----- reaping ---------------------------------------------------------

    /// Drain every reportable child exit before anything else happens.
    pub(super) fn reap_children(&mut self) {
        self.archiver_restarted_this_reap = false;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.handle_child_exit(pid.as_raw(), ChildExit::Code(code));
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.handle_child_exit(pid.as_raw(), ChildExit::Signal(sig));
                }
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(e) => {
                    log::error!("waitpid failed: {e}");
                    break;
                }
            }
        }
    }

    fn handle_child_exit(&mut self, pid: i32, exit: ChildExit) {
        // the log collector first, and before anything else happens, so the
        // messages about the deaths that follow are not lost
        if self.singleton(WorkerKind::SysLogger) == Some(pid) {
            self.clear_singleton(WorkerKind::SysLogger, pid);
            if self.cfg.logging_collector
                && self.shutdown_mode == ShutdownMode::None
                && !self.phase.winding_down()
            {
                log::warn!("log collector exited ({}), restarting it", exit.describe());
                self.start_singleton(WorkerKind::SysLogger);
            }
            return;
        }

        let record = self.registry.remove(pid);
        let kind = record.as_ref().map(|r| r.kind);

        if let Some(rec) = &record {
            if let Some(slot) = rec.slot {
                self.with_slots(|s| s.release(slot));
                self.slot_alloc.release(slot);
            }
            if rec.kind.is_singleton() {
                self.clear_singleton(rec.kind, pid);
            }
        }

        match kind {
            Some(WorkerKind::Startup) => self.handle_startup_exit(pid, exit),
            Some(WorkerKind::Checkpointer) => {
                if self.phase == PmPhase::ShutdownCheckpoint && exit.clean() {
                    log::info!("shutdown checkpoint complete");
                    self.begin_wal_drain();
                } else if !exit.clean() {
                    // the checkpointer owns dirty shared state; any unclean
                    // death, clean-fatal included, is a crash
                    self.handle_child_crash(pid, "checkpointer", exit);
                }
            }
            Some(WorkerKind::BgWorker) => {
                if let Some(idx) = self.bgworkers.report_exit(pid, Instant::now()) {
                    let entry = &self.bgworkers.entries()[idx];
                    if exit.crashed() {
                        log::warn!(
                            "background worker {:?} crashed ({})",
                            entry.name,
                            exit.describe()
                        );
                    }
                    // registrant asked to hear about state changes
                    if entry.notify_pid != 0 {
                        let _ = signal_child(entry.notify_pid, Signal::SIGUSR1);
                    }
                }
                if exit.crashed() {
                    self.handle_child_crash(pid, "background worker", exit);
                }
            }
            Some(other) => {
                if exit.crashed() && !record.as_ref().map(|r| r.dead_end).unwrap_or(false) {
                    self.handle_child_crash(pid, other.as_str(), exit);
                } else {
                    log::debug!("{} (pid {pid}) exited, {}", other.as_str(), exit.describe());
                }
            }
            None => {
                // not in the registry; a stale singleton entry would make us
                // wait forever on a pid that is already gone
                for kind in WorkerKind::all() {
                    self.clear_singleton(kind, pid);
                }
                log::debug!("untracked child {pid} exited, {}", exit.describe());
            }
        }

        // the archiver is revived at most once per reap event, whatever the
        // phase, as long as nothing worse is going on
        if kind == Some(WorkerKind::Archiver)
            && self.cfg.archive_mode
            && !self.archiver_restarted_this_reap
            && self.shutdown_mode == ShutdownMode::None
            && !self.fatal_error
            && !exit.crashed()
        {
            self.archiver_restarted_this_reap = true;
            self.start_singleton(WorkerKind::Archiver);
        }
    }

    fn handle_startup_exit(&mut self, pid: i32, exit: ChildExit) {
        if exit.clean() {
            self.startup_status = StartupStatus::NotRunning;
            if matches!(
                self.phase,
                PmPhase::Startup | PmPhase::Recovery | PmPhase::HotStandby
            ) {
                self.phase = PmPhase::Run;
                self.fatal_error = false;
                self.conns_allowed = self.shutdown_mode == ShutdownMode::None;
                if !self.ready_announced {
                    let _ = self.pidfile.publish_status(PidFileStatus::Ready);
                    self.ready_announced = true;
                }
                log::info!("database system is ready to accept connections");
                self.bgworkers.request_pass();
            }
            return;
        }

        // an unclean death we asked for is part of shutdown or crash cleanup
        if self.startup_status == StartupStatus::Signaled
            || self.shutdown_mode != ShutdownMode::None
            || self.fatal_error
        {
            self.startup_status = StartupStatus::NotRunning;
            return;
        }

        if self.phase == PmPhase::Startup || !exit.crashed() {
            // the very first recovery attempt failed, or startup reported a
            // clean fatal: retrying would loop, so give up now
            log::error!("startup worker failed ({}), aborting", exit.describe());
            self.exit_supervisor(EXIT_FAILURE);
        }

        self.startup_status = StartupStatus::Crashed;
        self.handle_child_crash(pid, "startup worker", exit);
    }

    /// The crash cascade: one dying child takes the whole cluster through a
    /// shared-memory reset. Walks the registry, signals every survivor,
    /// arms the kill escalation, and parks the machine in WaitBackends.
    fn handle_child_crash(&mut self, pid: i32, what: &str, exit: ChildExit) {
        if self.fatal_error || self.shutdown_mode == ShutdownMode::Immediate {
            // a cascade is already running; this death is part of it
            return;
        }
        log::warn!(
            "{what} (pid {pid}) was terminated by {}; terminating all other server processes",
            exit.describe()
        );
        self.fatal_error = true;
        self.conns_allowed = false;

        let sig = self.quit_signal();
        let survivors: Vec<i32> = self
            .registry
            .iter(KindMask::ALL)
            .map(|r| r.pid)
            .filter(|p| *p != pid)
            .collect();
        for survivor in survivors {
            let _ = signal_child(survivor, sig);
        }
        if self.singleton(WorkerKind::Startup).is_some() {
            self.startup_status = StartupStatus::Signaled;
        }

        self.abort_deadline = Some(Instant::now() + KILL_CHILDREN_AFTER);
        if !matches!(self.phase, PmPhase::WaitDeadEnd | PmPhase::NoChildren) {
            self.phase = PmPhase::WaitBackends;
        }
    }

    /// Past the escalation deadline, survivors get the hard kill.
    pub(super) fn check_kill_escalation(&mut self) {
        let Some(deadline) = self.abort_deadline else {
            return;
        };
        if Instant::now() < deadline {
            return;
        }
        self.abort_deadline = None;
        if self.registry.is_empty() {
            return;
        }
        let sig = if self.cfg.send_abort_for_crash {
            Signal::SIGABRT
        } else {
            Signal::SIGKILL
        };
        log::warn!(
            "children did not exit within {}s, escalating to {sig}",
            KILL_CHILDREN_AFTER.as_secs()
        );
        let pids: Vec<i32> = self.registry.iter(KindMask::ALL).map(|r| r.pid).collect();
        for pid in pids {
            let _ = signal_child(pid, sig);
        }
    }

    // ----- inter-process signal channel ------------------------------------

    pub(super) fn process_pmsignals(&mut self) {
        let Some(view) = self
            .segment
            .as_ref()
            .and_then(|s| s.region(REGION_PMSIGNAL))
        else {
            return;
        };
        let table = PmSignalTable::new(&view);

        if table.consume(PmSignalReason::RecoveryStarted) && self.phase == PmPhase::Startup {
            log::info!("recovery confirmed in progress");
            self.phase = PmPhase::Recovery;
            self.bgworkers.request_pass();
        }

        if table.consume(PmSignalReason::BeginHotStandby)
            && self.phase == PmPhase::Recovery
            && self.cfg.hot_standby
        {
            log::info!("consistent recovery state reached, accepting read-only sessions");
            self.phase = PmPhase::HotStandby;
            self.conns_allowed = self.shutdown_mode == ShutdownMode::None;
            if !self.ready_announced {
                let _ = self.pidfile.publish_status(PidFileStatus::Ready);
                self.ready_announced = true;
            }
            self.bgworkers.request_pass();
        }

        if table.consume(PmSignalReason::StartWalReceiver)
            && self.singleton(WorkerKind::WalReceiver).is_none()
            && self.shutdown_mode == ShutdownMode::None
            && !self.fatal_error
            && matches!(
                self.phase,
                PmPhase::Startup | PmPhase::Recovery | PmPhase::HotStandby | PmPhase::Run
            )
        {
            self.start_singleton(WorkerKind::WalReceiver);
        }

        if table.consume(PmSignalReason::StartAutovacWorker) {
            self.maybe_start_autovac_worker();
        }

        if table.consume(PmSignalReason::BackgroundWorkerChange) {
            self.bgworkers.request_pass();
        }

        // AdvanceStateMachine has no payload: the machine advances at the
        // end of this loop iteration anyway
        table.consume(PmSignalReason::AdvanceStateMachine);

        if table.consume(PmSignalReason::RotateLogfile) {
            if let Some(pid) = self.singleton(WorkerKind::SysLogger) {
                let _ = signal_child(pid, Signal::SIGUSR1);
            }
        }
    }

    fn maybe_start_autovac_worker(&mut self) {
        if !self.cfg.autovacuum || self.fatal_error || self.shutdown_mode != ShutdownMode::None {
            return;
        }
        let state = self.admission_snapshot();
        if admission::admission_verdict(&state, ConnectionKind::AutoVacWorker)
            != AdmissionVerdict::Ok
        {
            return;
        }
        let Some(slot) = self.slot_alloc.alloc() else {
            return;
        };
        let token = admission::generate_cancel_token();
        let mut bootstrap = self.base_bootstrap(WorkerKind::AutoVacWorker);
        bootstrap.slot = Some(slot);
        bootstrap.cancel_token = Some(token);
        match self.launch_child(bootstrap) {
            Ok(pid) => {
                self.with_slots(|s| s.claim(slot, pid, token));
                self.register_child(ChildRecord {
                    pid,
                    kind: WorkerKind::AutoVacWorker,
                    slot: Some(slot),
                    cancel_token: token,
                    dead_end: false,
                    bgworker_notify: false,
                });
                log::debug!("started autovacuum worker (pid {pid})");
            }
            Err(e) => {
                self.slot_alloc.release(slot);
                log::warn!("could not start autovacuum worker: {e}");
            }
        }
    }

    // ----- phase machine ---------------------------------------------------

    pub(super) fn advance_state_machine(&mut self) {
        match self.phase {
            PmPhase::Run | PmPhase::HotStandby => {
                if self.shutdown_mode == ShutdownMode::Smart
                    && self.session_count_excluding_walsenders() == 0
                {
                    log::info!("last session gone, proceeding with shutdown");
                    self.enter_stop_backends();
                    self.advance_state_machine();
                }
            }
            PmPhase::WaitBackends => self.advance_wait_backends(),
            PmPhase::WaitWalSenders => {
                if self.walsender_pids().is_empty()
                    && self.singleton(WorkerKind::Archiver).is_none()
                {
                    self.phase = PmPhase::WaitDeadEnd;
                    self.advance_state_machine();
                }
            }
            PmPhase::WaitDeadEnd => {
                if self.registry.is_empty() {
                    self.phase = PmPhase::NoChildren;
                    self.advance_state_machine();
                }
            }
            PmPhase::NoChildren => self.decide_final(),
            _ => {}
        }
    }

    fn advance_wait_backends(&mut self) {
        let backend_mask = KindMask::of(WorkerKind::Session)
            .union(KindMask::of(WorkerKind::AutoVacWorker))
            .union(KindMask::of(WorkerKind::BgWorker));
        let backends_left = self
            .registry
            .iter(backend_mask)
            .filter(|r| !r.dead_end && !self.is_walsender(r))
            .count();

        let singles_left = [
            WorkerKind::Startup,
            WorkerKind::BgWriter,
            WorkerKind::WalWriter,
            WorkerKind::WalReceiver,
            WorkerKind::WalSummarizer,
            WorkerKind::AutoVacLauncher,
            WorkerKind::SlotSync,
        ]
        .iter()
        .any(|k| self.singleton(*k).is_some());

        if backends_left > 0 || singles_left {
            return;
        }

        if self.fatal_error || self.shutdown_mode == ShutdownMode::Immediate {
            // no shutdown checkpoint after a crash or an immediate request;
            // recovery at next boot settles the books
            self.phase = PmPhase::WaitDeadEnd;
        } else if let Some(cp) = self.singleton(WorkerKind::Checkpointer) {
            log::info!("asking the checkpointer to write the shutdown checkpoint");
            let _ = signal_child(cp, Signal::SIGUSR2);
            self.phase = PmPhase::ShutdownCheckpoint;
        } else if let Some(cp) = self.start_singleton(WorkerKind::Checkpointer) {
            // never had one; bring one up just for the shutdown checkpoint
            let _ = signal_child(cp, Signal::SIGUSR2);
            self.phase = PmPhase::ShutdownCheckpoint;
        } else {
            log::warn!("no checkpointer available, skipping the shutdown checkpoint");
            self.phase = PmPhase::WaitDeadEnd;
        }
        self.advance_state_machine();
    }

    /// Shutdown checkpoint is on disk; the WAL holdouts may finish now.
    fn begin_wal_drain(&mut self) {
        for pid in self.walsender_pids() {
            let _ = signal_child(pid, Signal::SIGUSR2);
        }
        if let Some(pid) = self.singleton(WorkerKind::Archiver) {
            let _ = signal_child(pid, Signal::SIGUSR2);
        }
        self.phase = PmPhase::WaitWalSenders;
    }

    fn decide_final(&mut self) {
        if self.shutdown_mode != ShutdownMode::None {
            let code = if self.fatal_error { EXIT_FAILURE } else { EXIT_OK };
            log::info!("database system is shut down");
            self.exit_supervisor(code);
        }
        if self.fatal_error {
            if self.cfg.restart_after_crash {
                self.reinitialize_after_crash();
            } else {
                log::error!("a server process crashed and restart_after_crash is off");
                self.exit_supervisor(EXIT_FAILURE);
            }
        }
    }

    /// Every child is gone: rebuild the shared segment and start over. The
    /// segment keeps its name, so the pidfile entry stays valid.
    fn reinitialize_after_crash(&mut self) {
        log::warn!("all server processes terminated; reinitializing shared memory");

        if let Some(old) = self.segment.take() {
            old.destroy();
        }
        match Segment::create(&self.segment_name, &self.cfg) {
            Ok(segment) => self.segment = Some(segment),
            Err(e) => {
                log::error!("could not reinitialize shared memory: {e}");
                self.exit_supervisor(EXIT_FAILURE);
            }
        }
        self.slot_alloc = crate::shmem::slots::SlotAllocator::new(
            self.cfg.live_children_ceiling() as usize,
        );
        self.fatal_error = false;
        self.conns_allowed = false;
        self.abort_deadline = None;
        let _ = self.pidfile.publish_status(PidFileStatus::Starting);
        self.ready_announced = false;

        if let Err(e) = self.launch_startup(true) {
            log::error!("could not relaunch the startup worker: {e}");
            self.exit_supervisor(EXIT_FAILURE);
        }
    }

    // ----- opportunistic singleton starts ----------------------------------

    /// (Re)start singletons that should be running in the current phase but
    /// are not, one batch per loop iteration.
    pub(super) fn launch_missing_singletons(&mut self) {
        if self.fatal_error
            || self.shutdown_mode == ShutdownMode::Immediate
            || self.phase.winding_down()
        {
            return;
        }

        if self.cfg.logging_collector && self.singleton(WorkerKind::SysLogger).is_none() {
            self.start_singleton(WorkerKind::SysLogger);
        }

        if matches!(
            self.phase,
            PmPhase::Startup | PmPhase::Recovery | PmPhase::HotStandby | PmPhase::Run
        ) {
            for kind in [WorkerKind::Checkpointer, WorkerKind::BgWriter] {
                if self.singleton(kind).is_none() {
                    self.start_singleton(kind);
                }
            }
        }

        if self.phase == PmPhase::Run {
            if self.singleton(WorkerKind::WalWriter).is_none() {
                self.start_singleton(WorkerKind::WalWriter);
            }
            if self.cfg.autovacuum && self.singleton(WorkerKind::AutoVacLauncher).is_none() {
                self.start_singleton(WorkerKind::AutoVacLauncher);
            }
        }

        if matches!(self.phase, PmPhase::Run | PmPhase::HotStandby)
            && self.cfg.archive_mode
            && self.singleton(WorkerKind::Archiver).is_none()
        {
            self.start_singleton(WorkerKind::Archiver);
        }

        if matches!(self.phase, PmPhase::Run | PmPhase::Recovery | PmPhase::HotStandby)
            && self.cfg.wal_summarize
            && self.singleton(WorkerKind::WalSummarizer).is_none()
        {
            self.start_singleton(WorkerKind::WalSummarizer);
        }

        if self.phase == PmPhase::HotStandby
            && self.cfg.slot_sync
            && self.singleton(WorkerKind::SlotSync).is_none()
        {
            self.start_singleton(WorkerKind::SlotSync);
        }
    }

    // ----- background workers ----------------------------------------------

    pub(super) fn run_bgworker_pass(&mut self) {
        if !self.bgworkers.pass_pending() {
            return;
        }
        let phase = self.phase;
        let blocked =
            self.fatal_error || self.phase.winding_down() || self.shutdown_mode == ShutdownMode::Immediate;
        let allows = move |st: BgwStartTime| {
            if blocked {
                return false;
            }
            match st {
                BgwStartTime::SupervisorStart => true,
                BgwStartTime::ConsistentState => {
                    matches!(phase, PmPhase::HotStandby | PmPhase::Run)
                }
                BgwStartTime::RecoveryFinished => phase == PmPhase::Run,
            }
        };

        let plan = self
            .bgworkers
            .plan_pass(Instant::now(), allows, self.cfg.bgworker_restart_floor);

        for (name, notify_pid) in &plan.removed {
            log::info!("background worker {name:?} removed from the registry");
            if *notify_pid != 0 {
                let _ = signal_child(*notify_pid, Signal::SIGUSR1);
            }
        }

        for idx in plan.launch {
            let Some(entry) = self.bgworkers.entries().get(idx) else {
                continue;
            };
            let name = entry.name.clone();
            let notify_pid = entry.notify_pid;

            let Some(slot) = self.slot_alloc.alloc() else {
                self.bgworkers.mark_launch_failed(idx, Instant::now());
                continue;
            };
            let token = admission::generate_cancel_token();
            let mut bootstrap = self.base_bootstrap(WorkerKind::BgWorker);
            bootstrap.slot = Some(slot);
            bootstrap.cancel_token = Some(token);
            bootstrap.bgworker_name = Some(name.clone());

            match self.launch_child(bootstrap) {
                Ok(pid) => {
                    self.bgworkers.mark_started(idx, pid);
                    self.with_slots(|s| s.claim(slot, pid, token));
                    self.register_child(ChildRecord {
                        pid,
                        kind: WorkerKind::BgWorker,
                        slot: Some(slot),
                        cancel_token: token,
                        dead_end: false,
                        bgworker_notify: notify_pid != 0,
                    });
                    log::info!("started background worker {name:?} (pid {pid})");
                }
                Err(e) => {
                    self.slot_alloc.release(slot);
                    log::warn!("could not start background worker {name:?}: {e}");
                    self.bgworkers.mark_launch_failed(idx, Instant::now());
                }
            }
        }
    }

    // ----- connection handling ---------------------------------------------

    fn admission_snapshot(&self) -> AdmissionState {
        AdmissionState {
            phase: self.phase,
            shutdown_mode: self.shutdown_mode,
            fatal_error: self.fatal_error,
            conns_allowed: self.conns_allowed,
            live_children: self.registry.live_count(),
            ceiling: self.cfg.live_children_ceiling() as usize,
        }
    }

    /// Accept until the listener runs dry; each connection becomes either a
    /// session or a dead-end child.
    pub(super) fn drain_accepts(&mut self, idx: usize) {
        loop {
            match self.listeners.accept(idx) {
                Ok(Some(stream)) => self.handle_connection(stream),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn handle_connection(&mut self, stream: ClientStream) {
        let state = self.admission_snapshot();
        let mut verdict = admission::admission_verdict(&state, ConnectionKind::Session);

        let mut claimed = None;
        if verdict == AdmissionVerdict::Ok {
            match self.slot_alloc.alloc() {
                Some(slot) => claimed = Some((slot, admission::generate_cancel_token())),
                None => verdict = AdmissionVerdict::TooMany,
            }
        }

        match verdict {
            AdmissionVerdict::Ok => {
                let Some((slot, token)) = claimed else {
                    return;
                };
                let mut bootstrap = self.base_bootstrap(WorkerKind::Session);
                bootstrap.client_fd = Some(stream.as_raw_fd());
                bootstrap.slot = Some(slot);
                bootstrap.cancel_token = Some(token);

                match self.launch_child(bootstrap) {
                    Ok(pid) => {
                        self.with_slots(|s| s.claim(slot, pid, token));
                        self.register_child(ChildRecord {
                            pid,
                            kind: WorkerKind::Session,
                            slot: Some(slot),
                            cancel_token: token,
                            dead_end: false,
                            bgworker_notify: false,
                        });
                        log::debug!("accepted session from {} (pid {pid})", stream.peer());
                    }
                    Err(e) => {
                        self.slot_alloc.release(slot);
                        log::warn!("could not start a session worker: {e}");
                    }
                }
            }
            rejection => {
                log::debug!(
                    "rejecting connection from {}: {}",
                    stream.peer(),
                    rejection.message()
                );
                let mut bootstrap = self.base_bootstrap(WorkerKind::Session);
                bootstrap.client_fd = Some(stream.as_raw_fd());
                bootstrap.reject_reason = Some(rejection.message().to_string());

                match self.launch_child(bootstrap) {
                    Ok(pid) => {
                        self.register_child(ChildRecord {
                            pid,
                            kind: WorkerKind::Session,
                            slot: None,
                            cancel_token: 0,
                            dead_end: true,
                            bgworker_notify: false,
                        });
                    }
                    Err(e) => {
                        log::warn!("could not start a rejection worker: {e}");
                    }
                }
            }
        }
        // our copy of the socket closes here; the child keeps its own
        drop(stream);
    }

    /// Register a long-lived background worker before the loop starts.
    #[allow(dead_code)]
    pub fn register_bgworker(&mut self, entry: super::bgworker::BgWorkerEntry) {
        self.bgworkers.register(entry);
    }
}
