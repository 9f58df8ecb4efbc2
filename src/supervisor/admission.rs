//! Connection admission
//!
//! Every accepted socket gets a verdict before any child is launched: a real
//! session, or a dead-end child that delivers one specific rejection so the
//! client sees a protocol-clean error instead of a dropped connection.
//! Cancel requests are authorized against the shared slot array, never the
//! private registry, because the resolving process may not have inherited
//! the registry at all.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::shmem::slots::SlotArray;

use super::lifecycle::{PmPhase, ShutdownMode};

/// What kind of backend a connection wants to become.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Session,
    WalSender,
    BgWorker,
    AutoVacWorker,
}

/// Admission decision for one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionVerdict {
    Ok,
    /// Still starting up, no recovery confirmed yet.
    Startup,
    /// Recovery running but not yet at a consistent point.
    NotConsistent,
    /// Crash recovery in progress.
    Recovery,
    /// Shutdown in progress, or smart shutdown already closed the doors.
    ShuttingDown,
    /// Live-child ceiling reached.
    TooMany,
}

impl AdmissionVerdict {
    /// The client-facing rejection text a dead-end child delivers.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Startup => "the database system is starting up",
            Self::NotConsistent => "the database system is not yet accepting connections",
            Self::Recovery => "the database system is in recovery mode",
            Self::ShuttingDown => "the database system is shutting down",
            Self::TooMany => "sorry, too many clients already",
        }
    }
}

/// Everything the verdict depends on, snapshotted by the event loop.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionState {
    pub phase: PmPhase,
    pub shutdown_mode: ShutdownMode,
    pub fatal_error: bool,
    pub conns_allowed: bool,
    pub live_children: usize,
    pub ceiling: usize,
}

/// Decide whether a connection of this kind may proceed.
pub fn admission_verdict(state: &AdmissionState, kind: ConnectionKind) -> AdmissionVerdict {
    // background workers are internal and only bounded by the ceiling
    if kind != ConnectionKind::BgWorker && !state.phase.serving() {
        if state.shutdown_mode != ShutdownMode::None {
            return AdmissionVerdict::ShuttingDown;
        }
        // a crash cycle outranks the phase: the cluster is recovering even
        // while survivors are still being drained
        if state.fatal_error {
            return AdmissionVerdict::Recovery;
        }
        if state.phase.winding_down() {
            return AdmissionVerdict::ShuttingDown;
        }
        return match state.phase {
            PmPhase::Init | PmPhase::Startup => AdmissionVerdict::Startup,
            PmPhase::Recovery => AdmissionVerdict::NotConsistent,
            _ => AdmissionVerdict::Recovery,
        };
    }

    if kind == ConnectionKind::Session && !state.conns_allowed {
        return AdmissionVerdict::ShuttingDown;
    }

    if state.live_children >= state.ceiling {
        return AdmissionVerdict::TooMany;
    }

    AdmissionVerdict::Ok
}

/// Draw a cancel token. Zero is reserved for free slots, so it is never
/// handed out.
pub fn generate_cancel_token() -> u32 {
    loop {
        let token = OsRng.next_u32();
        if token != 0 {
            return token;
        }
    }
}

/// Resolve a cancel request to its target, or `None` when the pid is unknown
/// or the token does not match. The caller delivers the interrupt.
pub fn cancel_target(slots: &SlotArray<'_>, pid: i32, token: u32) -> Option<i32> {
    if slots.match_cancel(pid, token) {
        Some(pid)
    } else {
        None
    }
}

/// Handle a cancel request end to end: authorize and deliver one SIGINT.
pub fn process_cancel_request(slots: &SlotArray<'_>, pid: i32, token: u32) -> bool {
    match cancel_target(slots, pid, token) {
        Some(target) => {
            log::debug!("cancel request for pid {target} authorized");
            nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(target),
                nix::sys::signal::Signal::SIGINT,
            )
            .is_ok()
        }
        None => {
            log::info!("cancel request for pid {pid} ignored: wrong token or unknown pid");
            false
        }
    }
}
