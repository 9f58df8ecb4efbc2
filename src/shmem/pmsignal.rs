//! Inter-process signal channel
//!
//! A small shared table of single-shot event flags. A child that wants the
//! supervisor's attention sets the flag for its reason and sends SIGUSR1;
//! the supervisor's event loop checks and clears every flag on the next
//! pass. Flags carry no payload and coalesce: two sets before a check are
//! one event, which every reason here tolerates.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::Config;

use super::{RegionView, ShmemError};

/// Reasons a child may signal the supervisor. The discriminant is the table
/// index, so the order is part of the segment format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PmSignalReason {
    RecoveryStarted = 0,
    BeginHotStandby = 1,
    StartWalReceiver = 2,
    StartAutovacWorker = 3,
    BackgroundWorkerChange = 4,
    AdvanceStateMachine = 5,
    RotateLogfile = 6,
}

pub const ALL_REASONS: [PmSignalReason; 7] = [
    PmSignalReason::RecoveryStarted,
    PmSignalReason::BeginHotStandby,
    PmSignalReason::StartWalReceiver,
    PmSignalReason::StartAutovacWorker,
    PmSignalReason::BackgroundWorkerChange,
    PmSignalReason::AdvanceStateMachine,
    PmSignalReason::RotateLogfile,
];

pub fn table_size() -> usize {
    ALL_REASONS.len() * std::mem::size_of::<AtomicU32>()
}

pub fn reattach_region(view: &RegionView, _cfg: &Config) -> Result<(), ShmemError> {
    if view.len() < table_size() {
        return Err(ShmemError::RegionCorrupt("pmsignal table truncated"));
    }
    Ok(())
}

/// View over the shared flag table, usable from either side.
pub struct PmSignalTable<'a> {
    slots: &'a [AtomicU32],
}

impl<'a> PmSignalTable<'a> {
    pub fn new(view: &'a RegionView) -> Self {
        PmSignalTable {
            slots: unsafe { view.as_slice_of::<AtomicU32>() },
        }
    }

    /// Child side: raise the flag. The caller follows up with SIGUSR1 to the
    /// supervisor.
    pub fn set(&self, reason: PmSignalReason) {
        self.slots[reason as usize].store(1, Ordering::SeqCst);
    }

    /// Supervisor side: consume the flag, reporting whether it was set.
    pub fn consume(&self, reason: PmSignalReason) -> bool {
        self.slots[reason as usize].swap(0, Ordering::SeqCst) != 0
    }

    pub fn is_set(&self, reason: PmSignalReason) -> bool {
        self.slots[reason as usize].load(Ordering::SeqCst) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_table() -> Vec<AtomicU32> {
        (0..ALL_REASONS.len()).map(|_| AtomicU32::new(0)).collect()
    }

    fn table(slots: &[AtomicU32]) -> PmSignalTable<'_> {
        PmSignalTable { slots }
    }

    #[test]
    fn test_set_consume_single_shot() {
        let slots = heap_table();
        let t = table(&slots);
        assert!(!t.consume(PmSignalReason::RecoveryStarted));
        t.set(PmSignalReason::RecoveryStarted);
        assert!(t.is_set(PmSignalReason::RecoveryStarted));
        assert!(t.consume(PmSignalReason::RecoveryStarted));
        assert!(!t.consume(PmSignalReason::RecoveryStarted));
    }

    #[test]
    fn test_reasons_are_independent() {
        let slots = heap_table();
        let t = table(&slots);
        t.set(PmSignalReason::RotateLogfile);
        assert!(!t.consume(PmSignalReason::AdvanceStateMachine));
        assert!(t.consume(PmSignalReason::RotateLogfile));
    }

    #[test]
    fn test_double_set_coalesces() {
        let slots = heap_table();
        let t = table(&slots);
        t.set(PmSignalReason::StartAutovacWorker);
        t.set(PmSignalReason::StartAutovacWorker);
        assert!(t.consume(PmSignalReason::StartAutovacWorker));
        assert!(!t.consume(PmSignalReason::StartAutovacWorker));
    }
}
