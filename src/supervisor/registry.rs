//! Child process accounting
//!
//! One record per live child, indexed by pid. The registry is private to the
//! supervisor process; the shared-memory slot array carries the subset peers
//! need (pid and cancel token). A child is present here exactly as long as it
//! is attached to shared memory, which is why dead-end children are tracked
//! too: the segment cannot be torn down under them.

use std::collections::HashMap;

use nix::sys::signal::Signal;

use crate::worker::WorkerKind;

use super::launcher::signal_child;

/// Bitmask over worker kinds for count/iter/signal operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindMask(u16);

impl KindMask {
    pub const EMPTY: KindMask = KindMask(0);
    pub const ALL: KindMask = KindMask((1 << crate::worker::WORKER_KIND_COUNT) - 1);

    pub const fn of(kind: WorkerKind) -> KindMask {
        KindMask(1 << kind as u16)
    }

    pub const fn union(self, other: KindMask) -> KindMask {
        KindMask(self.0 | other.0)
    }

    pub const fn without(self, other: KindMask) -> KindMask {
        KindMask(self.0 & !other.0)
    }

    pub const fn contains(self, kind: WorkerKind) -> bool {
        self.0 & (1 << kind as u16) != 0
    }
}

/// Everything the supervisor remembers about one live child.
#[derive(Debug, Clone)]
pub struct ChildRecord {
    pub pid: i32,
    pub kind: WorkerKind,
    /// Index into the shared slot array, if the child occupies one.
    pub slot: Option<usize>,
    /// Random token a client must present to cancel this child's work.
    pub cancel_token: u32,
    /// Short-lived rejection worker; never serves queries.
    pub dead_end: bool,
    /// Registrant wants a notification when this bgworker exits.
    pub bgworker_notify: bool,
}

#[derive(Debug, Default)]
pub struct ChildRegistry {
    children: HashMap<i32, ChildRecord>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a child. A duplicate pid means our bookkeeping diverged from
    /// the kernel's, which is not survivable.
    pub fn add(&mut self, record: ChildRecord) -> Result<(), RegistryError> {
        if self.children.contains_key(&record.pid) {
            return Err(RegistryError::DuplicatePid(record.pid));
        }
        self.children.insert(record.pid, record);
        Ok(())
    }

    pub fn remove(&mut self, pid: i32) -> Option<ChildRecord> {
        self.children.remove(&pid)
    }

    pub fn find(&self, pid: i32) -> Option<&ChildRecord> {
        self.children.get(&pid)
    }

    pub fn count(&self, mask: KindMask) -> usize {
        self.children.values().filter(|c| mask.contains(c.kind)).count()
    }

    pub fn iter(&self, mask: KindMask) -> impl Iterator<Item = &ChildRecord> {
        self.children.values().filter(move |c| mask.contains(c.kind))
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.children.len()
    }

    /// Live children other than dead-end rejection workers.
    pub fn live_count_excluding_dead_end(&self) -> usize {
        self.children.values().filter(|c| !c.dead_end).count()
    }

    pub fn dead_end_count(&self) -> usize {
        self.children.values().filter(|c| c.dead_end).count()
    }

    /// Deliver a signal to every child matching the mask. Failures are
    /// logged and skipped; a child that died between reap passes is expected
    /// to be unsignalable.
    pub fn signal_many(&self, mask: KindMask, sig: Signal) -> usize {
        let mut sent = 0;
        for child in self.iter(mask) {
            match signal_child(child.pid, sig) {
                Ok(()) => sent += 1,
                Err(e) => {
                    log::debug!(
                        "could not signal {} child {}: {}",
                        child.kind.as_str(),
                        child.pid,
                        e
                    );
                }
            }
        }
        sent
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("child pid {0} already registered")]
    DuplicatePid(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: i32, kind: WorkerKind) -> ChildRecord {
        ChildRecord {
            pid,
            kind,
            slot: None,
            cancel_token: 0,
            dead_end: false,
            bgworker_notify: false,
        }
    }

    #[test]
    fn test_add_find_remove() {
        let mut reg = ChildRegistry::new();
        reg.add(record(100, WorkerKind::Session)).unwrap();
        assert_eq!(reg.find(100).unwrap().kind, WorkerKind::Session);
        assert_eq!(reg.live_count(), 1);
        let removed = reg.remove(100).unwrap();
        assert_eq!(removed.pid, 100);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_duplicate_pid_rejected() {
        let mut reg = ChildRegistry::new();
        reg.add(record(7, WorkerKind::Session)).unwrap();
        assert!(matches!(
            reg.add(record(7, WorkerKind::BgWorker)),
            Err(RegistryError::DuplicatePid(7))
        ));
    }

    #[test]
    fn test_count_by_mask() {
        let mut reg = ChildRegistry::new();
        reg.add(record(1, WorkerKind::Session)).unwrap();
        reg.add(record(2, WorkerKind::Session)).unwrap();
        reg.add(record(3, WorkerKind::BgWorker)).unwrap();
        reg.add(record(4, WorkerKind::AutoVacWorker)).unwrap();

        assert_eq!(reg.count(KindMask::of(WorkerKind::Session)), 2);
        assert_eq!(
            reg.count(KindMask::of(WorkerKind::Session).union(KindMask::of(WorkerKind::BgWorker))),
            3
        );
        assert_eq!(reg.count(KindMask::ALL), 4);
        assert_eq!(reg.count(KindMask::EMPTY), 0);
    }

    #[test]
    fn test_mask_without() {
        let mask = KindMask::ALL.without(KindMask::of(WorkerKind::Session));
        assert!(!mask.contains(WorkerKind::Session));
        assert!(mask.contains(WorkerKind::Checkpointer));
    }

    #[test]
    fn test_dead_end_counting() {
        let mut reg = ChildRegistry::new();
        let mut dead = record(9, WorkerKind::Session);
        dead.dead_end = true;
        reg.add(dead).unwrap();
        reg.add(record(10, WorkerKind::Session)).unwrap();

        assert_eq!(reg.dead_end_count(), 1);
        assert_eq!(reg.live_count_excluding_dead_end(), 1);
    }
}
