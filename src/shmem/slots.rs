//! Shared child-slot array
//!
//! The supervisor's registry is private, but peers sometimes have to find a
//! child without asking the supervisor: cancel-request handling looks up the
//! target by pid, and a spawn-and-reattach child never inherited the
//! registry at all. This array mirrors the lookup-relevant subset, written
//! only by the supervisor at launch and reap time.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::config::Config;

use super::{RegionView, ShmemError};

/// Children mark themselves a WAL sender here; the supervisor reads the bit
/// back when it excludes the walsender class from backend signaling.
pub const SLOT_FLAG_WALSENDER: u32 = 1 << 0;

#[repr(C)]
pub struct SlotEntry {
    pid: AtomicI32,
    cancel_token: AtomicU32,
    flags: AtomicU32,
}

impl SlotEntry {
    pub const fn empty() -> Self {
        SlotEntry {
            pid: AtomicI32::new(0),
            cancel_token: AtomicU32::new(0),
            flags: AtomicU32::new(0),
        }
    }
}

pub fn slot_array_size(count: usize) -> usize {
    count * std::mem::size_of::<SlotEntry>()
}

pub fn init_region(_view: &RegionView, _cfg: &Config) {
    // freshly truncated shared memory is already zero, and a zero pid marks
    // a free slot
}

pub fn reattach_region(view: &RegionView, cfg: &Config) -> Result<(), ShmemError> {
    if view.len() < slot_array_size(cfg.live_children_ceiling() as usize) {
        return Err(ShmemError::RegionCorrupt("slot array truncated"));
    }
    Ok(())
}

/// View over the shared slot array.
pub struct SlotArray<'a> {
    entries: &'a [SlotEntry],
}

impl<'a> SlotArray<'a> {
    pub fn new(view: &'a RegionView) -> Self {
        SlotArray {
            entries: unsafe { view.as_slice_of::<SlotEntry>() },
        }
    }

    pub fn from_entries(entries: &'a [SlotEntry]) -> Self {
        SlotArray { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Publish a child. The token is stored before the pid so a concurrent
    /// reader that sees the pid also sees the token that goes with it.
    pub fn claim(&self, idx: usize, pid: i32, token: u32) {
        let entry = &self.entries[idx];
        entry.flags.store(0, Ordering::SeqCst);
        entry.cancel_token.store(token, Ordering::SeqCst);
        entry.pid.store(pid, Ordering::SeqCst);
    }

    /// Retire a child's slot; pid first, for the same reason.
    pub fn release(&self, idx: usize) {
        let entry = &self.entries[idx];
        entry.pid.store(0, Ordering::SeqCst);
        entry.cancel_token.store(0, Ordering::SeqCst);
        entry.flags.store(0, Ordering::SeqCst);
    }

    /// Child side: raise a flag on the slot this child occupies.
    pub fn set_flag(&self, idx: usize, flag: u32) {
        self.entries[idx].flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn has_flag(&self, idx: usize, flag: u32) -> bool {
        self.entries[idx].flags.load(Ordering::SeqCst) & flag != 0
    }

    /// Find a live child by pid.
    pub fn lookup(&self, pid: i32) -> Option<u32> {
        if pid == 0 {
            return None;
        }
        self.entries
            .iter()
            .find(|e| e.pid.load(Ordering::SeqCst) == pid)
            .map(|e| e.cancel_token.load(Ordering::SeqCst))
    }

    /// Does this (pid, token) pair authorize a cancel?
    pub fn match_cancel(&self, pid: i32, token: u32) -> bool {
        self.lookup(pid).map(|t| t == token).unwrap_or(false)
    }
}

/// Supervisor-side free-list over slot indexes. The shared array itself has
/// no allocation state; only the supervisor hands out indexes.
#[derive(Debug)]
pub struct SlotAllocator {
    free: Vec<usize>,
}

impl SlotAllocator {
    pub fn new(count: usize) -> Self {
        SlotAllocator {
            free: (0..count).rev().collect(),
        }
    }

    pub fn alloc(&mut self) -> Option<usize> {
        self.free.pop()
    }

    pub fn release(&mut self, idx: usize) {
        self.free.push(idx);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_entries(n: usize) -> Vec<SlotEntry> {
        (0..n).map(|_| SlotEntry::empty()).collect()
    }

    #[test]
    fn test_claim_lookup_release() {
        let entries = heap_entries(4);
        let slots = SlotArray::from_entries(&entries);
        slots.claim(2, 4321, 0xfeed_beef);
        assert_eq!(slots.lookup(4321), Some(0xfeed_beef));
        slots.release(2);
        assert_eq!(slots.lookup(4321), None);
    }

    #[test]
    fn test_match_cancel() {
        let entries = heap_entries(4);
        let slots = SlotArray::from_entries(&entries);
        slots.claim(0, 77, 1000);
        assert!(slots.match_cancel(77, 1000));
        assert!(!slots.match_cancel(77, 1001));
        assert!(!slots.match_cancel(78, 1000));
    }

    #[test]
    fn test_zero_pid_never_matches() {
        let entries = heap_entries(4);
        let slots = SlotArray::from_entries(&entries);
        assert_eq!(slots.lookup(0), None);
        assert!(!slots.match_cancel(0, 0));
    }

    #[test]
    fn test_flags_cleared_on_claim_and_release() {
        let entries = heap_entries(2);
        let slots = SlotArray::from_entries(&entries);
        slots.claim(0, 10, 1);
        slots.set_flag(0, SLOT_FLAG_WALSENDER);
        assert!(slots.has_flag(0, SLOT_FLAG_WALSENDER));
        slots.release(0);
        assert!(!slots.has_flag(0, SLOT_FLAG_WALSENDER));
        slots.claim(0, 11, 2);
        assert!(!slots.has_flag(0, SLOT_FLAG_WALSENDER));
    }

    #[test]
    fn test_allocator_exhausts_and_recycles() {
        let mut alloc = SlotAllocator::new(2);
        let a = alloc.alloc().unwrap();
        let b = alloc.alloc().unwrap();
        assert_ne!(a, b);
        assert!(alloc.alloc().is_none());
        alloc.release(a);
        assert_eq!(alloc.alloc(), Some(a));
    }
}
