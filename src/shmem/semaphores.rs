//! Process-shared semaphore pool
//!
//! A fixed array of POSIX semaphores living inside the shared segment, one
//! per possible shared-memory participant. The supervisor initializes and
//! destroys them; children wait and post under their own protocols.

use crate::config::Config;

use super::RegionView;

pub fn pool_size(count: usize) -> usize {
    count * std::mem::size_of::<libc::sem_t>()
}

/// Initialize every semaphore in the region, value 1, shared across
/// processes. The region size fixes the count.
pub fn init_region(view: &RegionView, _cfg: &Config) {
    let count = view.len() / std::mem::size_of::<libc::sem_t>();
    let base = view.as_ptr() as *mut libc::sem_t;
    for i in 0..count {
        unsafe {
            libc::sem_init(base.add(i), 1, 1);
        }
    }
}

/// Tear the pool down before the segment is unlinked.
pub fn destroy_region(view: &RegionView) {
    let count = view.len() / std::mem::size_of::<libc::sem_t>();
    let base = view.as_ptr() as *mut libc::sem_t;
    for i in 0..count {
        unsafe {
            libc::sem_destroy(base.add(i));
        }
    }
}

/// Accessor handed to worker-side code.
pub struct SemaphorePool<'a> {
    base: *mut libc::sem_t,
    count: usize,
    _view: std::marker::PhantomData<&'a RegionView>,
}

impl<'a> SemaphorePool<'a> {
    pub fn new(view: &'a RegionView) -> Self {
        SemaphorePool {
            base: view.as_ptr() as *mut libc::sem_t,
            count: view.len() / std::mem::size_of::<libc::sem_t>(),
            _view: std::marker::PhantomData,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Block on semaphore `idx`.
    pub fn acquire(&self, idx: usize) -> bool {
        if idx >= self.count {
            return false;
        }
        unsafe { libc::sem_wait(self.base.add(idx)) == 0 }
    }

    pub fn release(&self, idx: usize) -> bool {
        if idx >= self.count {
            return false;
        }
        unsafe { libc::sem_post(self.base.add(idx)) == 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_size_scales() {
        assert_eq!(pool_size(0), 0);
        assert_eq!(pool_size(4), 4 * std::mem::size_of::<libc::sem_t>());
    }
}
