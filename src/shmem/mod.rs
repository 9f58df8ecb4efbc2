//! Shared-memory provisioning
//!
//! The supervisor creates one POSIX shared-memory object at boot (and a
//! fresh one after a crash cycle), sized from a fixed table of subsystem
//! space requests. A header with magic, version and self-checksum sits at
//! offset 0, followed by a directory of named regions that reattaching
//! children use to find their subsystems without inheriting any pointers.
//!
//! The supervisor's contract toward the segment is narrow: create it,
//! destroy it, recreate it. Apart from the child-slot mirror it never reads
//! or writes a byte of it while children are alive.

pub mod pmsignal;
pub mod semaphores;
pub mod slots;

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, mmap_anonymous, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::config::Config;

const SEGMENT_MAGIC: u32 = 0x44425653; // "DBVS"
const SEGMENT_VERSION: u32 = 3;
const MAX_REGIONS: usize = 32;
const REGION_ALIGN: usize = 64;
const REGION_NAME_LEN: usize = 48;

/// Region names. Children look subsystems up by these, so they are part of
/// the segment format.
pub const REGION_LOCK_TABLE: &str = "lock-table";
pub const REGION_PROC_SLOTS: &str = "proc-slots";
pub const REGION_PMSIGNAL: &str = "pmsignal";
pub const REGION_SEMAPHORES: &str = "semaphores";
pub const REGION_XACT_STATUS: &str = "xact-status";
pub const REGION_BUFFER_POOL: &str = "buffer-pool";
pub const REGION_WAL_BUFFERS: &str = "wal-buffers";
pub const REGION_REPL_SLOTS: &str = "repl-slots";
pub const REGION_STATS: &str = "stats";
pub const REGION_PRELOAD: &str = "preload";

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SegmentHeader {
    magic: u32,
    version: u32,
    total_size: u64,
    region_count: u32,
    checksum: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RegionEntry {
    name: [u8; REGION_NAME_LEN],
    offset: u64,
    size: u64,
}

/// One subsystem's slice of the segment.
#[derive(Debug, Clone, Copy)]
pub struct RegionView {
    base: *mut u8,
    len: usize,
}

impl RegionView {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// View the region as a slice of `T`. The region layout is fixed by the
    /// directory, so the only way this fails is a format mismatch.
    ///
    /// # Safety
    ///
    /// `T` must be valid for any bit pattern and the region must really hold
    /// an array of `T` per the segment format.
    pub unsafe fn as_slice_of<T>(&self) -> &[T] {
        debug_assert_eq!(self.base as usize % std::mem::align_of::<T>(), 0);
        std::slice::from_raw_parts(self.base as *const T, self.len / std::mem::size_of::<T>())
    }
}

/// Per-subsystem provisioning hooks. `size` is consulted while summing the
/// segment, `init` runs once at creation on the zeroed region, `reattach`
/// lets a fresh process rebuild its local pointers and sanity-check the
/// region it found.
pub struct SubsystemDef {
    pub name: &'static str,
    pub size: fn(&Config) -> usize,
    pub init: fn(&RegionView, &Config),
    pub reattach: fn(&RegionView, &Config) -> Result<(), ShmemError>,
}

fn init_noop(_: &RegionView, _: &Config) {}

fn reattach_nonempty(view: &RegionView, _: &Config) -> Result<(), ShmemError> {
    if view.is_empty() {
        return Err(ShmemError::RegionCorrupt("empty region"));
    }
    Ok(())
}

/// The provisioning table, in dependency order: the lock table before
/// anything that takes locks, the process-slot array before anything that
/// registers a slot.
pub static SUBSYSTEMS: &[SubsystemDef] = &[
    SubsystemDef {
        name: REGION_LOCK_TABLE,
        size: |cfg| cfg.lock_table_entries as usize * 64,
        init: init_noop,
        reattach: reattach_nonempty,
    },
    SubsystemDef {
        name: REGION_PROC_SLOTS,
        size: |cfg| slots::slot_array_size(cfg.live_children_ceiling() as usize),
        init: slots::init_region,
        reattach: slots::reattach_region,
    },
    SubsystemDef {
        name: REGION_PMSIGNAL,
        size: |_| pmsignal::table_size(),
        init: init_noop,
        reattach: pmsignal::reattach_region,
    },
    SubsystemDef {
        name: REGION_SEMAPHORES,
        size: |cfg| semaphores::pool_size(cfg.semaphore_count() as usize),
        init: semaphores::init_region,
        reattach: reattach_nonempty,
    },
    SubsystemDef {
        name: REGION_XACT_STATUS,
        size: |_| 256 * 1024,
        init: init_noop,
        reattach: reattach_nonempty,
    },
    SubsystemDef {
        name: REGION_BUFFER_POOL,
        // 8 KiB pages plus a descriptor per page
        size: |cfg| cfg.shared_buffers as usize * (8192 + 64),
        init: init_noop,
        reattach: reattach_nonempty,
    },
    SubsystemDef {
        name: REGION_WAL_BUFFERS,
        size: |cfg| cfg.wal_buffers as usize * 8192,
        init: init_noop,
        reattach: reattach_nonempty,
    },
    SubsystemDef {
        name: REGION_REPL_SLOTS,
        size: |cfg| cfg.max_replication_slots as usize * 256,
        init: init_noop,
        reattach: reattach_nonempty,
    },
    SubsystemDef {
        name: REGION_STATS,
        size: |_| 64 * 1024,
        init: init_noop,
        reattach: reattach_nonempty,
    },
    SubsystemDef {
        name: REGION_PRELOAD,
        size: |cfg| cfg.extra_shared_memory + preload_requested(),
        init: init_noop,
        reattach: |_, _| Ok(()),
    },
];

static PRELOAD_REQUESTED: AtomicUsize = AtomicUsize::new(0);
static PRELOAD_FROZEN: AtomicBool = AtomicBool::new(false);

/// One-shot registration hook for preload libraries: extra shared memory may
/// be requested only before the segment is sized.
pub fn request_preload_shmem(bytes: usize) -> Result<(), ShmemError> {
    if PRELOAD_FROZEN.load(Ordering::SeqCst) {
        return Err(ShmemError::TooLateForRequest);
    }
    PRELOAD_REQUESTED.fetch_add(bytes, Ordering::SeqCst);
    Ok(())
}

fn preload_requested() -> usize {
    PRELOAD_REQUESTED.load(Ordering::SeqCst)
}

fn align_up(v: usize, align: usize) -> usize {
    v.div_ceil(align) * align
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

fn layout_prefix_size() -> usize {
    align_up(
        std::mem::size_of::<SegmentHeader>() + MAX_REGIONS * std::mem::size_of::<RegionEntry>(),
        REGION_ALIGN,
    )
}

/// Total bytes the segment needs for this configuration, rounded up to the
/// page size. Freezes the preload request window.
pub fn compute_total_size(cfg: &Config) -> usize {
    PRELOAD_FROZEN.store(true, Ordering::SeqCst);
    let mut total = layout_prefix_size();
    for def in SUBSYSTEMS {
        total = align_up(total + (def.size)(cfg), REGION_ALIGN);
    }
    align_up(total, page_size())
}

fn fnv1a(fields: &[u32]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for f in fields {
        for b in f.to_le_bytes() {
            hash ^= b as u32;
            hash = hash.wrapping_mul(0x01000193);
        }
    }
    hash
}

impl SegmentHeader {
    fn new(total_size: u64, region_count: u32) -> Self {
        let mut h = SegmentHeader {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            total_size,
            region_count,
            checksum: 0,
        };
        h.checksum = h.expected_checksum();
        h
    }

    fn expected_checksum(&self) -> u32 {
        fnv1a(&[
            self.magic,
            self.version,
            (self.total_size & 0xffff_ffff) as u32,
            (self.total_size >> 32) as u32,
            self.region_count,
        ])
    }

    fn validate(&self, mapped_size: u64) -> Result<(), ShmemError> {
        if self.magic != SEGMENT_MAGIC {
            return Err(ShmemError::BadHeader("magic mismatch"));
        }
        if self.version != SEGMENT_VERSION {
            return Err(ShmemError::BadHeader("layout version mismatch"));
        }
        if self.checksum != self.expected_checksum() {
            return Err(ShmemError::BadHeader("checksum mismatch"));
        }
        if self.total_size != mapped_size {
            return Err(ShmemError::BadHeader("size mismatch"));
        }
        if self.region_count as usize > MAX_REGIONS {
            return Err(ShmemError::BadHeader("region count out of range"));
        }
        Ok(())
    }
}

/// A mapped shared-memory segment. The owner (the supervisor) unlinks the
/// object on destroy; attachers only unmap.
pub struct Segment {
    name: String,
    base: NonNull<libc::c_void>,
    len: usize,
    owner: bool,
}

// The segment is only handed between processes, never between threads, but
// the raw pointer strips the auto traits.
unsafe impl Send for Segment {}

impl Segment {
    /// Name of the shared-memory object for this server instance.
    pub fn object_name(port: u16, pid: u32) -> String {
        format!("/dbvisor.{port}.{pid}")
    }

    /// Create, size and initialize the segment for this configuration. Every
    /// subsystem's init hook runs in table order on its zeroed region.
    pub fn create(name: &str, cfg: &Config) -> Result<Segment, ShmemError> {
        let total = compute_total_size(cfg);

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| ShmemError::Create {
            name: name.to_string(),
            errno: e,
        })?;

        let segment = Self::map_and_build(name, std::fs::File::from(fd), total, cfg);
        if segment.is_err() {
            let _ = shm_unlink(name);
        }
        segment
    }

    fn map_and_build(
        name: &str,
        file: std::fs::File,
        total: usize,
        cfg: &Config,
    ) -> Result<Segment, ShmemError> {
        ftruncate(&file, total as libc::off_t).map_err(|e| ShmemError::Create {
            name: name.to_string(),
            errno: e,
        })?;

        let base = Self::map(&file, total, name)?;
        let segment = Segment {
            name: name.to_string(),
            base,
            len: total,
            owner: true,
        };

        write_layout(segment.base, total, cfg)?;
        for def in SUBSYSTEMS {
            let view = segment
                .region(def.name)
                .ok_or(ShmemError::RegionMissing(def.name))?;
            (def.init)(&view, cfg);
        }

        Ok(segment)
    }

    /// Attach to an existing segment by name and rebuild local pointers
    /// through each subsystem's reattach hook.
    pub fn attach(name: &str, cfg: &Config) -> Result<Segment, ShmemError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|e| ShmemError::Attach {
            name: name.to_string(),
            errno: e,
        })?;
        let file = std::fs::File::from(fd);
        let total = file
            .metadata()
            .map_err(|e| ShmemError::Attach {
                name: name.to_string(),
                errno: nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)),
            })?
            .len() as usize;
        if total < std::mem::size_of::<SegmentHeader>() {
            return Err(ShmemError::BadHeader("object smaller than header"));
        }

        let base = Self::map(&file, total, name)?;
        let segment = Segment {
            name: name.to_string(),
            base,
            len: total,
            owner: false,
        };

        let header = unsafe { *(segment.base.as_ptr() as *const SegmentHeader) };
        header.validate(total as u64)?;

        for def in SUBSYSTEMS {
            let view = segment
                .region(def.name)
                .ok_or(ShmemError::RegionMissing(def.name))?;
            (def.reattach)(&view, cfg)?;
        }
        Ok(segment)
    }

    fn map(
        file: &std::fs::File,
        len: usize,
        name: &str,
    ) -> Result<NonNull<libc::c_void>, ShmemError> {
        let nz = NonZeroUsize::new(len).ok_or(ShmemError::BadHeader("zero-sized segment"))?;
        unsafe {
            mmap(
                None,
                nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )
        }
        .map_err(|e| ShmemError::Attach {
            name: name.to_string(),
            errno: e,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_size(&self) -> usize {
        self.len
    }

    /// Look a named region up in the directory.
    pub fn region(&self, name: &str) -> Option<RegionView> {
        find_region(self.base, self.len, name)
    }

    /// Unmap, and for the owner also tear down semaphores and unlink the
    /// object. Only valid once every child has exited.
    pub fn destroy(mut self) {
        if self.owner {
            if let Some(view) = self.region(REGION_SEMAPHORES) {
                semaphores::destroy_region(&view);
            }
        }
        let name = std::mem::take(&mut self.name);
        let owner = self.owner;
        unsafe {
            let _ = munmap(self.base, self.len);
        }
        if owner {
            let _ = shm_unlink(name.as_str());
        }
        std::mem::forget(self);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base, self.len);
        }
    }
}

/// Write the header and region directory over freshly zeroed memory.
fn write_layout(
    base: NonNull<libc::c_void>,
    total: usize,
    cfg: &Config,
) -> Result<(), ShmemError> {
    let mut offset = layout_prefix_size();
    let mut entries: Vec<RegionEntry> = Vec::with_capacity(SUBSYSTEMS.len());
    for def in SUBSYSTEMS {
        let size = (def.size)(cfg);
        let mut entry = RegionEntry {
            name: [0; REGION_NAME_LEN],
            offset: offset as u64,
            size: size as u64,
        };
        entry.name[..def.name.len()].copy_from_slice(def.name.as_bytes());
        entries.push(entry);
        offset = align_up(offset + size, REGION_ALIGN);
    }
    if offset > total {
        return Err(ShmemError::BadHeader("layout exceeds computed size"));
    }

    unsafe {
        let header_ptr = base.as_ptr() as *mut SegmentHeader;
        header_ptr.write(SegmentHeader::new(total as u64, entries.len() as u32));
        let dir_ptr =
            (base.as_ptr() as *mut u8).add(std::mem::size_of::<SegmentHeader>()) as *mut RegionEntry;
        for (i, e) in entries.iter().enumerate() {
            dir_ptr.add(i).write(*e);
        }
    }
    Ok(())
}

/// Resolve a named region against a mapped layout.
fn find_region(base: NonNull<libc::c_void>, total: usize, name: &str) -> Option<RegionView> {
    let header = unsafe { &*(base.as_ptr() as *const SegmentHeader) };
    let dir = unsafe {
        std::slice::from_raw_parts(
            (base.as_ptr() as *const u8).add(std::mem::size_of::<SegmentHeader>())
                as *const RegionEntry,
            header.region_count as usize,
        )
    };
    for entry in dir {
        let len = entry.name.iter().position(|b| *b == 0).unwrap_or(REGION_NAME_LEN);
        if &entry.name[..len] == name.as_bytes() {
            if entry.offset as usize + entry.size as usize > total {
                return None;
            }
            return Some(RegionView {
                base: unsafe { (base.as_ptr() as *mut u8).add(entry.offset as usize) },
                len: entry.size as usize,
            });
        }
    }
    None
}

/// Process-private stand-in for the segment, used by single-user mode: same
/// layout, same subsystem init hooks, but anonymous MAP_PRIVATE memory that
/// no other process can ever attach. Torn down with the process.
pub struct PrivateArena {
    base: NonNull<libc::c_void>,
    len: usize,
}

impl PrivateArena {
    pub fn create(cfg: &Config) -> Result<PrivateArena, ShmemError> {
        let total = compute_total_size(cfg);
        let nz = NonZeroUsize::new(total).ok_or(ShmemError::BadHeader("zero-sized segment"))?;
        let base = unsafe {
            mmap_anonymous(
                None,
                nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| ShmemError::Create {
            name: "private arena".to_string(),
            errno: e,
        })?;

        let arena = PrivateArena { base, len: total };
        write_layout(arena.base, total, cfg)?;
        for def in SUBSYSTEMS {
            let view = arena
                .region(def.name)
                .ok_or(ShmemError::RegionMissing(def.name))?;
            (def.init)(&view, cfg);
        }
        Ok(arena)
    }

    pub fn region(&self, name: &str) -> Option<RegionView> {
        find_region(self.base, self.len, name)
    }

    pub fn total_size(&self) -> usize {
        self.len
    }
}

impl Drop for PrivateArena {
    fn drop(&mut self) {
        if let Some(view) = self.region(REGION_SEMAPHORES) {
            semaphores::destroy_region(&view);
        }
        unsafe {
            let _ = munmap(self.base, self.len);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShmemError {
    #[error("cannot create shared-memory object {name}: {errno}")]
    Create { name: String, errno: nix::errno::Errno },

    #[error("cannot attach shared-memory object {name}: {errno}")]
    Attach { name: String, errno: nix::errno::Errno },

    #[error("shared-memory header invalid: {0}")]
    BadHeader(&'static str),

    #[error("shared-memory region missing: {0}")]
    RegionMissing(&'static str),

    #[error("shared-memory region corrupt: {0}")]
    RegionCorrupt(&'static str),

    #[error("preload shared-memory request after sizing")]
    TooLateForRequest,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut cfg = Config::defaults();
        // keep the test segment small
        cfg.apply("shared_buffers", "16").unwrap();
        cfg.apply("wal_buffers", "4").unwrap();
        cfg.apply("max_sessions", "8").unwrap();
        cfg
    }

    fn unique_name(tag: &str) -> String {
        format!("/dbvisor-test.{}.{}", tag, std::process::id())
    }

    #[test]
    fn test_total_size_page_aligned() {
        let cfg = test_config();
        let total = compute_total_size(&cfg);
        assert_eq!(total % page_size(), 0);
        assert!(total > layout_prefix_size());
    }

    #[test]
    fn test_header_checksum_detects_tamper() {
        let mut header = SegmentHeader::new(8192, 4);
        assert!(header.validate(8192).is_ok());
        header.total_size = 16384;
        assert!(matches!(
            header.validate(16384),
            Err(ShmemError::BadHeader("checksum mismatch"))
        ));
    }

    #[test]
    fn test_header_rejects_wrong_magic() {
        let mut header = SegmentHeader::new(8192, 4);
        header.magic = 0xdead_beef;
        assert!(matches!(
            header.validate(8192),
            Err(ShmemError::BadHeader("magic mismatch"))
        ));
    }

    #[test]
    fn test_create_attach_destroy() {
        let cfg = test_config();
        let name = unique_name("roundtrip");
        let segment = Segment::create(&name, &cfg).unwrap();

        for def in SUBSYSTEMS {
            let view = segment.region(def.name).unwrap();
            assert_eq!(view.len(), (def.size)(&cfg), "region {}", def.name);
        }

        let attached = Segment::attach(&name, &cfg).unwrap();
        assert_eq!(attached.total_size(), segment.total_size());
        drop(attached);

        segment.destroy();
        assert!(Segment::attach(&name, &cfg).is_err());
    }

    #[test]
    fn test_create_refuses_existing_object() {
        let cfg = test_config();
        let name = unique_name("dup");
        let segment = Segment::create(&name, &cfg).unwrap();
        assert!(matches!(
            Segment::create(&name, &cfg),
            Err(ShmemError::Create { .. })
        ));
        segment.destroy();
    }

    #[test]
    fn test_private_arena_mirrors_layout() {
        let cfg = test_config();
        let arena = PrivateArena::create(&cfg).unwrap();
        assert_eq!(arena.total_size() % page_size(), 0);
        for def in SUBSYSTEMS {
            let view = arena.region(def.name).unwrap();
            assert_eq!(view.len(), (def.size)(&cfg), "region {}", def.name);
        }
        assert!(arena.region("no-such-region").is_none());
    }

    #[test]
    fn test_unknown_region_absent() {
        let cfg = test_config();
        let name = unique_name("lookup");
        let segment = Segment::create(&name, &cfg).unwrap();
        assert!(segment.region("no-such-region").is_none());
        segment.destroy();
    }
}
