//! Filepath: src/pmem.rs
//!
//! PMem allocator contract and the bundled mmap-backed implementation.
//!
//! The index does not manage persistent memory itself; it consumes an
//! allocator through the [`PmemAllocator`] trait. The trait mirrors what a
//! production PMem heap provides: offset-addressed allocation, bidirectional
//! offset/address translation, and an explicit persistence barrier.
//!
//! [`MmapAllocator`] is the default implementation: a file-backed mapping
//! with bump allocation whose head lives inside the mapping itself. It is
//! sufficient to run a full engine lifecycle, including close and reopen
//! followed by index rebuild.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::AtomicU64;

use memmap2::MmapMut;

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD};
use crate::status::{Result, Status};
use crate::tracing_helpers::debug_log;

/// The reserved null offset. No allocation is ever placed at offset 0.
pub const NULL_OFFSET: u64 = 0;

/// First allocatable offset in an [`MmapAllocator`] image. Everything below
/// is the superblock: the allocation head at offset 0, the rest reserved
/// for the embedding engine (collection directory, format version, ...).
pub const DATA_START: u64 = 4096;

/// Offset of the 8-byte engine root slot inside the superblock.
pub const ROOT_SLOT_OFFSET: u64 = 64;

const ALLOC_ALIGN: u64 = 8;

/// A span of persistent memory handed out by an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceEntry {
    pub offset: u64,
    pub size: u64,
}

/// Contract consumed by the hash index and skiplist.
///
/// Implementations must be internally thread safe: `allocate` and `persist`
/// are called concurrently from writer threads while readers translate
/// offsets with no coordination at all.
pub trait PmemAllocator: Send + Sync {
    /// Allocate `size` bytes of persistent memory.
    ///
    /// Returns [`Status::MemoryOverflow`] when the device is exhausted.
    fn allocate(&self, size: u64) -> Result<SpaceEntry>;

    /// Return a span to the allocator.
    ///
    /// Reclamation timing is governed by the external epoch mechanism; the
    /// span must not be reused while any reader may still reference it.
    fn free(&self, entry: SpaceEntry);

    /// Translate an offset to a mapped address. [`NULL_OFFSET`] maps to null.
    fn offset_to_addr(&self, offset: u64) -> *mut u8;

    /// Translate a mapped address back to its offset. Null maps to
    /// [`NULL_OFFSET`].
    fn addr_to_offset(&self, addr: *const u8) -> u64;

    /// Persistence barrier: flush `len` bytes at `addr` to the persistence
    /// domain before returning.
    fn persist(&self, addr: *const u8, len: usize);
}

// ============================================================================
//  MmapAllocator
// ============================================================================

/// File-backed bump allocator over a private mapping.
///
/// Layout of the image:
///
/// ```text
/// [0..8)            allocation head (u64, lives in PMem, CAS-advanced)
/// [8..4096)         reserved superblock region (see ROOT_SLOT_OFFSET)
/// [4096..capacity)  allocations, 8-byte aligned
/// ```
///
/// `free` is a no-op: the engine's GC owns space reuse and this allocator
/// only needs to survive engine restarts with its head intact.
pub struct MmapAllocator {
    map: MmapMut,
    base: *mut u8,
    capacity: u64,
}

// SAFETY: the mapping is owned for the allocator's lifetime; all shared
// mutation goes through the in-map atomic head or through raw pointers
// whose synchronization is the callers' responsibility (slot locks, epoch).
unsafe impl Send for MmapAllocator {}
unsafe impl Sync for MmapAllocator {}

impl MmapAllocator {
    /// Create a fresh image of `capacity` bytes at `path`.
    pub fn create(path: &Path, capacity: u64) -> Result<Self> {
        if capacity <= DATA_START {
            return Err(Status::InvalidArgument("pmem capacity below data start"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity)?;
        // SAFETY: the file is owned and sized; the mapping outlives all
        // pointers handed out because the allocator is dropped last.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base: *mut u8 = map.as_mut_ptr();

        let alloc = Self {
            map,
            base,
            capacity,
        };
        alloc.head().store(DATA_START, crate::ordering::WRITE_ORD);
        alloc.persist(base, std::mem::size_of::<u64>());
        debug_log!("created pmem image, capacity={}", capacity);
        Ok(alloc)
    }

    /// Map an existing image created by [`MmapAllocator::create`].
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let capacity: u64 = file.metadata()?.len();
        if capacity <= DATA_START {
            return Err(Status::Corruption("pmem image truncated"));
        }
        // SAFETY: as in `create`.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base: *mut u8 = map.as_mut_ptr();

        let alloc = Self {
            map,
            base,
            capacity,
        };
        let head: u64 = alloc.head().load(READ_ORD);
        if head < DATA_START || head > capacity {
            return Err(Status::Corruption("pmem allocation head out of bounds"));
        }
        debug_log!("opened pmem image, capacity={} head={}", capacity, head);
        Ok(alloc)
    }

    /// The allocation head, stored in the first 8 bytes of the image.
    #[inline]
    fn head(&self) -> &AtomicU64 {
        // SAFETY: the mapping is page aligned and at least DATA_START bytes,
        // so byte 0 holds a valid, aligned u64.
        unsafe { &*self.base.cast::<AtomicU64>() }
    }
}

impl PmemAllocator for MmapAllocator {
    fn allocate(&self, size: u64) -> Result<SpaceEntry> {
        let aligned: u64 = size
            .checked_add(ALLOC_ALIGN - 1)
            .ok_or(Status::InvalidArgument("allocation size overflow"))?
            & !(ALLOC_ALIGN - 1);

        let head = self.head();
        let mut current: u64 = head.load(READ_ORD);
        loop {
            let end: u64 = current
                .checked_add(aligned)
                .ok_or(Status::MemoryOverflow("pmem"))?;
            if end > self.capacity {
                return Err(Status::MemoryOverflow("pmem"));
            }
            match head.compare_exchange_weak(current, end, CAS_SUCCESS, CAS_FAILURE) {
                Ok(_) => {
                    return Ok(SpaceEntry {
                        offset: current,
                        size: aligned,
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn free(&self, entry: SpaceEntry) {
        // Space reuse belongs to the engine's GC.
        debug_log!("pmem free deferred, offset={} size={}", entry.offset, entry.size);
    }

    #[inline]
    fn offset_to_addr(&self, offset: u64) -> *mut u8 {
        if offset == NULL_OFFSET {
            return std::ptr::null_mut();
        }
        debug_assert!(offset < self.capacity);
        // SAFETY: offset is within the mapping.
        unsafe { self.base.add(offset as usize) }
    }

    #[inline]
    fn addr_to_offset(&self, addr: *const u8) -> u64 {
        if addr.is_null() {
            return NULL_OFFSET;
        }
        debug_assert!(addr as usize >= self.base as usize);
        (addr as usize - self.base as usize) as u64
    }

    fn persist(&self, addr: *const u8, len: usize) {
        let offset: usize = addr as usize - self.base as usize;
        // A failed flush leaves durability to the next barrier; the data is
        // still visible to every thread through the shared mapping.
        let _ = self.map.flush_range(offset, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> (tempfile::TempDir, MmapAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let alloc = MmapAllocator::create(&dir.path().join("pmem.img"), 1 << 20).unwrap();
        (dir, alloc)
    }

    #[test]
    fn test_allocate_is_aligned_and_monotonic() {
        let (_dir, alloc) = image();
        let a = alloc.allocate(13).unwrap();
        let b = alloc.allocate(8).unwrap();
        assert_eq!(a.offset % ALLOC_ALIGN, 0);
        assert_eq!(a.size, 16);
        assert!(b.offset >= a.offset + a.size);
    }

    #[test]
    fn test_offset_addr_round_trip() {
        let (_dir, alloc) = image();
        let entry = alloc.allocate(64).unwrap();
        let addr = alloc.offset_to_addr(entry.offset);
        assert!(!addr.is_null());
        assert_eq!(alloc.addr_to_offset(addr), entry.offset);
        assert!(alloc.offset_to_addr(NULL_OFFSET).is_null());
        assert_eq!(alloc.addr_to_offset(std::ptr::null()), NULL_OFFSET);
    }

    #[test]
    fn test_exhaustion_reports_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = MmapAllocator::create(&dir.path().join("pmem.img"), DATA_START + 64).unwrap();
        assert!(alloc.allocate(48).is_ok());
        assert!(matches!(
            alloc.allocate(64),
            Err(Status::MemoryOverflow("pmem"))
        ));
    }

    #[test]
    fn test_reopen_preserves_head_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pmem.img");
        let offset: u64;
        {
            let alloc = MmapAllocator::create(&path, 1 << 20).unwrap();
            let entry = alloc.allocate(32).unwrap();
            offset = entry.offset;
            let addr = alloc.offset_to_addr(entry.offset);
            // SAFETY: addr covers 32 freshly allocated bytes.
            unsafe { std::ptr::copy_nonoverlapping(b"persisted".as_ptr(), addr, 9) };
            alloc.persist(addr, 9);
        }
        let reopened = MmapAllocator::open(&path).unwrap();
        let next = reopened.allocate(8).unwrap();
        assert!(next.offset >= offset + 32);
        let addr = reopened.offset_to_addr(offset);
        // SAFETY: offset was written before the image was closed.
        let bytes = unsafe { std::slice::from_raw_parts(addr, 9) };
        assert_eq!(bytes, b"persisted");
    }
}
