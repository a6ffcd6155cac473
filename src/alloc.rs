//! Filepath: src/alloc.rs
//!
//! DRAM allocation for index structures.
//!
//! [`DramAllocator`] hands out stable offsets into chunked, zeroed DRAM.
//! Writers allocate from per-thread arenas (`write_threads` lanes) so bucket
//! growth on different slots does not contend; readers translate offsets to
//! addresses lock-free while walking overflow chains.
//!
//! Properties the hash index relies on:
//!
//! 1. **Zeroed memory**: every chunk is `alloc_zeroed`ed and never reused,
//!    so a fresh bucket block always reads as empty entries.
//! 2. **Stable addresses**: chunks are never moved or freed before the
//!    allocator drops, so translated addresses stay valid for its lifetime.
//! 3. **Lock-free translation**: `offset_to_addr` only performs an acquire
//!    load of the owning chunk's base pointer.
//!
//! Offsets encode `(chunk index << 32) | offset within chunk`. Chunk index
//! 0 is never used, which keeps offset 0 free as the "no overflow bucket"
//! marker.

use std::alloc::Layout;
use std::cell::Cell;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::status::{Result, Status};
use crate::tracing_helpers::debug_log;

const CHUNK_SHIFT: u32 = 32;
const WITHIN_MASK: u64 = (1 << CHUNK_SHIFT) - 1;

/// Granularity of every allocation. Hash entries are 16 bytes and read
/// through 16-byte atomics, so nothing smaller is ever handed out.
const ALLOC_ALIGN: u64 = 16;

const DEFAULT_CHUNK_SIZE: u64 = 1 << 20;
const MAX_CHUNKS: usize = 4096;

struct OwnedChunk {
    ptr: *mut u8,
    layout: Layout,
}

impl Drop for OwnedChunk {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

struct Arena {
    chunk: usize,
    cursor: u64,
    end: u64,
}

/// Chunked bump allocator with per-writer-thread arenas.
pub struct DramAllocator {
    chunk_bases: Box<[AtomicPtr<u8>]>,
    next_chunk: AtomicUsize,
    owned: Mutex<Vec<OwnedChunk>>,
    arenas: Box<[CachePadded<Mutex<Arena>>]>,
    used: AtomicU64,
    mem_limit: u64,
}

// SAFETY: chunk pointers are published with release stores, never freed
// before drop, and all arena state sits behind mutexes.
unsafe impl Send for DramAllocator {}
unsafe impl Sync for DramAllocator {}

impl DramAllocator {
    /// Build an allocator with `write_threads` arena lanes and a total
    /// memory budget of `mem_limit` bytes.
    pub fn new(write_threads: u32, mem_limit: u64) -> Result<Self> {
        if write_threads == 0 {
            return Err(Status::InvalidArgument("write_threads must be positive"));
        }
        let arenas: Box<[CachePadded<Mutex<Arena>>]> = (0..write_threads)
            .map(|_| {
                CachePadded::new(Mutex::new(Arena {
                    chunk: 0,
                    cursor: 0,
                    end: 0,
                }))
            })
            .collect();
        let chunk_bases: Box<[AtomicPtr<u8>]> = (0..MAX_CHUNKS)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        Ok(Self {
            chunk_bases,
            next_chunk: AtomicUsize::new(1),
            owned: Mutex::new(Vec::new()),
            arenas,
            used: AtomicU64::new(0),
            mem_limit,
        })
    }

    /// Allocate `size` zeroed bytes and return their offset.
    ///
    /// Returns [`Status::MemoryOverflow`] when the budget or the chunk
    /// table is exhausted.
    pub fn allocate(&self, size: u64) -> Result<u64> {
        if size == 0 || size > WITHIN_MASK {
            return Err(Status::InvalidArgument("bad dram allocation size"));
        }
        let size: u64 = (size + ALLOC_ALIGN - 1) & !(ALLOC_ALIGN - 1);

        // Oversized requests (bucket arrays) get a dedicated chunk and
        // leave the caller's arena untouched.
        if size >= DEFAULT_CHUNK_SIZE {
            let chunk: usize = self.grow(size)?;
            return Ok(Self::encode(chunk, 0));
        }

        let lane: usize = self.lane();
        let mut arena = self.arenas[lane].lock();
        if arena.end - arena.cursor < size {
            let chunk: usize = self.grow(DEFAULT_CHUNK_SIZE)?;
            arena.chunk = chunk;
            arena.cursor = 0;
            arena.end = DEFAULT_CHUNK_SIZE;
        }
        let offset: u64 = Self::encode(arena.chunk, arena.cursor);
        arena.cursor += size;
        Ok(offset)
    }

    /// Translate an offset returned by [`DramAllocator::allocate`].
    ///
    /// Lock-free; safe to call from reader paths concurrent with writers
    /// allocating new chunks.
    #[inline]
    #[must_use]
    pub fn offset_to_addr(&self, offset: u64) -> *mut u8 {
        let chunk: usize = (offset >> CHUNK_SHIFT) as usize;
        let within: u64 = offset & WITHIN_MASK;
        debug_assert!(chunk >= 1 && chunk < MAX_CHUNKS);
        let base: *mut u8 = self.chunk_bases[chunk].load(READ_ORD);
        debug_assert!(!base.is_null());
        // SAFETY: within is below the owning chunk's size by construction.
        unsafe { base.add(within as usize) }
    }

    /// Bytes currently reserved from the budget.
    #[inline]
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(RELAXED)
    }

    #[inline]
    const fn encode(chunk: usize, within: u64) -> u64 {
        ((chunk as u64) << CHUNK_SHIFT) | within
    }

    /// Reserve and publish a fresh zeroed chunk of `size` bytes.
    fn grow(&self, size: u64) -> Result<usize> {
        if self.used.fetch_add(size, RELAXED) + size > self.mem_limit {
            self.used.fetch_sub(size, RELAXED);
            return Err(Status::MemoryOverflow("dram"));
        }
        let chunk: usize = self.next_chunk.fetch_add(1, RELAXED);
        if chunk >= MAX_CHUNKS {
            self.used.fetch_sub(size, RELAXED);
            return Err(Status::MemoryOverflow("dram chunk table"));
        }

        let layout = Layout::from_size_align(size as usize, ALLOC_ALIGN as usize)
            .map_err(|_| Status::InvalidArgument("bad dram allocation size"))?;
        // SAFETY: layout has non-zero size.
        let ptr: *mut u8 = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            self.used.fetch_sub(size, RELAXED);
            return Err(Status::MemoryOverflow("dram"));
        }

        self.owned.lock().push(OwnedChunk { ptr, layout });
        // Publish after the zeroed chunk is fully set up.
        self.chunk_bases[chunk].store(ptr, WRITE_ORD);
        debug_log!("dram chunk {} published, size={}", chunk, size);
        Ok(chunk)
    }

    /// Arena lane for the calling thread.
    fn lane(&self) -> usize {
        static NEXT_LANE: AtomicUsize = AtomicUsize::new(0);
        thread_local! {
            static THREAD_LANE: Cell<usize> = const { Cell::new(usize::MAX) };
        }
        THREAD_LANE.with(|lane| {
            if lane.get() == usize::MAX {
                lane.set(NEXT_LANE.fetch_add(1, RELAXED));
            }
            lane.get() % self.arenas.len()
        })
    }
}
