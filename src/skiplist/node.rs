//! Variable-height skiplist nodes.
//!
//! A node is one allocation with three regions:
//!
//! ```text
//! | header (16B) | next[height] atomic pointers | cached key (>= 4B) |
//! ```
//!
//! The header records everything needed to recover the allocation layout at
//! reclaim time, so retired nodes can be freed from a type-erased pointer.
//!
//! The key is cached inline when the node is tall (`height >= CACHE_LEVEL`,
//! where the key is read often during descents) or when it fits the 4-byte
//! tail that exists anyway. Otherwise `key()` reads through the referenced
//! PMem record.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::AtomicPtr;

use seize::Collector;

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};
use crate::record::DlDataEntry;

/// Maximum skiplist height; the header node owns all of them.
pub const MAX_HEIGHT: usize = 32;

/// Nodes at or above this height always cache their key inline.
pub const CACHE_LEVEL: u16 = 3;

/// Reserved key-cache tail present in every node.
const CACHE_TAIL: usize = 4;

/// One skiplist node. Always heap-allocated through [`SkiplistNode::alloc`];
/// the struct only describes the fixed header region.
#[repr(C)]
pub struct SkiplistNode {
    data_entry: AtomicPtr<DlDataEntry>,
    height: u16,
    cached_key_size: u16,
    _pad: u32,
    // next[height] pointers follow, then the cached key region
}

const _: () = assert!(std::mem::size_of::<SkiplistNode>() == 16);

impl SkiplistNode {
    /// Allocate a node of `height` referencing `data_entry`.
    ///
    /// Returns `None` when the allocator fails; callers surface that as a
    /// memory overflow status.
    #[must_use]
    pub fn alloc(key: &[u8], data_entry: *mut DlDataEntry, height: u16) -> Option<NonNull<Self>> {
        debug_assert!(height >= 1 && height as usize <= MAX_HEIGHT);
        debug_assert!(key.len() <= u16::MAX as usize);

        let cache: bool = height >= CACHE_LEVEL || key.len() <= CACHE_TAIL;
        let cached_key_size: u16 = if cache { key.len() as u16 } else { 0 };
        let layout: Layout = Self::layout_for(height, cached_key_size);

        // SAFETY: layout has non-zero size.
        let base: *mut Self = unsafe { std::alloc::alloc(layout) }.cast::<Self>();
        let node: NonNull<Self> = NonNull::new(base)?;

        // SAFETY: base covers the full layout; every region is initialized
        // before the pointer escapes.
        unsafe {
            base.write(Self {
                data_entry: AtomicPtr::new(data_entry),
                height,
                cached_key_size,
                _pad: 0,
            });
            let nexts: *mut AtomicPtr<Self> = base.add(1).cast::<AtomicPtr<Self>>();
            for level in 0..height as usize {
                nexts.add(level).write(AtomicPtr::new(std::ptr::null_mut()));
            }
            if cache {
                let key_dst: *mut u8 = nexts.add(height as usize).cast::<u8>();
                std::ptr::copy_nonoverlapping(key.as_ptr(), key_dst, key.len());
            }
        }
        Some(node)
    }

    /// Free a node allocated by [`SkiplistNode::alloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc`, be unreachable from any list, and not
    /// be freed twice.
    pub(crate) unsafe fn dealloc(ptr: *mut Self) {
        // SAFETY: the header still holds the parameters the allocation was
        // made with.
        unsafe {
            let layout: Layout = Self::layout_for((*ptr).height, (*ptr).cached_key_size);
            std::alloc::dealloc(ptr.cast::<u8>(), layout);
        }
    }

    #[inline]
    fn layout_for(height: u16, cached_key_size: u16) -> Layout {
        let size: usize = std::mem::size_of::<Self>()
            + height as usize * std::mem::size_of::<AtomicPtr<Self>>()
            + (cached_key_size as usize).max(CACHE_TAIL);
        // SAFETY: align is a power of two and size cannot overflow isize.
        unsafe { Layout::from_size_align_unchecked(size, std::mem::align_of::<Self>()) }
    }

    /// Number of valid next levels.
    #[inline]
    #[must_use]
    pub fn height(&self) -> u16 {
        self.height
    }

    /// The referenced PMem record.
    #[inline]
    #[must_use]
    pub fn data_entry(&self) -> *mut DlDataEntry {
        self.data_entry.load(READ_ORD)
    }

    /// Repoint the node at a replacement record. Caller holds the write
    /// position locks for this key.
    #[inline]
    pub fn set_data_entry(&self, entry: *mut DlDataEntry) {
        self.data_entry.store(entry, WRITE_ORD);
    }

    /// The node's (encoded) key: the inline cache when present, otherwise
    /// the key bytes of the referenced record.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        if self.cached_key_size != 0 {
            // SAFETY: the cache region was written at alloc time and is
            // immutable afterwards.
            unsafe {
                let nexts: *const AtomicPtr<Self> =
                    (self as *const Self).add(1).cast::<AtomicPtr<Self>>();
                std::slice::from_raw_parts(
                    nexts.add(self.height as usize).cast::<u8>(),
                    self.cached_key_size as usize,
                )
            }
        } else {
            // SAFETY: the record outlives the node per the epoch contract;
            // replacement records carry the same key bytes.
            unsafe { (*self.data_entry.load(READ_ORD)).key() }
        }
    }

    #[inline]
    fn next_slot(&self, level: usize) -> &AtomicPtr<Self> {
        debug_assert!(level >= 1 && level <= self.height as usize);
        // SAFETY: level is within the node's next array.
        unsafe {
            &*(self as *const Self)
                .add(1)
                .cast::<AtomicPtr<Self>>()
                .add(level - 1)
        }
    }

    /// Successor at `level`, acquire-loaded.
    #[inline]
    #[must_use]
    pub fn next(&self, level: usize) -> *mut Self {
        self.next_slot(level).load(READ_ORD)
    }

    /// Publish a successor at `level`.
    #[inline]
    pub fn set_next(&self, level: usize, node: *mut Self) {
        self.next_slot(level).store(node, WRITE_ORD);
    }

    /// Successor at `level` without ordering; single-threaded paths only.
    #[inline]
    #[must_use]
    pub fn relaxed_next(&self, level: usize) -> *mut Self {
        self.next_slot(level).load(RELAXED)
    }

    /// Store a successor without ordering; single-threaded paths only.
    #[inline]
    pub fn relaxed_set_next(&self, level: usize, node: *mut Self) {
        self.next_slot(level).store(node, RELAXED);
    }

    /// Compare-and-swap the successor at `level`.
    #[inline]
    pub fn cas_next(&self, level: usize, expected: *mut Self, node: *mut Self) -> bool {
        self.next_slot(level)
            .compare_exchange(expected, node, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }
}

/// Reclaim a retired node (seize callback).
///
/// # Safety
///
/// - `ptr` must point to a node from [`SkiplistNode::alloc`] that has been
///   unlinked from every level.
/// - Must only be called after seize determines no readers remain.
pub(crate) unsafe fn reclaim_node(ptr: *mut SkiplistNode, _collector: &Collector) {
    // SAFETY: caller guarantees the node is unreachable and unfreed.
    unsafe { SkiplistNode::dealloc(ptr) };
}
