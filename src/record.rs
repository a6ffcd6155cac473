//! Filepath: src/record.rs
//!
//! On-PMem record layouts consumed by the index.
//!
//! The canonical form of every record lives in persistent memory. The index
//! reads records through raw pointers obtained from the PMem allocator and
//! never owns them; lifetime is governed by the external epoch reclaimer.
//!
//! Two layouts exist:
//! - [`DataEntry`]: fixed header + inline key + inline value (point records)
//! - [`DlDataEntry`]: the same header plus `prev`/`next` PMem offsets,
//!   forming the doubly linked list that backs a sorted collection.

use std::sync::atomic::AtomicU64;

use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::pmem::NULL_OFFSET;

// ============================================================================
//  Record type bits
// ============================================================================

/// Point data record.
pub const STRING_RECORD: u16 = 1 << 0;

/// Point delete record. Replaces a [`STRING_RECORD`] hash entry in place.
pub const STRING_DELETE_RECORD: u16 = 1 << 1;

/// Sorted-collection data record (doubly linked on PMem).
pub const SORTED_RECORD: u16 = 1 << 2;

/// Sorted-collection tombstone. Retained on PMem until GC; iterators skip it.
pub const SORTED_DELETE_RECORD: u16 = 1 << 3;

/// Sorted-collection header record. The matching hash entry holds the DRAM
/// address of the skiplist header node rather than a PMem offset.
pub const SORTED_HEADER_RECORD: u16 = 1 << 4;

/// Mask matching point records, live or deleted.
pub const POINT_RECORD_MASK: u16 = STRING_RECORD | STRING_DELETE_RECORD;

/// Mask matching sorted data records, live or deleted.
pub const SORTED_RECORD_MASK: u16 = SORTED_RECORD | SORTED_DELETE_RECORD;

/// Mask matching every doubly-linked layout, header included.
pub const DL_RECORD_MASK: u16 = SORTED_RECORD_MASK | SORTED_HEADER_RECORD;

/// True when `record_type` names a doubly-linked layout.
#[inline]
#[must_use]
pub const fn is_dl_type(record_type: u16) -> bool {
    record_type & DL_RECORD_MASK != 0
}

// ============================================================================
//  DataHeader
// ============================================================================

/// Fixed record header shared by both layouts. 16 bytes on PMem.
///
/// `timestamp` orders versions of the same key during engine recovery; the
/// index itself never inspects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DataHeader {
    pub record_type: u16,
    pub key_size: u16,
    pub value_size: u32,
    pub timestamp: u64,
}

impl DataHeader {
    #[inline]
    #[must_use]
    pub const fn new(record_type: u16, key_size: u16, value_size: u32, timestamp: u64) -> Self {
        Self {
            record_type,
            key_size,
            value_size,
            timestamp,
        }
    }
}

// ============================================================================
//  DataEntry (point records)
// ============================================================================

/// A point record on PMem: header, then key bytes, then value bytes.
#[derive(Debug)]
#[repr(C)]
pub struct DataEntry {
    pub header: DataHeader,
    // key bytes, then value bytes, follow inline
}

impl DataEntry {
    /// Total on-PMem size for a record carrying `key_len` + `value_len`.
    #[inline]
    #[must_use]
    pub const fn size_of(key_len: usize, value_len: usize) -> usize {
        std::mem::size_of::<DataHeader>() + key_len + value_len
    }

    /// Inline key bytes.
    ///
    /// # Safety
    ///
    /// `self` must reference a fully written record: the allocation behind
    /// it must extend `header.key_size + header.value_size` bytes past the
    /// header.
    #[inline]
    #[must_use]
    pub unsafe fn key(&self) -> &[u8] {
        let base: *const u8 = (self as *const Self).cast::<u8>();
        // SAFETY: caller guarantees the inline region is initialized.
        unsafe {
            std::slice::from_raw_parts(
                base.add(std::mem::size_of::<DataHeader>()),
                self.header.key_size as usize,
            )
        }
    }

    /// Inline value bytes.
    ///
    /// # Safety
    ///
    /// Same contract as [`DataEntry::key`].
    #[inline]
    #[must_use]
    pub unsafe fn value(&self) -> &[u8] {
        let base: *const u8 = (self as *const Self).cast::<u8>();
        // SAFETY: caller guarantees the inline region is initialized.
        unsafe {
            std::slice::from_raw_parts(
                base.add(std::mem::size_of::<DataHeader>() + self.header.key_size as usize),
                self.header.value_size as usize,
            )
        }
    }

    /// Write a complete point record at `dst`.
    ///
    /// The caller persists the written range afterwards; until then the
    /// record is not durable.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of [`DataEntry::size_of`] bytes and
    /// 8-byte aligned.
    pub unsafe fn emplace(
        dst: *mut u8,
        record_type: u16,
        timestamp: u64,
        key: &[u8],
        value: &[u8],
    ) {
        let header = DataHeader::new(record_type, key.len() as u16, value.len() as u32, timestamp);
        // SAFETY: caller guarantees dst covers header + key + value.
        unsafe {
            dst.cast::<DataHeader>().write(header);
            let payload: *mut u8 = dst.add(std::mem::size_of::<DataHeader>());
            std::ptr::copy_nonoverlapping(key.as_ptr(), payload, key.len());
            std::ptr::copy_nonoverlapping(value.as_ptr(), payload.add(key.len()), value.len());
        }
    }
}

// ============================================================================
//  DlDataEntry (sorted records)
// ============================================================================

/// A sorted-collection record on PMem.
///
/// `prev` and `next` are PMem offsets ([`NULL_OFFSET`] terminated) keeping
/// the collection's records in encoded-key order. The list is repaired at
/// recovery by walking back pointers, so the forward pointer is always
/// persisted before the backward one during a splice.
///
/// After a record is published, its links are read lock-free by cursors
/// while splices mutate them under the write-position locks: every such
/// access must go through the `load_*`/`store_*` accessors. Plain field
/// access is reserved for unpublished records and single-threaded recovery.
#[derive(Debug)]
#[repr(C)]
pub struct DlDataEntry {
    pub header: DataHeader,
    pub prev: u64,
    pub next: u64,
    // key bytes, then value bytes, follow inline
}

impl DlDataEntry {
    /// Total on-PMem size for a record carrying `key_len` + `value_len`.
    #[inline]
    #[must_use]
    pub const fn size_of(key_len: usize, value_len: usize) -> usize {
        std::mem::size_of::<Self>() + key_len + value_len
    }

    /// Inline (encoded) key bytes.
    ///
    /// # Safety
    ///
    /// `self` must reference a fully written record: the allocation behind
    /// it must extend `header.key_size + header.value_size` bytes past the
    /// fixed fields.
    #[inline]
    #[must_use]
    pub unsafe fn key(&self) -> &[u8] {
        let base: *const u8 = (self as *const Self).cast::<u8>();
        // SAFETY: caller guarantees the inline region is initialized.
        unsafe {
            std::slice::from_raw_parts(
                base.add(std::mem::size_of::<Self>()),
                self.header.key_size as usize,
            )
        }
    }

    /// Inline value bytes.
    ///
    /// # Safety
    ///
    /// Same contract as [`DlDataEntry::key`].
    #[inline]
    #[must_use]
    pub unsafe fn value(&self) -> &[u8] {
        let base: *const u8 = (self as *const Self).cast::<u8>();
        // SAFETY: caller guarantees the inline region is initialized.
        unsafe {
            std::slice::from_raw_parts(
                base.add(std::mem::size_of::<Self>() + self.header.key_size as usize),
                self.header.value_size as usize,
            )
        }
    }

    /// True when this record is a tombstone.
    #[inline]
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.header.record_type == SORTED_DELETE_RECORD
    }

    #[inline]
    fn prev_word(&self) -> &AtomicU64 {
        // SAFETY: the field is 8-aligned and only ever accessed atomically
        // once the record is published.
        unsafe { &*std::ptr::addr_of!(self.prev).cast::<AtomicU64>() }
    }

    #[inline]
    fn next_word(&self) -> &AtomicU64 {
        // SAFETY: as in prev_word.
        unsafe { &*std::ptr::addr_of!(self.next).cast::<AtomicU64>() }
    }

    /// Back link, acquire-loaded.
    #[inline]
    #[must_use]
    pub fn load_prev(&self) -> u64 {
        self.prev_word().load(READ_ORD)
    }

    /// Forward link, acquire-loaded.
    #[inline]
    #[must_use]
    pub fn load_next(&self) -> u64 {
        self.next_word().load(READ_ORD)
    }

    /// Publish a new back link. Caller holds the write-position locks.
    #[inline]
    pub fn store_prev(&self, offset: u64) {
        self.prev_word().store(offset, WRITE_ORD);
    }

    /// Publish a new forward link. Caller holds the write-position locks.
    #[inline]
    pub fn store_next(&self, offset: u64) {
        self.next_word().store(offset, WRITE_ORD);
    }

    /// Write a complete sorted record at `dst`.
    ///
    /// The caller persists the written range afterwards.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of [`DlDataEntry::size_of`] bytes and
    /// 8-byte aligned.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn emplace(
        dst: *mut u8,
        record_type: u16,
        timestamp: u64,
        prev: u64,
        next: u64,
        key: &[u8],
        value: &[u8],
    ) {
        let header = DataHeader::new(record_type, key.len() as u16, value.len() as u32, timestamp);
        // SAFETY: caller guarantees dst covers the fixed fields + key + value.
        unsafe {
            let entry: *mut Self = dst.cast::<Self>();
            (*entry).header = header;
            (*entry).prev = prev;
            (*entry).next = next;
            let payload: *mut u8 = dst.add(std::mem::size_of::<Self>());
            std::ptr::copy_nonoverlapping(key.as_ptr(), payload, key.len());
            std::ptr::copy_nonoverlapping(value.as_ptr(), payload.add(key.len()), value.len());
        }
    }
}

/// Size check: both fixed layouts must stay pointer-aligned so inline key
/// bytes start on an 8-byte boundary.
const _: () = {
    assert!(std::mem::size_of::<DataHeader>() == 16);
    assert!(std::mem::size_of::<DlDataEntry>() == 32);
    assert!(NULL_OFFSET == 0);
};
