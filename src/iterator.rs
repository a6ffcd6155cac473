//! Filepath: src/iterator.rs
//!
//! Ordered cursor over one sorted collection.
//!
//! The cursor walks the collection's PMem doubly linked list directly; the
//! skiplist is only consulted to position on a seek. It is a weak view:
//! each access observes the records live at that moment, and the guard it
//! holds pins the reclamation epoch so observed records stay readable.

use std::sync::Arc;

use seize::LocalGuard;

use crate::key::{encode_collection_key, user_key};
use crate::pmem::PmemAllocator;
use crate::record::DlDataEntry;
use crate::skiplist::{Skiplist, SortedCollection, Splice};

/// Capabilities of an ordered cursor, independent of the index behind it.
pub trait OrderedIter {
    /// Position on the first record whose user key is >= `key`.
    fn seek(&mut self, key: &[u8]);
    /// Position on the collection's first record.
    fn seek_to_first(&mut self);
    /// True while positioned on a record.
    fn valid(&self) -> bool;
    /// Advance; returns the new validity.
    fn next(&mut self) -> bool;
    /// Step back; returns the new validity.
    fn prev(&mut self) -> bool;
    /// User key at the current position. Empty when invalid.
    fn key(&self) -> &[u8];
    /// Value at the current position. Empty when invalid.
    fn value(&self) -> &[u8];
}

/// Cursor over a [`Skiplist`] collection.
pub struct SortedIterator<'a> {
    skiplist: &'a Skiplist,
    pmem: Arc<dyn PmemAllocator>,
    current: *const DlDataEntry,
    guard: LocalGuard<'a>,
}

impl Skiplist {
    /// Open a cursor. The cursor registers itself in the collection's
    /// reclamation epoch for its whole lifetime.
    #[must_use]
    pub fn iter<'a>(&'a self, pmem: Arc<dyn PmemAllocator>) -> SortedIterator<'a> {
        SortedIterator {
            skiplist: self,
            pmem,
            current: std::ptr::null(),
            guard: self.guard(),
        }
    }
}

impl SortedIterator<'_> {
    /// Skip forward over tombstones; lands on a live record or invalidates.
    fn settle_forward(&mut self) {
        // SAFETY: current either is null or references a record reachable
        // from the chain under this cursor's guard.
        unsafe {
            while !self.current.is_null() && (*self.current).is_tombstone() {
                self.current = self
                    .pmem
                    .offset_to_addr((*self.current).load_next())
                    .cast_const()
                    .cast::<DlDataEntry>();
            }
        }
    }
}

impl OrderedIter for SortedIterator<'_> {
    fn seek(&mut self, key: &[u8]) {
        let encoded: Vec<u8> = encode_collection_key(self.skiplist.id(), key);
        let mut splice = Splice::default();
        self.skiplist.seek(&encoded, &mut splice, &self.guard);
        self.current = splice.next_data_entry.cast_const();
        self.settle_forward();
    }

    fn seek_to_first(&mut self) {
        // SAFETY: the header record exists for the collection's lifetime.
        let first: u64 = unsafe { (*self.skiplist.header().data_entry()).load_next() };
        self.current = self.pmem.offset_to_addr(first).cast_const().cast::<DlDataEntry>();
        self.settle_forward();
    }

    #[inline]
    fn valid(&self) -> bool {
        !self.current.is_null()
    }

    fn next(&mut self) -> bool {
        if !self.valid() {
            return false;
        }
        // SAFETY: current is a live record under the guard.
        self.current = unsafe {
            self.pmem
                .offset_to_addr((*self.current).load_next())
                .cast_const()
                .cast::<DlDataEntry>()
        };
        self.settle_forward();
        self.valid()
    }

    fn prev(&mut self) -> bool {
        if !self.valid() {
            return false;
        }
        let header_entry: *const DlDataEntry = self.skiplist.header().data_entry().cast_const();
        // SAFETY: back pointers stay within the chain; the walk terminates
        // at the header record, which is never a tombstone.
        unsafe {
            loop {
                self.current = self
                    .pmem
                    .offset_to_addr((*self.current).load_prev())
                    .cast_const()
                    .cast::<DlDataEntry>();
                if self.current.is_null() || self.current == header_entry {
                    self.current = std::ptr::null();
                    return false;
                }
                if !(*self.current).is_tombstone() {
                    return true;
                }
            }
        }
    }

    fn key(&self) -> &[u8] {
        if !self.valid() {
            return &[];
        }
        // SAFETY: current is a live record under the guard; sorted records
        // always carry the 8-byte collection prefix.
        user_key(unsafe { (*self.current).key() })
    }

    fn value(&self) -> &[u8] {
        if !self.valid() {
            return &[];
        }
        // SAFETY: as in key.
        unsafe { (*self.current).value() }
    }
}
