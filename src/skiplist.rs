//! Filepath: src/skiplist.rs
//!
//! Concurrent multi-level skiplist over one sorted collection.
//!
//! The skiplist is a DRAM index over records that form a doubly linked list
//! in PMem, ordered by encoded key. Forward traversal is lock-free; writers
//! coordinate with the hash index by locking the slot mutexes of the write
//! position's PMem neighbors plus the key's own slot, in address order.
//!
//! A write proceeds in two phases: splice the new record into the PMem list
//! (forward pointer persisted first, so recovery can repair a torn splice
//! from back pointers), then link the DRAM node bottom-up so readers always
//! find a fully linked lower-level path before discovering the node higher
//! up. The caller publishes the record through the hash index while still
//! holding the lock set; a failed write publishes nothing.

pub mod node;

use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use seize::{Collector, Guard, LocalGuard};

use crate::hash_table::{HashTable, KeyHashHint};
use crate::pmem::{NULL_OFFSET, PmemAllocator};
use crate::record::DlDataEntry;
use crate::status::{Result, Status};
use crate::tracing_helpers::{debug_log, error_log};

pub use node::{CACHE_LEVEL, MAX_HEIGHT, SkiplistNode};

// ============================================================================
//  Capability trait
// ============================================================================

/// Capabilities of a named, ordered record collection.
pub trait SortedCollection {
    fn id(&self) -> u64;
    fn name(&self) -> &str;
}

// ============================================================================
//  Splice
// ============================================================================

/// Per-operation scratch recording the write position across all levels.
///
/// After a seek for `key`: `prevs[l]` is the last node whose key precedes
/// `key` and `nexts[l]` the first node whose key is >= `key`, for every
/// level `l in [1, MAX_HEIGHT]`. At level 1 the PMem neighbors are cached
/// too: `next_data_entry` is `prev_data_entry`'s successor on PMem, which
/// may be a tombstone no DRAM node references.
pub struct Splice {
    pub prevs: [*mut SkiplistNode; MAX_HEIGHT + 1],
    pub nexts: [*mut SkiplistNode; MAX_HEIGHT + 1],
    pub prev_data_entry: *mut DlDataEntry,
    pub next_data_entry: *mut DlDataEntry,
}

impl Default for Splice {
    fn default() -> Self {
        Self {
            prevs: [std::ptr::null_mut(); MAX_HEIGHT + 1],
            nexts: [std::ptr::null_mut(); MAX_HEIGHT + 1],
            prev_data_entry: std::ptr::null_mut(),
            next_data_entry: std::ptr::null_mut(),
        }
    }
}

impl Splice {
    /// Repair a single level after a failed validation, advancing
    /// `prevs[level]` until `nexts[level]` is the first node >= `key`.
    pub fn recompute(&mut self, key: &[u8], level: usize) {
        loop {
            // SAFETY: prevs[level] was a live node when recorded and stays
            // reachable under the caller's epoch guard.
            let next: *mut SkiplistNode = unsafe { (*self.prevs[level]).next(level) };
            if next.is_null() {
                self.nexts[level] = next;
                break;
            }
            // SAFETY: next was acquire-loaded from a live node.
            if key > unsafe { (*next).key() } {
                self.prevs[level] = next;
            } else {
                self.nexts[level] = next;
                break;
            }
        }
    }
}

// ============================================================================
//  LockSet
// ============================================================================

/// Proof that the slot mutexes covering a write position are held.
///
/// Produced only by [`Skiplist::find_and_lock_write_pos`]. Splice-mutating
/// operations take a reference as evidence; dropping it releases every
/// lock.
#[must_use = "releasing the write position without using it is a logic error"]
pub struct LockSet<'a> {
    guards: Vec<MutexGuard<'a, ()>>,
}

impl LockSet<'_> {
    /// Number of distinct slot mutexes held.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

// ============================================================================
//  Skiplist
// ============================================================================

/// Ordered index over one named collection.
pub struct Skiplist {
    header: NonNull<SkiplistNode>,
    name: String,
    id: u64,
    hash_table: Arc<HashTable>,
    pmem: Arc<dyn PmemAllocator>,
    collector: Collector,
}

// SAFETY: all shared node state is accessed through atomics; the header
// pointer is immutable after construction and freed only on drop.
unsafe impl Send for Skiplist {}
unsafe impl Sync for Skiplist {}

impl Skiplist {
    /// Build the index for a collection whose header record is
    /// `header_entry`. All levels start empty.
    pub fn new(
        name: &str,
        id: u64,
        header_entry: *mut DlDataEntry,
        pmem: Arc<dyn PmemAllocator>,
        hash_table: Arc<HashTable>,
    ) -> Result<Self> {
        let header: NonNull<SkiplistNode> =
            SkiplistNode::alloc(name.as_bytes(), header_entry, MAX_HEIGHT as u16)
                .ok_or(Status::MemoryOverflow("skiplist header node"))?;
        Ok(Self {
            header,
            name: name.to_owned(),
            id,
            hash_table,
            pmem,
            collector: Collector::new(),
        })
    }

    /// The header node. Its key caches the collection name; its data entry
    /// is the collection's header record.
    #[inline]
    #[must_use]
    pub fn header(&self) -> &SkiplistNode {
        // SAFETY: the header lives as long as self.
        unsafe { self.header.as_ref() }
    }

    /// DRAM address of the header node, published in the collection's hash
    /// entry.
    #[inline]
    #[must_use]
    pub fn header_addr(&self) -> u64 {
        self.header.as_ptr() as u64
    }

    /// Pin the calling thread into the collection's reclamation epoch.
    /// Traversals and seeks require an active guard.
    #[inline]
    #[must_use]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// Geometric height with p = 0.5, in `[1, MAX_HEIGHT]`.
    #[must_use]
    pub fn random_height() -> u16 {
        thread_local! {
            static HEIGHT_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
        }
        HEIGHT_RNG.with(|rng| {
            let mut rng = rng.borrow_mut();
            let mut height: u16 = 1;
            while (height as usize) < MAX_HEIGHT && rng.gen_bool(0.5) {
                height += 1;
            }
            height
        })
    }

    /// Top-down search for `key`, filling `splice` (see [`Splice`] for the
    /// postcondition). Lock-free.
    pub fn seek(&self, key: &[u8], splice: &mut Splice, _guard: &LocalGuard<'_>) {
        self.seek_impl(key, splice);
    }

    fn seek_impl(&self, key: &[u8], splice: &mut Splice) {
        let mut prev: *mut SkiplistNode = self.header.as_ptr();
        for level in (1..=MAX_HEIGHT).rev() {
            loop {
                // SAFETY: prev is the header or a node acquire-loaded below;
                // nodes stay alive under the epoch.
                let next: *mut SkiplistNode = unsafe { (*prev).next(level) };
                if next.is_null() {
                    splice.prevs[level] = prev;
                    splice.nexts[level] = next;
                    break;
                }
                // SAFETY: as above.
                if key > unsafe { (*next).key() } {
                    prev = next;
                } else {
                    splice.prevs[level] = prev;
                    splice.nexts[level] = next;
                    break;
                }
            }
        }
        // SAFETY: prevs[1] is live; its record's successor is read straight
        // from PMem and may be a tombstone without a node.
        unsafe {
            splice.prev_data_entry = (*splice.prevs[1]).data_entry();
            splice.next_data_entry = self
                .pmem
                .offset_to_addr((*splice.prev_data_entry).load_next())
                .cast::<DlDataEntry>();
        }
    }

    /// Find and lock a consistent write position for `insert_key`.
    ///
    /// Collects the distinct slot mutexes guarding the position's PMem
    /// neighbors plus `hint`'s own slot, locks them in address order, and
    /// re-validates the position. Inconsistent positions are retried
    /// internally for fresh inserts; for updates (`updated_entry` set, the
    /// record being replaced or deleted) a conflict returns `Ok(None)` and
    /// the caller re-drives from the hash index.
    pub fn find_and_lock_write_pos<'a>(
        &'a self,
        splice: &mut Splice,
        insert_key: &[u8],
        hint: &KeyHashHint<'a>,
        updated_entry: Option<*const DlDataEntry>,
        guard: &LocalGuard<'_>,
    ) -> Result<Option<LockSet<'a>>> {
        let mut stale: bool = false;
        loop {
            let prev_entry: *mut DlDataEntry;
            let next_entry: *mut DlDataEntry;
            if let Some(victim) = updated_entry {
                // SAFETY: victim came from a hash entry this caller matched;
                // the epoch keeps it readable even if replaced concurrently.
                unsafe {
                    prev_entry = self
                        .pmem
                        .offset_to_addr((*victim).load_prev())
                        .cast::<DlDataEntry>();
                    next_entry = self
                        .pmem
                        .offset_to_addr((*victim).load_next())
                        .cast::<DlDataEntry>();
                }
            } else {
                if stale {
                    // Stale prevs are still valid descent points: unlinked
                    // nodes keep their forward pointers until reclaimed.
                    for level in 1..=MAX_HEIGHT {
                        splice.recompute(insert_key, level);
                    }
                    // SAFETY: prevs[1] is live under the epoch guard.
                    unsafe {
                        splice.prev_data_entry = (*splice.prevs[1]).data_entry();
                        splice.next_data_entry = self
                            .pmem
                            .offset_to_addr((*splice.prev_data_entry).load_next())
                            .cast::<DlDataEntry>();
                    }
                } else {
                    self.seek(insert_key, splice, guard);
                }
                prev_entry = splice.prev_data_entry;
                next_entry = splice.next_data_entry;
            }

            let mut spins: Vec<&'a Mutex<()>> = Vec::with_capacity(3);
            spins.push(hint.spin);
            // SAFETY: prev_entry is non-null (the header record at minimum);
            // next_entry is checked.
            unsafe {
                spins.push(self.hash_table.hint((*prev_entry).key()).spin);
                if !next_entry.is_null() {
                    spins.push(self.hash_table.hint((*next_entry).key()).spin);
                }
            }
            spins.sort_by_key(|spin| *spin as *const Mutex<()> as usize);
            spins.dedup_by_key(|spin| *spin as *const Mutex<()> as usize);
            let guards: Vec<MutexGuard<'a, ()>> = spins.iter().map(|spin| spin.lock()).collect();

            if let Some(victim) = updated_entry {
                let victim_offset: u64 = self.pmem.addr_to_offset(victim.cast::<u8>());
                // SAFETY: entries read under the locks that guard their links.
                let still_linked: bool = unsafe {
                    (*prev_entry).load_next() == victim_offset
                        && (next_entry.is_null() || (*next_entry).load_prev() == victim_offset)
                        && (*victim).load_prev() == self.pmem.addr_to_offset(prev_entry.cast::<u8>())
                };
                if !still_linked {
                    return Ok(None);
                }
                // Locate the victim's node now that the position is frozen.
                self.seek_impl(insert_key, splice);
                let node: *mut SkiplistNode = splice.nexts[1];
                // SAFETY: nexts[1] is live under the epoch guard.
                let node_matches: bool =
                    !node.is_null() && unsafe { (*node).data_entry().cast_const() == victim };
                if !node_matches {
                    return Ok(None);
                }
                splice.prev_data_entry = prev_entry;
                splice.next_data_entry = next_entry;
                return Ok(Some(LockSet { guards }));
            }

            // Fresh insert: the splice must not have moved while we locked.
            // SAFETY: nodes and entries are kept alive by the epoch guard.
            let still_valid: bool = unsafe {
                (*splice.prevs[1]).next(1) == splice.nexts[1]
                    && (*prev_entry).load_next() == self.pmem.addr_to_offset(next_entry.cast::<u8>())
            };
            if still_valid {
                // A same-key record appearing here means the caller lost a
                // race it can only resolve back at the hash index.
                let same_key: bool = !splice.nexts[1].is_null()
                    // SAFETY: as above.
                    && unsafe { (*splice.nexts[1]).key() } == insert_key;
                if same_key {
                    return Ok(None);
                }
                return Ok(Some(LockSet { guards }));
            }
            drop(guards);
            stale = true;
        }
    }

    /// Splice a fully persisted record and its freshly allocated node into
    /// the collection.
    ///
    /// Preconditions: `_lock` covers this position; `inserting_entry` is
    /// persisted with its `prev`/`next` already pointing at the splice's
    /// neighbors. The caller publishes the hash entry for the record while
    /// the lock set is still held.
    pub fn insert_data_entry(
        &self,
        _lock: &LockSet<'_>,
        splice: &Splice,
        inserting_entry: *mut DlDataEntry,
        node: NonNull<SkiplistNode>,
    ) -> *mut SkiplistNode {
        let entry_offset: u64 = self.pmem.addr_to_offset(inserting_entry.cast_const().cast::<u8>());

        // Phase 1: PMem list. Forward pointer first; a crash between the
        // two persists is repaired from back pointers at recovery.
        // SAFETY: neighbors are frozen by the lock set.
        unsafe {
            debug_assert_eq!(
                (*inserting_entry).prev,
                self.pmem.addr_to_offset(splice.prev_data_entry.cast_const().cast::<u8>())
            );
            (*splice.prev_data_entry).store_next(entry_offset);
            self.pmem.persist(
                std::ptr::addr_of!((*splice.prev_data_entry).next).cast::<u8>(),
                std::mem::size_of::<u64>(),
            );
            if !splice.next_data_entry.is_null() {
                (*splice.next_data_entry).store_prev(entry_offset);
                self.pmem.persist(
                    std::ptr::addr_of!((*splice.next_data_entry).prev).cast::<u8>(),
                    std::mem::size_of::<u64>(),
                );
            }
        }

        // Phase 2: DRAM levels, bottom-up. The node's own pointers are set
        // before the release store that makes the level reachable.
        let node_ptr: *mut SkiplistNode = node.as_ptr();
        // SAFETY: node is unpublished until the set_next below; prevs are
        // frozen by the lock set.
        unsafe {
            for level in 1..=(*node_ptr).height() as usize {
                (*node_ptr).relaxed_set_next(level, splice.nexts[level]);
                (*splice.prevs[level]).set_next(level, node_ptr);
            }
        }
        node_ptr
    }

    /// Replace the record behind an existing key.
    ///
    /// The splice was positioned by [`Skiplist::find_and_lock_write_pos`]
    /// with `updated_entry` set: `nexts[1]` is the victim's node and
    /// `prev_data_entry`/`next_data_entry` are the victim's PMem neighbors.
    /// `new_entry` is persisted and already points at those neighbors; the
    /// superseded record stays readable until the epoch reclaimer frees it.
    pub fn update_data_entry(
        &self,
        _lock: &LockSet<'_>,
        splice: &Splice,
        new_entry: *mut DlDataEntry,
    ) -> *mut SkiplistNode {
        let entry_offset: u64 = self.pmem.addr_to_offset(new_entry.cast_const().cast::<u8>());
        let node: *mut SkiplistNode = splice.nexts[1];
        debug_assert!(!node.is_null());

        // SAFETY: neighbors and node are frozen by the lock set.
        unsafe {
            (*splice.prev_data_entry).store_next(entry_offset);
            self.pmem.persist(
                std::ptr::addr_of!((*splice.prev_data_entry).next).cast::<u8>(),
                std::mem::size_of::<u64>(),
            );
            if !splice.next_data_entry.is_null() {
                (*splice.next_data_entry).store_prev(entry_offset);
                self.pmem.persist(
                    std::ptr::addr_of!((*splice.next_data_entry).prev).cast::<u8>(),
                    std::mem::size_of::<u64>(),
                );
            }
            (*node).set_data_entry(new_entry);
        }
        node
    }

    /// Remove a key: the persisted `tombstone_entry` replaces the victim on
    /// the PMem list, and the victim's node is unlinked top-down, keeping
    /// lower levels traversable until all upper references are gone. The
    /// node's storage goes to the epoch reclaimer.
    ///
    /// Splice preconditions are those of [`Skiplist::update_data_entry`].
    pub fn delete_data_entry(
        &self,
        _lock: &LockSet<'_>,
        splice: &Splice,
        tombstone_entry: *mut DlDataEntry,
        guard: &LocalGuard<'_>,
    ) {
        let node: *mut SkiplistNode = splice.nexts[1];
        debug_assert!(!node.is_null());

        self.update_data_entry(_lock, splice, tombstone_entry);

        // SAFETY: prevs are frozen by the lock set; the node occupies every
        // level up to its height.
        unsafe {
            for level in (1..=(*node).height() as usize).rev() {
                debug_assert_eq!((*splice.prevs[level]).next(level), node);
                (*splice.prevs[level]).set_next(level, (*node).next(level));
            }
            // SAFETY: the node is now unreachable from the header.
            guard.defer_retire(node, node::reclaim_node);
        }
    }

    /// Re-splice every live record of the collection, serially.
    ///
    /// Called once at engine open, after the hash index has been
    /// repopulated from PMem and before any concurrent access; the skiplist
    /// must still be empty. Back-pointer inconsistencies are fatal.
    pub fn rebuild(&self) -> Result<()> {
        let header_entry: *mut DlDataEntry = self.header().data_entry();
        // SAFETY: the header record exists for the collection's lifetime.
        let mut prev_offset: u64 = self.pmem.addr_to_offset(header_entry.cast_const().cast::<u8>());
        let mut next_offset: u64 = unsafe { (*header_entry).next };
        let mut splice = Splice::default();
        let mut rebuilt: u64 = 0;

        while next_offset != NULL_OFFSET {
            let entry: *mut DlDataEntry = self.pmem.offset_to_addr(next_offset).cast::<DlDataEntry>();
            // SAFETY: offsets come from the persisted chain being walked.
            unsafe {
                if (*entry).prev != prev_offset {
                    error_log!(
                        "collection {}: record at {} has back pointer {}, expected {}",
                        self.id,
                        next_offset,
                        (*entry).prev,
                        prev_offset
                    );
                    return Err(Status::Corruption("sorted record back pointer mismatch"));
                }
                if !(*entry).is_tombstone() {
                    let height: u16 = Self::random_height();
                    let node: NonNull<SkiplistNode> =
                        SkiplistNode::alloc((*entry).key(), entry, height)
                            .ok_or(Status::MemoryOverflow("skiplist node"))?;
                    self.seek_impl((*entry).key(), &mut splice);
                    for level in 1..=height as usize {
                        node.as_ref().relaxed_set_next(level, splice.nexts[level]);
                        (*splice.prevs[level]).relaxed_set_next(level, node.as_ptr());
                    }
                    rebuilt += 1;
                }
                prev_offset = next_offset;
                next_offset = (*entry).next;
            }
        }
        debug_log!("collection {}: rebuilt {} nodes", self.id, rebuilt);
        Ok(())
    }

    /// Consistency audit: level-1 keys strictly increase and visit the same
    /// records as the PMem chain, tombstones aside. Diagnostic; walks the
    /// whole collection.
    pub fn audit_order(&self, _guard: &LocalGuard<'_>) -> Result<()> {
        // SAFETY: traversal under the epoch guard; entries via their nodes.
        unsafe {
            let mut node: *mut SkiplistNode = self.header().next(1);
            let mut pm_offset: u64 = (*self.header().data_entry()).load_next();
            let mut last_key: Option<Vec<u8>> = None;

            while !node.is_null() {
                let node_key: Vec<u8> = (*node).key().to_vec();
                if let Some(previous) = &last_key {
                    if &node_key <= previous {
                        return Err(Status::Corruption("skiplist level-1 order violation"));
                    }
                }
                loop {
                    if pm_offset == NULL_OFFSET {
                        return Err(Status::Corruption("pmem chain ends before skiplist"));
                    }
                    let entry: *const DlDataEntry =
                        self.pmem.offset_to_addr(pm_offset).cast::<DlDataEntry>();
                    if (*entry).is_tombstone() {
                        pm_offset = (*entry).load_next();
                        continue;
                    }
                    if entry != (*node).data_entry().cast_const() {
                        return Err(Status::Corruption("skiplist and pmem chain disagree"));
                    }
                    pm_offset = (*entry).load_next();
                    break;
                }
                last_key = Some(node_key);
                node = (*node).next(1);
            }

            while pm_offset != NULL_OFFSET {
                let entry: *const DlDataEntry =
                    self.pmem.offset_to_addr(pm_offset).cast::<DlDataEntry>();
                if !(*entry).is_tombstone() {
                    return Err(Status::Corruption("pmem record missing from skiplist"));
                }
                pm_offset = (*entry).load_next();
            }
        }
        Ok(())
    }
}

impl SortedCollection for Skiplist {
    #[inline]
    fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Skiplist {
    fn drop(&mut self) {
        // Exclusive access: free every node still linked at level 1. Nodes
        // retired earlier are unreachable from here and are reclaimed by
        // the collector's own drop.
        let mut node: *mut SkiplistNode = self.header.as_ptr();
        while !node.is_null() {
            // SAFETY: teardown is single-threaded; each node is freed once.
            unsafe {
                let next: *mut SkiplistNode = (*node).relaxed_next(1);
                SkiplistNode::dealloc(node);
                node = next;
            }
        }
    }
}
