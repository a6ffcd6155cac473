//! Filepath: src/hash_table.rs
//!
//! Striped, open-addressed hash index.
//!
//! The table maps a key fingerprint to the PMem offset of the record's
//! canonical data entry (or, for collection headers, to the DRAM address of
//! the skiplist header node). Entries live in fixed-size buckets chained
//! through overflow blocks; a group of `slot_grain` consecutive buckets
//! shares one spin mutex.
//!
//! # Concurrency Model
//!
//! 1. Readers: never lock. Entry words are 16-byte atomics loaded with
//!    Acquire; an entry is only published (Release) after the record it
//!    references is persisted, so whatever a reader observes is a
//!    previously valid record kept alive by the external epoch reclaimer.
//! 2. Writers: acquire the slot mutex, locate a position with
//!    [`HashTable::search`] under [`SearchPurpose::Write`], then publish
//!    with [`HashTable::insert`]. Writers on different slots never contend.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use portable_atomic::AtomicU128;

use crate::alloc::DramAllocator;
use crate::key::{hash_key, key_prefix};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::pmem::{NULL_OFFSET, PmemAllocator};
use crate::record::{is_dl_type, DataEntry, DataHeader, DlDataEntry, SORTED_HEADER_RECORD};
use crate::skiplist::node::SkiplistNode;
use crate::status::{Result, Status};
use crate::tracing_helpers::warn_log;

/// Bytes of one packed hash entry.
pub const HASH_ENTRY_SIZE: u64 = 16;

/// Bytes reserved at the end of each bucket for the overflow link.
const BUCKET_TAIL_SIZE: u64 = 8;

// ============================================================================
//  HashEntry
// ============================================================================

/// One 16-byte index entry.
///
/// The all-zero word doubles as the empty marker: offset 0 is the reserved
/// null offset, so no live entry ever packs to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashEntry {
    /// Upper 32 bits of the 64-bit key hash.
    pub key_prefix: u32,
    pub record_type: u16,
    pub reserved: u16,
    /// PMem offset of the record, or the DRAM address of the skiplist
    /// header node for [`SORTED_HEADER_RECORD`] entries.
    pub offset: u64,
}

impl HashEntry {
    #[inline]
    #[must_use]
    const fn pack(self) -> u128 {
        (self.key_prefix as u128)
            | ((self.record_type as u128) << 32)
            | ((self.reserved as u128) << 48)
            | ((self.offset as u128) << 64)
    }

    #[inline]
    #[must_use]
    const fn unpack(raw: u128) -> Self {
        Self {
            key_prefix: raw as u32,
            record_type: (raw >> 32) as u16,
            reserved: (raw >> 48) as u16,
            offset: (raw >> 64) as u64,
        }
    }
}

/// Opaque handle to an entry position inside a bucket chain.
///
/// Produced by [`HashTable::search`]; consumed by [`HashTable::insert`].
/// Never addressable by callers.
#[derive(Debug, Clone, Copy)]
pub struct EntrySlot {
    cell: *const AtomicU128,
}

// ============================================================================
//  Configuration
// ============================================================================

/// Construction parameters for [`HashTable`].
#[derive(Debug, Clone)]
pub struct HashTableConfig {
    /// Number of first-level buckets. Must be a power of two.
    pub num_hash_buckets: u64,
    /// Bytes per bucket, entries plus the 8-byte overflow link. Must be a
    /// multiple of 16 so every entry word stays 16-byte aligned.
    pub hash_bucket_size: u32,
    /// Buckets per slot mutex. Must divide `num_hash_buckets`.
    pub slot_grain: u32,
    /// Arena lanes in the DRAM allocator.
    pub write_threads: u32,
    /// Total DRAM budget in bytes for buckets and overflow blocks.
    pub dram_limit: u64,
}

impl Default for HashTableConfig {
    fn default() -> Self {
        Self {
            num_hash_buckets: 1 << 16,
            hash_bucket_size: 128,
            slot_grain: 64,
            write_threads: 4,
            dram_limit: 1 << 30,
        }
    }
}

impl HashTableConfig {
    fn validate(&self) -> Result<()> {
        if self.num_hash_buckets == 0 || !self.num_hash_buckets.is_power_of_two() {
            return Err(Status::InvalidArgument(
                "num_hash_buckets must be a power of two",
            ));
        }
        let min_size: u64 = BUCKET_TAIL_SIZE + HASH_ENTRY_SIZE;
        if (self.hash_bucket_size as u64) < min_size || self.hash_bucket_size % 16 != 0 {
            return Err(Status::InvalidArgument(
                "hash_bucket_size must be a multiple of 16 holding at least one entry",
            ));
        }
        if self.slot_grain == 0 || self.num_hash_buckets % self.slot_grain as u64 != 0 {
            return Err(Status::InvalidArgument(
                "slot_grain must divide num_hash_buckets",
            ));
        }
        if self.write_threads == 0 {
            return Err(Status::InvalidArgument("write_threads must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
//  Hints and search results
// ============================================================================

/// Everything derived from one key hash: its bucket, its slot, and the slot
/// mutex a writer must hold. Pure to compute; holds no lock itself.
#[derive(Clone, Copy)]
pub struct KeyHashHint<'a> {
    pub key_hash: u64,
    pub bucket: u64,
    pub slot: usize,
    pub spin: &'a Mutex<()>,
}

/// Whether a search may produce an insert position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPurpose {
    /// Lock-free lookup.
    Read,
    /// Locate-for-write. Requires the slot mutex to be held.
    Write,
}

/// A matched entry together with a copy of its record header.
#[derive(Debug, Clone, Copy)]
pub struct FoundEntry {
    pub entry: HashEntry,
    pub data_header: DataHeader,
    /// Position for an in-place update of this entry.
    pub slot: EntrySlot,
}

/// Outcome of [`HashTable::search`].
#[derive(Debug)]
pub enum SearchResult {
    Found(FoundEntry),
    /// No match. On the write path, `insert_slot` is the first empty (or
    /// freshly chained) position in the bucket chain.
    NotFound { insert_slot: Option<EntrySlot> },
}

/// Occupancy of one bucket chain, for diagnostics and invariant checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStats {
    /// Non-empty entries counted by walking the chain.
    pub occupied: u64,
    /// Entries recorded by the insert path.
    pub recorded: u64,
}

// ============================================================================
//  HashTable
// ============================================================================

/// The striped hash index.
pub struct HashTable {
    num_hash_buckets: u64,
    hash_bucket_size: u64,
    slot_grain: u64,
    entries_per_bucket: u64,
    dram: DramAllocator,
    pmem: Arc<dyn PmemAllocator>,
    buckets_base: *mut u8,
    slots: Box<[CachePadded<Mutex<()>>]>,
    chain_entries: Box<[AtomicU64]>,
}

// SAFETY: bucket memory is only mutated through atomics (entry words,
// overflow links) or under slot mutexes; the base pointer itself is
// immutable after construction.
unsafe impl Send for HashTable {}
unsafe impl Sync for HashTable {}

impl HashTable {
    /// Build the index. Bucket storage is zeroed up front; an all-zero
    /// entry word is the end-of-bucket marker readers rely on.
    pub fn new(config: &HashTableConfig, pmem: Arc<dyn PmemAllocator>) -> Result<Self> {
        config.validate()?;

        let dram = DramAllocator::new(config.write_threads, config.dram_limit)?;
        let bucket_size: u64 = config.hash_bucket_size as u64;
        let array_offset: u64 = dram.allocate(bucket_size * config.num_hash_buckets)?;
        let buckets_base: *mut u8 = dram.offset_to_addr(array_offset);

        let num_slots: usize = (config.num_hash_buckets / config.slot_grain as u64) as usize;
        let slots: Box<[CachePadded<Mutex<()>>]> = (0..num_slots)
            .map(|_| CachePadded::new(Mutex::new(())))
            .collect();
        let chain_entries: Box<[AtomicU64]> = (0..config.num_hash_buckets)
            .map(|_| AtomicU64::new(0))
            .collect();

        Ok(Self {
            num_hash_buckets: config.num_hash_buckets,
            hash_bucket_size: bucket_size,
            slot_grain: config.slot_grain as u64,
            entries_per_bucket: (bucket_size - BUCKET_TAIL_SIZE) / HASH_ENTRY_SIZE,
            dram,
            pmem,
            buckets_base,
            slots,
            chain_entries,
        })
    }

    /// Hash `key` and name the bucket, slot, and slot mutex it falls under.
    #[must_use]
    pub fn hint(&self, key: &[u8]) -> KeyHashHint<'_> {
        let key_hash: u64 = hash_key(key);
        let bucket: u64 = key_hash & (self.num_hash_buckets - 1);
        let slot: usize = (bucket / self.slot_grain) as usize;
        KeyHashHint {
            key_hash,
            bucket,
            slot,
            spin: &self.slots[slot],
        }
    }

    /// The mutex guarding `slot`. Multi-slot writers collect these and lock
    /// in address order.
    #[inline]
    #[must_use]
    pub fn slot_mutex(&self, slot: usize) -> &Mutex<()> {
        &self.slots[slot]
    }

    /// Walk the bucket chain of `hint.bucket` for an entry matching `key`
    /// with a type in `type_mask`.
    ///
    /// Read purpose is lock-free. Write purpose requires `hint.spin` to be
    /// held and, when the chain is full, extends it with a zeroed overflow
    /// bucket ([`Status::MemoryOverflow`] if DRAM is exhausted).
    pub fn search(
        &self,
        hint: &KeyHashHint<'_>,
        key: &[u8],
        type_mask: u16,
        purpose: SearchPurpose,
    ) -> Result<SearchResult> {
        debug_assert!(
            purpose == SearchPurpose::Read || hint.spin.is_locked(),
            "write-purpose search requires the slot mutex"
        );

        let prefix: u32 = key_prefix(hint.key_hash);
        // SAFETY: hint.bucket < num_hash_buckets, so the block is inside
        // the bucket array.
        let mut bucket_base: *mut u8 =
            unsafe { self.buckets_base.add((hint.bucket * self.hash_bucket_size) as usize) };

        loop {
            for i in 0..self.entries_per_bucket {
                // SAFETY: entry words are 16-aligned inside the bucket.
                let cell: &AtomicU128 = unsafe {
                    &*bucket_base
                        .add((i * HASH_ENTRY_SIZE) as usize)
                        .cast::<AtomicU128>()
                };
                let raw: u128 = cell.load(READ_ORD);
                if raw == 0 {
                    // First empty word ends the live data in this chain.
                    let insert_slot = match purpose {
                        SearchPurpose::Read => None,
                        SearchPurpose::Write => Some(EntrySlot { cell }),
                    };
                    return Ok(SearchResult::NotFound { insert_slot });
                }

                let entry = HashEntry::unpack(raw);
                if entry.record_type & type_mask == 0 {
                    continue;
                }
                if let Some(data_header) = self.match_entry(key, prefix, &entry) {
                    return Ok(SearchResult::Found(FoundEntry {
                        entry,
                        data_header,
                        slot: EntrySlot { cell },
                    }));
                }
            }

            // SAFETY: the trailing 8 bytes of each bucket hold the overflow
            // link, 8-aligned because the bucket size is a multiple of 16.
            let tail: &AtomicU64 = unsafe {
                &*bucket_base
                    .add((self.hash_bucket_size - BUCKET_TAIL_SIZE) as usize)
                    .cast::<AtomicU64>()
            };
            let next_offset: u64 = tail.load(READ_ORD);
            if next_offset != 0 {
                bucket_base = self.dram.offset_to_addr(next_offset);
                continue;
            }

            match purpose {
                SearchPurpose::Read => return Ok(SearchResult::NotFound { insert_slot: None }),
                SearchPurpose::Write => {
                    // Chain full: extend it. The new bucket is zeroed, so
                    // readers that follow the link early see an empty block.
                    let new_offset: u64 = self.dram.allocate(self.hash_bucket_size)?;
                    let new_base: *mut u8 = self.dram.offset_to_addr(new_offset);
                    tail.store(new_offset, WRITE_ORD);
                    warn_log!(
                        "bucket {} chained overflow block, chain_entries={}",
                        hint.bucket,
                        self.chain_entries[hint.bucket as usize].load(RELAXED)
                    );
                    return Ok(SearchResult::NotFound {
                        insert_slot: Some(EntrySlot {
                            cell: new_base.cast::<AtomicU128>(),
                        }),
                    });
                }
            }
        }
    }

    /// Publish an entry at a position returned by a write-purpose search.
    ///
    /// The 16-byte store is the linearization point readers observe.
    ///
    /// # Safety
    ///
    /// - `slot` must come from a [`SearchPurpose::Write`] search on this
    ///   table for the same `hint`, with `hint.spin` held continuously
    ///   since.
    /// - `offset` must reference a fully persisted record of
    ///   `record_type` (or a live header node for header types).
    /// - `is_update` must be true iff `slot` holds a matched entry rather
    ///   than an empty word.
    pub unsafe fn insert(
        &self,
        hint: &KeyHashHint<'_>,
        slot: EntrySlot,
        record_type: u16,
        offset: u64,
        is_update: bool,
    ) {
        debug_assert!(hint.spin.is_locked());
        debug_assert_ne!(offset, NULL_OFFSET);

        let entry = HashEntry {
            key_prefix: key_prefix(hint.key_hash),
            record_type,
            reserved: 0,
            offset,
        };
        // SAFETY: slot.cell points into this table's bucket storage per the
        // caller contract.
        unsafe { (*slot.cell).store(entry.pack(), WRITE_ORD) };
        if !is_update {
            self.chain_entries[hint.bucket as usize].fetch_add(1, RELAXED);
        }
    }

    /// Occupancy of one bucket chain. Walks the chain; intended for audits
    /// and tests, not hot paths.
    #[must_use]
    pub fn chain_stats(&self, bucket: u64) -> ChainStats {
        debug_assert!(bucket < self.num_hash_buckets);
        let mut occupied: u64 = 0;
        // SAFETY: bucket is in range; chain links were published by insert.
        let mut bucket_base: *mut u8 =
            unsafe { self.buckets_base.add((bucket * self.hash_bucket_size) as usize) };
        loop {
            for i in 0..self.entries_per_bucket {
                // SAFETY: as in search.
                let cell: &AtomicU128 = unsafe {
                    &*bucket_base
                        .add((i * HASH_ENTRY_SIZE) as usize)
                        .cast::<AtomicU128>()
                };
                if cell.load(READ_ORD) != 0 {
                    occupied += 1;
                }
            }
            // SAFETY: as in search.
            let tail: &AtomicU64 = unsafe {
                &*bucket_base
                    .add((self.hash_bucket_size - BUCKET_TAIL_SIZE) as usize)
                    .cast::<AtomicU64>()
            };
            let next_offset: u64 = tail.load(READ_ORD);
            if next_offset == 0 {
                break;
            }
            bucket_base = self.dram.offset_to_addr(next_offset);
        }
        ChainStats {
            occupied,
            recorded: self.chain_entries[bucket as usize].load(RELAXED),
        }
    }

    /// Number of first-level buckets.
    #[inline]
    #[must_use]
    pub fn num_buckets(&self) -> u64 {
        self.num_hash_buckets
    }

    /// Full match check for a candidate entry whose type passed the mask.
    ///
    /// Header entries match on the collection name cached in the skiplist
    /// header node; everything else matches on fingerprint plus the key
    /// bytes of the referenced record.
    fn match_entry(&self, key: &[u8], prefix: u32, entry: &HashEntry) -> Option<DataHeader> {
        if entry.record_type == SORTED_HEADER_RECORD {
            // SAFETY: header entries store the address of a header node that
            // lives as long as its collection, which outlives the table's
            // users per the publication order.
            unsafe {
                let node: *const SkiplistNode = entry.offset as *const SkiplistNode;
                if (*node).key() == key {
                    return Some((*(*node).data_entry()).header);
                }
            }
            return None;
        }

        if entry.key_prefix != prefix {
            return None;
        }
        // SAFETY: entry.offset references a persisted record; the epoch
        // reclaimer keeps superseded records alive for concurrent readers.
        unsafe {
            if is_dl_type(entry.record_type) {
                let record: *const DlDataEntry =
                    self.pmem.offset_to_addr(entry.offset).cast::<DlDataEntry>();
                ((*record).key() == key).then(|| (*record).header)
            } else {
                let record: *const DataEntry =
                    self.pmem.offset_to_addr(entry.offset).cast::<DataEntry>();
                ((*record).key() == key).then(|| (*record).header)
            }
        }
    }
}
