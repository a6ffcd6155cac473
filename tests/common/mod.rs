//! Common test utilities: tracing setup and a minimal engine harness.
//!
//! The harness wires the index components together the way the surrounding
//! engine does - PMem allocator, hash index, skiplists - and drives the
//! documented write protocol: persist the record, splice it, publish the
//! hash entry under the write-position locks.
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     let fx = common::TestEngine::create_default();
//!     // ...
//! }
//! ```

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

use pmindex::key::encode_collection_key;
use pmindex::pmem::{MmapAllocator, PmemAllocator, ROOT_SLOT_OFFSET};
use pmindex::record::{
    DataEntry, DlDataEntry, SORTED_DELETE_RECORD, SORTED_HEADER_RECORD, SORTED_RECORD,
    SORTED_RECORD_MASK, STRING_DELETE_RECORD, STRING_RECORD,
};
use pmindex::skiplist::SkiplistNode;
use pmindex::{
    HashTable, HashTableConfig, SearchPurpose, SearchResult, Skiplist, SortedCollection, Splice,
    Status,
};

static INIT: Once = Once::new();

/// Install a test tracing subscriber once. Honors `RUST_LOG`; only emits
/// when the crate is built with the `tracing` feature.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A small bucket geometry that still exercises slot striping and overflow
/// chains under test workloads.
pub fn small_config() -> HashTableConfig {
    HashTableConfig {
        num_hash_buckets: 1 << 10,
        hash_bucket_size: 128,
        slot_grain: 16,
        write_threads: 8,
        dram_limit: 1 << 28,
    }
}

/// The index components plus the write protocol glue the engine layers on
/// top of them.
pub struct TestEngine {
    pub pmem: Arc<MmapAllocator>,
    pub table: Arc<HashTable>,
    clock: AtomicU64,
    path: PathBuf,
}

impl TestEngine {
    pub fn create(path: &Path, capacity: u64, config: &HashTableConfig) -> Self {
        let pmem = Arc::new(MmapAllocator::create(path, capacity).unwrap());
        let table = Arc::new(
            HashTable::new(config, pmem.clone() as Arc<dyn PmemAllocator>).unwrap(),
        );
        Self {
            pmem,
            table,
            clock: AtomicU64::new(1),
            path: path.to_owned(),
        }
    }

    /// Reopen an existing image with a fresh (empty) index.
    pub fn open(path: &Path, config: &HashTableConfig) -> Self {
        let pmem = Arc::new(MmapAllocator::open(path).unwrap());
        let table = Arc::new(
            HashTable::new(config, pmem.clone() as Arc<dyn PmemAllocator>).unwrap(),
        );
        Self {
            pmem,
            table,
            clock: AtomicU64::new(1 << 32),
            path: path.to_owned(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn now(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Engine root slot (collection directory stand-in)
    // ------------------------------------------------------------------

    /// Remember one offset in the superblock, surviving reopen.
    pub fn set_root(&self, offset: u64) {
        let addr = self.pmem.offset_to_addr(ROOT_SLOT_OFFSET);
        // SAFETY: the root slot is inside the reserved superblock.
        unsafe { addr.cast::<u64>().write(offset) };
        self.pmem.persist(addr, std::mem::size_of::<u64>());
    }

    pub fn root(&self) -> u64 {
        // SAFETY: as in set_root.
        unsafe { self.pmem.offset_to_addr(ROOT_SLOT_OFFSET).cast::<u64>().read() }
    }

    // ------------------------------------------------------------------
    // Point operations
    // ------------------------------------------------------------------

    pub fn put(&self, key: &[u8], value: &[u8]) -> pmindex::Result<()> {
        let hint = self.table.hint(key);
        let _slot_guard = hint.spin.lock();
        let found = self.table.search(
            &hint,
            key,
            STRING_RECORD | STRING_DELETE_RECORD,
            SearchPurpose::Write,
        )?;
        let offset = self.write_point_record(STRING_RECORD, key, value)?;
        match found {
            SearchResult::Found(existing) => {
                // SAFETY: slot from this search, lock held, record persisted.
                unsafe {
                    self.table
                        .insert(&hint, existing.slot, STRING_RECORD, offset, true)
                };
            }
            SearchResult::NotFound { insert_slot } => {
                // SAFETY: as above.
                unsafe {
                    self.table
                        .insert(&hint, insert_slot.unwrap(), STRING_RECORD, offset, false)
                };
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> pmindex::Result<Vec<u8>> {
        let hint = self.table.hint(key);
        match self
            .table
            .search(&hint, key, STRING_RECORD, SearchPurpose::Read)?
        {
            SearchResult::Found(found) => {
                let record = self
                    .pmem
                    .offset_to_addr(found.entry.offset)
                    .cast::<DataEntry>();
                // SAFETY: published entries reference fully written records.
                Ok(unsafe { (*record).value().to_vec() })
            }
            SearchResult::NotFound { .. } => Err(Status::NotFound),
        }
    }

    /// Point delete: replace the live entry with a delete record in place.
    /// Deleting an absent key is a no-op.
    pub fn delete(&self, key: &[u8]) -> pmindex::Result<()> {
        let hint = self.table.hint(key);
        let _slot_guard = hint.spin.lock();
        match self
            .table
            .search(&hint, key, STRING_RECORD, SearchPurpose::Write)?
        {
            SearchResult::Found(found) => {
                let offset = self.write_point_record(STRING_DELETE_RECORD, key, b"")?;
                // SAFETY: slot from this search, lock held, record persisted.
                unsafe {
                    self.table
                        .insert(&hint, found.slot, STRING_DELETE_RECORD, offset, true)
                };
                Ok(())
            }
            SearchResult::NotFound { .. } => Ok(()),
        }
    }

    fn write_point_record(&self, record_type: u16, key: &[u8], value: &[u8]) -> pmindex::Result<u64> {
        let space = self
            .pmem
            .allocate(DataEntry::size_of(key.len(), value.len()) as u64)?;
        let addr = self.pmem.offset_to_addr(space.offset);
        // SAFETY: the span was just allocated for this record.
        unsafe { DataEntry::emplace(addr, record_type, self.now(), key, value) };
        self.pmem.persist(addr, space.size as usize);
        Ok(space.offset)
    }

    // ------------------------------------------------------------------
    // Sorted collections
    // ------------------------------------------------------------------

    /// Create a collection: persist its header record, build the skiplist,
    /// publish the header through the hash index.
    pub fn create_sorted(&self, name: &str, id: u64) -> pmindex::Result<Arc<Skiplist>> {
        let header = self.write_dl_record(SORTED_HEADER_RECORD, 0, 0, name.as_bytes(), &id.to_be_bytes())?;
        let skiplist = Arc::new(Skiplist::new(
            name,
            id,
            header,
            self.pmem.clone() as Arc<dyn PmemAllocator>,
            Arc::clone(&self.table),
        )?);

        let hint = self.table.hint(name.as_bytes());
        let _slot_guard = hint.spin.lock();
        let found = self
            .table
            .search(&hint, name.as_bytes(), SORTED_HEADER_RECORD, SearchPurpose::Write)?;
        let SearchResult::NotFound { insert_slot } = found else {
            return Err(Status::InvalidArgument("collection already exists"));
        };
        // SAFETY: slot from this search, lock held; the header node lives
        // as long as the returned skiplist.
        unsafe {
            self.table.insert(
                &hint,
                insert_slot.unwrap(),
                SORTED_HEADER_RECORD,
                skiplist.header_addr(),
                false,
            )
        };
        Ok(skiplist)
    }

    /// Recover a collection from its persisted header after reopen:
    /// republish hash entries by scanning the PMem chain, then rebuild the
    /// skiplist.
    pub fn recover_sorted(&self, name: &str, id: u64, header_offset: u64) -> pmindex::Result<Arc<Skiplist>> {
        let header = self.pmem.offset_to_addr(header_offset).cast::<DlDataEntry>();
        let skiplist = Arc::new(Skiplist::new(
            name,
            id,
            header,
            self.pmem.clone() as Arc<dyn PmemAllocator>,
            Arc::clone(&self.table),
        )?);

        // Header entry first.
        {
            let hint = self.table.hint(name.as_bytes());
            let _slot_guard = hint.spin.lock();
            if let SearchResult::NotFound { insert_slot } = self.table.search(
                &hint,
                name.as_bytes(),
                SORTED_HEADER_RECORD,
                SearchPurpose::Write,
            )? {
                // SAFETY: slot from this search, lock held.
                unsafe {
                    self.table.insert(
                        &hint,
                        insert_slot.unwrap(),
                        SORTED_HEADER_RECORD,
                        skiplist.header_addr(),
                        false,
                    )
                };
            }
        }

        // Scan the chain, republishing each record's hash entry.
        // SAFETY: the chain was persisted before shutdown.
        unsafe {
            let mut offset = (*header).load_next();
            while offset != 0 {
                let entry = self.pmem.offset_to_addr(offset).cast::<DlDataEntry>();
                let encoded = (*entry).key().to_vec();
                let hint = self.table.hint(&encoded);
                let _slot_guard = hint.spin.lock();
                let found = self
                    .table
                    .search(&hint, &encoded, SORTED_RECORD_MASK, SearchPurpose::Write)?;
                let record_type = (*entry).header.record_type;
                match found {
                    SearchResult::Found(existing) => {
                        // A tombstone can coexist with a newer record of
                        // the same key until GC; the newest version wins.
                        if (*entry).header.timestamp > existing.data_header.timestamp {
                            // SAFETY: slot from this search, lock held.
                            self.table.insert(&hint, existing.slot, record_type, offset, true);
                        }
                    }
                    SearchResult::NotFound { insert_slot } => {
                        // SAFETY: as above.
                        self.table
                            .insert(&hint, insert_slot.unwrap(), record_type, offset, false);
                    }
                }
                offset = (*entry).load_next();
            }
        }

        skiplist.rebuild()?;
        Ok(skiplist)
    }

    /// Insert or update one key in a sorted collection.
    pub fn sput(&self, skiplist: &Skiplist, user_key: &[u8], value: &[u8]) -> pmindex::Result<()> {
        let encoded = encode_collection_key(skiplist.id(), user_key);
        let hint = self.table.hint(&encoded);

        loop {
            let guard = skiplist.guard();
            let victim: Option<*const DlDataEntry> = match self.table.search(
                &hint,
                &encoded,
                SORTED_RECORD_MASK,
                SearchPurpose::Read,
            )? {
                SearchResult::Found(found) if found.entry.record_type == SORTED_RECORD => Some(
                    self.pmem
                        .offset_to_addr(found.entry.offset)
                        .cast_const()
                        .cast::<DlDataEntry>(),
                ),
                _ => None,
            };

            let mut splice = Splice::default();
            let Some(lockset) =
                skiplist.find_and_lock_write_pos(&mut splice, &encoded, &hint, victim, &guard)?
            else {
                continue;
            };

            // The hash state may have moved before the locks landed.
            let locked = self
                .table
                .search(&hint, &encoded, SORTED_RECORD_MASK, SearchPurpose::Write)?;
            match locked {
                SearchResult::Found(found) if found.entry.record_type == SORTED_RECORD => {
                    let Some(victim_ptr) = victim else {
                        continue;
                    };
                    if found.entry.offset != self.pmem.addr_to_offset(victim_ptr.cast::<u8>()) {
                        continue;
                    }
                    let new_entry = self.write_dl_record(
                        SORTED_RECORD,
                        // SAFETY: the victim's links are frozen by the lock set.
                        unsafe { (*victim_ptr).load_prev() },
                        unsafe { (*victim_ptr).load_next() },
                        &encoded,
                        value,
                    )?;
                    skiplist.update_data_entry(&lockset, &splice, new_entry);
                    // SAFETY: slot from the locked search; record persisted.
                    unsafe {
                        self.table.insert(
                            &hint,
                            found.slot,
                            SORTED_RECORD,
                            self.pmem.addr_to_offset(new_entry.cast_const().cast::<u8>()),
                            true,
                        )
                    };
                    return Ok(());
                }
                SearchResult::Found(found) => {
                    // Tombstoned key: fresh splice, entry slot reused.
                    if victim.is_some() {
                        continue;
                    }
                    self.splice_new_record(skiplist, &lockset, &splice, &encoded, value)?;
                    let offset = self.latest_offset(&splice);
                    // SAFETY: slot from the locked search; record persisted.
                    unsafe {
                        self.table
                            .insert(&hint, found.slot, SORTED_RECORD, offset, true)
                    };
                    return Ok(());
                }
                SearchResult::NotFound { insert_slot } => {
                    if victim.is_some() {
                        continue;
                    }
                    self.splice_new_record(skiplist, &lockset, &splice, &encoded, value)?;
                    let offset = self.latest_offset(&splice);
                    // SAFETY: slot from the locked search; record persisted.
                    unsafe {
                        self.table.insert(
                            &hint,
                            insert_slot.unwrap(),
                            SORTED_RECORD,
                            offset,
                            false,
                        )
                    };
                    return Ok(());
                }
            }
        }
    }

    /// Persist a new record for the splice position and link it in.
    fn splice_new_record(
        &self,
        skiplist: &Skiplist,
        lockset: &pmindex::LockSet<'_>,
        splice: &Splice,
        encoded: &[u8],
        value: &[u8],
    ) -> pmindex::Result<()> {
        let prev_offset = self
            .pmem
            .addr_to_offset(splice.prev_data_entry.cast_const().cast::<u8>());
        let next_offset = self
            .pmem
            .addr_to_offset(splice.next_data_entry.cast_const().cast::<u8>());
        let entry = self.write_dl_record(SORTED_RECORD, prev_offset, next_offset, encoded, value)?;
        let node = SkiplistNode::alloc(encoded, entry, Skiplist::random_height())
            .ok_or(Status::MemoryOverflow("skiplist node"))?;
        skiplist.insert_data_entry(lockset, splice, entry, node);
        Ok(())
    }

    /// Offset of the record just linked after `splice.prev_data_entry`.
    fn latest_offset(&self, splice: &Splice) -> u64 {
        // SAFETY: prev_data_entry is frozen by the caller's lock set.
        unsafe { (*splice.prev_data_entry).load_next() }
    }

    /// Remove one key from a sorted collection. Absent keys are a no-op.
    pub fn sdelete(&self, skiplist: &Skiplist, user_key: &[u8]) -> pmindex::Result<()> {
        let encoded = encode_collection_key(skiplist.id(), user_key);
        let hint = self.table.hint(&encoded);

        loop {
            let guard = skiplist.guard();
            let victim: *const DlDataEntry = match self.table.search(
                &hint,
                &encoded,
                SORTED_RECORD,
                SearchPurpose::Read,
            )? {
                SearchResult::Found(found) => self
                    .pmem
                    .offset_to_addr(found.entry.offset)
                    .cast_const()
                    .cast::<DlDataEntry>(),
                SearchResult::NotFound { .. } => return Ok(()),
            };

            let mut splice = Splice::default();
            let Some(lockset) = skiplist.find_and_lock_write_pos(
                &mut splice,
                &encoded,
                &hint,
                Some(victim),
                &guard,
            )?
            else {
                continue;
            };

            let locked = self
                .table
                .search(&hint, &encoded, SORTED_RECORD, SearchPurpose::Write)?;
            let SearchResult::Found(found) = locked else {
                continue;
            };
            if found.entry.offset != self.pmem.addr_to_offset(victim.cast::<u8>()) {
                continue;
            }

            let tombstone = self.write_dl_record(
                SORTED_DELETE_RECORD,
                self.pmem
                    .addr_to_offset(splice.prev_data_entry.cast_const().cast::<u8>()),
                self.pmem
                    .addr_to_offset(splice.next_data_entry.cast_const().cast::<u8>()),
                &encoded,
                b"",
            )?;
            skiplist.delete_data_entry(&lockset, &splice, tombstone, &guard);
            // SAFETY: slot from the locked search; tombstone persisted.
            unsafe {
                self.table.insert(
                    &hint,
                    found.slot,
                    SORTED_DELETE_RECORD,
                    self.pmem.addr_to_offset(tombstone.cast_const().cast::<u8>()),
                    true,
                )
            };
            return Ok(());
        }
    }

    pub fn sget(&self, skiplist: &Skiplist, user_key: &[u8]) -> pmindex::Result<Vec<u8>> {
        let encoded = encode_collection_key(skiplist.id(), user_key);
        let hint = self.table.hint(&encoded);
        match self
            .table
            .search(&hint, &encoded, SORTED_RECORD, SearchPurpose::Read)?
        {
            SearchResult::Found(found) => {
                let record = self
                    .pmem
                    .offset_to_addr(found.entry.offset)
                    .cast::<DlDataEntry>();
                // SAFETY: published entries reference fully written records.
                Ok(unsafe { (*record).value().to_vec() })
            }
            SearchResult::NotFound { .. } => Err(Status::NotFound),
        }
    }

    fn write_dl_record(
        &self,
        record_type: u16,
        prev: u64,
        next: u64,
        key: &[u8],
        value: &[u8],
    ) -> pmindex::Result<*mut DlDataEntry> {
        let space = self
            .pmem
            .allocate(DlDataEntry::size_of(key.len(), value.len()) as u64)?;
        let addr = self.pmem.offset_to_addr(space.offset);
        // SAFETY: the span was just allocated for this record.
        unsafe { DlDataEntry::emplace(addr, record_type, self.now(), prev, next, key, value) };
        self.pmem.persist(addr, space.size as usize);
        Ok(addr.cast::<DlDataEntry>())
    }
}

/// Collect `(key, value)` pairs from a cursor, first to last.
pub fn collect_forward(engine: &TestEngine, skiplist: &Skiplist) -> Vec<(Vec<u8>, Vec<u8>)> {
    use pmindex::OrderedIter;

    let mut iter = skiplist.iter(engine.pmem.clone() as Arc<dyn PmemAllocator>);
    let mut out = Vec::new();
    iter.seek_to_first();
    while iter.valid() {
        out.push((iter.key().to_vec(), iter.value().to_vec()));
        if !iter.next() {
            break;
        }
    }
    out
}
