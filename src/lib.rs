//! # pmindex
//!
//! The DRAM indexing core of a persistent-memory key-value engine.
//!
//! Records live in byte-addressable persistent memory in their canonical
//! form; this crate keeps the volatile structures that find them fast:
//!
//! - A striped, open-addressed [hash index](hash_table::HashTable) mapping
//!   key fingerprints to PMem offsets. Readers are lock-free; writers
//!   serialize per slot.
//! - A concurrent [skiplist](skiplist::Skiplist) per sorted collection,
//!   ordering records that form a doubly linked list on PMem. Traversal is
//!   lock-free; writes lock the write position's slot mutexes in address
//!   order.
//! - An [ordered cursor](iterator::SortedIterator) walking the PMem list
//!   under an epoch guard.
//!
//! ## Design
//!
//! The index persists nothing itself: after a restart it is rebuilt from
//! the PMem image ([`skiplist::Skiplist::rebuild`]). Publication order is
//! the backbone of crash consistency - a record is persisted first, then
//! spliced into the PMem list, then linked in DRAM, and only then published
//! through the hash index, so anything a reader can find is durable.
//!
//! Allocators are collaborators: persistent memory comes through the
//! [`pmem::PmemAllocator`] contract (a file-backed default is bundled),
//! DRAM for bucket storage through the crate's own chunked
//! [`alloc::DramAllocator`]. Node reclamation defers to a seize collector;
//! readers pin an epoch guard instead of taking locks.

pub mod alloc;
pub mod hash_table;
pub mod iterator;
pub mod key;
pub mod ordering;
pub mod pmem;
pub mod record;
pub mod skiplist;
pub mod status;

mod tracing_helpers;

pub use hash_table::{
    ChainStats, FoundEntry, HashEntry, HashTable, HashTableConfig, KeyHashHint, SearchPurpose,
    SearchResult,
};
pub use iterator::{OrderedIter, SortedIterator};
pub use pmem::{MmapAllocator, PmemAllocator, SpaceEntry};
pub use skiplist::{LockSet, Skiplist, SkiplistNode, SortedCollection, Splice, MAX_HEIGHT};
pub use status::{Result, Status};
