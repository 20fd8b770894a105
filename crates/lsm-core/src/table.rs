//! Context tables
//!
//! A fixed array of buckets, each an `RcuList` of records. Keys are hashed by
//! their raw handle; within a bucket records are matched by key equality.
//! `find` never takes a lock. `insert` and `remove` serialize per bucket on
//! the list's writer lock, which is held only for the pointer splice.
//!
//! The table keeps its own count of linked records. A bounded insert
//! reserves its slot in that count before linking, so concurrent inserts
//! never overshoot the bound.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};
use lsm_host::{CredKey, TaskKey};
use lsm_sync::{Collector, Guard, InsertError, RcuList};

use crate::error::ContextError;
use crate::record::{ContextRecord, Owner};

/// Fibonacci hashing multiplier (2^64 / golden ratio)
const HASH_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

/// An identity that keys one of the two tables.
pub trait ContextKey: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Table name used in logs and invariant reports
    const TABLE: &'static str;

    fn handle(self) -> u64;

    /// Owner of a record bound to this key
    fn owner(self) -> Owner;

    /// The key of a record, if it is bound to this kind of key
    fn of(record: &ContextRecord) -> Option<Self>;
}

impl ContextKey for TaskKey {
    const TABLE: &'static str = "task";

    fn handle(self) -> u64 {
        TaskKey::handle(self)
    }

    fn owner(self) -> Owner {
        Owner::Task(self)
    }

    fn of(record: &ContextRecord) -> Option<Self> {
        record.task()
    }
}

impl ContextKey for CredKey {
    const TABLE: &'static str = "cred";

    fn handle(self) -> u64 {
        CredKey::handle(self)
    }

    fn owner(self) -> Owner {
        Owner::Cred(self)
    }

    fn of(record: &ContextRecord) -> Option<Self> {
        record.cred()
    }
}

/// Hashed table of context records keyed by `K`.
pub struct ContextTable<K: ContextKey> {
    buckets: Vec<RcuList<ContextRecord>>,
    hash_bits: u32,
    collector: Arc<Collector>,
    /// Linked records plus reservations held by inserts in progress
    live: AtomicUsize,
    _key: PhantomData<K>,
}

impl<K: ContextKey> ContextTable<K> {
    /// Create a table with `1 << hash_bits` buckets reclaimed by `collector`.
    ///
    /// `hash_bits` must be in `1..=16` (see `EngineConfig::validate`).
    pub fn new(hash_bits: u32, collector: &Arc<Collector>) -> Self {
        let buckets = (0..1usize << hash_bits)
            .map(|_| RcuList::new(collector.clone()))
            .collect();
        Self {
            buckets,
            hash_bits,
            collector: collector.clone(),
            live: AtomicUsize::new(0),
            _key: PhantomData,
        }
    }

    /// The collector that reclaims this table's records.
    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    fn bucket(&self, key: K) -> &RcuList<ContextRecord> {
        let index = key.handle().wrapping_mul(HASH_MULTIPLIER) >> (64 - self.hash_bits);
        &self.buckets[index as usize]
    }

    /// Find the record bound to `key`.
    pub fn find<'g>(&'g self, key: K, guard: &'g Guard<'_>) -> Option<&'g ContextRecord> {
        self.bucket(key)
            .find(guard, |record| K::of(record) == Some(key))
    }

    /// Link `record` into its bucket.
    ///
    /// Fails with `Duplicate` if a record for the same key is already
    /// linked, and with `AllocationFailure` if the node cannot be allocated.
    pub fn insert<'g>(
        &'g self,
        record: ContextRecord,
        guard: &'g Guard<'_>,
    ) -> Result<&'g ContextRecord, ContextError> {
        self.insert_bounded(record, None, guard)
    }

    /// Link `record` unless the table already holds `max` records.
    ///
    /// A full table fails with `AllocationFailure`, like a failed node
    /// allocation.
    pub fn insert_bounded<'g>(
        &'g self,
        record: ContextRecord,
        max: Option<usize>,
        guard: &'g Guard<'_>,
    ) -> Result<&'g ContextRecord, ContextError> {
        let key = K::of(&record).ok_or(ContextError::MissingContext)?;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| match max {
                Some(max) if live >= max => None,
                _ => Some(live + 1),
            })
            .map_err(|_| ContextError::AllocationFailure)?;

        let result = self
            .bucket(key)
            .insert_unique(record, |other| K::of(other) == Some(key), guard)
            .map_err(|err| match err {
                InsertError::OutOfMemory => ContextError::AllocationFailure,
                InsertError::Occupied(_) => ContextError::Duplicate,
            });
        if result.is_err() {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    /// Unlink `record` and schedule it for release.
    ///
    /// Returns false if the record is not linked in this table, so a record
    /// is retired at most once however many paths race to remove it.
    pub fn remove(&self, record: &ContextRecord) -> bool {
        let Some(key) = K::of(record) else {
            return false;
        };
        if !self.bucket(key).remove(record) {
            return false;
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        record.mark_retired();
        true
    }

    /// Every linked record, bucket by bucket.
    pub fn iter<'g>(&'g self, guard: &'g Guard<'g>) -> impl Iterator<Item = &'g ContextRecord> + 'g {
        self.buckets.iter().flat_map(move |bucket| bucket.iter(guard))
    }

    /// Number of linked records (counting inserts still in progress)
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Records per bucket (for debugging/verification)
    pub fn bucket_lengths(&self) -> Vec<usize> {
        self.buckets.iter().map(RcuList::len).collect()
    }
}

impl<K: ContextKey> fmt::Debug for ContextTable<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextTable")
            .field("table", &K::TABLE)
            .field("buckets", &self.bucket_count())
            .field("len", &self.len())
            .finish()
    }
}
