//! The lock-free, growable hash table.
//!
//! Buckets live in a wait-free directory of chain-head slots; every chain
//! is a slice of one shared split-ordered list. Crossing the load factor
//! doubles the bucket count with a single CAS and no rehash: a bucket that
//! has never been touched is initialized lazily by splicing its dummy node
//! into its parent's chain, so existing elements stay exactly where they
//! are.

use std::marker::PhantomData;
use std::ops::{ControlFlow, Deref};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::alloc::Allocator;
use crate::dynarray::DynArray;
use crate::error::Error;
use crate::list::{AtomicLink, Link, ListCtx, Node, Traverse};
use crate::pin::PinRecord;

/// Hash values are masked to 31 bits; the top bit of the reversed value is
/// the dummy/ordinary tag.
const HASH_MASK: u32 = 0x7FFF_FFFF;

/// Largest bucket count the table will double to.
const MAX_SIZE: u32 = 1 << 30;

/// How the table derives keys, hashes, and payload lifecycle from its
/// element type. Bundled function pointers keep the table's core logic
/// independent of any concrete payload layout.
pub struct TableConfig<T> {
    /// Reject inserts whose key is already present.
    pub unique: bool,
    /// Borrows the key bytes out of an element.
    pub key_of: fn(&T) -> &[u8],
    /// Hashes key bytes; only the low 31 bits are used.
    pub hash: fn(&[u8]) -> u64,
    /// Key equality. Must agree with `hash`: equal keys hash equally.
    pub eq: fn(&[u8], &[u8]) -> bool,
    /// Runs once when a node is physically allocated, never on reuse.
    pub constructor: Option<fn(*mut T)>,
    /// Runs once when a node is physically freed at teardown.
    pub destructor: Option<fn(*mut T)>,
    /// Replaces the raw byte copy when an insert fills in a payload; use it
    /// for element types that are not trivially copyable.
    pub initialize: Option<fn(*mut T, &T)>,
    /// Average chain length that triggers doubling.
    pub max_load: u32,
}

impl<T> TableConfig<T> {
    pub fn new(
        unique: bool,
        key_of: fn(&T) -> &[u8],
        hash: fn(&[u8]) -> u64,
        eq: fn(&[u8], &[u8]) -> bool,
    ) -> Self {
        Self {
            unique,
            key_of,
            hash,
            eq,
            constructor: None,
            destructor: None,
            initialize: None,
            max_load: 1,
        }
    }
}

impl<T> Clone for TableConfig<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TableConfig<T> {}

/// Outcome of [`LfHash::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Inserted,
    /// The table is unique and the key was already present.
    Duplicate,
}

/// Outcome of [`LfHash::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    NotFound,
}

/// Outcome of [`LfHash::iterate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    Completed,
    /// The callback broke out of the walk.
    Aborted,
}

/// A lock-free hash table of fixed-size elements.
///
/// All operations go through a [`Pins`] accessor obtained from
/// [`LfHash::pin`]; the exclusive borrow on the accessor is what upholds
/// the single-owner contract on its hazard slots.
pub struct LfHash<T: 'static> {
    buckets: DynArray<AtomicLink<Node<T>>>,
    alloc: Allocator<T>,
    config: TableConfig<T>,
    /// Current bucket count; grows by doubling, never shrinks.
    size: AtomicU32,
    /// Approximate element count; only steers growth.
    count: AtomicU32,
}

unsafe impl<T: Send + Sync> Send for LfHash<T> {}
unsafe impl<T: Send + Sync> Sync for LfHash<T> {}

/// An accessor session. Holds one pin record for its whole lifetime and
/// returns it, purgatory drained, when dropped.
pub struct Pins<'h, T: 'static> {
    table: &'h LfHash<T>,
    record: &'h PinRecord<Node<T>>,
}

impl<T: 'static> Drop for Pins<'_, T> {
    fn drop(&mut self) {
        self.table.alloc.pinbox().release(self.record);
    }
}

/// A found element, kept alive by hazard slot 2 of its accessor. The slot
/// is cleared when the guard drops, whatever path control takes.
pub struct EntryGuard<'p, T> {
    record: &'p PinRecord<Node<T>>,
    node: *mut Node<T>,
    _marker: PhantomData<&'p T>,
}

impl<T> Deref for EntryGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the node is ordinary and pinned in slot 2; a concurrent
        // delete may mark it but cannot recycle its bytes while pinned.
        unsafe { &*(*self.node).payload() }
    }
}

impl<T> Drop for EntryGuard<'_, T> {
    fn drop(&mut self) {
        self.record.unpin(2);
    }
}

impl<T: 'static> LfHash<T> {
    pub fn new(config: TableConfig<T>) -> Self {
        Self {
            buckets: DynArray::new(),
            alloc: Allocator::new(config.constructor, config.destructor),
            config,
            size: AtomicU32::new(1),
            count: AtomicU32::new(0),
        }
    }

    /// Acquires an accessor session.
    ///
    /// Fails with [`Error::PinsExhausted`] when the pin record space is
    /// full and with [`Error::OutOfMemory`] when growing the registry
    /// fails.
    pub fn pin(&self) -> Result<Pins<'_, T>, Error> {
        Ok(Pins {
            table: self,
            record: self.alloc.pinbox().acquire()?,
        })
    }

    /// Inserts a copy of `value`.
    ///
    /// The payload is filled by a raw byte copy unless the configuration
    /// supplies an `initialize` hook. On a unique table a present key
    /// yields [`Insertion::Duplicate`] and the table is left untouched.
    pub fn insert(&self, pins: &mut Pins<'_, T>, value: &T) -> Result<Insertion, Error> {
        debug_assert!(ptr::eq(pins.table, self));
        let record = pins.record;
        let node = self.alloc.new_node(record)?;
        // SAFETY: the node is unpublished and exclusively ours.
        unsafe {
            let payload = (*node).payload();
            match self.config.initialize {
                Some(initialize) => initialize(payload, value),
                None => ptr::copy_nonoverlapping(value, payload, 1),
            }
        }
        // SAFETY: payload initialized just above.
        let key = (self.config.key_of)(unsafe { &*(*node).payload() });
        let hashnr = self.raw_hash(key);
        let bucket = hashnr % self.size.load(Ordering::SeqCst);
        let head = match self.bucket_head(bucket, record) {
            Ok(head) => head,
            Err(error) => {
                self.alloc.free_node(record, node);
                return Err(error);
            }
        };
        // SAFETY: still unpublished.
        unsafe { (*node).hashnr = hashnr.reverse_bits() | 1 };
        if self
            .list()
            .insert(head, node, key, record, self.config.unique)
            .is_some()
        {
            self.alloc.free_node(record, node);
            return Ok(Insertion::Duplicate);
        }
        let size = self.size.load(Ordering::SeqCst);
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if u64::from(count) > u64::from(self.config.max_load) * u64::from(size) && size < MAX_SIZE {
            // Losing this race just means someone else already doubled.
            if self
                .size
                .compare_exchange(size, size * 2, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                #[cfg(feature = "logging")]
                log::debug!("bucket count doubled to {}", size * 2);
            }
        }
        Ok(Insertion::Inserted)
    }

    /// Removes the first element matching `key`.
    pub fn remove(&self, pins: &mut Pins<'_, T>, key: &[u8]) -> Result<Removal, Error> {
        debug_assert!(ptr::eq(pins.table, self));
        let record = pins.record;
        let hashnr = self.raw_hash(key);
        let bucket = hashnr % self.size.load(Ordering::SeqCst);
        // The bucket is initialized even on the remove path: a split may
        // have assigned the key to a bucket no accessor has touched yet.
        let head = self.bucket_head(bucket, record)?;
        if self
            .list()
            .delete(head, hashnr.reverse_bits() | 1, key, record)
        {
            self.count.fetch_sub(1, Ordering::SeqCst);
            Ok(Removal::Removed)
        } else {
            Ok(Removal::NotFound)
        }
    }

    /// Looks up `key`, returning a guard that keeps the element pinned.
    pub fn get<'p>(
        &self,
        pins: &'p mut Pins<'_, T>,
        key: &[u8],
    ) -> Result<Option<EntryGuard<'p, T>>, Error> {
        debug_assert!(ptr::eq(pins.table, self));
        let record = pins.record;
        let hashnr = self.raw_hash(key);
        let bucket = hashnr % self.size.load(Ordering::SeqCst);
        let head = self.bucket_head(bucket, record)?;
        Ok(self
            .list()
            .search(head, hashnr.reverse_bits() | 1, key, record)
            .map(|node| EntryGuard {
                record,
                node,
                _marker: PhantomData,
            }))
    }

    /// Visits every live element at least once. An element moved by a
    /// concurrent mutation may be visited twice; callers that need a
    /// snapshot must serialize externally.
    pub fn iterate(
        &self,
        pins: &mut Pins<'_, T>,
        mut action: impl FnMut(&T) -> ControlFlow<()>,
    ) -> Result<Iteration, Error> {
        debug_assert!(ptr::eq(pins.table, self));
        let record = pins.record;
        // Every chain hangs off bucket zero's dummy.
        let head = self.bucket_head(0, record)?;
        match self.list().walk(head, record, &mut action) {
            Traverse::Aborted => Ok(Iteration::Aborted),
            _ => Ok(Iteration::Completed),
        }
    }

    /// Approximate number of live elements.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current bucket count.
    pub fn bucket_count(&self) -> usize {
        self.size.load(Ordering::Relaxed) as usize
    }

    /// Nodes waiting in the allocator pool. Diagnostic only.
    pub fn pool_count(&mut self) -> usize {
        self.alloc.pool_count()
    }

    /// Nodes obtained from the system allocator over the table's lifetime.
    /// Stays flat while the pool is feeding reuse.
    pub fn allocated_nodes(&self) -> usize {
        self.alloc.fresh_alloc_count() as usize
    }

    fn raw_hash(&self, key: &[u8]) -> u32 {
        ((self.config.hash)(key) as u32) & HASH_MASK
    }

    fn list(&self) -> ListCtx<'_, T> {
        ListCtx {
            pinbox: self.alloc.pinbox(),
            key_of: self.config.key_of,
            eq: self.config.eq,
        }
    }

    /// Returns the chain-head slot for `bucket`, initializing the bucket
    /// first if no accessor has touched it yet.
    fn bucket_head(
        &self,
        bucket: u32,
        record: &PinRecord<Node<T>>,
    ) -> Result<&AtomicLink<Node<T>>, Error> {
        let slot = self.buckets.get_or_alloc(bucket as usize)?;
        if slot.load(Ordering::SeqCst).ptr.is_null() {
            self.init_bucket(slot, bucket, record)?;
        }
        Ok(slot)
    }

    /// Splices `bucket`'s dummy node into its parent's chain, recursively
    /// making sure the parent is initialized first. Racing initializers
    /// converge on one winning dummy; losers free their speculative node.
    fn init_bucket(
        &self,
        slot: &AtomicLink<Node<T>>,
        bucket: u32,
        record: &PinRecord<Node<T>>,
    ) -> Result<(), Error> {
        let parent = parent_bucket(bucket);
        let parent_slot = self.buckets.get_or_alloc(parent as usize)?;
        if bucket != 0 && parent_slot.load(Ordering::SeqCst).ptr.is_null() {
            self.init_bucket(parent_slot, parent, record)?;
        }
        // Dummies come straight from the system, never from the pool: they
        // live as long as the table and are never retired.
        let dummy = Node::<T>::alloc()?;
        // SAFETY: unpublished; bit 0 of a reversed bucket index is clear,
        // which is exactly the dummy tag.
        unsafe { (*dummy).hashnr = bucket.reverse_bits() };
        let winner = match self.list().insert(parent_slot, dummy, &[], record, true) {
            None => dummy,
            Some(existing) => {
                // Someone else's dummy won. Dummies are never freed, so the
                // unpinned duplicate pointer stays valid.
                // SAFETY: our dummy lost and was never published.
                unsafe { Node::dealloc(dummy) };
                existing
            }
        };
        // Racing initializers CAS the same winner, so a failure here means
        // the slot is already correct.
        let _ = slot.compare_exchange(
            Link::null(),
            Link::to(winner),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        Ok(())
    }
}

impl<T: 'static> Drop for LfHash<T> {
    fn drop(&mut self) {
        // Exclusive teardown: the borrow checker guarantees every accessor
        // session ended, so purgatories are empty and chains are stable.
        let mut cur = match self.buckets.get(0) {
            Some(slot) => slot.load(Ordering::Relaxed).ptr,
            None => ptr::null_mut(),
        };
        while !cur.is_null() {
            // SAFETY: nodes are walked exactly once and freed by kind.
            unsafe {
                let next = (*cur).link.load(Ordering::Relaxed).ptr;
                if (*cur).is_ordinary() {
                    self.alloc.direct_free(cur);
                } else {
                    Node::dealloc(cur);
                }
                cur = next;
            }
        }
        // The allocator then frees the pool; the directory frees itself.
    }
}

/// Clears the highest set bit: the parent bucket in the splitting order.
fn parent_bucket(bucket: u32) -> u32 {
    if bucket == 0 {
        0
    } else {
        bucket & !(1 << (31 - bucket.leading_zeros()))
    }
}
