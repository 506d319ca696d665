//! The sorted lock-free singly linked list backing every bucket chain.
//!
//! Nodes are ordered by bit-reversed hash. Synthetic dummy nodes (tag bit
//! clear) mark where each bucket starts; ordinary data nodes (tag bit set)
//! follow their bucket's dummy. One physical chain is shared by every
//! bucket that was split out of it, which is what lets the table double its
//! bucket count without relocating a single element.

mod link;

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ops::ControlFlow;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::Backoff;

use crate::error::Error;
use crate::pin::{PinBox, PinRecord, Retire};

pub(crate) use link::{AtomicLink, Link};

/// One chain entry: a dummy bucket head or an ordinary data node.
///
/// A node is never freed directly. It moves one way through
/// live → logically deleted → unlinked → retired → reclaimed, and the
/// reclaimed memory goes back to the allocator pool, not to the system.
#[repr(C)]
pub(crate) struct Node<T> {
    /// Successor in the chain plus the logical-deletion mark.
    pub(crate) link: AtomicLink<Node<T>>,
    /// Chains retired nodes; dead weight while the node is reachable.
    retired: AtomicPtr<Node<T>>,
    /// Bit-reversed hash. Bit 0 set means ordinary, clear means dummy.
    pub(crate) hashnr: u32,
    data: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T> Retire for Node<T> {
    fn retired_next(&self) -> &AtomicPtr<Self> {
        &self.retired
    }
}

impl<T> Node<T> {
    /// Allocates a zeroed node: null clean link, null retired chain, dummy
    /// tag, uninitialized payload.
    pub(crate) fn alloc() -> Result<*mut Self, Error> {
        // SAFETY: a concrete node struct is never zero-sized.
        let node = unsafe { alloc_zeroed(Layout::new::<Self>()) }.cast::<Self>();
        if node.is_null() {
            return Err(Error::OutOfMemory);
        }
        Ok(node)
    }

    /// # Safety
    ///
    /// `node` must have come from [`Node::alloc`] and be unreachable.
    pub(crate) unsafe fn dealloc(node: *mut Self) {
        unsafe { dealloc(node.cast(), Layout::new::<Self>()) };
    }

    pub(crate) fn payload(&self) -> *mut T {
        self.data.get().cast()
    }

    pub(crate) fn is_ordinary(&self) -> bool {
        self.hashnr & 1 == 1
    }
}

/// Threads one traversal step between cooperating operations: the link slot
/// that pointed at `curr`, the current node, and its successor.
pub(crate) struct Cursor<T> {
    prev: *const AtomicLink<Node<T>>,
    pub(crate) curr: *mut Node<T>,
    next: *mut Node<T>,
}

impl<T> Cursor<T> {
    pub(crate) fn new() -> Self {
        Self {
            prev: ptr::null(),
            curr: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }
}

pub(crate) enum Traverse {
    Found,
    NotFound,
    /// A walk callback stopped the scan.
    Aborted,
}

/// The pieces of table configuration the chain operations need.
pub(crate) struct ListCtx<'a, T> {
    pub(crate) pinbox: &'a PinBox<Node<T>>,
    pub(crate) key_of: fn(&T) -> &[u8],
    pub(crate) eq: fn(&[u8], &[u8]) -> bool,
}

impl<T> ListCtx<'_, T> {
    /// Positions `cursor` on the first node whose order key is not below
    /// `hashnr`, helping to unlink any logically deleted node it passes.
    ///
    /// Hazard slot use: 0 pins `next`, 1 pins `curr`, 2 pins the node whose
    /// link is `prev`. Slots are left set for the caller to hand over to
    /// insert or delete; every public wrapper clears them on exit.
    ///
    /// With `walk` supplied the traversal turns into an iteration pass: the
    /// callback sees every ordinary, unmarked node at least once, dummies
    /// are skipped, and the sorted-order cutoff is disabled.
    pub(crate) fn find(
        &self,
        head: &AtomicLink<Node<T>>,
        hashnr: u32,
        key: &[u8],
        cursor: &mut Cursor<T>,
        record: &PinRecord<Node<T>>,
        mut walk: Option<&mut dyn FnMut(&T) -> ControlFlow<()>>,
    ) -> Traverse {
        let backoff = Backoff::new();
        'from_head: loop {
            cursor.prev = head;
            // Pin the first node consistently with the head slot.
            loop {
                cursor.curr = head.load(Ordering::SeqCst).ptr;
                record.pin(1, cursor.curr);
                if head.load(Ordering::SeqCst).ptr == cursor.curr {
                    break;
                }
                backoff.spin();
            }
            loop {
                if cursor.curr.is_null() {
                    return Traverse::NotFound;
                }
                // SAFETY: `curr` is pinned in slot 1, so it cannot be
                // recycled while its header is read.
                let curr = unsafe { &*cursor.curr };
                // Pin `next` consistently with `curr`'s link; the same load
                // carries the deletion mark.
                let mut curr_link;
                loop {
                    curr_link = curr.link.load(Ordering::SeqCst);
                    cursor.next = curr_link.ptr;
                    record.pin(0, cursor.next);
                    if curr.link.load(Ordering::SeqCst) == curr_link {
                        break;
                    }
                    backoff.spin();
                }
                let cur_hashnr = curr.hashnr;
                // SAFETY: `prev` is the head slot or the link of the node
                // pinned in slot 2.
                let prev_link = unsafe { &*cursor.prev }.load(Ordering::SeqCst);
                if prev_link.ptr != cursor.curr || prev_link.deleted {
                    // The chain moved underneath the cursor.
                    backoff.spin();
                    continue 'from_head;
                }
                if !curr_link.deleted {
                    let ordinary = cur_hashnr & 1 == 1;
                    match walk.as_mut() {
                        Some(action) => {
                            if ordinary {
                                // SAFETY: ordinary nodes carry initialized
                                // payload and `curr` is pinned.
                                let payload = unsafe { &*curr.payload() };
                                if action(payload).is_break() {
                                    return Traverse::Aborted;
                                }
                            }
                        }
                        None => {
                            let target_ordinary = hashnr & 1 == 1;
                            if ordinary == target_ordinary && cur_hashnr == hashnr {
                                if !ordinary {
                                    // Dummy sought, dummy with the same tag
                                    // value found.
                                    return Traverse::Found;
                                }
                                // SAFETY: as above.
                                let payload = unsafe { &*curr.payload() };
                                if (self.eq)((self.key_of)(payload), key) {
                                    return Traverse::Found;
                                }
                                // Same order key, different key bytes: keep
                                // walking the cluster.
                            } else if cur_hashnr > hashnr {
                                // Sorted order proves the target is absent.
                                return Traverse::NotFound;
                            }
                        }
                    }
                    cursor.prev = &curr.link;
                    record.pin(2, cursor.curr);
                } else {
                    // Deleted node: help the remover unlink it, then retire
                    // it. Only the thread whose unlink succeeds retires.
                    if unsafe { &*cursor.prev }
                        .compare_exchange(
                            Link::to(cursor.curr),
                            Link::to(cursor.next),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        self.pinbox.retire(record, cursor.curr);
                    } else {
                        backoff.spin();
                        continue 'from_head;
                    }
                }
                cursor.curr = cursor.next;
                record.pin(1, cursor.curr);
            }
        }
    }

    /// Finds the node for `hashnr`/`key` and leaves it pinned in hazard
    /// slot 2 for the caller. All other slots are cleared; slot 2 is also
    /// cleared when nothing was found.
    pub(crate) fn search(
        &self,
        head: &AtomicLink<Node<T>>,
        hashnr: u32,
        key: &[u8],
        record: &PinRecord<Node<T>>,
    ) -> Option<*mut Node<T>> {
        let mut cursor = Cursor::new();
        let found = matches!(
            self.find(head, hashnr, key, &mut cursor, record, None),
            Traverse::Found
        );
        if found {
            record.pin(2, cursor.curr);
        } else {
            record.unpin(2);
        }
        record.unpin(0);
        record.unpin(1);
        found.then(|| cursor.curr)
    }

    /// Inserts `node` at its sorted position with a single CAS on the
    /// predecessor link, retrying from a fresh `find` on conflict. Nodes
    /// with an equal order key are placed before existing ones.
    ///
    /// Returns the duplicate when `unique` is set and the key is present.
    /// The duplicate pointer is not pinned: only dummy nodes, which are
    /// never freed, may be dereferenced through it.
    pub(crate) fn insert(
        &self,
        head: &AtomicLink<Node<T>>,
        node: *mut Node<T>,
        key: &[u8],
        record: &PinRecord<Node<T>>,
        unique: bool,
    ) -> Option<*mut Node<T>> {
        let backoff = Backoff::new();
        let mut cursor = Cursor::new();
        // SAFETY: the node is not yet published; nothing races the read.
        let hashnr = unsafe { (*node).hashnr };
        let duplicate = loop {
            let found = matches!(
                self.find(head, hashnr, key, &mut cursor, record, None),
                Traverse::Found
            );
            if found && unique {
                break Some(cursor.curr);
            }
            // Link the node in front of `curr`; publication is the one CAS
            // on the predecessor, so a lost race leaves no trace.
            // SAFETY: still unpublished.
            unsafe { &(*node).link }.store(Link::to(cursor.curr), Ordering::SeqCst);
            if unsafe { &*cursor.prev }
                .compare_exchange(
                    Link::to(cursor.curr),
                    Link::to(node),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break None;
            }
            backoff.spin();
        };
        record.unpin(0);
        record.unpin(1);
        record.unpin(2);
        duplicate
    }

    /// Removes the node for `hashnr`/`key`: mark first, then unlink. When
    /// the unlink CAS loses to a helper, one finishing `find` completes the
    /// helping bookkeeping before success is reported.
    pub(crate) fn delete(
        &self,
        head: &AtomicLink<Node<T>>,
        hashnr: u32,
        key: &[u8],
        record: &PinRecord<Node<T>>,
    ) -> bool {
        let backoff = Backoff::new();
        let mut cursor = Cursor::new();
        let deleted = loop {
            if !matches!(
                self.find(head, hashnr, key, &mut cursor, record, None),
                Traverse::Found
            ) {
                break false;
            }
            // Phase one: publish the deletion mark on the node's own link.
            // SAFETY: `curr` is pinned in slot 1.
            if unsafe { &(*cursor.curr).link }
                .compare_exchange(
                    Link::to(cursor.next),
                    Link::deleted(cursor.next),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                // The link moved under us; reposition and try again.
                backoff.spin();
                continue;
            }
            // Phase two: unlink from the chain.
            if unsafe { &*cursor.prev }
                .compare_exchange(
                    Link::to(cursor.curr),
                    Link::to(cursor.next),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                self.pinbox.retire(record, cursor.curr);
            } else {
                // A helper finished the unlink; one more positioning pass
                // keeps mark and unlink bookkeeping balanced.
                self.find(head, hashnr, key, &mut cursor, record, None);
            }
            break true;
        };
        record.unpin(0);
        record.unpin(1);
        record.unpin(2);
        deleted
    }

    /// Iterates the whole chain, invoking `action` on every ordinary node.
    pub(crate) fn walk(
        &self,
        head: &AtomicLink<Node<T>>,
        record: &PinRecord<Node<T>>,
        action: &mut dyn FnMut(&T) -> ControlFlow<()>,
    ) -> Traverse {
        let mut cursor = Cursor::new();
        let outcome = self.find(head, 0, &[], &mut cursor, record, Some(action));
        record.unpin(0);
        record.unpin(1);
        record.unpin(2);
        outcome
    }
}
