//! Lock-free free-list allocator for chain nodes.
//!
//! Reclaimed nodes are pushed onto a Treiber stack and reused; memory only
//! goes back to the system when the whole structure is torn down. Popping
//! pins the candidate top in hazard slot 0 first, so a concurrent reclaimer
//! can never recycle the node out from under the pop.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_utils::Backoff;

use crate::error::Error;
use crate::list::Node;
use crate::pin::{PinBox, PinRecord, Retire};

struct FreeStack<T> {
    top: AtomicPtr<Node<T>>,
}

impl<T> FreeStack<T> {
    /// Splices a `first..last` chain onto the stack with one CAS.
    fn push_chain(&self, first: *mut Node<T>, last: *mut Node<T>) {
        let backoff = Backoff::new();
        let mut top = self.top.load(Ordering::SeqCst);
        loop {
            // SAFETY: the chain is unreferenced; its retired-chain slots
            // are ours until the push publishes them.
            unsafe { (*last).retired_next().store(top, Ordering::SeqCst) };
            match self
                .top
                .compare_exchange(top, first, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(current) => {
                    top = current;
                    backoff.spin();
                }
            }
        }
    }
}

pub(crate) struct Allocator<T: 'static> {
    pinbox: PinBox<Node<T>>,
    stack: Arc<FreeStack<T>>,
    constructor: Option<fn(*mut T)>,
    destructor: Option<fn(*mut T)>,
    /// Fresh system allocations, for diagnostics.
    fresh_allocs: AtomicU32,
}

impl<T: 'static> Allocator<T> {
    pub(crate) fn new(constructor: Option<fn(*mut T)>, destructor: Option<fn(*mut T)>) -> Self {
        let stack = Arc::new(FreeStack {
            top: AtomicPtr::new(ptr::null_mut()),
        });
        let free_target = Arc::clone(&stack);
        let pinbox = PinBox::new(Box::new(move |first, last| {
            free_target.push_chain(first, last);
        }));
        Self {
            pinbox,
            stack,
            constructor,
            destructor,
            fresh_allocs: AtomicU32::new(0),
        }
    }

    pub(crate) fn pinbox(&self) -> &PinBox<Node<T>> {
        &self.pinbox
    }

    /// Pops a pooled node or falls back to a fresh system allocation. The
    /// constructor hook runs once per physical allocation, never on reuse;
    /// resetting payload state on reuse is the caller's business.
    pub(crate) fn new_node(&self, record: &PinRecord<Node<T>>) -> Result<*mut Node<T>, Error> {
        let backoff = Backoff::new();
        let node = loop {
            // Pin the candidate top before touching it.
            let top = loop {
                let top = self.stack.top.load(Ordering::SeqCst);
                record.pin(0, top);
                if self.stack.top.load(Ordering::SeqCst) == top {
                    break top;
                }
                backoff.spin();
            };
            if top.is_null() {
                let fresh = Node::<T>::alloc()?;
                if let Some(constructor) = self.constructor {
                    // SAFETY: fresh node, exclusively owned.
                    constructor(unsafe { (*fresh).payload() });
                }
                self.fresh_allocs.fetch_add(1, Ordering::Relaxed);
                break fresh;
            }
            // SAFETY: `top` is pinned, so its retired-chain slot is
            // readable even if it is popped and recycled concurrently.
            let next = unsafe { (*top).retired_next().load(Ordering::SeqCst) };
            if self
                .stack
                .top
                .compare_exchange(top, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break top;
            }
            backoff.spin();
        };
        record.unpin(0);
        Ok(node)
    }

    /// Retires an unlinked node; it reaches the pool once no hazard slot
    /// references it.
    pub(crate) fn free_node(&self, record: &PinRecord<Node<T>>, node: *mut Node<T>) {
        self.pinbox.retire(record, node);
    }

    /// Frees a node without going through purgatory.
    ///
    /// # Safety
    ///
    /// Only valid during exclusive teardown, when no accessor can hold a
    /// pin on `node`.
    pub(crate) unsafe fn direct_free(&self, node: *mut Node<T>) {
        if let Some(destructor) = self.destructor {
            // SAFETY: caller guarantees exclusivity.
            destructor(unsafe { (*node).payload() });
        }
        // SAFETY: as above.
        unsafe { Node::dealloc(node) };
    }

    /// Walks the free stack and counts pooled nodes. Diagnostic only; the
    /// exclusive borrow keeps the stack still while walking.
    pub(crate) fn pool_count(&mut self) -> usize {
        let mut count = 0;
        let mut cur = self.stack.top.load(Ordering::Relaxed);
        while !cur.is_null() {
            count += 1;
            // SAFETY: no concurrent mutation under `&mut self`.
            cur = unsafe { (*cur).retired_next().load(Ordering::Relaxed) };
        }
        count
    }

    /// Number of nodes obtained from the system allocator so far.
    pub(crate) fn fresh_alloc_count(&self) -> u32 {
        self.fresh_allocs.load(Ordering::Relaxed)
    }
}

impl<T: 'static> Drop for Allocator<T> {
    fn drop(&mut self) {
        // Exclusive teardown: destruct and free everything still pooled.
        let mut cur = self.stack.top.swap(ptr::null_mut(), Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: pooled nodes are unreferenced and owned by the stack.
            let next = unsafe { (*cur).retired_next().load(Ordering::Relaxed) };
            unsafe { self.direct_free(cur) };
            cur = next;
        }
    }
}
