//! Pin records and deferred reclamation.
//!
//! Every accessor owns one [`PinRecord`] at a time. Its hazard slots
//! advertise "I may be dereferencing this node, do not recycle it"; its
//! purgatory collects nodes that were unlinked but may still be referenced
//! by someone else's slot. A reclamation pass scans every record's every
//! slot and hands the provably unreferenced part of the purgatory to the
//! owner's batch-free hook in one call, amortizing the scan over
//! [`PURGATORY_BATCH`] retirements.

use std::cell::UnsafeCell;
use std::ops::ControlFlow;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crossbeam_utils::Backoff;

use crate::dynarray::{DynArray, ZeroInit};
use crate::error::Error;

/// Hazard slots per pin record.
pub(crate) const PIN_SLOTS: usize = 4;

/// Retirements between reclamation passes.
const PURGATORY_BATCH: u32 = 100;

/// Size of the pin record index space. Also the version stride of the free
/// stack: the top word packs `version * MAX_RECORDS + free_index`, so a
/// recycled index can never satisfy a stale compare-and-swap (the classic
/// ABA hazard on free-list heads).
const MAX_RECORDS: u32 = 65536;

/// Access to the pointer-sized slot inside a node that chains retired
/// nodes through purgatory and the allocator free stack.
///
/// # Safety
///
/// The slot must be dead weight for every reader once the node has been
/// physically unlinked; the registry overwrites it freely from that point.
pub(crate) unsafe trait Retire: Sized {
    fn retired_next(&self) -> &AtomicPtr<Self>;
}

/// Per-accessor pin state.
///
/// The hazard slots are read by every thread during reclamation scans; the
/// purgatory fields belong exclusively to the current holder of the record.
/// `link` doubles as the record's own index while the record is handed out
/// and as the next-free index while it sits on the free stack.
#[repr(C, align(64))]
pub(crate) struct PinRecord<N> {
    pins: [AtomicPtr<N>; PIN_SLOTS],
    link: AtomicU32,
    purgatory_count: UnsafeCell<u32>,
    purgatory: UnsafeCell<*mut N>,
}

unsafe impl<N> ZeroInit for PinRecord<N> {}
unsafe impl<N> Send for PinRecord<N> {}
unsafe impl<N> Sync for PinRecord<N> {}

impl<N> PinRecord<N> {
    /// Publishes a hazard reference. The store is sequentially consistent
    /// so a subsequent revalidation load cannot pass it.
    pub(crate) fn pin(&self, slot: usize, node: *mut N) {
        self.pins[slot].store(node, Ordering::SeqCst);
    }

    pub(crate) fn unpin(&self, slot: usize) {
        self.pins[slot].store(ptr::null_mut(), Ordering::SeqCst);
    }
}

impl<N: Retire> PinRecord<N> {
    /// Owner-only: threads other than the record holder must never call.
    fn push_purgatory(&self, node: *mut N) {
        // SAFETY: the purgatory fields are private to the record holder and
        // `node` is unlinked, so its retired-chain slot is ours to write.
        unsafe {
            (*node).retired_next().store(*self.purgatory.get(), Ordering::Relaxed);
            *self.purgatory.get() = node;
            *self.purgatory_count.get() += 1;
        }
    }

    fn purgatory_len(&self) -> u32 {
        // SAFETY: owner-only read.
        unsafe { *self.purgatory_count.get() }
    }
}

/// Registry of pin records plus the deferred-free machinery.
pub(crate) struct PinBox<N> {
    records: DynArray<PinRecord<N>>,
    /// Versioned free-stack top; see [`MAX_RECORDS`].
    top_ver: AtomicU32,
    /// Highest record index ever handed out.
    records_used: AtomicU32,
    /// Receives each reclaimed batch as a `first..last` chain.
    free_batch: Box<dyn Fn(*mut N, *mut N) + Send + Sync>,
}

impl<N: Retire> PinBox<N> {
    pub(crate) fn new(free_batch: Box<dyn Fn(*mut N, *mut N) + Send + Sync>) -> Self {
        Self {
            records: DynArray::new(),
            top_ver: AtomicU32::new(0),
            records_used: AtomicU32::new(0),
            free_batch,
        }
    }

    /// Obtains a fresh or recycled pin record.
    pub(crate) fn acquire(&self) -> Result<&PinRecord<N>, Error> {
        let mut top_ver = self.top_ver.load(Ordering::SeqCst);
        let (record, index) = loop {
            let index = top_ver % MAX_RECORDS;
            if index == 0 {
                // Free stack is empty; claim a fresh index. Index zero is
                // reserved to mean "no record".
                let fresh = self.records_used.fetch_add(1, Ordering::SeqCst) + 1;
                if fresh >= MAX_RECORDS {
                    return Err(Error::PinsExhausted);
                }
                break (self.records.get_or_alloc(fresh as usize)?, fresh);
            }
            // The index came off the free stack, so its record segment is
            // already allocated and this cannot actually allocate.
            let candidate = self.records.get_or_alloc(index as usize)?;
            let next = candidate.link.load(Ordering::SeqCst);
            let new_top = top_ver
                .wrapping_sub(index)
                .wrapping_add(next)
                .wrapping_add(MAX_RECORDS);
            match self
                .top_ver
                .compare_exchange(top_ver, new_top, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break (candidate, index),
                Err(current) => top_ver = current,
            }
        };
        record.link.store(index, Ordering::SeqCst);
        // Fresh records are zeroed; recycled ones were drained on release.
        // Reset anyway so the invariant does not depend on the path taken.
        unsafe {
            *record.purgatory.get() = ptr::null_mut();
            *record.purgatory_count.get() = 0;
        }
        Ok(record)
    }

    /// Returns a record after draining its purgatory.
    ///
    /// Draining may have to wait for other accessors to drop their pins on
    /// nodes this record retired; the wait is a voluntary backoff, never a
    /// lock.
    pub(crate) fn release(&self, record: &PinRecord<N>) {
        let backoff = Backoff::new();
        while record.purgatory_len() != 0 {
            self.reclaim(record);
            if record.purgatory_len() != 0 {
                backoff.snooze();
            }
        }
        let index = record.link.load(Ordering::SeqCst);
        let mut top_ver = self.top_ver.load(Ordering::SeqCst);
        loop {
            let free_top = top_ver % MAX_RECORDS;
            record.link.store(free_top, Ordering::SeqCst);
            let new_top = top_ver
                .wrapping_sub(free_top)
                .wrapping_add(index)
                .wrapping_add(MAX_RECORDS);
            match self
                .top_ver
                .compare_exchange(top_ver, new_top, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(current) => top_ver = current,
            }
        }
    }

    /// Adds an unlinked node to the record's purgatory, running a
    /// reclamation pass every [`PURGATORY_BATCH`] retirements.
    pub(crate) fn retire(&self, record: &PinRecord<N>, node: *mut N) {
        record.push_purgatory(node);
        if record.purgatory_len() % PURGATORY_BATCH == 0 {
            self.reclaim(record);
        }
    }

    /// Scans every hazard slot in the registry against the record's
    /// purgatory. Nodes still referenced go back to the purgatory; the rest
    /// leave through the batch-free hook as one chain.
    fn reclaim(&self, record: &PinRecord<N>) {
        // Snapshot and reset the caller's purgatory. Re-added survivors land
        // in the live purgatory, not the snapshot, so the scan terminates.
        // SAFETY: owner-only purgatory access.
        let mut outcast: *mut N = unsafe { ptr::replace(record.purgatory.get(), ptr::null_mut()) };
        unsafe {
            *record.purgatory_count.get() = 0;
        }

        self.records.for_each_segment(|segment| {
            for rec in segment.iter() {
                for slot in rec.pins.iter() {
                    let pinned = slot.load(Ordering::SeqCst);
                    if pinned.is_null() {
                        continue;
                    }
                    // Unlink every snapshot entry matching this hazard.
                    let mut prev: *mut N = ptr::null_mut();
                    let mut cur = outcast;
                    while !cur.is_null() {
                        // SAFETY: snapshot nodes are unlinked and owned by
                        // this pass; their retired-chain slots are valid.
                        let next = unsafe { (*cur).retired_next().load(Ordering::Relaxed) };
                        if cur == pinned {
                            if prev.is_null() {
                                outcast = next;
                            } else {
                                unsafe { (*prev).retired_next().store(next, Ordering::Relaxed) };
                            }
                            record.push_purgatory(cur);
                        } else {
                            prev = cur;
                        }
                        cur = next;
                    }
                    if outcast.is_null() {
                        return ControlFlow::Break(());
                    }
                }
            }
            ControlFlow::Continue(())
        });

        if outcast.is_null() {
            return;
        }
        let mut last = outcast;
        #[cfg(feature = "logging")]
        let mut batch = 1u32;
        loop {
            // SAFETY: as above.
            let next = unsafe { (*last).retired_next().load(Ordering::Relaxed) };
            if next.is_null() {
                break;
            }
            last = next;
            #[cfg(feature = "logging")]
            {
                batch += 1;
            }
        }
        #[cfg(feature = "logging")]
        log::trace!("reclaiming a batch of {batch} retired nodes");
        (self.free_batch)(outcast, last);
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;
    use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{PinBox, Retire, PURGATORY_BATCH};

    struct TestNode {
        retired: AtomicPtr<TestNode>,
        value: usize,
    }

    unsafe impl Retire for TestNode {
        fn retired_next(&self) -> &AtomicPtr<Self> {
            &self.retired
        }
    }

    fn new_node(value: usize) -> *mut TestNode {
        Box::into_raw(Box::new(TestNode {
            retired: AtomicPtr::new(ptr::null_mut()),
            value,
        }))
    }

    fn collecting_pinbox() -> (PinBox<TestNode>, Arc<Mutex<Vec<usize>>>) {
        let freed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&freed);
        let pinbox = PinBox::new(Box::new(move |first: *mut TestNode, last: *mut TestNode| {
            let mut cur = first;
            loop {
                // Take ownership back and record which nodes were freed.
                let node = unsafe { Box::from_raw(cur) };
                sink.lock().unwrap().push(node.value);
                if cur == last {
                    break;
                }
                cur = node.retired.load(Ordering::Relaxed);
            }
        }));
        (pinbox, freed)
    }

    #[test]
    fn records_are_recycled_through_the_free_stack() {
        let (pinbox, _freed) = collecting_pinbox();
        let first = pinbox.acquire().unwrap() as *const _;
        pinbox.release(unsafe { &*first });
        let second = pinbox.acquire().unwrap() as *const _;
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_accessors_get_distinct_records() {
        let (pinbox, _freed) = collecting_pinbox();
        let a = pinbox.acquire().unwrap();
        let b = pinbox.acquire().unwrap();
        assert!(!ptr::eq(a, b));
        pinbox.release(a);
        pinbox.release(b);
    }

    #[test]
    fn retire_below_batch_size_defers_freeing() {
        let (pinbox, freed) = collecting_pinbox();
        let record = pinbox.acquire().unwrap();
        pinbox.retire(record, new_node(1));
        pinbox.retire(record, new_node(2));
        assert!(freed.lock().unwrap().is_empty());
        pinbox.release(record);
        let mut seen = freed.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn batch_boundary_triggers_reclaim() {
        let (pinbox, freed) = collecting_pinbox();
        let record = pinbox.acquire().unwrap();
        for value in 0..PURGATORY_BATCH as usize {
            pinbox.retire(record, new_node(value));
        }
        assert_eq!(freed.lock().unwrap().len(), PURGATORY_BATCH as usize);
        pinbox.release(record);
    }

    #[test]
    fn pinned_nodes_survive_reclamation() {
        let (pinbox, freed) = collecting_pinbox();
        let holder = pinbox.acquire().unwrap();
        let retirer = pinbox.acquire().unwrap();

        let node = new_node(7);
        holder.pin(0, node);
        for value in 100..100 + PURGATORY_BATCH as usize - 1 {
            pinbox.retire(retirer, new_node(value));
        }
        pinbox.retire(retirer, node);
        // The pass ran at the batch boundary; everything except the pinned
        // node must have been freed.
        assert_eq!(freed.lock().unwrap().len(), PURGATORY_BATCH as usize - 1);
        assert!(!freed.lock().unwrap().contains(&7));
        // The node's bytes are still intact while pinned.
        assert_eq!(unsafe { (*node).value }, 7);

        holder.unpin(0);
        pinbox.release(retirer);
        assert!(freed.lock().unwrap().contains(&7));
        pinbox.release(holder);
    }

    #[test]
    fn record_indexes_start_at_one() {
        // Index zero is the reserved "no record" value.
        let (pinbox, _freed) = collecting_pinbox();
        let a = pinbox.acquire().unwrap();
        let b = pinbox.acquire().unwrap();
        assert_eq!(a.link.load(Ordering::SeqCst), 1);
        assert_eq!(b.link.load(Ordering::SeqCst), 2);
        pinbox.release(b);
        pinbox.release(a);
    }

    #[test]
    fn concurrent_acquire_release_yields_unique_records() {
        let (pinbox, _freed) = collecting_pinbox();
        let pinbox = Arc::new(pinbox);
        let peak = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pinbox = Arc::clone(&pinbox);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let record = pinbox.acquire().unwrap();
                        let index = record.link.load(Ordering::SeqCst) as usize;
                        peak.fetch_max(index, Ordering::Relaxed);
                        pinbox.release(record);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        // Never more than eight live records, so the free stack must have
        // been recycling indexes instead of growing the registry.
        assert!(peak.load(Ordering::Relaxed) <= 8);
    }
}
