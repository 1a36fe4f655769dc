//! The mark phase: trace from an explicit root set, distributing work
//! across collector threads with [`StealQueue`].
//!
//! Per §4.4/§6, roots are explicit (globals, thread stacks handed to us
//! by the embedder), never discovered by conservative stack scanning.
//! Work distribution follows the teacher crate's `gc/marker.rs`: a
//! per-worker queue backed by [`StealQueue`], overflowing into a shared
//! `SegQueue` when a worker's local queue is full, with idle workers
//! stealing from both their peers and the overflow queue.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

use crate::gc::worklist::{Steal, StealQueue};
use crate::heap::PagedHeap;
use crate::object::{ObjectHeader, Visitor};

/// Anything that can enumerate the current root set: global handles, and
/// every live mutator's thread-local roots (interpreter stack, operand
/// stack, currently-executing frame). Supplying this is the embedder's
/// responsibility; this crate only consumes it.
///
/// Roots are plain addresses rather than `NonNull<u8>`: the mark queues
/// they flow through are shared across collector threads, and a bare
/// address (unlike a raw pointer type) is `Send`/`Sync` without any
/// unsafe assertion on our part.
pub trait RootProvider: Send + Sync {
    /// Every currently-live root address, snapshotted at call time.
    fn roots(&self) -> Vec<usize>;
}

/// Local capacity of each worker's `StealQueue` before it spills into the
/// shared overflow queue.
const LOCAL_QUEUE_CAPACITY: usize = 4096;

struct MarkVisitor<'a> {
    queue: &'a PerThreadMarkQueue,
}

impl Visitor for MarkVisitor<'_> {
    fn visit_field(&mut self, field: &crate::object::GcPtr) {
        let addr = field.raw_load() as usize;
        if addr != 0 {
            self.queue.push(addr);
        }
    }
}

/// One worker's local work queue plus a handle to the shared overflow.
pub struct PerThreadMarkQueue {
    local: StealQueue<usize, LOCAL_QUEUE_CAPACITY>,
    overflow: std::sync::Arc<SegQueue<usize>>,
}

impl PerThreadMarkQueue {
    #[must_use]
    pub fn new(overflow: std::sync::Arc<SegQueue<usize>>) -> Self {
        Self {
            local: StealQueue::new(),
            overflow,
        }
    }

    fn push(&self, addr: usize) {
        if !self.local.push(addr) {
            self.overflow.push(addr);
        }
    }

    fn pop(&self) -> Option<usize> {
        self.local.pop().or_else(|| self.overflow.pop())
    }

    fn steal_from(&self, other: &Self) -> Steal<usize> {
        match other.local.steal() {
            Steal::Empty => other.overflow.pop().map_or(Steal::Empty, Steal::Success),
            result => result,
        }
    }
}

/// Run the mark phase to completion: seed every worker with the root
/// set, then work-steal until every queue (local and shared) is empty
/// and no worker is mid-trace.
///
/// Marks an object as reached by swapping its `gc_field` to
/// `mark_value` (tri-color: unmarked objects are white, anything popped
/// off a queue and not yet traced is grey, and once `walk_pointer_fields`
/// has run for it the object is effectively black — there is no
/// separate grey set because membership in a mark queue already encodes
/// it).
pub fn mark(
    heap: &PagedHeap,
    roots: &dyn RootProvider,
    mark_value: u8,
    worker_count: usize,
) {
    let overflow = std::sync::Arc::new(SegQueue::new());
    for addr in roots.roots() {
        overflow.push(addr);
    }
    // Addresses the write barrier recorded since the previous cycle:
    // objects a mutator stored into an already-traced field that might
    // otherwise be invisible to this mark epoch (§4.6).
    for addr in heap.drain_remembered_roots() {
        overflow.push(addr);
    }

    let active_workers = AtomicUsize::new(0);
    let worker_count = worker_count.max(1);

    std::thread::scope(|scope| {
        let queues: Vec<PerThreadMarkQueue> = (0..worker_count)
            .map(|_| PerThreadMarkQueue::new(std::sync::Arc::clone(&overflow)))
            .collect();

        for (idx, queue) in queues.iter().enumerate() {
            let queues = &queues;
            let active_workers = &active_workers;
            scope.spawn(move || {
                mark_worker(heap, queue, queues, idx, mark_value, active_workers);
            });
        }
    });
}

#[allow(clippy::needless_range_loop)]
fn mark_worker(
    heap: &PagedHeap,
    own: &PerThreadMarkQueue,
    all: &[PerThreadMarkQueue],
    own_idx: usize,
    mark_value: u8,
    active_workers: &AtomicUsize,
) {
    loop {
        let Some(addr) = own.pop().or_else(|| steal_from_peers(all, own_idx, own)) else {
            break;
        };

        active_workers.fetch_add(1, Ordering::AcqRel);
        // SAFETY: `addr` came from a root or from a GcPtr field visited
        // during tracing, both of which name live objects per the
        // `Trace` contract.
        let header = unsafe { &*(addr as *const ObjectHeader) };
        let page = heap.page_containing(addr);
        if let Some(page) = page {
            header.validate(page.id(), addr - page.start());
        }
        if header.try_mark(mark_value) {
            if let Some(page) = page {
                page.add_amount_live(header.size());
            }
            let mut visitor = MarkVisitor { queue: own };
            // SAFETY: same as above.
            unsafe {
                header.walk_pointer_fields(addr as *const u8, &mut visitor);
            }
        }
        active_workers.fetch_sub(1, Ordering::AcqRel);
    }
}

fn steal_from_peers(
    all: &[PerThreadMarkQueue],
    own_idx: usize,
    own: &PerThreadMarkQueue,
) -> Option<usize> {
    for _ in 0..4 {
        let mut saw_retry = false;
        for (idx, peer) in all.iter().enumerate() {
            if idx == own_idx {
                continue;
            }
            match own.steal_from(peer) {
                Steal::Success(addr) => return Some(addr),
                Steal::Retry => saw_retry = true,
                Steal::Empty => {}
            }
        }
        if !saw_retry {
            return None;
        }
        std::thread::yield_now();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::mutator::MutatorContext;
    use crate::object::{GcPtr, Trace};

    struct Node {
        next: GcPtr,
    }
    // SAFETY: reports its one pointer field.
    unsafe impl Trace for Node {
        fn trace(&self, visitor: &mut dyn Visitor) {
            visitor.visit_field(&self.next);
        }
    }

    struct SingleRoot(std::sync::Mutex<Vec<usize>>);
    impl RootProvider for SingleRoot {
        fn roots(&self) -> Vec<usize> {
            self.0.lock().unwrap().clone()
        }
    }

    #[test]
    fn mark_reaches_transitively_linked_objects() {
        let heap = PagedHeap::new(HeapConfig::for_tests());
        let mutator = MutatorContext::new(heap.clone());

        let tail = mutator.allocate_object(Node { next: GcPtr::new(std::ptr::null_mut()) }, 1, false);
        let head = mutator.allocate_object(
            Node {
                next: GcPtr::new(tail.cast::<u8>()),
            },
            1,
            false,
        );

        let root = SingleRoot(std::sync::Mutex::new(vec![head as usize]));

        let mark_value = heap.mark_value().current();
        mark(&heap, &root, mark_value, 2);

        // SAFETY: both objects are still valid allocations.
        let head_header = unsafe { &*head.cast::<ObjectHeader>() };
        let tail_header = unsafe { &*tail.cast::<ObjectHeader>() };
        assert_eq!(head_header.gc_field(), mark_value);
        assert_eq!(tail_header.gc_field(), mark_value);
    }

    #[test]
    fn unreachable_objects_stay_unmarked() {
        let heap = PagedHeap::new(HeapConfig::for_tests());
        let mutator = MutatorContext::new(heap.clone());
        let orphan = mutator.allocate_object(Node { next: GcPtr::new(std::ptr::null_mut()) }, 1, false);

        let root = SingleRoot(std::sync::Mutex::new(Vec::new()));
        let mark_value = heap.mark_value().current();
        mark(&heap, &root, mark_value, 1);

        // SAFETY: orphan is still a valid allocation, just unreached.
        let header = unsafe { &*orphan.cast::<ObjectHeader>() };
        assert_eq!(header.gc_field(), crate::object::UNMARKED);
    }
}
