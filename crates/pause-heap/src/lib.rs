//! A paged heap with pauseless, concurrent relocation.
//!
//! This crate provides the memory management core for a small
//! object-oriented virtual machine: a fixed set of equal-size pages,
//! bump-pointer allocation within a page, and a relocation protocol that
//! lets a collector evacuate sparsely-populated pages while mutator
//! threads keep running, cooperating only through read/write barriers
//! and occasional safepoint handshakes — never a stop-the-world pause.
//!
//! # What this crate does not do
//!
//! It does not implement a bytecode interpreter, a class hierarchy, or
//! conservative stack scanning. Roots are explicit: the embedder
//! supplies them through [`gc::RootProvider`]. Fixing up raw,
//! non-`GcPtr` roots held by mutator threads (e.g. an interpreter's
//! operand stack) after a relocation cycle is the embedder's
//! responsibility, using [`mutator::MutatorContext::poll_safepoint`] as
//! the hook; this crate only guarantees the side array a root might need
//! to forward through stays alive until every mutator has passed that
//! hook at least once after relocation completes.
//!
//! # Quick start
//!
//! ```
//! use pause_heap::{config::HeapConfig, heap::PagedHeap, mutator::MutatorContext, Trace, Visitor};
//!
//! struct Counter(u64);
//! // SAFETY: holds no heap pointers.
//! unsafe impl Trace for Counter {
//!     fn trace(&self, _visitor: &mut dyn Visitor) {}
//! }
//!
//! let heap = PagedHeap::new(HeapConfig::for_tests());
//! let mutator = MutatorContext::new(heap);
//! let obj = mutator.allocate_object(Counter(1), 0, false);
//! // SAFETY: obj was just allocated above.
//! assert_eq!(unsafe { (*obj).value.0 }, 1);
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]

pub mod barrier;
pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod metrics;
pub mod mutator;
pub mod object;
pub mod page;

pub use config::HeapConfig;
pub use error::FatalError;
pub use gc::{CollectInfo, Collector, RootProvider};
pub use heap::PagedHeap;
pub use metrics::GcMetrics;
pub use mutator::MutatorContext;
pub use object::{GcBox, GcPtr, ObjectHeader, Trace, Visitor};
pub use page::{Page, PageId};

/// Yield the current thread, acknowledging the collector's current
/// safepoint epoch first.
///
/// Embedders should call this on interpreter loop back-edges and
/// blocking-call boundaries so a pending relocation cycle's handshake
/// never waits long on this thread.
pub fn yield_now(mutator: &mutator::MutatorContext) {
    mutator.poll_safepoint();
    std::thread::yield_now();
}

/// Test-only helpers for exercising collection deterministically.
///
/// Gated the same way the teacher crate gates its own `test_util`
/// module: always compiled under `#[cfg(test)]`, and additionally
/// exposed to other crates in the workspace (integration tests, fuzz
/// harnesses) when the `test-util` feature is enabled.
#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use std::sync::{Arc, Mutex};

    use crate::config::HeapConfig;
    use crate::gc::{Collector, RootProvider};
    use crate::heap::PagedHeap;

    /// A [`RootProvider`] whose root set is an explicit, test-managed
    /// list. Tests register and clear roots directly instead of relying
    /// on a real interpreter stack.
    #[derive(Default)]
    pub struct TestRoots(Mutex<Vec<usize>>);

    impl TestRoots {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn register(&self, addr: *mut u8) {
            if !addr.is_null() {
                self.0.lock().unwrap().push(addr as usize);
            }
        }

        pub fn clear(&self) {
            self.0.lock().unwrap().clear();
        }

        /// Current root addresses, reflecting any forwarding a
        /// collection cycle performed and wrote back through
        /// [`RootProvider::roots`]'s caller... in this simple harness,
        /// unchanged unless the test updates them itself, matching the
        /// crate's stance that root fixup is the embedder's job.
        #[must_use]
        pub fn snapshot(&self) -> Vec<usize> {
            self.0.lock().unwrap().clone()
        }
    }

    impl RootProvider for TestRoots {
        fn roots(&self) -> Vec<usize> {
            self.0.lock().unwrap().clone()
        }
    }

    /// Build a heap sized for fast tests, plus a [`Collector`] wired to
    /// an empty [`TestRoots`] set a test can register roots into.
    #[must_use]
    pub fn test_heap_and_collector() -> (Arc<PagedHeap>, Arc<TestRoots>, Collector) {
        let heap = PagedHeap::new(HeapConfig::for_tests());
        let roots = Arc::new(TestRoots::new());
        let collector = Collector::new(Arc::clone(&heap), Arc::clone(&roots) as Arc<dyn RootProvider>);
        (heap, roots, collector)
    }

    /// Force a single collection cycle to completion on the calling
    /// thread, using one collector worker. Convenience wrapper over
    /// [`Collector::collect`] for tests that don't care about parallel
    /// mark-phase throughput.
    pub fn collect_sync(collector: &Collector) -> crate::GcMetrics {
        collector.collect(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_heap_and_collector;

    struct Leaf(u32);
    // SAFETY: no pointer fields.
    unsafe impl Trace for Leaf {
        fn trace(&self, _visitor: &mut dyn Visitor) {}
    }

    #[test]
    fn end_to_end_allocate_collect_survives_a_rooted_object() {
        let (heap, roots, collector) = test_heap_and_collector();
        let mutator = mutator::MutatorContext::new(std::sync::Arc::clone(&heap));
        let obj = mutator.allocate_object(Leaf(7), 1, true);
        roots.register(obj.cast::<u8>());

        crate::test_util::collect_sync(&collector);

        let current = roots.snapshot();
        // SAFETY: pinned allocation, stable address, still live.
        let value = unsafe { &(*(current[0] as *const GcBox<Leaf>)).value };
        assert_eq!(value.0, 7);
    }

    #[test]
    fn end_to_end_unrooted_object_is_reclaimable() {
        let (heap, _roots, collector) = test_heap_and_collector();
        let mutator = mutator::MutatorContext::new(std::sync::Arc::clone(&heap));
        for _ in 0..400 {
            mutator.allocate_object(Leaf(0), 1, false);
        }
        let free_before = heap.free_pages();
        crate::test_util::collect_sync(&collector);
        assert!(heap.free_pages() >= free_before);
    }
}
