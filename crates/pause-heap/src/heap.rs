//! The paged heap: a fixed-size backing region carved into pages at
//! startup, plus the free/in-use/full-non-relocatable pools described in
//! §4.2 and §4.5.
//!
//! Grounded on SOM++'s `PagedHeap` (`original_source/.../memory/PagedHeap.cpp`)
//! for the pool structure, and on the teacher's `GlobalHeap` (`heap.rs`) for
//! the "carve one big `mmap` region into fixed-size slices up front" shape.
//! The free pool is a [`crossbeam_queue::SegQueue`] rather than the
//! teacher's per-size-class free lists, since every page here is the same
//! size; the full-non-relocatable pool is a plain `Mutex<Vec<_>>` since it
//! is only ever walked, not contended on a hot path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use sys_alloc::MmapOptions;

use crate::config::HeapConfig;
use crate::error::FatalError;
use crate::gc::safepoint::SafepointCoordinator;
use crate::object::MarkValue;
use crate::page::{Page, PageId};

/// Owns the heap's entire backing memory region and the pools of pages
/// carved out of it.
///
/// A `PagedHeap` is shared by every mutator and collector thread; all of
/// its pool operations are internally synchronized (`SegQueue` is
/// lock-free, the non-relocatable pool uses a short-held `Mutex`).
pub struct PagedHeap {
    config: HeapConfig,
    /// Keeps the backing region mapped for the heap's entire lifetime.
    /// Never read directly after construction; pages hold the addresses
    /// they need.
    _region: sys_alloc::Mmap,
    region_base: usize,
    region_end: usize,
    pages: Vec<Arc<Page>>,
    free: SegQueue<Arc<Page>>,
    /// Full pages relinquished by mutators, awaiting the next cycle's
    /// victim selection (§4.4). Not yet known to be sparse or dense;
    /// that is decided after the mark phase attributes liveness to them.
    full_pages: Mutex<Vec<Arc<Page>>>,
    full_non_relocatable: Mutex<Vec<Arc<Page>>>,
    mark_value: MarkValue,
    /// Bytes allocated since the last collection cycle began, used by
    /// `maybe_collect` policy in [`crate::gc::collector`].
    bytes_since_collection: AtomicUsize,
    /// Addresses `write_barrier` has published into already-traced
    /// objects since the mark phase last drained this queue. A mutator
    /// storing a pointer to a freshly-allocated, not-yet-marked object
    /// into a field the collector has already walked would otherwise
    /// leave that object invisible to the in-flight mark epoch; treating
    /// every barrier-recorded store as a potential root closes that race
    /// (§4.6). Drained once per cycle by [`crate::gc::marker::mark`].
    remembered_roots: SegQueue<usize>,
    /// Count of pages [`Self::add_full_non_relocatable`] has pinned
    /// since the last [`Self::take_non_relocatable_promotions`] call,
    /// surfaced in a cycle's [`crate::metrics::GcMetrics`].
    non_relocatable_promotions: AtomicUsize,
    safepoints: SafepointCoordinator,
}

impl PagedHeap {
    /// Map the backing region and carve it into `config.total_pages`
    /// pages. Panics if the region cannot be mapped: there is no
    /// degraded mode to fall back to (§4.5, "fixed at startup").
    #[must_use]
    pub fn new(config: HeapConfig) -> Arc<Self> {
        let total_bytes = config.total_heap_bytes();
        // SAFETY: an anonymous mapping with no hint; the returned `Mmap`
        // owns the region for as long as `PagedHeap` is alive, and every
        // `Page`'s start/end addresses are derived from it below.
        let region = unsafe {
            MmapOptions::new()
                .len(total_bytes)
                .populate(false)
                .map_anon()
        }
        .unwrap_or_else(|err| {
            panic!("failed to map {total_bytes} byte heap region: {err}");
        });

        let base = region.ptr() as usize;
        let threshold = config.page_threshold_bytes();
        let pages: Vec<Arc<Page>> = (0..config.total_pages)
            .map(|id| {
                let start = base + id * config.page_size;
                Arc::new(Page::new(id, start, start + config.page_size, threshold))
            })
            .collect();

        let free = SegQueue::new();
        for page in &pages {
            free.push(Arc::clone(page));
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            total_pages = config.total_pages,
            page_size = config.page_size,
            total_bytes,
            "paged heap initialized"
        );

        Arc::new(Self {
            config,
            region_base: base,
            region_end: base + total_bytes,
            _region: region,
            pages,
            free,
            full_pages: Mutex::new(Vec::new()),
            full_non_relocatable: Mutex::new(Vec::new()),
            mark_value: MarkValue::new(),
            bytes_since_collection: AtomicUsize::new(0),
            remembered_roots: SegQueue::new(),
            non_relocatable_promotions: AtomicUsize::new(0),
            safepoints: SafepointCoordinator::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn page(&self, id: PageId) -> &Arc<Page> {
        &self.pages[id]
    }

    #[must_use]
    pub fn pages(&self) -> &[Arc<Page>] {
        &self.pages
    }

    /// Hand a fresh, empty page to a mutator or collector thread.
    ///
    /// Fatal if the free pool is exhausted: §7 classifies `HeapExhausted`
    /// as unrecoverable, since there is no mechanism in this design to
    /// grow the backing region after startup. Callers are expected to
    /// have already forced a collection cycle if one might free pages.
    pub fn request_page(&self) -> Arc<Page> {
        self.free.pop().unwrap_or_else(|| {
            FatalError::HeapExhausted {
                total_pages: self.pages.len(),
                live_bytes: self.total_used_bytes(),
            }
            .report_and_abort()
        })
    }

    /// Bytes currently allocated across every page this heap owns. The
    /// live-bytes figure reported by a `HeapExhausted` diagnostic: it is
    /// `used()`, not `amount_live()`, since exhaustion can happen before
    /// any mark phase has run and `used()` is always current while
    /// `amount_live` is only refreshed once per cycle.
    #[must_use]
    pub fn total_used_bytes(&self) -> usize {
        self.pages.iter().map(|p| p.used()).sum()
    }

    /// Try to hand out a page without aborting on exhaustion, so the
    /// collector can attempt a cycle first.
    #[must_use]
    pub fn try_request_page(&self) -> Option<Arc<Page>> {
        self.free.pop()
    }

    /// Return an emptied page to the free pool.
    pub fn relinquish_page(&self, page: Arc<Page>) {
        page.clear();
        self.free.push(page);
    }

    /// Hand a full, still-live page to the heap as a relocation
    /// candidate for the next cycle, without clearing its contents.
    pub fn retire_full_page(&self, page: Arc<Page>) {
        self.full_pages.lock().push(page);
    }

    /// Drain every page currently awaiting victim selection. Called once
    /// per cycle by the collector; pages not chosen as victims are
    /// pushed back via `retire_full_page`.
    #[must_use]
    pub fn drain_full_pages(&self) -> Vec<Arc<Page>> {
        std::mem::take(&mut *self.full_pages.lock())
    }

    /// Record a full page that must not be relocated (its liveness was
    /// above the threshold, or it holds objects pinned for other
    /// reasons) so future cycles skip it as a relocation candidate but
    /// still scan it for marking.
    pub fn add_full_non_relocatable(&self, page: Arc<Page>) {
        self.full_non_relocatable.lock().push(page);
        self.non_relocatable_promotions
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Drain the count of pages promoted to the non-relocatable pool
    /// since the last call. Called once per cycle by the collector to
    /// populate that cycle's [`crate::metrics::GcMetrics`].
    pub fn take_non_relocatable_promotions(&self) -> usize {
        self.non_relocatable_promotions.swap(0, Ordering::AcqRel)
    }

    /// Record `addr` as a potential root for the in-flight mark epoch.
    /// Called from [`crate::barrier::write_barrier`] for every non-null
    /// store; harmless to call outside a cycle; the next cycle's mark
    /// phase just treats it as an extra conservative root.
    pub fn remember_root(&self, addr: usize) {
        if addr != 0 {
            self.remembered_roots.push(addr);
        }
    }

    /// Drain every remembered root accumulated since the last call. The
    /// mark phase seeds its work queue with these alongside the
    /// embedder's own [`crate::gc::RootProvider::roots`].
    #[must_use]
    pub fn drain_remembered_roots(&self) -> Vec<usize> {
        let mut drained = Vec::new();
        while let Some(addr) = self.remembered_roots.pop() {
            drained.push(addr);
        }
        drained
    }

    /// Pages retained because they were too live to relocate profitably.
    /// Snapshot, not a live view: taken under the pool's lock and then
    /// released immediately.
    #[must_use]
    pub fn full_non_relocatable_pages(&self) -> Vec<Arc<Page>> {
        self.full_non_relocatable.lock().clone()
    }

    /// Remove a page from the non-relocatable pool (for example, once a
    /// later cycle finds it sparse enough to relocate after all).
    pub fn remove_full_non_relocatable(&self, id: PageId) -> Option<Arc<Page>> {
        let mut pool = self.full_non_relocatable.lock();
        let idx = pool.iter().position(|p| p.id() == id)?;
        Some(pool.remove(idx))
    }

    /// Find the page containing `addr`, if any. `O(1)`: every page is
    /// the same size and carved out of one contiguous region, so the
    /// index is a direct division rather than a search.
    #[must_use]
    pub fn page_containing(&self, addr: usize) -> Option<&Arc<Page>> {
        if addr < self.region_base || addr >= self.region_end {
            return None;
        }
        let idx = (addr - self.region_base) / self.config.page_size;
        self.pages.get(idx)
    }

    #[must_use]
    pub fn mark_value(&self) -> &MarkValue {
        &self.mark_value
    }

    pub fn record_allocation(&self, bytes: usize) {
        self.bytes_since_collection
            .fetch_add(bytes, Ordering::AcqRel);
    }

    /// Whether enough has been allocated since the last cycle to warrant
    /// requesting a new one, per `config.collection_trigger_bytes`.
    #[must_use]
    pub fn should_collect(&self) -> bool {
        self.bytes_since_collection.load(Ordering::Acquire) >= self.config.collection_trigger_bytes
    }

    pub fn reset_collection_trigger(&self) {
        self.bytes_since_collection.store(0, Ordering::Release);
    }

    #[must_use]
    pub fn safepoints(&self) -> &SafepointCoordinator {
        &self.safepoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_relinquish_round_trips_through_free_pool() {
        let heap = PagedHeap::new(HeapConfig::for_tests());
        let before = heap.free_pages();
        let page = heap.request_page();
        assert_eq!(heap.free_pages(), before - 1);
        page.allocate(64);
        heap.relinquish_page(page);
        assert_eq!(heap.free_pages(), before);
    }

    #[test]
    fn relinquished_page_is_cleared() {
        let heap = PagedHeap::new(HeapConfig::for_tests());
        let page = heap.request_page();
        page.allocate(64);
        page.add_amount_live(64);
        heap.relinquish_page(Arc::clone(&page));
        let reused = heap.request_page();
        assert_eq!(reused.used(), 0);
        assert_eq!(reused.amount_live(), 0);
    }

    #[test]
    fn non_relocatable_pool_tracks_pages_added_to_it() {
        let heap = PagedHeap::new(HeapConfig::for_tests());
        let page = heap.request_page();
        let id = page.id();
        heap.add_full_non_relocatable(page);
        assert_eq!(heap.full_non_relocatable_pages().len(), 1);
        let removed = heap.remove_full_non_relocatable(id);
        assert!(removed.is_some());
        assert!(heap.full_non_relocatable_pages().is_empty());
    }

    #[test]
    fn remembered_roots_drain_once() {
        let heap = PagedHeap::new(HeapConfig::for_tests());
        heap.remember_root(0); // ignored
        heap.remember_root(0x1000);
        heap.remember_root(0x2000);
        let drained = heap.drain_remembered_roots();
        assert_eq!(drained.len(), 2);
        assert!(heap.drain_remembered_roots().is_empty());
    }

    #[test]
    fn exhaustion_reports_live_bytes() {
        let heap = PagedHeap::new(HeapConfig::for_tests());
        let page = heap.request_page();
        page.allocate(64);
        assert_eq!(heap.total_used_bytes(), 64);
    }

    #[test]
    fn collection_trigger_fires_after_enough_allocation() {
        let heap = PagedHeap::new(HeapConfig::for_tests());
        assert!(!heap.should_collect());
        heap.record_allocation(heap.config().collection_trigger_bytes);
        assert!(heap.should_collect());
        heap.reset_collection_trigger();
        assert!(!heap.should_collect());
    }
}
