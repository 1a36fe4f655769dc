//! Collection metrics (§10.2), adapted from the teacher crate's
//! `metrics.rs`: a per-cycle snapshot plus a running total, recorded
//! after every [`crate::gc::Collector::collect`] call.

use std::time::Duration;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of what a single collection cycle did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcMetrics {
    pub duration: Duration,
    pub pages_scanned: usize,
    pub pages_relocated: usize,
    pub pages_retained: usize,
    /// Pages returned to the free pool this cycle. Always equal to
    /// `pages_relocated` in this design: a victim page is, by
    /// definition, the set of pages freed once relocation and the
    /// post-cycle handshake complete. Kept as its own field because it
    /// answers a different question ("how much free capacity did this
    /// cycle create") than `pages_relocated` ("how many pages did the
    /// collector evacuate").
    pub pages_freed: usize,
    /// Pages a mutator pinned into the non-relocatable pool this cycle
    /// (for example, a full pinned-allocation page rotated out in
    /// `MutatorContext::rotate_page`).
    pub pages_promoted_non_relocatable: usize,
    /// Dead bytes recovered by relocating victim pages: the gap between
    /// each victim's capacity and the live bytes found in it.
    pub bytes_reclaimed: usize,
    /// Live bytes found across every page scanned this cycle, whether
    /// the page was retained in place or relocated elsewhere.
    pub bytes_surviving: usize,
    pub objects_relocated: usize,
    /// Forwarding compare-exchange races lost this cycle, summed across
    /// every victim page's [`crate::page::Page::cas_losses`].
    pub cas_losses_observed: usize,
}

impl GcMetrics {
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            duration: Duration::ZERO,
            pages_scanned: 0,
            pages_relocated: 0,
            pages_retained: 0,
            pages_freed: 0,
            pages_promoted_non_relocatable: 0,
            bytes_reclaimed: 0,
            bytes_surviving: 0,
            objects_relocated: 0,
            cas_losses_observed: 0,
        }
    }
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::zero()
    }
}

/// Running totals across every cycle a [`crate::gc::Collector`] has run,
/// plus the most recent cycle's snapshot, retrievable independently of
/// whatever the caller of `collect` did with its own return value —
/// mirroring the teacher crate's `last_gc_metrics()` accessor, adapted
/// from its global thread-local to this crate's per-collector instance.
#[derive(Debug, Default)]
pub struct CumulativeMetrics {
    total_collections: AtomicU64,
    total_pages_relocated: AtomicU64,
    total_bytes_surviving: AtomicU64,
    total_bytes_reclaimed: AtomicU64,
    last: Mutex<GcMetrics>,
}

impl CumulativeMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, cycle: &GcMetrics) {
        self.total_collections.fetch_add(1, Ordering::Relaxed);
        self.total_pages_relocated
            .fetch_add(cycle.pages_relocated as u64, Ordering::Relaxed);
        self.total_bytes_surviving
            .fetch_add(cycle.bytes_surviving as u64, Ordering::Relaxed);
        self.total_bytes_reclaimed
            .fetch_add(cycle.bytes_reclaimed as u64, Ordering::Relaxed);
        *self.last.lock() = *cycle;

        #[cfg(feature = "tracing")]
        tracing::info!(
            pages_scanned = cycle.pages_scanned,
            pages_relocated = cycle.pages_relocated,
            pages_retained = cycle.pages_retained,
            pages_freed = cycle.pages_freed,
            pages_promoted_non_relocatable = cycle.pages_promoted_non_relocatable,
            bytes_reclaimed = cycle.bytes_reclaimed,
            bytes_surviving = cycle.bytes_surviving,
            objects_relocated = cycle.objects_relocated,
            cas_losses_observed = cycle.cas_losses_observed,
            duration_us = cycle.duration.as_micros() as u64,
            "collection cycle completed"
        );
    }

    #[must_use]
    pub fn total_collections(&self) -> u64 {
        self.total_collections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_pages_relocated(&self) -> u64 {
        self.total_pages_relocated.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_bytes_surviving(&self) -> u64 {
        self.total_bytes_surviving.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_bytes_reclaimed(&self) -> u64 {
        self.total_bytes_reclaimed.load(Ordering::Relaxed)
    }

    /// The most recent cycle's metrics, or `GcMetrics::zero()` if
    /// `record` has never been called.
    #[must_use]
    pub fn last_gc_metrics(&self) -> GcMetrics {
        *self.last.lock()
    }
}
