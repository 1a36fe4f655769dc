//! A single fixed-size page: bump-pointer allocation plus the per-page
//! "side array" of forwarding slots used during relocation.
//!
//! Grounded directly on SOM++'s `Page` (`original_source/.../memory/Page.cpp`):
//! `pageStart`/`pageEnd`/`nextFreeObject`/`threshold`/`amountLiveData` map
//! onto the fields below one-for-one, and `Block`/`UnBlock`/`LookupNewAddress`
//! map onto [`Page::block`]/[`Page::unblock`]/[`Page::forward`].

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::config::ALIGNMENT;
use crate::error::FatalError;
use crate::object::clone_object;

/// Opaque identity for a page, stable for the page's lifetime in the heap
/// (pages are never moved or freed individually; only their contents are
/// reset between cycles).
pub type PageId = usize;

/// A forwarding slot in a page's side array.
///
/// Null means "not yet forwarded". Any other value is the new address of
/// the object that used to live at this slot's offset, per §4.4's
/// clone-and-forward protocol.
type ForwardSlot = AtomicPtr<u8>;

/// One fixed-size, contiguous slice of the heap's backing memory, plus its
/// allocation and relocation metadata.
pub struct Page {
    id: PageId,
    page_start: usize,
    page_end: usize,
    /// Bump pointer. Owned exclusively by whichever mutator or collector
    /// thread currently holds the page; readers outside that thread may
    /// only observe it after a hand-off (relinquish/request) has
    /// established happens-before through the heap's page pools.
    next_free: AtomicUsize,
    /// Fraction of the page, in bytes, past which the page is handed back
    /// to the heap as a full page instead of being bumped into further.
    threshold: usize,
    /// Bytes of this page's objects found live by the most recent mark
    /// phase. Updated with a plain atomic fetch-add from possibly many
    /// collector worker threads concurrently (see `Open Questions` in
    /// the design notes: this must not be the source project's
    /// non-atomic "mutex elided" increment).
    amount_live: AtomicUsize,
    /// Set while this page is a relocation victim: mutators must forward
    /// through the side array instead of assuming `next_free` is final.
    blocked: AtomicBool,
    /// Present iff `blocked`. Installed by `block()`, taken and dropped
    /// by `unblock()`. The `RwLock` only guards *installation*; the
    /// forwarding slots inside the installed array are individually
    /// atomic and require no lock to read or CAS.
    side_array: RwLock<Option<Box<[ForwardSlot]>>>,
    /// Count of `forward()` calls on this page that lost the
    /// compare-exchange race since the last `block()`. Surfaced in
    /// [`crate::metrics::GcMetrics::cas_losses_observed`].
    cas_losses: AtomicUsize,
}

impl Page {
    pub(crate) fn new(id: PageId, page_start: usize, page_end: usize, threshold: usize) -> Self {
        Self {
            id,
            page_start,
            page_end,
            next_free: AtomicUsize::new(page_start),
            threshold,
            amount_live: AtomicUsize::new(0),
            blocked: AtomicBool::new(false),
            side_array: RwLock::new(None),
            cas_losses: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> PageId {
        self.id
    }

    #[must_use]
    pub fn start(&self) -> usize {
        self.page_start
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.page_end
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.page_end - self.page_start
    }

    /// Bytes already handed out via `allocate`.
    #[must_use]
    pub fn used(&self) -> usize {
        self.next_free.load(Ordering::Acquire) - self.page_start
    }

    /// Whether the page has crossed its fill threshold and should be
    /// relinquished back to the heap.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.used() >= self.threshold
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// Bump-allocate `size` bytes (already rounded up by the caller to
    /// [`ALIGNMENT`]). Fatal if the page cannot satisfy the request: the
    /// allocator is expected to call `is_full`/request a fresh page
    /// before this would ever happen, per §7 (`PageOverflow` is a logic
    /// error, not a recoverable condition).
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        debug_assert_eq!(size % ALIGNMENT, 0, "allocation size must be pre-aligned");
        let start = self.next_free.fetch_add(size, Ordering::AcqRel);
        if start + size > self.page_end {
            FatalError::PageOverflow {
                page: self.id,
                requested: size,
                available: self.page_end.saturating_sub(start),
            }
            .report_and_abort();
        }
        // SAFETY: `start` lies within [page_start, page_end) by the check
        // above, and is non-null because `page_start` is a real mapped
        // address.
        unsafe { NonNull::new_unchecked(start as *mut u8) }
    }

    /// Undo the last `size` bytes of allocation. Used only to rewind a
    /// collector's own relocation target page after losing a forwarding
    /// race (§4.4, "rewind on CAS loss"). The caller must hold the page
    /// exclusively: no other thread may be allocating from it concurrently.
    pub(crate) fn rewind(&self, size: usize) {
        self.next_free.fetch_sub(size, Ordering::AcqRel);
    }

    /// Overwrite this page's entire backing region with a poison
    /// pattern (§4.4 phase 3 step 4). A diagnostic safety net, not a
    /// correctness requirement: any reader that bypassed the barrier and
    /// still holds a raw pointer into this page from before relocation
    /// sees obviously-wrong bytes instead of stale data or a
    /// silently-plausible reused allocation.
    fn poison(&self) {
        // SAFETY: the caller (`clear`/`unblock`) only runs once no
        // mutator can still be bump-allocating into or forwarding
        // through this page, so no concurrent reader can observe a
        // torn write.
        unsafe {
            std::ptr::write_bytes(self.page_start as *mut u8, 0xAA, self.capacity());
        }
    }

    /// Reset a page to empty, ready to be handed out again. Called when
    /// a page is freed back into the heap's free pool.
    pub(crate) fn clear(&self) {
        self.poison();
        self.next_free.store(self.page_start, Ordering::Release);
        self.amount_live.store(0, Ordering::Release);
        self.blocked.store(false, Ordering::Release);
        *self.side_array.write() = None;
    }

    /// Record that `bytes` of this page's contents survived the current
    /// mark phase. Safe to call from any number of collector threads
    /// concurrently; see the design notes on atomicity.
    pub fn add_amount_live(&self, bytes: usize) {
        self.amount_live.fetch_add(bytes, Ordering::AcqRel);
    }

    #[must_use]
    pub fn amount_live(&self) -> usize {
        self.amount_live.load(Ordering::Acquire)
    }

    /// Fraction of the page's capacity still holding live data, as used
    /// by victim selection (§4.4: pages below the liveness threshold are
    /// relocated, pages above it are retained in place).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percentage_live(&self) -> f64 {
        self.amount_live() as f64 / self.capacity() as f64
    }

    /// Install the side array and mark the page as a relocation victim.
    /// Must be called with no mutator still bump-allocating into the
    /// page (i.e. after it has been relinquished).
    pub(crate) fn block(&self) {
        let slots = self.capacity() / ALIGNMENT;
        let array = (0..slots)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        *self.side_array.write() = Some(array);
        self.cas_losses.store(0, Ordering::Release);
        self.blocked.store(true, Ordering::Release);
    }

    /// Drop the side array once every mutator has passed a safepoint
    /// after relocation completed, so stale forwarding lookups can never
    /// race with the page being reused for fresh allocations. Poisons
    /// the page's contents first (§4.4 phase 3 step 4), before the side
    /// array that let readers resolve a stale address is gone.
    pub(crate) fn unblock(&self) {
        self.poison();
        self.blocked.store(false, Ordering::Release);
        *self.side_array.write() = None;
    }

    /// Count of `forward()` calls on this page that lost the
    /// compare-exchange race since the last `block()`.
    #[must_use]
    pub fn cas_losses(&self) -> usize {
        self.cas_losses.load(Ordering::Acquire)
    }

    fn slot_index(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.page_start && addr < self.page_end);
        (addr - self.page_start) / ALIGNMENT
    }

    /// Look up or install the forwarding address for the object at `addr`
    /// within this (blocked) page, cloning it into `target_page` if no
    /// other thread has forwarded it yet.
    ///
    /// This is SOM++'s `LookupNewAddress`: every racing reader either
    /// wins the CAS and becomes the thread that cloned the object, or
    /// loses it and discovers the winner's address, rewinding its own
    /// speculative clone.
    ///
    /// # Safety
    ///
    /// `addr` must point at a live object inside this page.
    pub unsafe fn forward(&self, addr: NonNull<u8>, target_page: &Page) -> NonNull<u8> {
        let guard = self.side_array.read();
        let array = guard
            .as_ref()
            .expect("forward() called on a page with no installed side array");
        let idx = self.slot_index(addr.as_ptr() as usize);
        let slot = &array[idx];

        let existing = slot.load(Ordering::Acquire);
        if let Some(found) = NonNull::new(existing) {
            return found;
        }

        // SAFETY: caller guarantees `addr` is a live object in this page.
        let candidate = unsafe { clone_object(addr, target_page) };

        match slot.compare_exchange(
            std::ptr::null_mut(),
            candidate.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => candidate,
            Err(winner) => {
                // Lost the race: another thread forwarded this object
                // first. Rewind our speculative clone so the bytes we
                // just bump-allocated on `target_page` are reclaimed by
                // the next allocation there.
                self.cas_losses.fetch_add(1, Ordering::Relaxed);
                // SAFETY: `candidate` was the very last allocation made
                // on `target_page` by this thread and no one else can be
                // allocating into it concurrently during relocation.
                let size = unsafe { &*addr.as_ptr().cast::<crate::object::ObjectHeader>() }.size();
                target_page.rewind(size);
                // SAFETY: winner was published via a successful CAS by
                // another thread that itself produced it from
                // `clone_object`, so it is a valid, live object address.
                unsafe { NonNull::new_unchecked(winner) }
            }
        }
    }
}

// `Page` is `Send`/`Sync` automatically: every field is either a plain
// integer or an atomic (including the `RwLock`-guarded `AtomicPtr`
// side array), so no raw pointer ever appears unwrapped in its layout.

#[cfg(test)]
mod tests {
    use super::*;

    fn make_page(id: PageId, size: usize) -> (Vec<u8>, Page) {
        let mut backing = vec![0u8; size];
        let start = backing.as_mut_ptr() as usize;
        let page = Page::new(id, start, start + size, size * 9 / 10);
        (backing, page)
    }

    #[test]
    fn allocate_bumps_and_respects_threshold() {
        let (_backing, page) = make_page(0, 4096);
        assert!(!page.is_full());
        let a = page.allocate(64);
        let b = page.allocate(64);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 64);
        assert_eq!(page.used(), 128);
    }

    #[test]
    fn is_full_once_threshold_crossed() {
        let (_backing, page) = make_page(0, 256);
        page.allocate(250);
        assert!(page.is_full());
    }

    #[test]
    fn clear_resets_bump_pointer_and_liveness() {
        let (_backing, page) = make_page(0, 4096);
        page.allocate(128);
        page.add_amount_live(128);
        page.block();
        page.clear();
        assert_eq!(page.used(), 0);
        assert_eq!(page.amount_live(), 0);
        assert!(!page.is_blocked());
    }

    #[test]
    fn percentage_live_reflects_marked_bytes() {
        let (_backing, page) = make_page(0, 1000);
        page.add_amount_live(250);
        assert!((page.percentage_live() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn clear_poisons_the_backing_bytes() {
        let (backing, page) = make_page(0, 4096);
        page.allocate(128);
        page.clear();
        assert!(backing.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn unblock_poisons_before_dropping_the_side_array() {
        let (backing, page) = make_page(0, 4096);
        page.allocate(128);
        page.block();
        page.unblock();
        assert!(backing.iter().all(|&b| b == 0xAA));
        assert!(!page.is_blocked());
    }

    #[test]
    fn cas_losses_reset_on_block() {
        let (_backing, page) = make_page(0, 4096);
        page.block();
        assert_eq!(page.cas_losses(), 0);
    }
}
