//! Victim selection and the relocation phase (§4.4).
//!
//! Grounded on SOM++'s `PauselessCollectorThread::RelocatePage` and
//! `PagedHeap::getPercentageLiveData`-driven victim selection
//! (`original_source/.../memory/pauseless/PauselessCollectorThread.cpp`):
//! after marking, every full page accumulated since the last cycle is
//! classified by how much of it survived; sparse pages are evacuated
//! eagerly by the collector (live objects are cloned and forwarded via
//! the same [`crate::page::Page::forward`] CAS protocol a mutator's read
//! barrier would use), dense pages are left in place and re-offered to
//! the next cycle.

use std::sync::Arc;

use crate::heap::PagedHeap;
use crate::object::ObjectHeader;
use crate::page::Page;

/// Outcome of classifying the pages accumulated since the previous
/// cycle.
pub struct VictimSelection {
    pub victims: Vec<Arc<Page>>,
    pub retained: Vec<Arc<Page>>,
}

/// Partition full pages into relocation victims and pages worth keeping
/// in place, using `liveness_threshold` as the cutoff. Must be called
/// after the mark phase has finished attributing `amount_live` to every
/// page (victim selection reads, but does not itself compute, page
/// liveness).
#[must_use]
pub fn select_victims(heap: &PagedHeap, liveness_threshold: f64) -> VictimSelection {
    let candidates = heap.drain_full_pages();
    let mut victims = Vec::new();
    let mut retained = Vec::new();
    for page in candidates {
        if page.percentage_live() < liveness_threshold {
            victims.push(page);
        } else {
            retained.push(page);
        }
    }
    VictimSelection { victims, retained }
}

/// Put pages the collector decided not to relocate this cycle back into
/// rotation for the next one.
pub fn requeue_retained(heap: &PagedHeap, retained: Vec<Arc<Page>>) {
    for page in retained {
        heap.retire_full_page(page);
    }
}

/// Result of evacuating one victim page: the (possibly rotated) target
/// page the collector should keep relocating into, and how many objects
/// this call actually forwarded.
pub struct RelocationOutcome {
    pub target: Arc<Page>,
    pub objects_relocated: usize,
}

/// Evacuate every live object out of `victim` into pages drawn from
/// `next_target`, which is called again whenever the current target
/// fills up. `victim` must already be blocked (its side array
/// installed) before this runs, and the page's `used()` bound must be
/// captured before blocking so this walk does not race a mutator still
/// bump-allocating into it (relinquished pages are never still being
/// allocated into, so this holds for any page reaching victim
/// selection).
pub fn relocate_victim(
    victim: &Page,
    mark_value: u8,
    mut target: Arc<Page>,
    mut next_target: impl FnMut(Arc<Page>) -> Arc<Page>,
) -> RelocationOutcome {
    let mut offset = victim.start();
    let limit = victim.start() + victim.used();
    let mut objects_relocated = 0;

    while offset < limit {
        // SAFETY: `offset` is within [page_start, page_start + used()),
        // which by construction holds only contiguous, fully-initialized
        // object headers written by `allocate`/`allocate_object`.
        let header = unsafe { &*(offset as *const ObjectHeader) };
        header.validate(victim.id(), offset - victim.start());
        let size = header.size();

        if header.gc_field() == mark_value {
            if target.is_full() {
                target = next_target(target);
            }
            // SAFETY: `offset` names a live, marked object on `victim`;
            // `target` is exclusively owned by this collector worker for
            // the duration of the relocation phase.
            unsafe {
                let addr = std::ptr::NonNull::new_unchecked(offset as *mut u8);
                let _ = victim.forward(addr, &target);
            }
            objects_relocated += 1;
        }

        offset += size;
    }

    RelocationOutcome { target, objects_relocated }
}
