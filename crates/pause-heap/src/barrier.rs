//! Read and write barriers (§4.6).
//!
//! These are the only sanctioned way to load or store a [`GcPtr`] field.
//! Both route through a page's forwarding side array when the field
//! happens to point into a page currently being relocated, so neither a
//! mutator nor the collector can ever observe — or, worse, publish — a
//! stale address into a page that has since been reused.
//!
//! Grounded on SOM++'s `READBARRIER`/`WRITEBARRIER` macros
//! (`original_source/.../vmobjects/ObjectFormats.h`, used throughout
//! `VMThread.cpp` and friends), which perform exactly this
//! check-and-forward on every field access while a collection is
//! in-flight and are plain loads/stores otherwise.

use std::ptr::NonNull;

use crate::heap::PagedHeap;
use crate::object::GcPtr;
use crate::page::Page;

/// Read a heap-pointer field, forwarding through the owning page's side
/// array if that page is currently blocked for relocation.
///
/// `target_page` is the page the caller would clone a forwarded object
/// into: a mutator's own current allocation page, or a collector
/// worker's dedicated relocation target (§4.4).
#[must_use]
pub fn read_barrier(field: &GcPtr, heap: &PagedHeap, target_page: &Page) -> *mut u8 {
    let raw = field.raw_load();
    let Some(resolved) = forward_if_blocked(raw, heap, target_page) else {
        return raw;
    };
    field.raw_store(resolved.as_ptr());
    resolved.as_ptr()
}

/// Store a heap-pointer field, forwarding `value` first if it points
/// into a page currently being relocated, and recording the stored
/// address as a potential root for the in-flight mark epoch.
///
/// Forwarding on write as well as read closes the race where a mutator
/// publishes a fresh pointer into a field that the collector's mark
/// phase has already passed over: without it, a later reader could
/// still land on a blocked page the collector believes has been fully
/// evacuated. Recording the store closes a second, distinct race: the
/// stored object itself (not the field it's stored into) might be a
/// freshly-allocated object the mark phase hasn't reached yet. Without
/// remembering it here, it would stay invisible to the current cycle
/// and could be wiped if its own page later becomes a relocation
/// victim.
pub fn write_barrier(field: &GcPtr, value: *mut u8, heap: &PagedHeap, target_page: &Page) {
    let resolved = forward_if_blocked(value, heap, target_page)
        .map_or(value, |ptr| ptr.as_ptr());
    if !resolved.is_null() {
        heap.remember_root(resolved as usize);
    }
    field.raw_store(resolved);
}

fn forward_if_blocked(raw: *mut u8, heap: &PagedHeap, target_page: &Page) -> Option<NonNull<u8>> {
    let ptr = NonNull::new(raw)?;
    let page = heap.page_containing(ptr.as_ptr() as usize)?;
    if !page.is_blocked() {
        return None;
    }
    // SAFETY: `ptr` was read from a live `GcPtr` field, which the
    // `Trace` contract requires to name a live object; `page` is the
    // page computed from that same address.
    Some(unsafe { page.forward(ptr, target_page) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::object::{GcBox, Trace, Visitor};

    struct Leaf(u32);
    // SAFETY: no pointer fields.
    unsafe impl Trace for Leaf {
        fn trace(&self, _visitor: &mut dyn Visitor) {}
    }

    #[test]
    fn read_barrier_is_transparent_outside_relocation() {
        let heap = PagedHeap::new(HeapConfig::for_tests());
        let page = heap.request_page();
        let header = GcBox::<Leaf>::header_for(GcBox::<Leaf>::alloc_size(16), 0);
        let addr = page.allocate(GcBox::<Leaf>::alloc_size(16));
        // SAFETY: freshly allocated, large enough, correctly aligned.
        unsafe {
            addr.as_ptr()
                .cast::<GcBox<Leaf>>()
                .write(GcBox { header, value: Leaf(7) });
        }
        let field = GcPtr::new(addr.as_ptr());
        let target = heap.request_page();
        let observed = read_barrier(&field, &heap, &target);
        assert_eq!(observed, addr.as_ptr());
    }

    #[test]
    fn read_barrier_forwards_through_blocked_page() {
        let heap = PagedHeap::new(HeapConfig::for_tests());
        let victim = heap.request_page();
        let size = GcBox::<Leaf>::alloc_size(16);
        let header = GcBox::<Leaf>::header_for(size, 0);
        let addr = victim.allocate(size);
        // SAFETY: freshly allocated, large enough, correctly aligned.
        unsafe {
            addr.as_ptr()
                .cast::<GcBox<Leaf>>()
                .write(GcBox { header, value: Leaf(9) });
        }
        victim.block();

        let field = GcPtr::new(addr.as_ptr());
        let target = heap.request_page();
        let forwarded = read_barrier(&field, &heap, &target);
        assert_ne!(forwarded, addr.as_ptr());
        assert_eq!(field.raw_load(), forwarded);

        // A second read must see the same forwarded address, not clone
        // again.
        let forwarded_again = read_barrier(&field, &heap, &target);
        assert_eq!(forwarded_again, forwarded);
    }

    #[test]
    fn write_barrier_remembers_the_stored_address() {
        let heap = PagedHeap::new(HeapConfig::for_tests());
        let page = heap.request_page();
        let header = GcBox::<Leaf>::header_for(GcBox::<Leaf>::alloc_size(16), 0);
        let addr = page.allocate(GcBox::<Leaf>::alloc_size(16));
        // SAFETY: freshly allocated, large enough, correctly aligned.
        unsafe {
            addr.as_ptr()
                .cast::<GcBox<Leaf>>()
                .write(GcBox { header, value: Leaf(3) });
        }
        let field = GcPtr::new(std::ptr::null_mut());
        let target = heap.request_page();
        write_barrier(&field, addr.as_ptr(), &heap, &target);

        assert_eq!(field.raw_load(), addr.as_ptr());
        let remembered = heap.drain_remembered_roots();
        assert_eq!(remembered, vec![addr.as_ptr() as usize]);
    }

    #[test]
    fn write_barrier_ignores_a_null_store() {
        let heap = PagedHeap::new(HeapConfig::for_tests());
        let target = heap.request_page();
        let field = GcPtr::new(std::ptr::null_mut());
        write_barrier(&field, std::ptr::null_mut(), &heap, &target);
        assert!(heap.drain_remembered_roots().is_empty());
    }
}
