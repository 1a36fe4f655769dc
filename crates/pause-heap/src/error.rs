//! Error handling policy (§7 / §10.4): `HeapExhausted`, `PageOverflow`, and
//! `InvalidObject` are all fatal — they indicate the embedder violated an
//! invariant the collector depends on for correctness, not a condition it
//! makes sense to recover from. `CASContention` is not an error at all; it
//! is handled inline by retry loops in [`crate::page::Page::forward`] and
//! never reaches this type.
//!
//! SOM++ reports the equivalent conditions with
//! `GetUniverse()->ErrorExit(...)` / `Quit(-1)`, tearing the process down
//! rather than unwinding back into interpreter code that assumes a live
//! heap. We keep that policy: a `FatalError` is logged and then aborts
//! the process, it is never returned to a caller to recover from.

use std::fmt;

/// A heap invariant violation severe enough that continuing to run would
/// mean operating on a heap the collector can no longer reason about.
#[derive(Debug)]
pub enum FatalError {
    /// No free page was available to satisfy a `request_page` call and
    /// no pages could be reclaimed by forcing a collection.
    HeapExhausted {
        /// Total pages configured for the heap.
        total_pages: usize,
        /// Bytes allocated across the heap at the moment exhaustion was
        /// detected (`PagedHeap::total_used_bytes`).
        live_bytes: usize,
    },
    /// A page's bump pointer was asked to allocate past `page_end`. This
    /// can only happen if a caller allocated without first checking
    /// `Page::is_full`, which is a caller bug, not a transient condition.
    PageOverflow {
        page: usize,
        requested: usize,
        available: usize,
    },
    /// An object header failed a sanity check (for example, a declared
    /// size of zero, or a class pointer of zero) while the collector was
    /// walking a page.
    InvalidObject {
        page: usize,
        offset: usize,
        reason: &'static str,
    },
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeapExhausted {
                total_pages,
                live_bytes,
            } => {
                write!(
                    f,
                    "heap exhausted: no page available among {total_pages} configured pages ({live_bytes} bytes live)"
                )
            }
            Self::PageOverflow {
                page,
                requested,
                available,
            } => write!(
                f,
                "page {page} overflow: requested {requested} bytes, only {available} available"
            ),
            Self::InvalidObject {
                page,
                offset,
                reason,
            } => write!(f, "invalid object at page {page} offset {offset}: {reason}"),
        }
    }
}

impl std::error::Error for FatalError {}

impl FatalError {
    /// Log this error at `error` level (when the `tracing` feature is
    /// enabled) and terminate the process.
    ///
    /// This never returns. The collector and allocator call it directly
    /// instead of propagating a `Result`, matching the "fatal errors
    /// abort, they are not exceptions user code can catch" policy.
    #[cold]
    pub fn report_and_abort(self) -> ! {
        #[cfg(feature = "tracing")]
        tracing::error!(error = %self, "fatal heap error, aborting process");
        #[cfg(not(feature = "tracing"))]
        eprintln!("fatal heap error, aborting process: {self}");
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_name_the_offending_page() {
        let err = FatalError::PageOverflow {
            page: 3,
            requested: 64,
            available: 16,
        };
        let msg = err.to_string();
        assert!(msg.contains("page 3"));
        assert!(msg.contains("64"));
    }

    #[test]
    fn heap_exhausted_message_names_pages_and_live_bytes() {
        let err = FatalError::HeapExhausted {
            total_pages: 8,
            live_bytes: 32768,
        };
        let msg = err.to_string();
        assert!(msg.contains('8'));
        assert!(msg.contains("32768"));
    }
}
