//! A lock-free, fixed-capacity work-stealing deque used to spread
//! mark-phase and relocation work across collector threads.
//!
//! This is a Chase-Lev deque, the same concept as the teacher crate's own
//! `gc/worklist.rs` reimplemented against a plain `Option<T>` buffer and
//! `AtomicIsize` ends rather than its `Cell<usize>`/`AtomicUsize`/
//! `MaybeUninit<T>` representation: the owning thread pushes and pops
//! from one end (`top`/bottom bump-style), while idle collector threads
//! steal from the other end. Fixed capacity (`N`) rather than a growable
//! ring buffer, matching the teacher's choice to avoid a resize path on
//! the hot mark loop.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicIsize, Ordering};

/// A single producer / multiple consumer work-stealing queue of `T`.
///
/// The owning thread calls [`push`]/[`pop`]; any thread may call
/// [`steal`]. `T: Copy` keeps the slot type plain `Cell`-friendly (the
/// collector stores raw heap addresses here, not owned values).
pub struct StealQueue<T: Copy, const N: usize> {
    buffer: UnsafeCell<[Option<T>; N]>,
    top: AtomicIsize,
    bottom: AtomicIsize,
}

/// Outcome of a steal attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Steal<T> {
    Empty,
    Success(T),
    /// Another thread won a concurrent steal/pop race; retry.
    Retry,
}

impl<T: Copy, const N: usize> StealQueue<T, N> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: UnsafeCell::new([None; N]),
            top: AtomicIsize::new(0),
            bottom: AtomicIsize::new(0),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let bottom = self.bottom.load(Ordering::Acquire);
        let top = self.top.load(Ordering::Acquire);
        (bottom - top).max(0) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    /// Push a value onto this thread's own end. Only the owning thread
    /// may call this.
    ///
    /// Returns `false` (and does not push) if the queue is at capacity;
    /// callers fall back to a shared overflow structure (see
    /// [`super::marker`]).
    pub fn push(&self, value: T) -> bool {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Acquire);
        if (bottom - top) as usize >= N {
            return false;
        }
        // SAFETY: only the owning thread writes to `buffer`, and only at
        // `bottom`, which is reserved to it by the Chase-Lev protocol.
        unsafe {
            (*self.buffer.get())[bottom as usize % N] = Some(value);
        }
        self.bottom.store(bottom + 1, Ordering::Release);
        true
    }

    /// Pop from this thread's own end. Only the owning thread may call
    /// this.
    pub fn pop(&self) -> Option<T> {
        let bottom = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(bottom, Ordering::SeqCst);
        let top = self.top.load(Ordering::SeqCst);

        if top > bottom {
            self.bottom.store(bottom + 1, Ordering::Relaxed);
            return None;
        }

        // SAFETY: `bottom` was reserved to the owning thread above, and
        // no stealer can have claimed this slot once `top > bottom`
        // fails to hold.
        let value = unsafe { (*self.buffer.get())[bottom as usize % N] };

        if top == bottom {
            let won = self
                .top
                .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(bottom + 1, Ordering::Relaxed);
            if !won {
                return None;
            }
        }

        value
    }

    /// Steal from the opposite end. Any thread may call this, including
    /// the owner (though the owner should prefer `pop`).
    pub fn steal(&self) -> Steal<T> {
        let top = self.top.load(Ordering::Acquire);
        let bottom = self.bottom.load(Ordering::Acquire);

        if top >= bottom {
            return Steal::Empty;
        }

        // SAFETY: `top < bottom` means this slot has been published by
        // the owner's `push` (Release store to `bottom`) and has not yet
        // been reclaimed; we only read it.
        let value = unsafe { (*self.buffer.get())[top as usize % N] };

        match self
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => value.map_or(Steal::Empty, Steal::Success),
            Err(_) => Steal::Retry,
        }
    }
}

impl<T: Copy, const N: usize> Default for StealQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the Chase-Lev protocol above is the entire point: `top` is
// written only via CAS and `bottom` only by the owning thread, so
// concurrent push/pop/steal from different threads is sound.
unsafe impl<T: Copy + Send, const N: usize> Send for StealQueue<T, N> {}
unsafe impl<T: Copy + Send, const N: usize> Sync for StealQueue<T, N> {}
