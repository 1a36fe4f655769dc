//! Safepoints and handshakes (§5).
//!
//! Before a blocked page's side array can be dropped, every mutator must
//! be known to have passed a point after relocation finished — otherwise
//! a mutator could still be mid-way through a read barrier lookup on a
//! forwarding slot that is about to disappear. This module implements
//! that as an epoch handshake: the collector bumps a global epoch and
//! waits until every registered mutator has acknowledged an epoch at
//! least that new.
//!
//! Grounded on SOM++'s `Interpreter::isBlocked`/safepoint polling in
//! `VMThread.cpp` and the collector's wait loop in
//! `PauselessCollectorThread.cpp`; adapted here into an explicit,
//! independently testable epoch counter rather than inline polling
//! scattered through the interpreter loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Per-mutator handshake state, shared between the mutator thread and
/// the coordinator.
pub struct MutatorSlot {
    acked_epoch: AtomicU64,
}

impl MutatorSlot {
    #[must_use]
    pub fn acked_epoch(&self) -> u64 {
        self.acked_epoch.load(Ordering::Acquire)
    }
}

/// Tracks the current handshake epoch and every live mutator's
/// acknowledgement of it.
pub struct SafepointCoordinator {
    epoch: AtomicU64,
    mutators: Mutex<Vec<Arc<MutatorSlot>>>,
}

impl SafepointCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            mutators: Mutex::new(Vec::new()),
        }
    }

    /// Register a new mutator, acknowledging the current epoch
    /// immediately (a brand new mutator has, trivially, not missed any
    /// handshake that happened before it existed).
    #[must_use]
    pub fn register(&self) -> Arc<MutatorSlot> {
        let slot = Arc::new(MutatorSlot {
            acked_epoch: AtomicU64::new(self.epoch.load(Ordering::Acquire)),
        });
        self.mutators.lock().push(Arc::clone(&slot));
        slot
    }

    pub fn unregister(&self, slot: &Arc<MutatorSlot>) {
        let mut mutators = self.mutators.lock();
        if let Some(idx) = mutators.iter().position(|m| Arc::ptr_eq(m, slot)) {
            mutators.remove(idx);
        }
    }

    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.mutators.lock().len()
    }

    /// Called by a mutator at a safepoint-checked program point (the
    /// allocation slow path, loop back-edges, etc.) to acknowledge the
    /// current epoch.
    pub fn poll(&self, slot: &MutatorSlot) {
        let current = self.epoch.load(Ordering::Acquire);
        slot.acked_epoch.store(current, Ordering::Release);
    }

    /// Bump the epoch, requesting every mutator acknowledge a new one.
    /// Returns the new epoch to wait for.
    pub fn request_handshake(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Block the calling (collector) thread until every currently
    /// registered mutator has acknowledged at least `target_epoch`.
    ///
    /// Mutators that are blocked in native code or otherwise not polling
    /// would stall this forever; this design assumes every mutator loop
    /// polls frequently enough (as SOM++'s interpreter does on every
    /// bytecode dispatch) that this is a short spin, not a long parked
    /// wait.
    pub fn wait_for_handshake(&self, target_epoch: u64) {
        loop {
            let pending = self
                .mutators
                .lock()
                .iter()
                .any(|m| m.acked_epoch() < target_epoch);
            if !pending {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Same as `wait_for_handshake`, but gives up (returning `false`)
    /// after `timeout` instead of spinning forever. Intended for tests
    /// and health checks, not the collector's real handshake path.
    #[must_use]
    pub fn wait_for_handshake_timeout(&self, target_epoch: u64, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let pending = self
                .mutators
                .lock()
                .iter()
                .any(|m| m.acked_epoch() < target_epoch);
            if !pending {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
    }
}

impl Default for SafepointCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_completes_once_every_mutator_polls() {
        let coord = SafepointCoordinator::new();
        let a = coord.register();
        let b = coord.register();

        let target = coord.request_handshake();
        assert!(!coord.wait_for_handshake_timeout(target, Duration::from_millis(10)));

        coord.poll(&a);
        assert!(!coord.wait_for_handshake_timeout(target, Duration::from_millis(10)));

        coord.poll(&b);
        assert!(coord.wait_for_handshake_timeout(target, Duration::from_millis(10)));
    }

    #[test]
    fn unregistering_a_mutator_removes_it_from_the_wait() {
        let coord = SafepointCoordinator::new();
        let a = coord.register();
        let b = coord.register();
        let target = coord.request_handshake();
        coord.poll(&a);
        coord.unregister(&b);
        assert!(coord.wait_for_handshake_timeout(target, Duration::from_millis(10)));
    }

    #[test]
    fn freshly_registered_mutator_starts_caught_up() {
        let coord = SafepointCoordinator::new();
        coord.request_handshake();
        let fresh = coord.register();
        assert_eq!(fresh.acked_epoch(), 1);
    }
}
