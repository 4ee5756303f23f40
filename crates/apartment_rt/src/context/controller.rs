// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Shared cancellation state for an [`crate::context::AsyncContext`] subtree: a cancel-all flag and
/// a latch counting callbacks currently bound to this controller (directly, or through a
/// descendant context).
///
/// A controller is typically created once per logical operation (e.g. one per flow run, or one per
/// user request) and shared by every context derived from it, so a single call to
/// [`CancellationController::cancel_all`] reaches every callback in that operation.
#[derive(Debug)]
pub struct CancellationController {
    cancelled: AtomicBool,
    pending: AtomicUsize,
    idle: Condvar,
    idle_lock: Mutex<()>,
}

impl CancellationController {
    /// Creates a fresh, not-yet-cancelled controller with no pending callbacks.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            idle: Condvar::new(),
            idle_lock: Mutex::new(()),
        })
    }

    /// Requests cancellation of every callback bound (directly or via a descendant context) to
    /// this controller. This is cooperative: already-running bodies do not observe the request
    /// until their next natural synchronization point.
    pub fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// `true` if [`Self::cancel_all`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Increments the pending-callback latch. Call before running a callback bound to this
    /// controller.
    pub(crate) fn enter(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the pending-callback latch and wakes any thread blocked in
    /// [`Self::wait_for_quiescence`]. Call after a callback bound to this controller returns.
    pub(crate) fn leave(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            let _guard = self.idle_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            self.idle.notify_all();
        }
    }

    /// Blocks the calling thread until no callback bound to this controller is in flight.
    pub fn wait_for_quiescence(&self) {
        let mut guard = self.idle_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while self.pending.load(Ordering::SeqCst) > 0 {
            guard = self
                .idle
                .wait_timeout(guard, Duration::from_millis(50))
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_controller_is_not_cancelled() {
        let controller = CancellationController::new();
        assert!(!controller.is_cancelled());
    }

    #[test]
    fn cancel_all_is_observed() {
        let controller = CancellationController::new();
        controller.cancel_all();
        assert!(controller.is_cancelled());
    }

    #[test]
    fn quiescence_returns_immediately_with_no_pending_work() {
        let controller = CancellationController::new();
        controller.wait_for_quiescence();
    }

    #[test]
    fn quiescence_waits_for_enter_leave_balance() {
        let controller = CancellationController::new();
        controller.enter();
        controller.enter();
        controller.leave();

        let controller_clone = Arc::clone(&controller);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            controller_clone.leave();
        });

        controller.wait_for_quiescence();
        handle.join().unwrap();
    }
}
