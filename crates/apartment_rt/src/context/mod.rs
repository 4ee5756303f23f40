// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ambient metadata - ownership, cancellation, priority, and a parent chain - that travels with
//! every callback scheduled through an apartment.

mod controller;
mod owner;

pub use controller::CancellationController;
pub use owner::{Locked, Owner, WeakOwner};

use std::sync::Arc;

/// Priority value reserved to mean "run inline/synchronously if at all possible", rather than
/// hopping through an apartment's queue.
pub const INLINE_PRIORITY: i32 = 0x1_0000;

#[derive(Debug, Default, Clone)]
struct Inner {
    owner: Owner,
    controller: Option<Arc<CancellationController>>,
    parent: Option<AsyncContext>,
    priority: i32,
}

/// An immutable, cheaply-cloneable record of the ambient state a callback runs under: who keeps it
/// alive, how it is cancelled, how urgently it should run, and the chain of contexts it was derived
/// from.
///
/// Contexts form a parent chain: [`Self::check_cancel_all`], [`Self::check_owner_expired`], and
/// [`Self::lock_owner`] all walk the whole chain, so a context derived from a cancelled parent is
/// itself considered cancelled even if it has no controller of its own.
#[derive(Debug, Clone)]
pub struct AsyncContext {
    inner: Arc<Inner>,
}

impl Default for AsyncContext {
    fn default() -> Self {
        Self::empty()
    }
}

impl AsyncContext {
    /// The empty context: no owner, no controller, priority 0, no parent. Every other context is
    /// built from this one via the builder methods below.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
        }
    }

    fn derive(&self, f: impl FnOnce(&mut Inner)) -> Self {
        let mut inner = (*self.inner).clone();
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Returns a context identical to this one but bound to `owner`.
    #[must_use]
    pub fn bind_owner(&self, owner: Owner) -> Self {
        self.derive(|inner| inner.owner = owner)
    }

    /// Returns a context identical to this one but reporting cancellation through `controller`.
    #[must_use]
    pub fn bind_controller(&self, controller: Arc<CancellationController>) -> Self {
        self.derive(|inner| inner.controller = Some(controller))
    }

    /// Returns a context identical to this one but chained from `parent`: cancellation and
    /// expiration checks recurse into `parent` as well.
    #[must_use]
    pub fn bind_parent(&self, parent: Self) -> Self {
        self.derive(|inner| inner.parent = Some(parent))
    }

    /// Returns a context identical to this one but with `priority` set. [`INLINE_PRIORITY`] asks
    /// the scheduler to prefer running synchronously over hopping through an apartment queue.
    #[must_use]
    pub fn set_priority(&self, priority: i32) -> Self {
        self.derive(|inner| inner.priority = priority)
    }

    /// This context's own priority (does not consult the parent chain).
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.inner.priority
    }

    /// `true` if this context's own owner has expired. Does not consult the parent chain; use
    /// [`Self::check_owner_expired`] for the recursive check.
    #[must_use]
    fn owner_expired_here(&self) -> bool {
        self.inner.owner.check_expired()
    }

    /// `true` if this context's own controller has been cancelled. Does not consult the parent
    /// chain; use [`Self::check_cancel_all`] for the recursive check.
    #[must_use]
    fn cancelled_here(&self) -> bool {
        self.inner
            .controller
            .as_ref()
            .is_some_and(|controller| controller.is_cancelled())
    }

    /// `true` if this context's owner, or any ancestor's owner, has expired.
    #[must_use]
    pub fn check_owner_expired(&self) -> bool {
        self.owner_expired_here()
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(Self::check_owner_expired)
    }

    /// `true` if this context's controller, or any ancestor's controller, has been cancelled.
    #[must_use]
    pub fn check_cancel_all(&self) -> bool {
        self.cancelled_here()
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(Self::check_cancel_all)
    }

    /// `true` if this context should be treated as cancelled for any reason: explicit cancel-all,
    /// or an expired owner anywhere in the chain.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.check_cancel_all() || self.check_owner_expired()
    }

    /// Acquires a lock keeping every ancestor's owner (and this context's own owner) alive for the
    /// duration of a callback. Returns `None` if any owner in the chain has expired.
    ///
    /// The caller must keep the returned lock alive for as long as the callback runs.
    #[must_use]
    pub fn lock_owner(&self) -> Option<Vec<Locked>> {
        let mut locks = Vec::new();
        let mut current = Some(self);
        while let Some(ctx) = current {
            locks.push(ctx.inner.owner.try_lock()?);
            current = ctx.inner.parent.as_ref();
        }
        Some(locks)
    }

    /// Increments every controller in the chain's pending-callback latch. Call before running a
    /// callback bound to this context; pair with [`Self::leave_all_controllers`].
    pub(crate) fn enter_all_controllers(&self) {
        if let Some(controller) = &self.inner.controller {
            controller.enter();
        }
        if let Some(parent) = &self.inner.parent {
            parent.enter_all_controllers();
        }
    }

    /// Decrements every controller in the chain's pending-callback latch.
    pub(crate) fn leave_all_controllers(&self) {
        if let Some(controller) = &self.inner.controller {
            controller.leave();
        }
        if let Some(parent) = &self.inner.parent {
            parent.leave_all_controllers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn empty_context_is_never_cancelled() {
        let ctx = AsyncContext::empty();
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.priority(), 0);
    }

    #[test]
    fn cancel_is_recursive_through_parent_chain() {
        let controller = CancellationController::new();
        let root = AsyncContext::empty().bind_controller(Arc::clone(&controller));
        let child = AsyncContext::empty().bind_parent(root);

        assert!(!child.check_cancel_all());
        controller.cancel_all();
        assert!(child.check_cancel_all());
    }

    #[test]
    fn owner_expiry_is_recursive_through_parent_chain() {
        let object = Arc::new(());
        let root = AsyncContext::empty().bind_owner(Owner::weak(&object));
        let child = AsyncContext::empty().bind_parent(root);

        assert!(!child.check_owner_expired());
        drop(object);
        assert!(child.check_owner_expired());
    }

    #[test]
    fn lock_owner_fails_if_any_ancestor_expired() {
        let object = Arc::new(());
        let root = AsyncContext::empty().bind_owner(Owner::weak(&object));
        let child = AsyncContext::empty().bind_parent(root);

        assert!(child.lock_owner().is_some());
        drop(object);
        assert!(child.lock_owner().is_none());
    }

    #[test]
    fn inline_priority_constant_is_distinguishable_from_normal_range() {
        let ctx = AsyncContext::empty().set_priority(INLINE_PRIORITY);
        assert_eq!(ctx.priority(), INLINE_PRIORITY);
        assert!(ctx.priority() > i16::MAX as i32);
    }
}
