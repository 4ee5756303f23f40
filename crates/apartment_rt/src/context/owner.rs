// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::{Arc, Weak};

/// An opaque "I am alive" lock obtained from a weak owner. Dropping it releases the lock.
///
/// Holding a `Locked` for the duration of a callback guarantees the owned object cannot be dropped
/// while the callback runs.
pub struct Locked {
    // Kept alive only to be dropped at the right time; the field itself is never read.
    _held: Box<dyn std::any::Any + Send>,
}

impl fmt::Debug for Locked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locked").finish_non_exhaustive()
    }
}

impl Locked {
    fn holding<T: Send + 'static>(value: Arc<T>) -> Self {
        Self {
            _held: Box::new(value),
        }
    }

    /// A sentinel lock for owners that require no locking (strong and none owners).
    #[must_use]
    pub fn no_lock_needed() -> Self {
        Self {
            _held: Box::new(()),
        }
    }
}

/// The object lifetime an [`crate::context::AsyncContext`] binds a callback to.
#[derive(Clone)]
pub enum Owner {
    /// No object lifetime is bound; the callback always runs.
    None,

    /// The callback keeps this object alive for its duration.
    Strong(Arc<dyn std::any::Any + Send + Sync>),

    /// The callback must upgrade this weak reference before running; if the upgrade fails, the
    /// callback is skipped as if cancelled.
    Weak(Arc<dyn WeakOwner>),
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("Owner::None"),
            Self::Strong(_) => f.write_str("Owner::Strong(..)"),
            Self::Weak(_) => f.write_str("Owner::Weak(..)"),
        }
    }
}

impl Default for Owner {
    fn default() -> Self {
        Self::None
    }
}

/// Implemented by weak-owner adapters so [`Owner::Weak`] can check expiry and acquire a lock
/// without knowing the concrete pointee type.
pub trait WeakOwner: Send + Sync {
    /// Returns `true` if the owned object has already been dropped.
    fn check_expired(&self) -> bool;

    /// Attempts to upgrade to a strong reference, returning a lock that keeps the object alive
    /// until dropped. Returns `None` if the object has expired.
    fn try_lock(&self) -> Option<Locked>;
}

struct WeakOwnerAdapter<T> {
    inner: Weak<T>,
}

impl<T: Send + Sync + 'static> WeakOwner for WeakOwnerAdapter<T> {
    fn check_expired(&self) -> bool {
        self.inner.strong_count() == 0
    }

    fn try_lock(&self) -> Option<Locked> {
        self.inner.upgrade().map(Locked::holding)
    }
}

impl Owner {
    /// Binds a strong owner: the returned owner keeps `value` alive for as long as any context
    /// derived from it is alive.
    pub fn strong<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self::Strong(value)
    }

    /// Binds a weak owner: callbacks must upgrade `value` before running.
    pub fn weak<T: Send + Sync + 'static>(value: &Arc<T>) -> Self {
        Self::Weak(Arc::new(WeakOwnerAdapter {
            inner: Arc::downgrade(value),
        }))
    }

    /// `true` if this owner's object has expired. Strong and none owners never expire.
    #[must_use]
    pub fn check_expired(&self) -> bool {
        match self {
            Self::None | Self::Strong(_) => false,
            Self::Weak(weak) => weak.check_expired(),
        }
    }

    /// Acquires a lock keeping the owned object alive, or `None` if a weak owner has expired.
    #[must_use]
    pub fn try_lock(&self) -> Option<Locked> {
        match self {
            Self::None => Some(Locked::no_lock_needed()),
            Self::Strong(value) => Some(Locked::holding(Arc::clone(value))),
            Self::Weak(weak) => weak.try_lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_owner_never_expires_and_always_locks() {
        let owner = Owner::None;
        assert!(!owner.check_expired());
        assert!(owner.try_lock().is_some());
    }

    #[test]
    fn strong_owner_never_expires() {
        let value = Arc::new(42);
        let owner = Owner::strong(value);
        assert!(!owner.check_expired());
        assert!(owner.try_lock().is_some());
    }

    #[test]
    fn weak_owner_expires_after_drop() {
        let value = Arc::new(42);
        let owner = Owner::weak(&value);
        assert!(!owner.check_expired());
        assert!(owner.try_lock().is_some());

        drop(value);

        assert!(owner.check_expired());
        assert!(owner.try_lock().is_none());
    }
}
