// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use super::Future;
use super::node::Node;
use crate::apartment::Apartment;
use crate::result::AsyncResult;

/// The write side of a future: created paired with a [`Future<T>`], completed at most once by
/// whoever holds the promise. Dropping a promise without completing it leaves its future pending
/// forever - callers that need a deadline should pair it with [`Future::set_timeout`].
pub struct Promise<T: Clone + Send + 'static> {
    node: Arc<Node<T>>,
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Creates a pending promise/future pair.
    #[must_use]
    pub fn create() -> (Self, Future<T>) {
        let node = Node::pending();
        let future = Future {
            inner: Arc::clone(&node),
        };
        (Self { node }, future)
    }

    /// Completes the paired future with `value`, advising `prefer` as the apartment downstream
    /// feeds should run on. A second call is a no-op.
    pub fn resolve(self, value: T, prefer: Option<Apartment>) {
        self.node.complete(Ok(value), prefer);
    }

    /// Completes the paired future with `error`. A second call is a no-op.
    pub fn reject(self, error: crate::result::AsyncError, prefer: Option<Apartment>) {
        self.node.complete(Err(error), prefer);
    }

    /// Completes the paired future with a full result, value or error alike.
    pub fn complete(self, result: AsyncResult<T>, prefer: Option<Apartment>) {
        self.node.complete(result, prefer);
    }

    pub(super) fn into_node(self) -> Arc<Node<T>> {
        self.node
    }
}
