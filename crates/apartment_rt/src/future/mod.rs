// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The composable future/promise graph: the core async state machine. A [`Future<T>`] is a
//! cheaply-cloneable handle to a node that starts empty and transitions to a value or an
//! [`AsyncError`] exactly once; pipe combinators (`then`, `trap`, `transform`, the `flat_*`
//! variants, and the `on_*` observers) build new futures wired to feed from existing ones.

mod aggregate;
mod node;
mod promise;

pub use aggregate::{all, all_completed, any};
pub use promise::Promise;

use std::sync::Arc;
use std::time::Duration;

use node::Node;

use crate::apartment::Apartment;
use crate::context::{AsyncContext, INLINE_PRIORITY};
use crate::result::{AsyncError, AsyncResult, ErrorCode};

/// The outcome of a pipe body: either an immediate result, or another future whose completion
/// this pipe should adopt (the `flat_*` combinators).
enum Branch<R: Clone + Send + 'static> {
    Ready(AsyncResult<R>),
    Flatten(Future<R>),
}

/// A handle to a node in the future graph. See the module docs.
pub struct Future<T: Clone + Send + 'static> {
    inner: Arc<Node<T>>,
}

impl<T: Clone + Send + 'static> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Future").field(&self.inner).finish()
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// An already-completed future carrying `value`.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        Self {
            inner: Node::completed(Ok(value), None),
        }
    }

    /// An already-completed future carrying `error`.
    #[must_use]
    pub fn rejected(error: AsyncError) -> Self {
        Self {
            inner: Node::completed(Err(error), None),
        }
    }

    /// An immediate future wrapping an already-computed result, used internally by pipe
    /// combinators to avoid allocating a promise when a value is already on hand. An alias for
    /// the constructor pair above, taken from a single `AsyncResult`.
    #[must_use]
    pub fn dx(result: AsyncResult<T>) -> Self {
        Self {
            inner: Node::completed(result, None),
        }
    }

    /// Posts `body` to run on `apartment` (or run synchronously if `context`'s priority is
    /// [`INLINE_PRIORITY`] and `apartment` is the current thread's apartment).
    pub fn post(
        apartment: Apartment,
        context: AsyncContext,
        body: impl FnOnce() -> AsyncResult<T> + Send + 'static,
    ) -> Self {
        if context.priority() >= INLINE_PRIORITY && apartment.is_current() {
            return Self::dx(run_with_context(&context, body));
        }

        let node = Node::pending();
        let future = Self {
            inner: Arc::clone(&node),
        };
        let apartment_for_job = apartment.clone();
        let id = apartment.schedule(
            context.priority(),
            Box::new(move || {
                let result = run_with_context(&context, body);
                node.complete(result, Some(apartment_for_job));
            }),
        );
        if id == 0 {
            future
                .inner
                .complete(Err(AsyncError::new(ErrorCode::Terminated)), None);
        }
        future
    }

    /// Like [`Self::post`], but `body` does not run until `delay` has elapsed. A zero delay is
    /// equivalent to `post`.
    pub fn post_delayed(
        apartment: Apartment,
        context: AsyncContext,
        delay: Duration,
        body: impl FnOnce() -> AsyncResult<T> + Send + 'static,
    ) -> Self {
        if delay.is_zero() {
            return Self::post(apartment, context, body);
        }

        let node = Node::pending();
        let future = Self {
            inner: Arc::clone(&node),
        };
        let weak = Arc::downgrade(&node);
        let apartment_for_job = apartment.clone();
        let id = apartment.schedule_delayed(
            context.priority(),
            delay,
            Box::new(move || {
                let Some(node) = weak.upgrade() else {
                    return;
                };
                if let Some(cancel) = node.cancel_request() {
                    node.complete(Err(cancel.error), None);
                    return;
                }
                let result = run_with_context(&context, body);
                node.complete(result, Some(apartment_for_job));
            }),
        );
        if id == 0 {
            future
                .inner
                .complete(Err(AsyncError::new(ErrorCode::Terminated)), None);
        }
        future
    }

    /// Reads the result without blocking, if this future has already completed.
    #[must_use]
    pub fn peek_result(&self) -> Option<AsyncResult<T>> {
        self.inner.peek()
    }

    /// Blocks the calling thread until this future completes, returning its result.
    ///
    /// If the calling thread is running inside a single-thread apartment, that apartment's own
    /// queue is drained inline while waiting, so a task can safely wait on a future scheduled on
    /// its own apartment without deadlocking.
    #[must_use]
    pub fn wait(&self) -> AsyncResult<T> {
        self.inner.wait_blocking()
    }

    /// Requests cooperative cancellation of this future. Has no effect on an already-completed
    /// future. If `backtrack` is set, the request also propagates to this future's upstream(s),
    /// recursively.
    pub fn try_cancel(&self, backtrack: bool) {
        self.inner
            .request_cancel(AsyncError::new(ErrorCode::Cancelled), backtrack);
    }

    /// Schedules a cooperative cancel of this future after `duration`, using `timeout_apartment`
    /// to host the delayed cancel job. The pending delayed cancel is proactively removed if this
    /// future completes first. Returns `self` for chaining.
    #[must_use]
    pub fn set_timeout(self, timeout_apartment: Apartment, duration: Duration, backtrack: bool) -> Self {
        let weak = Arc::downgrade(&self.inner);
        let id = timeout_apartment.schedule_delayed(
            0,
            duration,
            Box::new(move || {
                if let Some(node) = weak.upgrade() {
                    node.request_cancel(AsyncError::new(ErrorCode::Timeout), backtrack);
                }
            }),
        );
        if id != 0 {
            let cleanup_apartment = timeout_apartment;
            self.inner.register_downstream(Box::new(move |_result, _prefer| {
                cleanup_apartment.try_unschedule(id);
            }));
        }
        self
    }

    fn pipe<R: Clone + Send + 'static>(
        &self,
        apartment: Option<Apartment>,
        context: AsyncContext,
        cancellable: bool,
        body: impl FnOnce(AsyncResult<T>) -> Branch<R> + Send + 'static,
    ) -> Future<R> {
        let new_node = Node::<R>::pending();
        let new_future = Future {
            inner: Arc::clone(&new_node),
        };

        let upstream_node = Arc::clone(&self.inner);
        new_node.set_upstream_cancel(Arc::new(move |error, backtrack| {
            upstream_node.request_cancel(error, backtrack);
        }));

        let feed_node = Arc::clone(&new_node);
        self.inner.register_downstream(Box::new(move |incoming, incoming_prefer| {
            run_pipe_feed(feed_node, apartment, context, cancellable, incoming, incoming_prefer, body);
        }));

        new_future
    }

    /// Runs `f` on the resolved value and completes with its result; forwards an upstream error
    /// unchanged.
    pub fn then<R: Clone + Send + 'static>(
        &self,
        apartment: Option<Apartment>,
        context: AsyncContext,
        f: impl FnOnce(T) -> AsyncResult<R> + Send + 'static,
    ) -> Future<R> {
        self.pipe(apartment, context, true, move |incoming| match incoming {
            Ok(value) => Branch::Ready(f(value)),
            Err(error) => Branch::Ready(Err(error)),
        })
    }

    /// Runs `f` on an upstream error and completes with its result; forwards an upstream value
    /// unchanged.
    pub fn trap(
        &self,
        apartment: Option<Apartment>,
        context: AsyncContext,
        f: impl FnOnce(AsyncError) -> AsyncResult<T> + Send + 'static,
    ) -> Future<T> {
        self.pipe(apartment, context, true, move |incoming| match incoming {
            Ok(value) => Branch::Ready(Ok(value)),
            Err(error) => Branch::Ready(f(error)),
        })
    }

    /// Runs `f` on the full result, value or error alike, and completes with its result.
    pub fn transform<R: Clone + Send + 'static>(
        &self,
        apartment: Option<Apartment>,
        context: AsyncContext,
        f: impl FnOnce(AsyncResult<T>) -> AsyncResult<R> + Send + 'static,
    ) -> Future<R> {
        self.pipe(apartment, context, true, move |incoming| Branch::Ready(f(incoming)))
    }

    /// Like [`Self::then`], but `f` returns another future whose completion this one adopts.
    pub fn flat_then<R: Clone + Send + 'static>(
        &self,
        apartment: Option<Apartment>,
        context: AsyncContext,
        f: impl FnOnce(T) -> Future<R> + Send + 'static,
    ) -> Future<R> {
        self.pipe(apartment, context, true, move |incoming| match incoming {
            Ok(value) => Branch::Flatten(f(value)),
            Err(error) => Branch::Ready(Err(error)),
        })
    }

    /// Like [`Self::trap`], but `f` returns another future whose completion this one adopts.
    pub fn flat_trap(
        &self,
        apartment: Option<Apartment>,
        context: AsyncContext,
        f: impl FnOnce(AsyncError) -> Future<T> + Send + 'static,
    ) -> Future<T> {
        self.pipe(apartment, context, true, move |incoming| match incoming {
            Ok(value) => Branch::Ready(Ok(value)),
            Err(error) => Branch::Flatten(f(error)),
        })
    }

    /// Like [`Self::transform`], but `f` returns another future whose completion this one adopts.
    pub fn flat_transform<R: Clone + Send + 'static>(
        &self,
        apartment: Option<Apartment>,
        context: AsyncContext,
        f: impl FnOnce(AsyncResult<T>) -> Future<R> + Send + 'static,
    ) -> Future<R> {
        self.pipe(apartment, context, true, move |incoming| Branch::Flatten(f(incoming)))
    }

    /// Runs `f` on a successful result as a side effect, without changing the result. Does not
    /// synthesize cancellation on its own (non-cancellable), though an explicit `backtrack`
    /// request still propagates through it.
    pub fn on_success(
        &self,
        apartment: Option<Apartment>,
        context: AsyncContext,
        f: impl FnOnce(&T) + Send + 'static,
    ) -> Future<T> {
        self.pipe(apartment, context, false, move |incoming| {
            if let Ok(value) = &incoming {
                f(value);
            }
            Branch::Ready(incoming)
        })
    }

    /// Runs `f` on a failed result as a side effect, without changing the result.
    pub fn on_failure(
        &self,
        apartment: Option<Apartment>,
        context: AsyncContext,
        f: impl FnOnce(&AsyncError) + Send + 'static,
    ) -> Future<T> {
        self.pipe(apartment, context, false, move |incoming| {
            if let Err(error) = &incoming {
                f(error);
            }
            Branch::Ready(incoming)
        })
    }

    /// Runs `f` on the result, value or error alike, as a side effect, without changing it.
    pub fn on_completion(
        &self,
        apartment: Option<Apartment>,
        context: AsyncContext,
        f: impl FnOnce(&AsyncResult<T>) + Send + 'static,
    ) -> Future<T> {
        self.pipe(apartment, context, false, move |incoming| {
            f(&incoming);
            Branch::Ready(incoming)
        })
    }

    /// A pipe that forwards its upstream result unchanged. Observationally equal to `self` except
    /// for node identity and the apartment advised to further downstreams.
    #[must_use]
    pub fn noop(&self) -> Future<T> {
        self.pipe(None, AsyncContext::empty(), false, Branch::Ready)
    }

    /// Forwards this future's completion into an existing `promise`. Like [`Self::noop`], this is
    /// non-cancellable: `promise` always receives whatever `self` produces.
    pub fn forward(&self, promise: Promise<T>) {
        let node = promise.into_node();
        self.inner.register_downstream(Box::new(move |result, prefer| {
            node.complete(result, prefer);
        }));
    }

    /// Re-posts `body` on `apartment` until it returns an [`ErrorCode::Eof`] (success) or any
    /// other error (failure), used for poll-style retry loops.
    pub fn repeat(
        apartment: Apartment,
        context: AsyncContext,
        body: impl FnMut() -> AsyncResult<()> + Send + 'static,
    ) -> Future<()> {
        let shared: Arc<std::sync::Mutex<dyn FnMut() -> AsyncResult<()> + Send>> =
            Arc::new(std::sync::Mutex::new(body));
        repeat_step(apartment, context, shared)
    }
}

fn repeat_step(
    apartment: Apartment,
    context: AsyncContext,
    body: Arc<std::sync::Mutex<dyn FnMut() -> AsyncResult<()> + Send>>,
) -> Future<()> {
    let body_for_post = Arc::clone(&body);
    let apartment_for_transform = apartment.clone();
    let context_for_transform = context.clone();

    Future::post(apartment.clone(), context.clone(), move || {
        let mut guard = body_for_post
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        (guard)()
    })
    .flat_transform(Some(apartment), context, move |result| match result {
        Ok(()) => repeat_step(
            apartment_for_transform.clone(),
            context_for_transform.clone(),
            Arc::clone(&body),
        ),
        Err(error) if error.code() == ErrorCode::Eof => Future::resolved(()),
        Err(error) => Future::rejected(error),
    })
}

/// Runs `body` under the ownership/cancellation checks described by `context`: if the context's
/// owner chain has expired, the body never runs and a cancelled result is produced instead.
fn run_with_context<T>(
    context: &AsyncContext,
    body: impl FnOnce() -> AsyncResult<T>,
) -> AsyncResult<T> {
    let Some(_locks) = context.lock_owner() else {
        return Err(AsyncError::new(ErrorCode::Cancelled));
    };

    context.enter_all_controllers();
    let result = body();
    context.leave_all_controllers();
    result
}

#[allow(clippy::too_many_arguments, reason = "internal dispatch helper, not public API")]
fn run_pipe_feed<T: Clone + Send + 'static, R: Clone + Send + 'static>(
    node: Arc<Node<R>>,
    apartment: Option<Apartment>,
    context: AsyncContext,
    cancellable: bool,
    incoming: AsyncResult<T>,
    incoming_prefer: Option<Apartment>,
    body: impl FnOnce(AsyncResult<T>) -> Branch<R> + Send + 'static,
) {
    if cancellable
        && let Some(cancel) = node.cancel_request()
    {
        let result = match incoming {
            Err(error) => Err(error),
            Ok(_) => Err(cancel.error),
        };
        node.complete(result, None);
        return;
    }

    let target = apartment
        .clone()
        .or(incoming_prefer)
        .or_else(crate::apartment::current)
        .unwrap_or_else(crate::apartment::default_mta);

    let run_inline = context.priority() >= INLINE_PRIORITY && target.is_current();

    let run = move || {
        let node = node;
        let target_for_complete = target;

        let Some(_locks) = context.lock_owner() else {
            node.complete(Err(AsyncError::new(ErrorCode::Cancelled)), None);
            return;
        };

        context.enter_all_controllers();
        let branch = body(incoming);
        context.leave_all_controllers();

        match branch {
            Branch::Ready(result) => node.complete(result, Some(target_for_complete)),
            Branch::Flatten(inner) => {
                let node_for_inner = Arc::clone(&node);
                inner.inner.register_downstream(Box::new(move |result, prefer| {
                    node_for_inner.complete(result, prefer);
                }));
            }
        }
    };

    if run_inline {
        run();
    } else {
        let id = target.schedule(context.priority(), Box::new(run));
        if id == 0 {
            node.complete(Err(AsyncError::new(ErrorCode::Terminated)), None);
        }
    }
}
