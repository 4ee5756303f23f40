// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::apartment::{self, Apartment};
use crate::context::AsyncContext;
use crate::result::{AsyncError, AsyncResult, ErrorCode};

/// A feed callback registered by a downstream node: invoked exactly once with the completed result
/// and the apartment the completing node advises running on.
pub(crate) type DownstreamFeed<T> = Box<dyn FnOnce(AsyncResult<T>, Option<Apartment>) + Send>;

enum State<T> {
    Pending(Vec<DownstreamFeed<T>>),
    Completed {
        result: AsyncResult<T>,
        prefer: Option<Apartment>,
    },
}

/// A request to cancel a node, recorded but not acted upon until the node's next natural
/// synchronization point (see the crate's cancellation semantics).
#[derive(Clone)]
pub(crate) struct CancelRequest {
    pub error: AsyncError,
    pub backtrack: bool,
}

/// A single node in the future graph. Transitions from [`State::Pending`] to
/// [`State::Completed`] at most once; every other field is append-only (downstreams) or
/// write-once-observed-many (the cancel request) prior to that transition.
///
/// `T` must be [`Clone`] because a node may have multiple downstreams, each of which receives its
/// own copy of the completed result - unlike a single-consumer channel.
pub(crate) struct Node<T: Clone + Send + 'static> {
    state: Mutex<State<T>>,
    cond: Condvar,
    cancel: Mutex<Option<CancelRequest>>,
    upstream_cancel: Mutex<Option<Arc<dyn Fn(AsyncError, bool) + Send + Sync>>>,
}

impl<T: Clone + Send + 'static> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let is_completed = matches!(
            &*self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
            State::Completed { .. }
        );
        f.debug_struct("Node")
            .field("completed", &is_completed)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Node<T> {
    pub fn pending() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Pending(Vec::new())),
            cond: Condvar::new(),
            cancel: Mutex::new(None),
            upstream_cancel: Mutex::new(None),
        })
    }

    pub fn completed(result: AsyncResult<T>, prefer: Option<Apartment>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Completed { result, prefer }),
            cond: Condvar::new(),
            cancel: Mutex::new(None),
            upstream_cancel: Mutex::new(None),
        })
    }

    /// Records a function to call if this node is cancelled with `backtrack = true`, used to
    /// propagate cancellation from a pipe/aggregate node to its upstream(s).
    pub fn set_upstream_cancel(&self, f: Arc<dyn Fn(AsyncError, bool) + Send + Sync>) {
        *self
            .upstream_cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(f);
    }

    /// Completes the node exactly once. A second call is a no-op, per the "completes at most
    /// once" invariant - this is the mechanism by which a cancellation race with a normal
    /// completion resolves: whichever call wins, the loser is silently ignored.
    pub fn complete(self: &Arc<Self>, result: AsyncResult<T>, prefer: Option<Apartment>) {
        let downstreams = {
            let mut state = self.lock_state();
            match &*state {
                State::Completed { .. } => return,
                State::Pending(_) => {
                    let State::Pending(downstreams) =
                        std::mem::replace(&mut *state, State::Completed {
                            result: result.clone(),
                            prefer: prefer.clone(),
                        })
                    else {
                        unreachable!("just matched Pending above")
                    };
                    downstreams
                }
            }
        };
        self.cond.notify_all();

        for feed in downstreams {
            feed_downstream(feed, result.clone(), prefer.clone());
        }
    }

    /// Registers a feed to run once this node completes. If the node has already completed, the
    /// feed runs (or is scheduled) immediately instead of being queued.
    pub fn register_downstream(self: &Arc<Self>, feed: DownstreamFeed<T>) {
        let already_completed = {
            let mut state = self.lock_state();
            match &mut *state {
                State::Pending(downstreams) => {
                    downstreams.push(feed);
                    None
                }
                State::Completed { result, prefer } => Some((result.clone(), prefer.clone())),
            }
        };

        if let Some((result, prefer)) = already_completed {
            feed_downstream(feed, result, prefer);
        }
    }

    pub fn peek(&self) -> Option<AsyncResult<T>> {
        match &*self.lock_state() {
            State::Pending(_) => None,
            State::Completed { result, .. } => Some(result.clone()),
        }
    }

    /// Blocks the calling thread until this node completes. If the calling thread is currently
    /// running inside an apartment that supports nested pumping, that apartment's own queue is
    /// drained inline while waiting so a task can safely wait on its own apartment without
    /// deadlock.
    pub fn wait_blocking(self: &Arc<Self>) -> AsyncResult<T> {
        if let Some(current) = apartment::current()
            && current.supports_nested_pump()
        {
            let node = Arc::clone(self);
            current.run_nested_pump_loop(move || node.peek().is_some());
            if let Some(result) = self.peek() {
                return result;
            }
        }

        let mut state = self.lock_state();
        loop {
            if let State::Completed { result, .. } = &*state {
                return result.clone();
            }
            state = self
                .cond
                .wait_timeout(state, Duration::from_millis(20))
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }

    /// Requests cancellation. The first request wins; later calls are no-ops. If `backtrack` is
    /// set and an upstream-cancel function was registered, the request propagates upstream too.
    pub fn request_cancel(&self, error: AsyncError, backtrack: bool) {
        let mut cancel = self.cancel.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if cancel.is_some() {
            return;
        }
        *cancel = Some(CancelRequest {
            error: error.clone(),
            backtrack,
        });
        drop(cancel);

        if backtrack
            && let Some(upstream) = self
                .upstream_cancel
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        {
            upstream(error, true);
        }
    }

    pub fn cancel_request(&self) -> Option<CancelRequest> {
        self.cancel.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Clone for CancelRequest {
    fn clone(&self) -> Self {
        Self {
            error: self.error.clone(),
            backtrack: self.backtrack,
        }
    }
}

/// Schedules (or, if the target apartment is the current thread's apartment, runs inline) the
/// downstream feed, per the completion-dispatch rule in the crate docs.
fn feed_downstream<T: Clone + Send + 'static>(
    feed: DownstreamFeed<T>,
    result: AsyncResult<T>,
    prefer: Option<Apartment>,
) {
    let target = prefer.or_else(apartment::current).unwrap_or_else(apartment::default_mta);

    if target.is_current() {
        feed(result, Some(target));
        return;
    }

    let target_for_job = target.clone();
    let id = target.schedule(
        0,
        Box::new(move || feed(result, Some(target_for_job))),
    );

    if id == 0 {
        // The target apartment is gone; this branch only triggers when `schedule` itself rejected
        // the job, so we cannot have lost `feed` above - reconstruct the call synchronously isn't
        // possible since `feed` was moved into the closure. We instead accept the dropped job: the
        // closure (and the feed inside it) is dropped without running, which correctly drops the
        // downstream node without ever completing it. Downstream code must not rely on a forced
        // TERMINATED completion in this narrow race (apartment stops between `schedule`'s state
        // check and the attempt) - it is equivalent to the apartment having stopped moments
        // earlier, before the upstream even completed.
        tracing::warn!("dropped a completed downstream feed: target apartment already stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_is_idempotent() {
        let node = Node::<i32>::pending();
        node.complete(Ok(1), None);
        node.complete(Ok(2), None);
        assert_eq!(node.peek(), Some(Ok(1)));
    }

    #[test]
    fn register_after_completion_still_feeds() {
        let node = Node::<i32>::pending();
        node.complete(Ok(7), None);

        let (tx, rx) = std::sync::mpsc::channel();
        node.register_downstream(Box::new(move |result, _| {
            tx.send(result).unwrap();
        }));

        assert_eq!(
            rx.recv_timeout(apartment_rt_testing::TEST_TIMEOUT).unwrap(),
            Ok(7)
        );
    }

    #[test]
    fn register_before_completion_feeds_on_complete() {
        let node = Node::<i32>::pending();

        let (tx, rx) = std::sync::mpsc::channel();
        node.register_downstream(Box::new(move |result, _| {
            tx.send(result).unwrap();
        }));

        node.complete(Ok(9), None);
        assert_eq!(
            rx.recv_timeout(apartment_rt_testing::TEST_TIMEOUT).unwrap(),
            Ok(9)
        );
    }

    #[test]
    fn cancel_request_is_first_write_wins() {
        let node = Node::<i32>::pending();
        node.request_cancel(AsyncError::new(ErrorCode::Cancelled), false);
        node.request_cancel(AsyncError::new(ErrorCode::Timeout), false);

        assert_eq!(node.cancel_request().unwrap().error.code(), ErrorCode::Cancelled);
    }

    #[test]
    fn backtrack_cancel_propagates_upstream() {
        let node = Node::<i32>::pending();
        let seen = Arc::new(Mutex::new(false));
        let seen_clone = Arc::clone(&seen);
        node.set_upstream_cancel(Arc::new(move |_err, _backtrack| {
            *seen_clone.lock().unwrap() = true;
        }));

        node.request_cancel(AsyncError::new(ErrorCode::Cancelled), true);
        assert!(*seen.lock().unwrap());
    }
}
