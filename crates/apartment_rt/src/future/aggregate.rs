// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Aggregation combinators over a fixed collection of futures: [`all`], [`all_completed`], and
//! [`any`].

use std::sync::{Arc, Mutex, Weak};

use super::Future;
use super::node::Node;
use crate::result::{AsyncError, AsyncResult, ErrorCode};

/// Requests cooperative, backtracking cancellation on every node still reachable through
/// `siblings`. Called once an aggregate has committed its result, so any input that hasn't yet
/// completed is told to stop. A no-op for nodes that have already completed or been dropped.
fn cancel_siblings<T: Clone + Send + 'static>(siblings: &[Weak<Node<T>>]) {
    for sibling in siblings {
        if let Some(node) = sibling.upgrade() {
            node.request_cancel(AsyncError::new(ErrorCode::Cancelled), true);
        }
    }
}

/// Returns the lowest-index recorded error in `errors`, independent of the order in which the
/// slots were populated. Used so `all` commits the first-by-input-index error rather than
/// whichever error happened to be observed first in wall-clock time.
fn lowest_recorded(errors: &[Option<AsyncError>]) -> Option<(usize, AsyncError)> {
    errors.iter().enumerate().find_map(|(i, slot)| slot.clone().map(|e| (i, e)))
}

/// Waits for every future in `inputs` to complete, short-circuiting on the first error. Errors are
/// tracked by input index so that if more than one input has failed by the time a given error is
/// processed, the lowest-index error wins the race rather than whichever happened to be observed
/// first in wall-clock time. On success, yields the values in input order.
pub fn all<T: Clone + Send + 'static>(inputs: Vec<Future<T>>) -> Future<Vec<T>> {
    if inputs.is_empty() {
        return Future::resolved(Vec::new());
    }

    let count = inputs.len();
    let node = Node::pending();
    let future = Future {
        inner: Arc::clone(&node),
    };

    let siblings: Arc<Vec<Weak<Node<T>>>> = Arc::new(inputs.iter().map(|input| Arc::downgrade(&input.inner)).collect());
    let slots: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; count]));
    let errors: Arc<Mutex<Vec<Option<AsyncError>>>> = Arc::new(Mutex::new(vec![None; count]));
    let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(count));

    for (index, input) in inputs.into_iter().enumerate() {
        let node = Arc::clone(&node);
        let siblings = Arc::clone(&siblings);
        let slots = Arc::clone(&slots);
        let errors = Arc::clone(&errors);
        let remaining = Arc::clone(&remaining);
        input.inner.register_downstream(Box::new(move |result, prefer| {
            match result {
                Err(error) => {
                    let lowest = {
                        let mut errors = errors.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        errors[index] = Some(error);
                        lowest_recorded(&errors)
                    };
                    if let Some((lowest_index, lowest_error)) = lowest
                        && lowest_index == index
                    {
                        node.complete(Err(lowest_error), prefer);
                        cancel_siblings(&siblings);
                    }
                }
                Ok(value) => {
                    let done = {
                        let mut slots = slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        slots[index] = Some(value);
                        remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) == 1
                    };
                    if done {
                        let values = std::mem::take(
                            &mut *slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
                        )
                        .into_iter()
                        .map(|slot| slot.expect("all slots filled when remaining reaches zero"))
                        .collect();
                        node.complete(Ok(values), None);
                        cancel_siblings(&siblings);
                    }
                }
            }
        }));
    }

    future
}

/// Waits for every future in `inputs` to complete, value or error alike, yielding each result in
/// input order. Never itself fails.
pub fn all_completed<T: Clone + Send + 'static>(inputs: Vec<Future<T>>) -> Future<Vec<AsyncResult<T>>> {
    if inputs.is_empty() {
        return Future::resolved(Vec::new());
    }

    let count = inputs.len();
    let node = Node::pending();
    let future = Future {
        inner: Arc::clone(&node),
    };

    let slots: Arc<Mutex<Vec<Option<AsyncResult<T>>>>> = Arc::new(Mutex::new(vec![None; count]));
    let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(count));

    for (index, input) in inputs.into_iter().enumerate() {
        let node = Arc::clone(&node);
        let slots = Arc::clone(&slots);
        let remaining = Arc::clone(&remaining);
        input.inner.register_downstream(Box::new(move |result, _prefer| {
            let done = {
                let mut slots = slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                slots[index] = Some(result);
                remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) == 1
            };
            if done {
                let values = std::mem::take(
                    &mut *slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
                )
                .into_iter()
                .map(|slot| slot.expect("all slots filled when remaining reaches zero"))
                .collect();
                node.complete(Ok(values), None);
            }
        }));
    }

    future
}

/// Completes with the first `inputs` future to complete successfully, or - if all fail - with the
/// error of the input with the lowest index. An empty `inputs` is rejected immediately.
pub fn any<T: Clone + Send + 'static>(inputs: Vec<Future<T>>) -> Future<T> {
    if inputs.is_empty() {
        return Future::rejected(AsyncError::new(ErrorCode::Unexpected));
    }

    let count = inputs.len();
    let node = Node::pending();
    let future = Future {
        inner: Arc::clone(&node),
    };

    let siblings: Arc<Vec<Weak<Node<T>>>> = Arc::new(inputs.iter().map(|input| Arc::downgrade(&input.inner)).collect());
    let errors: Arc<Mutex<Vec<Option<AsyncError>>>> = Arc::new(Mutex::new(vec![None; count]));
    let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(count));

    for (index, input) in inputs.into_iter().enumerate() {
        let node = Arc::clone(&node);
        let siblings = Arc::clone(&siblings);
        let errors = Arc::clone(&errors);
        let remaining = Arc::clone(&remaining);
        input.inner.register_downstream(Box::new(move |result, prefer| match result {
            Ok(value) => {
                node.complete(Ok(value), prefer);
                cancel_siblings(&siblings);
            }
            Err(error) => {
                let last = {
                    let mut errors = errors.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    errors[index] = Some(error);
                    remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) == 1
                };
                if last {
                    let errors = std::mem::take(
                        &mut *errors.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
                    );
                    let first = errors
                        .into_iter()
                        .flatten()
                        .next()
                        .expect("at least one error recorded when remaining reaches zero");
                    node.complete(Err(first), None);
                    cancel_siblings(&siblings);
                }
            }
        }));
    }

    future
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn all_collects_values_in_input_order() {
        let a = Future::resolved(1);
        let b = Future::resolved(2);
        let c = Future::resolved(3);

        let result = all(vec![a, b, c]).wait();
        assert_eq!(result, Ok(vec![1, 2, 3]));
    }

    #[test]
    fn all_short_circuits_on_first_error() {
        let a = Future::resolved(1);
        let b = Future::<i32>::rejected(AsyncError::new(ErrorCode::Unexpected));

        let result = all(vec![a, b]).wait();
        assert!(result.is_err());
    }

    #[test]
    fn all_completed_never_fails() {
        let a = Future::resolved(1);
        let b = Future::<i32>::rejected(AsyncError::new(ErrorCode::Eof));

        let result = all_completed(vec![a, b]).wait().unwrap();
        assert_eq!(result[0], Ok(1));
        assert!(result[1].is_err());
    }

    #[test]
    fn any_resolves_with_first_success() {
        let a = Future::<i32>::rejected(AsyncError::new(ErrorCode::Unexpected));
        let b = Future::resolved(42);

        let result = any(vec![a, b]).wait();
        assert_eq!(result, Ok(42));
    }

    #[test]
    fn any_with_all_failures_uses_lowest_index_error() {
        let a = Future::<i32>::rejected(AsyncError::new(ErrorCode::Timeout));
        let b = Future::<i32>::rejected(AsyncError::new(ErrorCode::Eof));

        let result = any(vec![a, b]).wait();
        assert_eq!(result.unwrap_err().code(), ErrorCode::Timeout);
    }

    #[test]
    fn any_empty_is_rejected_immediately() {
        let result: AsyncResult<i32> = any(Vec::new()).wait();
        assert!(result.is_err());
    }

    #[test]
    fn all_waits_for_pending_inputs() {
        let apartment = crate::apartment::spawn_mta("test-aggregate-wait", 2);
        apartment.start();

        let context = crate::context::AsyncContext::empty();
        let a = Future::post_delayed(apartment.clone(), context.clone(), Duration::from_millis(10), || Ok(1));
        let b = Future::post(apartment.clone(), context, || Ok(2));

        let result = all(vec![a, b]).wait();
        assert_eq!(result, Ok(vec![1, 2]));

        apartment.async_stop();
        apartment.wait();
    }

    #[test]
    fn lowest_recorded_picks_smallest_populated_index_regardless_of_fill_order() {
        let errors = vec![None, Some(AsyncError::new(ErrorCode::Timeout)), Some(AsyncError::new(ErrorCode::Eof))];

        let (index, error) = lowest_recorded(&errors).unwrap();
        assert_eq!(index, 1);
        assert_eq!(error.code(), ErrorCode::Timeout);
    }

    #[test]
    fn all_cancels_pending_sibling_on_first_error() {
        let apartment = crate::apartment::spawn_mta("test-aggregate-all-cancel", 2);
        apartment.start();
        let context = crate::context::AsyncContext::empty();

        let failing = Future::<i32>::rejected(AsyncError::new(ErrorCode::Unexpected));
        let pending = Future::post_delayed(apartment.clone(), context, Duration::from_millis(200), || Ok(1));

        let result = all(vec![failing, pending.clone()]).wait();
        assert!(result.is_err());

        let sibling_result = pending.wait();
        assert_eq!(sibling_result.unwrap_err().code(), ErrorCode::Cancelled);

        apartment.async_stop();
        apartment.wait();
    }

    #[test]
    fn any_cancels_pending_sibling_on_first_success() {
        let apartment = crate::apartment::spawn_mta("test-aggregate-any-cancel", 2);
        apartment.start();
        let context = crate::context::AsyncContext::empty();

        let succeeding = Future::resolved(42);
        let pending = Future::post_delayed(apartment.clone(), context, Duration::from_millis(200), || Ok(1));

        let result = any(vec![succeeding, pending.clone()]).wait();
        assert_eq!(result, Ok(42));

        let sibling_result = pending.wait();
        assert_eq!(sibling_result.unwrap_err().code(), ErrorCode::Cancelled);

        apartment.async_stop();
        apartment.wait();
    }
}
