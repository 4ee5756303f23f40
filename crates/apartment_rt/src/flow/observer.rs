// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use regex::Regex;

use crate::apartment::{Apartment, Job};
use crate::context::AsyncContext;
use crate::result::AsyncResult;

pub(crate) enum Observer {
    FlowRunning(Arc<dyn Fn() + Send + Sync>),
    FlowCompleted(Arc<dyn Fn(Option<&crate::result::AsyncError>) + Send + Sync>),
    TaskRunning {
        pattern: Regex,
        callback: Arc<dyn Fn(&str) + Send + Sync>,
    },
    TaskCompleted {
        pattern: Regex,
        callback: Arc<dyn Fn(&str, &AsyncResult<()>) + Send + Sync>,
    },
}

struct Entry {
    apartment: Apartment,
    context: AsyncContext,
    observer: Observer,
}

/// The set of observers registered on a single flow, keyed by an opaque id handed out at
/// registration.
#[derive(Default)]
pub(crate) struct Observers {
    next_id: u64,
    entries: std::collections::HashMap<u64, Entry>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, apartment: Apartment, context: AsyncContext, observer: Observer) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            Entry {
                apartment,
                context,
                observer,
            },
        );
        id
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn dispatch_flow_running(&mut self) {
        self.dispatch(|observer| match observer {
            Observer::FlowRunning(callback) => {
                let callback = Arc::clone(callback);
                Some(Box::new(move || callback()) as Job)
            }
            _ => None,
        });
    }

    pub fn dispatch_flow_completed(&mut self, error: Option<crate::result::AsyncError>) {
        self.dispatch(|observer| match observer {
            Observer::FlowCompleted(callback) => {
                let callback = Arc::clone(callback);
                let error = error.clone();
                Some(Box::new(move || callback(error.as_ref())) as Job)
            }
            _ => None,
        });
    }

    pub fn dispatch_task_running(&mut self, name: &str) {
        self.dispatch(|observer| match observer {
            Observer::TaskRunning { pattern, callback } if pattern.is_match(name) => {
                let callback = Arc::clone(callback);
                let name = name.to_owned();
                Some(Box::new(move || callback(&name)) as Job)
            }
            _ => None,
        });
    }

    pub fn dispatch_task_completed(&mut self, name: &str, result: &AsyncResult<()>) {
        let result = result.clone();
        self.dispatch(|observer| match observer {
            Observer::TaskCompleted { pattern, callback } if pattern.is_match(name) => {
                let callback = Arc::clone(callback);
                let name = name.to_owned();
                let result = result.clone();
                Some(Box::new(move || callback(&name, &result)) as Job)
            }
            _ => None,
        });
    }

    /// Walks every entry, builds a job for the ones `make_job` matches, and schedules it on the
    /// entry's apartment - unless the entry's context has been cancelled or its owner has
    /// expired, in which case the entry is dropped instead (per the observer-dispatch algorithm).
    fn dispatch(&mut self, mut make_job: impl FnMut(&Observer) -> Option<Job>) {
        self.entries.retain(|_id, entry| {
            let Some(job) = make_job(&entry.observer) else {
                return true;
            };

            if entry.context.is_cancelled() {
                return false;
            }

            let Some(locks) = entry.context.lock_owner() else {
                return false;
            };

            let priority = entry.context.priority();
            let id = entry.apartment.schedule(
                priority,
                Box::new(move || {
                    let _locks = locks;
                    job();
                }),
            );
            if id == 0 {
                tracing::warn!("dropped a flow observer callback: target apartment already stopped");
            }

            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apartment;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn task_completed_observer_fires_only_on_matching_name() {
        let apartment = apartment::spawn_sta("test-observer-dispatch");
        apartment.start();

        let mut observers = Observers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        observers.insert(
            apartment.clone(),
            AsyncContext::empty(),
            Observer::TaskCompleted {
                pattern: crate::pattern::compile("build_*").unwrap(),
                callback: Arc::new(move |_name, _result| {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                }),
            },
        );

        observers.dispatch_task_completed("build_debug", &Ok(()));
        observers.dispatch_task_completed("link", &Ok(()));

        apartment.async_stop();
        apartment.wait();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expired_owner_removes_the_observer() {
        let apartment = apartment::spawn_sta("test-observer-expiry");
        apartment.start();

        let object = Arc::new(());
        let context = AsyncContext::empty().bind_owner(crate::context::Owner::weak(&object));
        drop(object);

        let mut observers = Observers::new();
        observers.insert(
            apartment.clone(),
            context,
            Observer::FlowRunning(Arc::new(|| {})),
        );

        observers.dispatch_flow_running();
        assert_eq!(observers.entries.len(), 0);

        apartment.async_stop();
        apartment.wait();
    }
}
