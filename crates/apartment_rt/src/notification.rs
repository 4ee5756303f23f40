// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Name-pattern publish/subscribe for application code sitting on top of the flow/future layer.
//!
//! Distinct from [`crate::flow`]'s task-completion observers in one respect: registrations are
//! keyed by an opaque, caller-chosen `observer_key` rather than a handle returned at registration
//! time, so a caller can remove everything it registered (or just one pattern of it) without
//! having to hold onto ids. Matching uses the same pattern syntax as flow observers (`*`/`?`
//! wildcards, `, ; |` and whitespace as item separators), compiled by [`crate::pattern`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use regex::Regex;

use crate::apartment::Apartment;
use crate::context::AsyncContext;
use crate::pattern;

type Callback = Arc<dyn Fn(&str, &str, &(dyn Any + Send + Sync)) + Send + Sync>;

struct Registration {
    pattern: Regex,
    apartment: Apartment,
    context: AsyncContext,
    callback: Callback,
}

/// A process-wide (or scoped, if you construct more than one) notification hub. Cheap to share:
/// wrap in an [`Arc`] if multiple owners need the same hub.
#[derive(Default)]
pub struct NotificationCenter {
    registrations: Mutex<HashMap<String, Vec<Registration>>>,
}

impl NotificationCenter {
    /// Creates an empty notification center.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` under `observer_key` for every future [`Self::post_notification`]
    /// whose name matches `pattern`. `callback` runs on `apartment` at `context`'s priority,
    /// subject to the same owner/cancellation checks as flow observers: a dead owner or a
    /// cancelled context silently drops the registration's next match instead of firing it.
    ///
    /// Returns `None` (registering nothing) if `pattern` contains no items.
    pub fn add_observer(
        &self,
        observer_key: impl Into<String>,
        pattern: &str,
        apartment: Apartment,
        context: AsyncContext,
        callback: impl Fn(&str, &str, &(dyn Any + Send + Sync)) + Send + Sync + 'static,
    ) -> Option<()> {
        let compiled = self::pattern::compile(pattern)?;
        self.lock().entry(observer_key.into()).or_default().push(Registration {
            pattern: compiled,
            apartment,
            context,
            callback: Arc::new(callback),
        });
        Some(())
    }

    /// Removes every observer registered under `observer_key`. Returns `true` if any existed.
    pub fn remove_observer(&self, observer_key: &str) -> bool {
        self.lock().remove(observer_key).is_some()
    }

    /// Removes only the observers registered under `observer_key` whose pattern string equals
    /// `pattern` exactly (not a semantic-match check - the same literal pattern text used at
    /// registration). Returns `true` if any were removed.
    pub fn remove_observer_pattern(&self, observer_key: &str, pattern: &str) -> bool {
        let Some(compiled) = self::pattern::compile(pattern) else {
            return false;
        };
        let mut registrations = self.lock();
        let Some(entries) = registrations.get_mut(observer_key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.pattern.as_str() != compiled.as_str());
        let removed = entries.len() != before;
        if entries.is_empty() {
            registrations.remove(observer_key);
        }
        removed
    }

    /// Fans `name` out to every registered observer whose pattern matches, scheduling each
    /// callback on its own apartment. `sender` and `data` are handed to the callback verbatim;
    /// `data` is shared (not cloned) across every observer that fires.
    ///
    /// `context` is the posting call's own context: if it is already cancelled, nothing is
    /// dispatched.
    pub fn post_notification(
        &self,
        sender: &str,
        name: &str,
        data: Arc<dyn Any + Send + Sync>,
        context: &AsyncContext,
    ) {
        if context.is_cancelled() {
            return;
        }

        for entries in self.lock().values() {
            for entry in entries {
                if !entry.pattern.is_match(name) {
                    continue;
                }
                if entry.context.is_cancelled() {
                    continue;
                }
                let Some(locks) = entry.context.lock_owner() else {
                    continue;
                };

                let callback = Arc::clone(&entry.callback);
                let sender = sender.to_owned();
                let name = name.to_owned();
                let data = Arc::clone(&data);
                let priority = entry.context.priority();

                let id = entry.apartment.schedule(
                    priority,
                    Box::new(move || {
                        let _locks = locks;
                        callback(&sender, &name, data.as_ref());
                    }),
                );
                if id == 0 {
                    tracing::warn!("dropped a notification: target apartment already stopped");
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Registration>>> {
        self.registrations.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for NotificationCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationCenter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::apartment;

    #[test]
    fn matching_pattern_fires_exactly_once() {
        let apartment = apartment::spawn_sta("test-notification-match");
        apartment.start();

        let center = NotificationCenter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        center
            .add_observer(
                "subscriber-1",
                "a.b.*",
                apartment.clone(),
                AsyncContext::empty(),
                move |_sender, _name, _data| {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();

        center.post_notification("poster", "a.x.y.z", Arc::new(()), &AsyncContext::empty());
        center.post_notification("poster", "a.b.c", Arc::new(()), &AsyncContext::empty());

        apartment.async_stop();
        apartment.wait();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_observer_drops_all_its_patterns() {
        let apartment = apartment::spawn_sta("test-notification-remove");
        apartment.start();

        let center = NotificationCenter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        center
            .add_observer(
                "subscriber-1",
                "*",
                apartment.clone(),
                AsyncContext::empty(),
                move |_sender, _name, _data| {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();

        assert!(center.remove_observer("subscriber-1"));
        assert!(!center.remove_observer("subscriber-1"));

        center.post_notification("poster", "anything", Arc::new(()), &AsyncContext::empty());

        apartment.async_stop();
        apartment.wait();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_observer_pattern_leaves_other_patterns_under_same_key() {
        let apartment = apartment::spawn_sta("test-notification-remove-pattern");
        apartment.start();

        let center = NotificationCenter::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let hits_a = Arc::clone(&hits);
        center
            .add_observer("subscriber-1", "a.*", apartment.clone(), AsyncContext::empty(), move |_, name, _| {
                hits_a.lock().unwrap().push(name.to_owned());
            })
            .unwrap();
        let hits_b = Arc::clone(&hits);
        center
            .add_observer("subscriber-1", "b.*", apartment.clone(), AsyncContext::empty(), move |_, name, _| {
                hits_b.lock().unwrap().push(name.to_owned());
            })
            .unwrap();

        assert!(center.remove_observer_pattern("subscriber-1", "a.*"));

        center.post_notification("poster", "a.1", Arc::new(()), &AsyncContext::empty());
        center.post_notification("poster", "b.1", Arc::new(()), &AsyncContext::empty());

        apartment.async_stop();
        apartment.wait();

        assert_eq!(*hits.lock().unwrap(), vec!["b.1".to_owned()]);
    }
}
