// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::{Mutex, OnceLock};

use super::Apartment;

/// The process-wide default thread-pool apartment ("default MTA"), sized to the hardware by
/// default. Any scheduling call that does not name a specific apartment targets this one.
pub fn default_mta() -> Apartment {
    static DEFAULT_MTA: OnceLock<Apartment> = OnceLock::new();
    DEFAULT_MTA
        .get_or_init(|| {
            let apartment = spawn_mta("default_mta", default_thread_count());
            apartment.start();
            apartment
        })
        .clone()
}

fn default_thread_count() -> usize {
    many_cpus::ProcessorSet::builder()
        .take_all()
        .map(|set| set.processors().len())
        .filter(|&count| count > 0)
        .unwrap_or(1)
}

/// Creates (but does not start) a thread-pool apartment with `thread_count` worker threads.
#[must_use]
pub fn spawn_mta(name: &'static str, thread_count: usize) -> Apartment {
    Apartment::new(name, thread_count.max(1))
}

/// Creates (but does not start) a single-thread apartment.
#[must_use]
pub fn spawn_sta(name: &'static str) -> Apartment {
    Apartment::new(name, 1)
}

static NAMED_APARTMENTS: OnceLock<Mutex<std::collections::HashMap<&'static str, Apartment>>> =
    OnceLock::new();

/// Registers and starts a named single-thread apartment following the convention described in the
/// crate docs (e.g. `"ui_sta"`, `"master_sta"`). Returns the existing apartment if `name` was
/// already registered.
pub fn register_sta(name: &'static str) -> Apartment {
    let registry = NAMED_APARTMENTS.get_or_init(|| Mutex::new(std::collections::HashMap::new()));
    let mut registry = registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

    registry
        .entry(name)
        .or_insert_with(|| {
            let apartment = spawn_sta(name);
            apartment.start();
            apartment
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mta_is_a_singleton() {
        let a = default_mta();
        let b = default_mta();
        assert_eq!(a.name(), b.name());
    }

    #[test]
    fn register_sta_returns_same_instance_for_same_name() {
        let a = register_sta("test_named_sta_registry");
        let b = register_sta("test_named_sta_registry");
        assert_eq!(a.name(), b.name());
    }
}
