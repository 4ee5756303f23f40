// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashSet;

use crate::apartment::Apartment;
use crate::context::AsyncContext;
use crate::future::{Future, Promise};
use crate::result::AsyncResult;

/// A task's user-supplied body: either a plain synchronous function (`add_task`) or one that
/// returns another future to adopt (`add_flat_task`). Only invoked when every dependency
/// succeeded; a failed dependency short-circuits straight past this body.
pub(crate) enum Body {
    Sync(Box<dyn FnOnce() -> AsyncResult<()> + Send>),
    Flat(Box<dyn FnOnce() -> Future<()> + Send>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    NotStarted,
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// A single registered task: its declared dependency names, the still-outstanding subset of them,
/// and the trigger/future pair wired up at registration time.
pub(crate) struct Task {
    pub name: String,
    pub deps: Vec<String>,
    pub waiting: HashSet<String>,
    pub dep_failed: bool,
    pub apartment: Apartment,
    pub context: AsyncContext,
    pub status: Status,
    pub level: u32,
    pub result: Option<AsyncResult<()>>,
    pub trigger: Option<Promise<()>>,
    pub future: Future<()>,
}

/// Parses a task registration name of the form `"name"` or `"name: dep1, dep2"` into the task
/// name and its (possibly empty, order-preserving, duplicate-free) dependency list. A dependency
/// named more than once (`"x: a, a"`) collapses to a single edge.
pub(crate) fn parse_name_and_deps(spec: &str) -> (String, Vec<String>) {
    match spec.split_once(':') {
        None => (spec.trim().to_owned(), Vec::new()),
        Some((name, deps)) => {
            let mut seen = HashSet::new();
            let deps = deps
                .split(',')
                .map(str::trim)
                .filter(|dep| !dep.is_empty())
                .filter(|dep| seen.insert((*dep).to_owned()))
                .map(str::to_owned)
                .collect();
            (name.trim().to_owned(), deps)
        }
    }
}

/// `true` if `name` is non-empty and free of the characters reserved for the registration syntax
/// and the observer pattern language (whitespace, `,;:&|!()[]*?`).
#[must_use]
pub(crate) fn is_valid_task_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || ",:;&|!()[]*?".contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_name_with_no_deps() {
        let (name, deps) = parse_name_and_deps("build");
        assert_eq!(name, "build");
        assert!(deps.is_empty());
    }

    #[test]
    fn parses_name_with_deps() {
        let (name, deps) = parse_name_and_deps("link: compile, resources");
        assert_eq!(name, "link");
        assert_eq!(deps, vec!["compile".to_owned(), "resources".to_owned()]);
    }

    #[test]
    fn duplicate_deps_collapse_to_one_edge() {
        let (name, deps) = parse_name_and_deps("link: compile, compile, resources");
        assert_eq!(name, "link");
        assert_eq!(deps, vec!["compile".to_owned(), "resources".to_owned()]);
    }

    #[test]
    fn valid_name_rejects_reserved_characters() {
        assert!(is_valid_task_name("build_debug"));
        assert!(!is_valid_task_name(""));
        assert!(!is_valid_task_name("a b"));
        assert!(!is_valid_task_name("a*"));
        assert!(!is_valid_task_name("a:b"));
    }
}
