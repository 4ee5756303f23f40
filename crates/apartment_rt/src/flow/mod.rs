// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A named-task DAG built atop the future graph: register tasks and their dependencies, `start`
//! the flow, and either block on [`Flow::wait`] or subscribe observers to watch progress.

mod observer;
mod task;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use observer::{Observer, Observers};
use task::{Body, Status, Task};

use crate::apartment::Apartment;
use crate::context::AsyncContext;
use crate::error::{Error, Result};
use crate::future::{Future, Promise};
use crate::pattern;
use crate::result::{AsyncError, AsyncResult, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Running,
    Completed,
}

struct State {
    phase: Phase,
    default_apartment: Option<Apartment>,
    concurrency_limit: usize,
    tasks: HashMap<String, Task>,
    dependents: HashMap<String, Vec<String>>,
    pending: VecDeque<String>,
    running_count: usize,
    succeeded: usize,
    failed: usize,
    first_failed: Option<AsyncError>,
    first_failed_name: Option<String>,
    user_data: HashMap<String, Box<dyn std::any::Any + Send + Sync>>,
}

impl State {
    fn new() -> Self {
        Self {
            phase: Phase::NotStarted,
            default_apartment: None,
            concurrency_limit: 0,
            tasks: HashMap::new(),
            dependents: HashMap::new(),
            pending: VecDeque::new(),
            running_count: 0,
            succeeded: 0,
            failed: 0,
            first_failed: None,
            first_failed_name: None,
            user_data: HashMap::new(),
        }
    }
}

/// A named-task DAG. Cloning a [`Flow`] is cheap; every clone refers to the same underlying graph
/// and observer set.
#[derive(Clone)]
pub struct Flow {
    state: Arc<Mutex<State>>,
    observers: Arc<Mutex<Observers>>,
    flow_promise: Arc<Mutex<Option<Promise<()>>>>,
    flow_future: Future<()>,
}

impl Default for Flow {
    fn default() -> Self {
        Self::new()
    }
}

impl Flow {
    /// Creates an empty, `not-started` flow.
    #[must_use]
    pub fn new() -> Self {
        let (flow_promise, flow_future) = Promise::create();
        Self {
            state: Arc::new(Mutex::new(State::new())),
            observers: Arc::new(Mutex::new(Observers::new())),
            flow_promise: Arc::new(Mutex::new(Some(flow_promise))),
            flow_future,
        }
    }

    /// Sets the apartment used by tasks registered without an explicit one of their own. Has no
    /// effect on tasks already registered.
    pub fn set_default_apartment(&self, apartment: Apartment) {
        self.lock_state().default_apartment = Some(apartment);
    }

    /// Sets the maximum number of tasks allowed to run concurrently. `0` (the default) means
    /// unlimited.
    pub fn set_j(&self, limit: usize) {
        self.lock_state().concurrency_limit = limit;
    }

    /// Registers a task whose body runs synchronously and returns a plain result. `name_and_deps`
    /// is `"name"` or `"name: dep1, dep2, …"`.
    pub fn add_task(
        &self,
        name_and_deps: &str,
        apartment: Option<Apartment>,
        context: AsyncContext,
        f: impl FnOnce() -> AsyncResult<()> + Send + 'static,
    ) -> Result<()> {
        self.add_task_inner(name_and_deps, apartment, context, Body::Sync(Box::new(f)))
    }

    /// Registers a task whose body returns another future to adopt, per [`Future::flat_then`].
    pub fn add_flat_task(
        &self,
        name_and_deps: &str,
        apartment: Option<Apartment>,
        context: AsyncContext,
        f: impl FnOnce() -> Future<()> + Send + 'static,
    ) -> Result<()> {
        self.add_task_inner(name_and_deps, apartment, context, Body::Flat(Box::new(f)))
    }

    fn add_task_inner(
        &self,
        name_and_deps: &str,
        apartment: Option<Apartment>,
        context: AsyncContext,
        body: Body,
    ) -> Result<()> {
        let (name, deps) = task::parse_name_and_deps(name_and_deps);
        if !task::is_valid_task_name(&name) {
            return Err(Error::Programming(format!(
                "invalid flow task name: {name_and_deps:?}"
            )));
        }
        if deps.iter().any(|dep| dep == &name) {
            return Err(Error::Programming(format!("task {name:?} cannot depend on itself")));
        }

        let mut state = self.lock_state();
        if state.phase != Phase::NotStarted {
            return Err(Error::Programming(
                "cannot register a flow task after the flow has started".to_owned(),
            ));
        }
        if state.tasks.contains_key(&name) {
            return Err(Error::Programming(format!("duplicate flow task name: {name:?}")));
        }

        let apartment = apartment
            .or_else(|| state.default_apartment.clone())
            .unwrap_or_else(crate::apartment::default_mta);

        let (trigger_promise, trigger_future) = Promise::create();
        let future = build_task_pipeline(
            &trigger_future,
            apartment.clone(),
            context.clone(),
            body,
            self.clone(),
            name.clone(),
        );

        for dep in &deps {
            state.dependents.entry(dep.clone()).or_default().push(name.clone());
        }

        let waiting: HashSet<String> = deps.iter().cloned().collect();
        state.tasks.insert(
            name.clone(),
            Task {
                name,
                deps,
                waiting,
                dep_failed: false,
                apartment,
                context,
                status: Status::NotStarted,
                level: 0,
                result: None,
                trigger: Some(trigger_promise),
                future,
            },
        );

        Ok(())
    }

    /// Registers an observer fired once when the flow transitions to running. Returns an id usable
    /// with [`Self::remove_observer`].
    pub fn add_flow_running_observer(
        &self,
        apartment: Apartment,
        context: AsyncContext,
        f: impl Fn() + Send + Sync + 'static,
    ) -> u64 {
        self.observers_lock()
            .insert(apartment, context, Observer::FlowRunning(Arc::new(f)))
    }

    /// Registers an observer fired once when the flow completes, with the first-failed error if
    /// any task failed.
    pub fn add_flow_completed_observer(
        &self,
        apartment: Apartment,
        context: AsyncContext,
        f: impl Fn(Option<&AsyncError>) + Send + Sync + 'static,
    ) -> u64 {
        self.observers_lock()
            .insert(apartment, context, Observer::FlowCompleted(Arc::new(f)))
    }

    /// Registers an observer fired whenever a task matching `pattern` (a comma/semicolon/pipe/
    /// whitespace-separated glob list) starts running.
    pub fn add_task_running_observer(
        &self,
        pattern: &str,
        apartment: Apartment,
        context: AsyncContext,
        f: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<u64> {
        let pattern = pattern::compile(pattern)
            .ok_or_else(|| Error::Programming("empty task observer pattern".to_owned()))?;
        Ok(self.observers_lock().insert(
            apartment,
            context,
            Observer::TaskRunning {
                pattern,
                callback: Arc::new(f),
            },
        ))
    }

    /// Registers an observer fired whenever a task matching `pattern` completes, value or error
    /// alike.
    pub fn add_task_completed_observer(
        &self,
        pattern: &str,
        apartment: Apartment,
        context: AsyncContext,
        f: impl Fn(&str, &AsyncResult<()>) + Send + Sync + 'static,
    ) -> Result<u64> {
        let pattern = pattern::compile(pattern)
            .ok_or_else(|| Error::Programming("empty task observer pattern".to_owned()))?;
        Ok(self.observers_lock().insert(
            apartment,
            context,
            Observer::TaskCompleted {
                pattern,
                callback: Arc::new(f),
            },
        ))
    }

    /// Removes a previously registered observer. Returns `false` if `id` is unknown.
    pub fn remove_observer(&self, id: u64) -> bool {
        self.observers_lock().remove(id)
    }

    /// Validates the task graph and begins execution. Fails without mutating execution state if
    /// the graph is invalid (unknown dependency, or a cycle detected by the level-assignment guard).
    pub fn start(&self) -> Result<()> {
        let to_fire = {
            let mut state = self.lock_state();
            if state.phase != Phase::NotStarted {
                return Err(Error::Programming("flow already started".to_owned()));
            }

            validate_dag(&mut state)?;
            state.phase = Phase::Running;

            let roots: Vec<String> = state
                .tasks
                .values()
                .filter(|task| task.deps.is_empty())
                .map(|task| task.name.clone())
                .collect();
            for name in roots {
                if let Some(task) = state.tasks.get_mut(&name) {
                    task.status = Status::Pending;
                }
                state.pending.push_back(name);
            }

            drain_pending(&mut state)
        };

        self.observers_lock().dispatch_flow_running();
        self.fire(to_fire);
        Ok(())
    }

    /// Requests cooperative cancellation of every task still running or pending. Already-running
    /// task bodies are not interrupted; this only prevents not-yet-started tasks from being
    /// admitted and propagates cancellation through each task's future.
    pub fn try_cancel(&self) {
        let futures: Vec<Future<()>> = self
            .lock_state()
            .tasks
            .values()
            .map(|task| task.future.clone())
            .collect();
        for future in futures {
            future.try_cancel(true);
        }
    }

    /// Blocks until the flow completes.
    pub fn wait(&self) -> AsyncResult<()> {
        self.flow_future.wait()
    }

    /// A future that resolves when the flow completes.
    #[must_use]
    pub fn get_flow_future(&self) -> Future<()> {
        self.flow_future.clone()
    }

    /// A future that resolves when the named task completes, or `None` if no such task was
    /// registered.
    #[must_use]
    pub fn get_task_future(&self, name: &str) -> Option<Future<()>> {
        self.lock_state().tasks.get(name).map(|task| task.future.clone())
    }

    /// The named task's result, if it has completed.
    #[must_use]
    pub fn get_task_result(&self, name: &str) -> Option<AsyncResult<()>> {
        self.lock_state().tasks.get(name)?.result.clone()
    }

    /// `true` if the named task completed successfully.
    #[must_use]
    pub fn value(&self, name: &str) -> bool {
        matches!(self.get_task_result(name), Some(Ok(())))
    }

    /// The named task's error, if it completed with one.
    #[must_use]
    pub fn error(&self, name: &str) -> Option<AsyncError> {
        self.get_task_result(name)?.err()
    }

    /// The name of the first task to fail, if any has.
    #[must_use]
    pub fn get_failed_task_name(&self) -> Option<String> {
        self.lock_state().first_failed_name.clone()
    }

    /// Attaches arbitrary per-flow data under `key`, untouched by the engine itself.
    pub fn set_user_data(&self, key: impl Into<String>, value: impl std::any::Any + Send + Sync) {
        self.lock_state().user_data.insert(key.into(), Box::new(value));
    }

    /// Reads back per-flow data previously attached with [`Self::set_user_data`].
    #[must_use]
    pub fn get_user_data<T: 'static + Clone>(&self, key: &str) -> Option<T> {
        self.lock_state()
            .user_data
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Drops all retained task, observer, and user-data state, breaking any reference cycle formed
    /// by a caller storing this flow inside one of its own task closures.
    pub fn __force_cleanup(&self) {
        let mut state = self.lock_state();
        state.tasks.clear();
        state.dependents.clear();
        state.pending.clear();
        state.user_data.clear();
        drop(state);
        *self.observers_lock() = Observers::new();
    }

    fn on_task_completed(&self, name: &str, result: AsyncResult<()>) {
        let (to_fire, flow_finished, first_failed) = {
            let mut state = self.lock_state();
            let Some(task) = state.tasks.get_mut(name) else {
                return;
            };
            task.status = if result.is_ok() { Status::Succeeded } else { Status::Failed };
            task.result = Some(result.clone());
            if result.is_ok() {
                state.succeeded += 1;
            } else {
                state.failed += 1;
                if state.first_failed.is_none() {
                    state.first_failed = result.clone().err();
                    state.first_failed_name = Some(name.to_owned());
                }
            }
            state.running_count = state.running_count.saturating_sub(1);

            let failed_flag = result.is_err();
            if let Some(dependents) = state.dependents.get(name).cloned() {
                for dep_name in dependents {
                    if let Some(dependent) = state.tasks.get_mut(&dep_name) {
                        dependent.waiting.remove(name);
                        if failed_flag {
                            dependent.dep_failed = true;
                        }
                        if dependent.waiting.is_empty() && dependent.status == Status::NotStarted {
                            dependent.status = Status::Pending;
                            state.pending.push_back(dep_name);
                        }
                    }
                }
            }

            let to_fire = drain_pending(&mut state);
            let finished = state.succeeded + state.failed == state.tasks.len();
            if finished {
                state.phase = Phase::Completed;
            }
            (to_fire, finished, state.first_failed.clone())
        };

        self.observers_lock().dispatch_task_completed(name, &result);
        self.fire(to_fire);

        if flow_finished {
            self.complete_flow(first_failed);
        }
    }

    fn complete_flow(&self, first_failed: Option<AsyncError>) {
        self.observers_lock().dispatch_flow_completed(first_failed.clone());
        if let Some(promise) = self.flow_promise.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
            let result = match first_failed {
                Some(error) => Err(error),
                None => Ok(()),
            };
            promise.complete(result, None);
        }
    }

    fn fire(&self, to_fire: Vec<(String, Promise<()>, AsyncResult<()>)>) {
        for (name, promise, arg) in to_fire {
            self.observers_lock().dispatch_task_running(&name);
            promise.complete(arg, None);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn observers_lock(&self) -> std::sync::MutexGuard<'_, Observers> {
        self.observers.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Wires a task's trigger future through `flat_then` (runs the body only if every dependency
/// succeeded) into a `transform` that commits the result under the flow lock and drives
/// downstream tasks, at priority [`crate::context::INLINE_PRIORITY`] so the commit happens
/// directly inside the completion that produced it.
fn build_task_pipeline(
    trigger_future: &Future<()>,
    apartment: Apartment,
    context: AsyncContext,
    body: Body,
    flow: Flow,
    name: String,
) -> Future<()> {
    let ran = trigger_future.flat_then(Some(apartment), context, move |()| match body {
        Body::Sync(f) => Future::dx(f()),
        Body::Flat(f) => f(),
    });

    ran.transform(
        None,
        AsyncContext::empty().set_priority(crate::context::INLINE_PRIORITY),
        move |result| {
            flow.on_task_completed(&name, result.clone());
            result
        },
    )
}

/// Assigns each task a level (root = 1, otherwise one more than its deepest dependency) and
/// rejects the graph if any dependency is missing, if a task never reaches a positive level
/// (isolated in a cycle), or if levels grow past `2 * task_count` (the cycle guard).
fn validate_dag(state: &mut State) -> Result<()> {
    for task in state.tasks.values() {
        for dep in &task.deps {
            if !state.tasks.contains_key(dep) {
                return Err(Error::Programming(format!(
                    "flow task {:?} depends on unknown task {dep:?}",
                    task.name
                )));
            }
        }
    }

    let total = state.tasks.len();
    let guard = 2 * total.max(1);
    let mut levels: HashMap<String, u32> = HashMap::new();

    for task in state.tasks.values() {
        if task.deps.is_empty() {
            levels.insert(task.name.clone(), 1);
        }
    }

    let names: Vec<String> = state.tasks.keys().cloned().collect();
    let mut rounds = 0;
    loop {
        rounds += 1;
        if rounds > guard {
            return Err(Error::Programming(
                "flow task graph exceeded the cycle-detection iteration guard".to_owned(),
            ));
        }

        let mut changed = false;
        for name in &names {
            let task = &state.tasks[name];
            if task.deps.is_empty() {
                continue;
            }
            let mut max_dep_level = None;
            for dep in &task.deps {
                match levels.get(dep) {
                    Some(level) => {
                        max_dep_level = Some(max_dep_level.map_or(*level, |current: u32| current.max(*level)));
                    }
                    None => {
                        max_dep_level = None;
                        break;
                    }
                }
            }
            let Some(max_dep_level) = max_dep_level else {
                continue;
            };
            let candidate = max_dep_level + 1;
            let current = levels.get(name).copied();
            if current != Some(candidate) {
                levels.insert(name.clone(), candidate);
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    for name in state.tasks.keys() {
        if !levels.contains_key(name) {
            return Err(Error::Programming(format!(
                "flow task {name:?} is part of a cycle or isolated sub-graph"
            )));
        }
    }

    for (name, level) in levels {
        if let Some(task) = state.tasks.get_mut(&name) {
            task.level = level;
        }
    }

    Ok(())
}

/// Admits as many `Pending` tasks as the concurrency cap allows, taking their trigger promises so
/// the caller can fire them once the flow lock is released. Also handles the defensive case of a
/// task that is `NotStarted` with nothing pending and nothing running - which [`validate_dag`]
/// should have already ruled out, but is completed synthetically with
/// [`ErrorCode::Unexpected`] rather than left to hang forever.
fn drain_pending(state: &mut State) -> Vec<(String, Promise<()>, AsyncResult<()>)> {
    let mut to_fire = Vec::new();

    while state.concurrency_limit == 0 || state.running_count < state.concurrency_limit {
        let Some(name) = state.pending.pop_front() else {
            break;
        };
        let Some(task) = state.tasks.get_mut(&name) else {
            continue;
        };
        task.status = Status::Running;
        state.running_count += 1;
        let arg = if task.dep_failed {
            Err(state
                .first_failed
                .clone()
                .unwrap_or_else(|| AsyncError::new(ErrorCode::Unexpected)))
        } else {
            Ok(())
        };
        if let Some(promise) = task.trigger.take() {
            to_fire.push((name, promise, arg));
        }
    }

    let total = state.tasks.len();
    if to_fire.is_empty() && state.running_count == 0 && state.succeeded + state.failed < total {
        let stuck: Vec<String> = state
            .tasks
            .values()
            .filter(|task| task.status == Status::NotStarted)
            .map(|task| task.name.clone())
            .collect();
        for name in stuck {
            if let Some(task) = state.tasks.get_mut(&name) {
                task.status = Status::Running;
                state.running_count += 1;
                if let Some(promise) = task.trigger.take() {
                    to_fire.push((name, promise, Err(AsyncError::new(ErrorCode::Unexpected))));
                }
            }
        }
    }

    to_fire
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn test_apartment(name: &'static str) -> Apartment {
        let apartment = crate::apartment::spawn_mta(name, 2);
        apartment.start();
        apartment
    }

    #[test]
    fn linear_chain_runs_in_order() {
        let apartment = test_apartment("test-flow-linear");
        let flow = Flow::new();
        let (tx, rx) = mpsc::channel();

        let tx1 = tx.clone();
        flow.add_task("a", Some(apartment.clone()), AsyncContext::empty(), move || {
            tx1.send("a").unwrap();
            Ok(())
        })
        .unwrap();

        let tx2 = tx;
        flow.add_task("b: a", Some(apartment.clone()), AsyncContext::empty(), move || {
            tx2.send("b").unwrap();
            Ok(())
        })
        .unwrap();

        flow.start().unwrap();
        assert_eq!(flow.wait(), Ok(()));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "a");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "b");

        apartment.async_stop();
        apartment.wait();
    }

    #[test]
    fn failed_dependency_short_circuits_dependent() {
        let apartment = test_apartment("test-flow-short-circuit");
        let flow = Flow::new();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        flow.add_task("a", Some(apartment.clone()), AsyncContext::empty(), || {
            Err(AsyncError::new(ErrorCode::Unexpected))
        })
        .unwrap();
        flow.add_task("b: a", Some(apartment.clone()), AsyncContext::empty(), move || {
            ran_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        flow.start().unwrap();
        let result = flow.wait();

        assert!(result.is_err());
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(flow.error("b").is_some());
        assert_eq!(flow.get_failed_task_name().as_deref(), Some("a"));

        apartment.async_stop();
        apartment.wait();
    }

    #[test]
    fn unknown_dependency_fails_to_start() {
        let apartment = test_apartment("test-flow-unknown-dep");
        let flow = Flow::new();
        flow.add_task("a: missing", Some(apartment.clone()), AsyncContext::empty(), || Ok(()))
            .unwrap();

        assert!(flow.start().is_err());

        apartment.async_stop();
        apartment.wait();
    }

    #[test]
    fn cycle_fails_to_start() {
        let apartment = test_apartment("test-flow-cycle");
        let flow = Flow::new();
        flow.add_task("a: b", Some(apartment.clone()), AsyncContext::empty(), || Ok(()))
            .unwrap();
        flow.add_task("b: a", Some(apartment.clone()), AsyncContext::empty(), || Ok(()))
            .unwrap();

        assert!(flow.start().is_err());

        apartment.async_stop();
        apartment.wait();
    }

    #[test]
    fn self_dependency_is_rejected_at_registration() {
        let apartment = test_apartment("test-flow-self-dep");
        let flow = Flow::new();
        assert!(flow
            .add_task("a: a", Some(apartment.clone()), AsyncContext::empty(), || Ok(()))
            .is_err());

        apartment.async_stop();
        apartment.wait();
    }

    #[test]
    fn duplicate_task_name_is_rejected() {
        let apartment = test_apartment("test-flow-duplicate");
        let flow = Flow::new();
        flow.add_task("a", Some(apartment.clone()), AsyncContext::empty(), || Ok(()))
            .unwrap();
        assert!(flow
            .add_task("a", Some(apartment.clone()), AsyncContext::empty(), || Ok(()))
            .is_err());

        apartment.async_stop();
        apartment.wait();
    }

    #[test]
    fn concurrency_cap_limits_simultaneous_tasks() {
        let apartment = test_apartment("test-flow-concurrency-cap");
        let flow = Flow::new();
        flow.set_j(1);

        let concurrent = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let max_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for name in ["a", "b", "c"] {
            let concurrent = Arc::clone(&concurrent);
            let max_seen = Arc::clone(&max_seen);
            flow.add_task(name, Some(apartment.clone()), AsyncContext::empty(), move || {
                let now = concurrent.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                concurrent.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }

        flow.start().unwrap();
        flow.wait().unwrap();

        assert_eq!(max_seen.load(std::sync::atomic::Ordering::SeqCst), 1);

        apartment.async_stop();
        apartment.wait();
    }

    #[test]
    fn task_completed_observer_sees_every_task() {
        let apartment = test_apartment("test-flow-observer");
        let flow = Flow::new();
        flow.add_task("a", Some(apartment.clone()), AsyncContext::empty(), || Ok(())).unwrap();
        flow.add_task("b", Some(apartment.clone()), AsyncContext::empty(), || Ok(())).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        flow.add_task_completed_observer("*", apartment.clone(), AsyncContext::empty(), move |name, _result| {
            seen_clone.lock().unwrap().push(name.to_owned());
        })
        .unwrap();

        flow.start().unwrap();
        flow.wait().unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a".to_owned(), "b".to_owned()]);

        apartment.async_stop();
        apartment.wait();
    }
}
