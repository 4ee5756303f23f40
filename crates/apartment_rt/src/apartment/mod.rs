// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The apartment: a named execution context that schedules boxed closures onto one or more
//! threads with priority and delay, per the scheduling policy described in the crate docs.

mod queue;
mod registry;

pub use queue::{Job, Priority};
pub use registry::{default_mta, register_sta, spawn_mta, spawn_sta};

use std::cell::Cell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use queue::Queues;

const STATE_NOT_STARTED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;
const STATE_STOPPED: u8 = 3;

thread_local! {
    /// The name of the apartment currently executing a job on this thread, if any. Used by
    /// [`Apartment::is_current`] to decide the synchronous-if-possible fast path.
    static CURRENT_APARTMENT: Cell<Option<&'static str>> = const { Cell::new(None) };

    /// A handle to the apartment currently executing a job on this thread, if any. Used to resolve
    /// "the current thread's apartment" in the apartment-selection rule for a future with no
    /// explicitly specified apartment and no apartment advised by its upstream.
    static CURRENT_APARTMENT_HANDLE: std::cell::RefCell<Option<Apartment>> =
        const { std::cell::RefCell::new(None) };
}

/// Returns a handle to the apartment currently executing a job on this thread, if any.
#[must_use]
pub fn current() -> Option<Apartment> {
    CURRENT_APARTMENT_HANDLE.with(|current| current.borrow().clone())
}

/// A handle to a named scheduler. Cloning an [`Apartment`] is cheap and all clones refer to the
/// same underlying queues and threads.
#[derive(Clone)]
pub struct Apartment {
    inner: Arc<Core>,
}

struct Core {
    name: &'static str,
    thread_count: usize,
    nested_pump: bool,
    state: AtomicU8,
    next_id: AtomicU64,
    queues: Mutex<Queues>,
    work_available: Condvar,
    remaining_workers: AtomicUsize,
    busy_on_idle: AtomicUsize,
    stopped_lock: Mutex<()>,
    stopped: Condvar,
}

impl fmt::Debug for Apartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Apartment")
            .field("name", &self.inner.name)
            .field("thread_count", &self.inner.thread_count)
            .field("state", &self.inner.state.load(Ordering::SeqCst))
            .finish()
    }
}

impl Apartment {
    /// Creates a not-yet-started apartment named `name` with `thread_count` worker threads.
    /// `thread_count == 1` yields single-thread (STA) semantics; `thread_count > 1` yields
    /// thread-pool (MTA) semantics. Both share this same implementation, per the crate docs.
    #[must_use]
    pub fn new(name: &'static str, thread_count: usize) -> Self {
        assert!(thread_count > 0, "an apartment needs at least one thread");
        Self {
            inner: Arc::new(Core {
                name,
                thread_count,
                nested_pump: thread_count == 1,
                state: AtomicU8::new(STATE_NOT_STARTED),
                next_id: AtomicU64::new(1),
                queues: Mutex::new(Queues::new()),
                work_available: Condvar::new(),
                remaining_workers: AtomicUsize::new(thread_count),
                busy_on_idle: AtomicUsize::new(0),
                stopped_lock: Mutex::new(()),
                stopped: Condvar::new(),
            }),
        }
    }

    /// This apartment's registered name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// `true` if this apartment supports reentrant [`Self::run_nested_pump_loop`] waiting without
    /// deadlock. Only single-thread apartments do.
    #[must_use]
    pub fn supports_nested_pump(&self) -> bool {
        self.inner.nested_pump
    }

    /// `true` if the calling thread is currently running a job dispatched by this apartment.
    #[must_use]
    pub fn is_current(&self) -> bool {
        CURRENT_APARTMENT.with(|current| current.get() == Some(self.inner.name))
    }

    /// Starts the worker threads. Idempotent: calling this on an already-started apartment is a
    /// no-op.
    pub fn start(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                STATE_NOT_STARTED,
                STATE_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        for worker_index in 0..self.inner.thread_count {
            let core = Arc::clone(&self.inner);
            let name = format!("{}-worker-{worker_index}", self.inner.name);
            std::thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(core))
                .expect("failed to spawn apartment worker thread");
        }
    }

    /// Enqueues `job` to run as soon as a worker is free, at the given priority (see crate docs
    /// for the priority-to-queue mapping). Returns `0` if the apartment has already stopped.
    pub fn schedule(&self, priority: i32, job: Job) -> u64 {
        let state = self.inner.state.load(Ordering::SeqCst);
        if state == STATE_STOPPED {
            return 0;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut queues = self.lock_queues();
            queues.push_ready(id, Priority::classify(priority), job);
        }
        self.inner.work_available.notify_all();
        id
    }

    /// Enqueues `job` to run after `delay`, at the given priority once promoted. A non-positive
    /// delay is equivalent to [`Self::schedule`]. Returns `0` if rejected (apartment stopped, or
    /// stopping and no longer accepting new delayed work).
    pub fn schedule_delayed(&self, priority: i32, delay: Duration, job: Job) -> u64 {
        if delay.is_zero() {
            return self.schedule(priority, job);
        }

        let state = self.inner.state.load(Ordering::SeqCst);
        if state != STATE_RUNNING {
            return 0;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + delay;
        {
            let mut queues = self.lock_queues();
            queues.push_delayed(id, deadline, job);
        }
        self.inner.work_available.notify_all();
        id
    }

    /// Best-effort removal of a delayed or low-idle job scheduled earlier. Never revokes work
    /// already promoted to the high/normal queues or already claimed by a worker.
    pub fn try_unschedule(&self, id: u64) -> bool {
        let mut queues = self.lock_queues();
        queues.try_unschedule(id)
    }

    /// `true` once every worker thread has exited.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_STOPPED
    }

    /// `true` if the apartment is stopping or has fully stopped.
    #[must_use]
    pub fn is_stopping_or_stopped(&self) -> bool {
        matches!(
            self.inner.state.load(Ordering::SeqCst),
            STATE_STOPPING | STATE_STOPPED
        )
    }

    /// Requests an orderly shutdown: no further delayed work is accepted, and workers exit once
    /// their ready queues drain. Does not block; use [`Self::wait`] to block until stopped.
    pub fn async_stop(&self) {
        let previous = self.inner.state.swap(STATE_STOPPING, Ordering::SeqCst);
        if previous == STATE_NOT_STARTED {
            // Never started: nothing to drain, nothing to join.
            self.inner.state.store(STATE_STOPPED, Ordering::SeqCst);
            return;
        }
        self.inner.work_available.notify_all();
    }

    /// Blocks the calling thread until this apartment has fully stopped.
    ///
    /// # Panics
    ///
    /// Panics if `async_stop` was never called and the apartment is still running; callers must
    /// request a stop first.
    pub fn wait(&self) {
        crate::non_blocking_thread::assert_not_flagged();
        let mut guard = self.inner.stopped_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while !self.is_stopped() {
            assert!(
                self.is_stopping_or_stopped(),
                "wait() called on an apartment that was never asked to stop"
            );
            guard = self
                .inner
                .stopped
                .wait_timeout(guard, Duration::from_millis(20))
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }

    /// Runs this apartment's own queue inline on the calling thread until `predicate` returns
    /// `true`, or the apartment starts stopping. This lets a body running on a single-thread
    /// apartment call a blocking wait on another future scheduled on the *same* apartment without
    /// deadlocking - only meaningful when [`Self::supports_nested_pump`] is `true`.
    pub fn run_nested_pump_loop(&self, mut predicate: impl FnMut() -> bool) {
        while !predicate() {
            if self.is_stopping_or_stopped() {
                return;
            }

            let job = {
                let mut queues = self.lock_queues();
                queues.promote_due(Instant::now());
                queues.pop_ready(true)
            };

            match job {
                Some(job) => run_job(self.inner.name, job),
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn run_job(apartment_name: &'static str, job: Job) {
    CURRENT_APARTMENT.with(|current| current.set(Some(apartment_name)));
    let result = catch_unwind(AssertUnwindSafe(job));
    CURRENT_APARTMENT.with(|current| current.set(None));
    if let Err(panic) = result {
        tracing::error!(apartment = apartment_name, "a scheduled job panicked");
        drop(panic);
    }
}

fn worker_loop(core: Arc<Core>) {
    crate::non_blocking_thread::flag_current_thread();
    CURRENT_APARTMENT.with(|current| current.set(Some(core.name)));
    CURRENT_APARTMENT_HANDLE.with(|current| {
        *current.borrow_mut() = Some(Apartment {
            inner: Arc::clone(&core),
        });
    });

    loop {
        let job = {
            let mut queues = core
                .queues
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            loop {
                queues.promote_due(Instant::now());

                let idle_allowed = core.thread_count == 1
                    || core.busy_on_idle.load(Ordering::SeqCst) < core.thread_count - 1;

                if let Some(job) = queues.pop_ready(idle_allowed) {
                    break Some(job);
                }

                let stopping = core.state.load(Ordering::SeqCst) == STATE_STOPPING;
                if stopping && !queues.has_ready_work() {
                    break None;
                }

                let timeout = queues
                    .next_deadline()
                    .map_or(Duration::from_millis(200), |deadline| {
                        deadline.saturating_duration_since(Instant::now())
                    });

                queues = core
                    .work_available
                    .wait_timeout(queues, timeout.min(Duration::from_millis(200)))
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .0;
            }
        };

        let Some(job) = job else {
            break;
        };

        run_job(core.name, job);
    }

    finish_worker(&core);
}

fn finish_worker(core: &Arc<Core>) {
    if core.remaining_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
        let mut queues = core
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        queues.drain_all();
        drop(queues);

        core.state.store(STATE_STOPPED, Ordering::SeqCst);
        let _guard = core
            .stopped_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        core.stopped.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn schedule_before_start_runs_after_start() {
        let apartment = Apartment::new("test-before-start", 1);
        let (tx, rx) = mpsc::channel();
        apartment.schedule(0, Box::new(move || tx.send(()).unwrap()));
        apartment.start();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        apartment.async_stop();
        apartment.wait();
    }

    #[test]
    fn high_priority_runs_before_idle() {
        let apartment = Apartment::new("test-priority", 1);
        apartment.start();

        let (tx, rx) = mpsc::channel();
        let tx_low = tx.clone();
        let tx_high = tx;

        // Block the single worker so both jobs are queued before either runs.
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        apartment.schedule(0, Box::new(move || {
            gate_rx.recv().unwrap();
        }));

        apartment.schedule(-1, Box::new(move || tx_low.send("low").unwrap()));
        apartment.schedule(1, Box::new(move || tx_high.send("high").unwrap()));

        gate_tx.send(()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "high");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "low");

        apartment.async_stop();
        apartment.wait();
    }

    #[test]
    fn schedule_after_stopped_returns_zero() {
        let apartment = Apartment::new("test-after-stop", 1);
        apartment.start();
        apartment.async_stop();
        apartment.wait();

        assert_eq!(apartment.schedule(0, Box::new(|| {})), 0);
    }

    #[test]
    fn delayed_job_runs_after_delay_elapses() {
        let apartment = Apartment::new("test-delayed", 1);
        apartment.start();

        let start = Instant::now();
        let (tx, rx) = mpsc::channel();
        apartment.schedule_delayed(
            0,
            Duration::from_millis(50),
            Box::new(move || tx.send(Instant::now()).unwrap()),
        );

        let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired_at.duration_since(start) >= Duration::from_millis(40));

        apartment.async_stop();
        apartment.wait();
    }

    #[test]
    fn try_unschedule_prevents_delayed_job_from_running() {
        let apartment = Apartment::new("test-unschedule", 1);
        apartment.start();

        let ran = Arc::new(AtomicU64::new(0));
        let ran_clone = Arc::clone(&ran);
        let id = apartment.schedule_delayed(
            0,
            Duration::from_millis(100),
            Box::new(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(apartment.try_unschedule(id));

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        apartment.async_stop();
        apartment.wait();
    }

    #[test]
    fn is_current_is_true_only_inside_own_worker() {
        let apartment = Apartment::new("test-is-current", 1);
        apartment.start();

        assert!(!apartment.is_current());

        let apartment_clone = apartment.clone();
        let (tx, rx) = mpsc::channel();
        apartment.schedule(0, Box::new(move || {
            tx.send(apartment_clone.is_current()).unwrap();
        }));

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        apartment.async_stop();
        apartment.wait();
    }
}
