// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Instant;

/// A unit of work accepted by an apartment. Always run to completion on a worker thread; the
/// apartment never polls it.
pub type Job = Box<dyn FnOnce() + Send>;

/// The three priority classes an immediately-ready job is sorted into.
///
/// `priority > 0` maps to [`Priority::High`], `priority == 0` to [`Priority::Normal`], and
/// `priority < 0` to [`Priority::LowIdle`]. A job promoted out of the delayed queue always enters
/// [`Priority::LowIdle`] regardless of the priority it was scheduled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Runs before any normal or idle work.
    High,
    /// The default priority class.
    Normal,
    /// Runs only when no high/normal work is starved for a worker.
    LowIdle,
}

impl Priority {
    /// Classifies a raw integer priority per the apartment's scheduling policy (see module docs).
    #[must_use]
    pub fn classify(priority: i32) -> Self {
        match priority.cmp(&0) {
            Ordering::Greater => Self::High,
            Ordering::Equal => Self::Normal,
            Ordering::Less => Self::LowIdle,
        }
    }
}

struct DelayedEntry {
    id: u64,
    deadline: Instant,
    job: Job,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline to sort first, so reverse.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// The three ready-work queues plus the time-ordered delayed queue of a single apartment.
///
/// Owned behind a single mutex: an apartment never holds this lock while running user code.
pub struct Queues {
    high: VecDeque<(u64, Job)>,
    normal: VecDeque<(u64, Job)>,
    low_idle: VecDeque<(u64, Job)>,
    delayed: BinaryHeap<DelayedEntry>,
    // Tracks live ids across all four queues so try_unschedule can answer in O(1) for the common
    // "already ran or doesn't exist" case without a linear scan of the ready queues.
    delayed_ids: std::collections::HashSet<u64>,
}

impl Queues {
    pub fn new() -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low_idle: VecDeque::new(),
            delayed: BinaryHeap::new(),
            delayed_ids: std::collections::HashSet::new(),
        }
    }

    pub fn push_ready(&mut self, id: u64, priority: Priority, job: Job) {
        match priority {
            Priority::High => self.high.push_back((id, job)),
            Priority::Normal => self.normal.push_back((id, job)),
            Priority::LowIdle => self.low_idle.push_back((id, job)),
        }
    }

    pub fn push_delayed(&mut self, id: u64, deadline: Instant, job: Job) {
        self.delayed_ids.insert(id);
        self.delayed.push(DelayedEntry { id, deadline, job });
    }

    /// Returns `true` if any ready queue has work, ignoring the delayed queue (the caller's timer
    /// thread handles delayed promotion separately).
    pub fn has_ready_work(&self) -> bool {
        !self.high.is_empty() || !self.normal.is_empty() || !self.low_idle.is_empty()
    }

    pub fn is_fully_empty(&self) -> bool {
        self.high.is_empty()
            && self.normal.is_empty()
            && self.low_idle.is_empty()
            && self.delayed.is_empty()
    }

    /// Pops the next job a worker should run, honouring the "reserve at least one worker for
    /// non-idle work" policy: a worker only takes idle work when `idle_workers_allowed` is `true`.
    pub fn pop_ready(&mut self, idle_workers_allowed: bool) -> Option<Job> {
        if let Some((_, job)) = self.high.pop_front() {
            return Some(job);
        }
        if let Some((_, job)) = self.normal.pop_front() {
            return Some(job);
        }
        if idle_workers_allowed
            && let Some((_, job)) = self.low_idle.pop_front()
        {
            return Some(job);
        }
        None
    }

    /// Returns the earliest delayed deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|entry| entry.deadline)
    }

    /// Promotes every delayed entry whose deadline has passed into the low-idle queue.
    pub fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.peek() {
            if entry.deadline > now {
                break;
            }
            let DelayedEntry { id, job, .. } = self.delayed.pop().expect("just peeked Some");
            self.delayed_ids.remove(&id);
            self.low_idle.push_back((id, job));
        }
    }

    /// Best-effort removal of `id` from the delayed or low-idle queues. Returns `true` if found
    /// and removed.
    pub fn try_unschedule(&mut self, id: u64) -> bool {
        if self.delayed_ids.remove(&id) {
            let items: Vec<_> = self.delayed.drain().collect();
            let mut removed = false;
            for entry in items {
                if entry.id == id {
                    removed = true;
                } else {
                    self.delayed.push(entry);
                }
            }
            return removed;
        }

        if let Some(position) = self.low_idle.iter().position(|(job_id, _)| *job_id == id) {
            self.low_idle.remove(position);
            return true;
        }

        false
    }

    /// Drains every queued job without running it, used when the apartment reaches `stopped`.
    pub fn drain_all(&mut self) {
        self.high.clear();
        self.normal.clear();
        self.low_idle.clear();
        self.delayed.clear();
        self.delayed_ids.clear();
    }
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_priority_buckets() {
        assert_eq!(Priority::classify(5), Priority::High);
        assert_eq!(Priority::classify(0), Priority::Normal);
        assert_eq!(Priority::classify(-5), Priority::LowIdle);
    }

    #[test]
    fn high_beats_normal_beats_idle() {
        let mut queues = Queues::new();
        queues.push_ready(1, Priority::LowIdle, Box::new(|| {}));
        queues.push_ready(2, Priority::Normal, Box::new(|| {}));
        queues.push_ready(3, Priority::High, Box::new(|| {}));

        assert!(queues.pop_ready(true).is_some()); // high
        assert!(!queues.high.is_empty().then_some(()).is_some()); // sanity: high now empty path below
        assert_eq!(queues.high.len(), 0);
        assert_eq!(queues.normal.len(), 1);
        assert_eq!(queues.low_idle.len(), 1);
    }

    #[test]
    fn idle_work_withheld_when_disallowed() {
        let mut queues = Queues::new();
        queues.push_ready(1, Priority::LowIdle, Box::new(|| {}));
        assert!(queues.pop_ready(false).is_none());
        assert!(queues.pop_ready(true).is_some());
    }

    #[test]
    fn delayed_entries_promote_once_due() {
        let mut queues = Queues::new();
        let now = Instant::now();
        queues.push_delayed(1, now - std::time::Duration::from_millis(1), Box::new(|| {}));
        queues.push_delayed(2, now + std::time::Duration::from_secs(60), Box::new(|| {}));

        queues.promote_due(now);

        assert_eq!(queues.low_idle.len(), 1);
        assert_eq!(queues.delayed.len(), 1);
    }

    #[test]
    fn unschedule_removes_from_delayed_or_idle_only() {
        let mut queues = Queues::new();
        queues.push_delayed(1, Instant::now() + std::time::Duration::from_secs(60), Box::new(|| {}));
        assert!(queues.try_unschedule(1));
        assert!(!queues.try_unschedule(1));

        queues.push_ready(2, Priority::LowIdle, Box::new(|| {}));
        assert!(queues.try_unschedule(2));

        queues.push_ready(3, Priority::High, Box::new(|| {}));
        assert!(!queues.try_unschedule(3));
    }
}
