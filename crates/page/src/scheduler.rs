//! Cooperative task scheduler.
//!
//! Two heaps keyed by monotonic run-at time: high priority runs first,
//! low priority only when the high queue is empty or its head is not
//! yet due. Payloads are plain data; the page executes them and may
//! re-add a task to reschedule it. Ties on run-at keep insertion order
//! so tests are deterministic.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

use log::trace;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// One scheduled task, handed back to the executor when due.
pub struct ScheduledTask<T> {
    pub handle: TaskHandle,
    pub name: &'static str,
    pub payload: T,
    pub low_priority: bool,
}

struct Entry<T> {
    due: Instant,
    seq: u64,
    task: ScheduledTask<T>,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert for earliest-first.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct Scheduler<T> {
    high: BinaryHeap<Entry<T>>,
    low: BinaryHeap<Entry<T>>,
    cancelled: HashSet<TaskHandle>,
    next_handle: u64,
    next_seq: u64,
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            high: BinaryHeap::new(),
            low: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_handle: 0,
            next_seq: 0,
        }
    }

    /// Schedule `payload` to run `delay` from now. Names are for
    /// logging only; duplicates are fine.
    pub fn add(
        &mut self,
        payload: T,
        delay: Duration,
        name: &'static str,
        low_priority: bool,
    ) -> TaskHandle {
        self.add_at(payload, Instant::now() + delay, name, low_priority)
    }

    /// Like [`Scheduler::add`] with an explicit run-at time.
    pub fn add_at(
        &mut self,
        payload: T,
        due: Instant,
        name: &'static str,
        low_priority: bool,
    ) -> TaskHandle {
        self.next_handle += 1;
        self.next_seq += 1;
        let handle = TaskHandle(self.next_handle);
        trace!("scheduler: add {name} (low={low_priority})");
        let entry = Entry {
            due,
            seq: self.next_seq,
            task: ScheduledTask {
                handle,
                name,
                payload,
                low_priority,
            },
        };
        if low_priority {
            self.low.push(entry);
        } else {
            self.high.push(entry);
        }
        handle
    }

    /// Forget a task. Lazy: the entry is skipped when it comes due.
    pub fn cancel(&mut self, handle: TaskHandle) {
        self.cancelled.insert(handle);
    }

    /// Pop every task due at `now`, high priority first, in run-at
    /// order. The caller executes them and may re-`add` to reschedule;
    /// tasks must not call back into this method.
    pub fn take_due(&mut self, now: Instant) -> Vec<ScheduledTask<T>> {
        let mut due = Vec::new();
        Self::drain_heap(&mut self.high, &self.cancelled, now, &mut due);
        if self.high.peek().map_or(true, |e| e.due > now) {
            Self::drain_heap(&mut self.low, &self.cancelled, now, &mut due);
        }
        for task in &due {
            self.cancelled.remove(&task.handle);
        }
        due
    }

    fn drain_heap(
        heap: &mut BinaryHeap<Entry<T>>,
        cancelled: &HashSet<TaskHandle>,
        now: Instant,
        out: &mut Vec<ScheduledTask<T>>,
    ) {
        while heap.peek().is_some_and(|e| e.due <= now) {
            if let Some(entry) = heap.pop() {
                if !cancelled.contains(&entry.task.handle) {
                    out.push(entry.task);
                }
            }
        }
    }

    /// Milliseconds until the next runnable task, or `None` when the
    /// queues are empty.
    pub fn ms_until_next(&self, now: Instant) -> Option<u64> {
        let next = match (self.high.peek(), self.low.peek()) {
            (Some(h), Some(l)) => h.due.min(l.due),
            (Some(h), None) => h.due,
            (None, Some(l)) => l.due,
            (None, None) => return None,
        };
        Some(next.saturating_duration_since(now).as_millis() as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}
