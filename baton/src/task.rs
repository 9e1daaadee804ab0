// Copyright 2026 the baton authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use crate::sync::Semaphore;
use core::fmt;
use core::num::NonZeroU8;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Number of distinct priority levels.
pub(crate) const PRIORITY_LEVELS: usize = 6;

/// Scheduling priority of a task.
///
/// Levels range from [`Priority::MIN`] (0) to [`Priority::MAX`] (5); a
/// higher level always preempts a lower one at the next scheduling
/// primitive. Construction is checked, so an out-of-range level cannot
/// reach the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    /// The lowest priority level.
    pub const MIN: Priority = Priority(0);
    /// The highest priority level.
    pub const MAX: Priority = Priority((PRIORITY_LEVELS as u8) - 1);

    /// Returns `None` if `level` is greater than [`Priority::MAX`].
    pub const fn new(level: u8) -> Option<Priority> {
        if level <= Self::MAX.0 {
            Some(Priority(level))
        } else {
            None
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a forked task, unique within one scheduler lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) const fn new(n: u64) -> Self {
        TaskId(n)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The user entry point of a task, invoked once with the task's priority.
pub(crate) type Handler = Box<dyn FnOnce(Priority) + Send + 'static>;

/// Per-task bookkeeping, shared between the scheduler and the task's own OS
/// thread through an [`Arc`].
///
/// `consumed` and `waiting` are only ever written while the scheduler core
/// is locked; they are atomics solely because the descriptor is shared
/// across threads.
pub(crate) struct Task {
    id: TaskId,
    priority: Priority,
    /// Units of the quantum used since the task last started running.
    consumed: AtomicU32,
    /// Set while the task is parked on an event queue.
    waiting: AtomicBool,
    /// Taken exactly once, by the task's own thread.
    handler: Mutex<Option<Handler>>,
    /// Gate pairing posts from the dispatcher with waits by the task's own
    /// thread.
    gate: Semaphore,
    /// Taken at shutdown for joining.
    join: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) type TaskRef = Arc<Task>;

// === impl Task ===

impl Task {
    pub(crate) fn new(id: TaskId, priority: Priority, handler: Handler) -> Self {
        Self {
            id,
            priority,
            consumed: AtomicU32::new(0),
            waiting: AtomicBool::new(false),
            handler: Mutex::new(Some(handler)),
            gate: Semaphore::new(0),
            join: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn gate(&self) -> &Semaphore {
        &self.gate
    }

    pub(crate) fn consumed(&self) -> u32 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Charges one unit of the quantum for a scheduling primitive.
    pub(crate) fn charge(&self) {
        let used = self.consumed.load(Ordering::Relaxed);
        self.consumed.store(used.saturating_add(1), Ordering::Relaxed);
    }

    pub(crate) fn reset_consumed(&self) {
        self.consumed.store(0, Ordering::Relaxed);
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Relaxed)
    }

    pub(crate) fn set_waiting(&self, waiting: bool) {
        self.waiting.store(waiting, Ordering::Relaxed);
    }

    pub(crate) fn take_handler(&self) -> Option<Handler> {
        self.handler.lock().unwrap().take()
    }

    pub(crate) fn set_join(&self, handle: JoinHandle<()>) {
        *self.join.lock().unwrap() = Some(handle);
    }

    pub(crate) fn take_join(&self) -> Option<JoinHandle<()>> {
        self.join.lock().unwrap().take()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("consumed", &self.consumed())
            .field("waiting", &self.is_waiting())
            .finish_non_exhaustive()
    }
}

/// Ready queues indexed by priority, with an occupancy bitmap.
///
/// Selection is by highest non-empty level; within a level tasks leave in
/// the order they arrived.
pub(crate) struct ReadySet {
    queues: [VecDeque<TaskRef>; PRIORITY_LEVELS],
    occupancy: u8,
}

// === impl ReadySet ===

impl ReadySet {
    pub(crate) fn new() -> Self {
        Self {
            queues: std::array::from_fn(|_| VecDeque::new()),
            occupancy: 0,
        }
    }

    /// Appends `task` at the tail of its priority's queue.
    pub(crate) fn push(&mut self, task: TaskRef) {
        let i = task.priority().index();
        self.occupancy |= 1u8 << i;
        self.queues[i].push_back(task);
    }

    /// The highest priority with at least one queued task.
    pub(crate) fn top(&self) -> Option<Priority> {
        msb(self.occupancy).and_then(Priority::new)
    }

    /// Pops the head of the highest non-empty queue.
    pub(crate) fn pop(&mut self) -> Option<TaskRef> {
        let i = self.top()?.index();
        let task = self.queues[i].pop_front();
        if self.queues[i].is_empty() {
            self.occupancy &= !(1u8 << i);
        }
        task
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.occupancy == 0
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }
}

impl fmt::Debug for ReadySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (level, queue) in self.queues.iter().enumerate() {
            map.entry(&level, &queue.iter().map(|t| t.id()).collect::<Vec<_>>());
        }
        map.finish()
    }
}

/// Returns the most significant set bit.
fn msb(n: u8) -> Option<u8> {
    NonZeroU8::new(n).map(|n| (u8::BITS - 1 - n.leading_zeros()) as u8)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn task(id: u64, priority: u8) -> TaskRef {
        Arc::new(Task::new(
            TaskId::new(id),
            Priority::new(priority).unwrap(),
            Box::new(|_| {}),
        ))
    }

    #[test]
    fn priority_is_checked() {
        assert_eq!(Priority::new(0), Some(Priority::MIN));
        assert_eq!(Priority::new(5), Some(Priority::MAX));
        assert_eq!(Priority::new(6), None);
        assert!(Priority::new(3).unwrap() > Priority::new(2).unwrap());
    }

    #[test]
    fn msb_picks_the_highest_bit() {
        assert_eq!(msb(0), None);
        assert_eq!(msb(0b1), Some(0));
        assert_eq!(msb(0b10_0001), Some(5));
        assert_eq!(msb(u8::MAX), Some(7));
    }

    #[test]
    fn charge_is_monotonic_until_reset() {
        let t = task(1, 0);
        t.charge();
        t.charge();
        assert_eq!(t.consumed(), 2);
        t.reset_consumed();
        assert_eq!(t.consumed(), 0);
    }

    #[test]
    fn ready_set_prefers_the_highest_level() {
        let mut ready = ReadySet::new();
        ready.push(task(1, 1));
        ready.push(task(2, 4));
        ready.push(task(3, 0));

        assert_eq!(ready.top(), Priority::new(4));
        assert_eq!(ready.pop().unwrap().id(), TaskId::new(2));
        assert_eq!(ready.pop().unwrap().id(), TaskId::new(1));
        assert_eq!(ready.pop().unwrap().id(), TaskId::new(3));
        assert!(ready.pop().is_none());
        assert!(ready.is_empty());
    }

    #[test]
    fn ready_set_is_fifo_within_a_level() {
        let mut ready = ReadySet::new();
        for id in 1..=4 {
            ready.push(task(id, 3));
        }
        for id in 1..=4 {
            assert_eq!(ready.pop().unwrap().id(), TaskId::new(id));
        }
    }

    #[test]
    fn occupancy_tracks_emptied_levels() {
        let mut ready = ReadySet::new();
        ready.push(task(1, 5));
        ready.push(task(2, 2));
        let _ = ready.pop();
        assert_eq!(ready.top(), Priority::new(2));
        let _ = ready.pop();
        assert!(ready.is_empty());
        assert_eq!(ready.top(), None);
    }

    proptest::proptest! {
        /// Popping the whole set yields every level's tasks in arrival
        /// order, higher levels strictly first.
        #[test]
        fn drains_by_level_then_arrival(levels in proptest::collection::vec(0u8..=5, 0..64)) {
            let mut ready = ReadySet::new();
            for (id, level) in levels.iter().enumerate() {
                ready.push(task(id as u64, *level));
            }

            let mut expected = Vec::new();
            for level in (0u8..=5).rev() {
                for (id, l) in levels.iter().enumerate() {
                    if *l == level {
                        expected.push(id as u64);
                    }
                }
            }

            let mut drained = Vec::new();
            while let Some(t) = ready.pop() {
                drained.push(t.id());
            }
            let expected: Vec<_> = expected.into_iter().map(TaskId::new).collect();
            proptest::prop_assert_eq!(drained, expected);
            proptest::prop_assert!(ready.is_empty());
            proptest::prop_assert_eq!(ready.len(), 0);
        }
    }
}
