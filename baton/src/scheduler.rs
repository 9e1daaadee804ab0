// Copyright 2026 the baton authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::MAX_EVENTS;
use crate::error::{EventError, InitError, SpawnError};
use crate::sync::Semaphore;
use crate::task::{Handler, Priority, ReadySet, Task, TaskId, TaskRef};
use static_assertions::assert_impl_all;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

/// Process-wide slot holding the installed scheduler.
///
/// Exactly one scheduler may be installed at a time; [`shutdown`] clears the
/// slot so [`init`] may run again. The slot stays populated while `shutdown`
/// drains live tasks, because those tasks may still fork and signal.
static ACTIVE: Mutex<Option<Arc<Scheduler>>> = Mutex::new(None);

thread_local! {
    /// The task executing on this OS thread, if this is a task thread.
    static CURRENT: RefCell<Option<TaskRef>> = const { RefCell::new(None) };
}

fn current_task() -> Option<TaskRef> {
    CURRENT.with(|current| current.borrow().clone())
}

fn active() -> Option<Arc<Scheduler>> {
    ACTIVE.lock().unwrap().clone()
}

/// Installs a scheduler with the given time quantum and event count.
///
/// Every scheduling primitive invoked by a running task costs that task one
/// unit of `quantum`; a task that has used up its quantum rotates behind its
/// equal-priority peers. `event_count` bounds the event ids accepted by
/// [`wait`] and [`signal`] and may not exceed [`MAX_EVENTS`](crate::MAX_EVENTS).
///
/// # Errors
///
/// Fails without side effects if a scheduler is already installed, if
/// `event_count` exceeds the supported maximum, or if `quantum` is zero.
pub fn init(quantum: u32, event_count: usize) -> Result<(), InitError> {
    let mut slot = ACTIVE.lock().unwrap();
    if slot.is_some() {
        return Err(InitError::AlreadyRunning);
    }
    if event_count > MAX_EVENTS {
        return Err(InitError::TooManyEvents);
    }
    if quantum == 0 {
        return Err(InitError::ZeroQuantum);
    }

    tracing::debug!(quantum, event_count, "scheduler installed");
    *slot = Some(Arc::new(Scheduler::new(quantum, event_count)));
    Ok(())
}

/// Creates a task that will run `handler` at the given priority.
///
/// The task is backed by a fresh OS thread, parked until the dispatcher
/// selects it. If the calling thread is itself a task, the call costs the
/// caller one time unit, and a higher-priority child takes the processor
/// before `fork` returns.
///
/// # Errors
///
/// Fails if no scheduler is installed or if the OS refuses to create the
/// backing thread; the scheduler is left untouched in both cases.
pub fn fork<F>(priority: Priority, handler: F) -> Result<TaskId, SpawnError>
where
    F: FnOnce(Priority) + Send + 'static,
{
    let scheduler = active().ok_or(SpawnError::NotInitialized)?;
    scheduler.fork(Box::new(handler), priority)
}

/// Parks the running task until `event` is signaled.
///
/// Costs the running task one time unit. The task joins the event's FIFO
/// queue and the dispatcher hands the processor to the best remaining
/// candidate.
///
/// # Errors
///
/// Fails if no scheduler is installed or `event` is not below the configured
/// event count.
pub fn wait(event: usize) -> Result<(), EventError> {
    let scheduler = active().ok_or(EventError::NotInitialized)?;
    scheduler.wait(event)
}

/// Wakes every task parked on `event`, returning how many there were.
///
/// Costs the running task one time unit. Waiters re-enter the ready set in
/// their order of arrival on the event, each at the tail of its own
/// priority, and the dispatcher runs afterwards.
///
/// # Errors
///
/// Fails if no scheduler is installed or `event` is not below the configured
/// event count.
pub fn signal(event: usize) -> Result<usize, EventError> {
    let scheduler = active().ok_or(EventError::NotInitialized)?;
    scheduler.signal(event)
}

/// Spends one time unit of the running task.
///
/// This is the plain yield point: it may rotate the task behind its peers
/// or hand the processor to a higher-priority task. Without an installed
/// scheduler (or without a running task) it does nothing.
pub fn exec() {
    let Some(scheduler) = active() else { return };
    scheduler.exec();
}

/// Waits for every live task, joins their threads and uninstalls the
/// scheduler.
///
/// A no-op when no scheduler is installed. Afterwards [`init`] may be called
/// again.
pub fn shutdown() {
    let Some(scheduler) = active() else { return };
    scheduler.join_all();
    // Uninstall only after the drain: tasks may fork and signal while the
    // harness is blocked in here.
    ACTIVE.lock().unwrap().take();
    tracing::debug!("scheduler uninstalled");
}

/// A cooperative scheduler multiplexing forked tasks over OS threads, at
/// most one of which runs at any instant.
pub(crate) struct Scheduler {
    /// Units a task may consume before it must rotate behind its peers.
    quantum: u32,
    /// Number of valid event ids.
    events: usize,
    core: Mutex<Core>,
    /// Posted by a retiring task whenever `live` drops to zero.
    drain: Semaphore,
    next_id: AtomicU64,
}

assert_impl_all!(Scheduler: Send, Sync);

/// Scheduler state guarded by the core mutex.
///
/// Outside the window where the harness thread races a running task, only
/// the task holding the processor touches this, so the mutex is effectively
/// uncontended; it exists to make that remaining overlap well defined.
struct Core {
    ready: ReadySet,
    /// One FIFO of parked tasks per event id.
    waiters: Box<[VecDeque<TaskRef>]>,
    running: Option<TaskRef>,
    /// Completed descriptors retained for joining at shutdown.
    finished: Vec<TaskRef>,
    /// Tasks forked and not yet retired.
    live: usize,
}

// === impl Core ===

impl Core {
    fn new(event_count: usize) -> Self {
        Self {
            ready: ReadySet::new(),
            waiters: (0..event_count).map(|_| VecDeque::new()).collect(),
            running: None,
            finished: Vec::new(),
            live: 0,
        }
    }

    fn is_running(&self, task: &TaskRef) -> bool {
        self.running.as_ref().is_some_and(|t| Arc::ptr_eq(t, task))
    }

    /// Charges one time unit to the running task for the primitive being
    /// executed on its behalf.
    fn charge_running(&self) {
        if let Some(running) = &self.running {
            running.charge();
        }
    }

    /// Ensures the highest-priority runnable task is the one holding the
    /// processor.
    ///
    /// Returns the task whose gate must be posted once the core mutex is
    /// released, or `None` when the current runner keeps the processor. A
    /// returned task that *is* the old runner is a self-handoff (quantum
    /// rotation with no peers queued ahead); the caller posts nothing in
    /// that case.
    fn dispatch(&mut self, quantum: u32) -> Option<TaskRef> {
        let cur = self.running.clone();

        // Quantum rotation: an exhausted, non-waiting runner goes behind its
        // peers before the scan so it stays eligible at its own level. A
        // task parking on an event is already queued there instead.
        let mut rotated = false;
        if let Some(cur) = &cur {
            if cur.consumed() >= quantum && !cur.is_waiting() {
                self.ready.push(Arc::clone(cur));
                rotated = true;
            }
        }

        let top = self.ready.top()?;
        let preempts = match &cur {
            None => true,
            Some(cur) => {
                top > cur.priority() || cur.consumed() >= quantum || cur.is_waiting()
            }
        };
        if !preempts {
            debug_assert!(!rotated);
            return None;
        }

        let next = self.ready.pop()?;
        if let Some(cur) = &cur {
            cur.reset_consumed();
            // Preempted by a higher priority before exhausting its quantum:
            // the old runner stays runnable behind its peers.
            if !rotated && !cur.is_waiting() {
                self.ready.push(Arc::clone(cur));
            }
        }
        next.reset_consumed();
        self.running = Some(Arc::clone(&next));

        tracing::trace!(
            from = ?cur.as_ref().map(|t| t.id()),
            to = %next.id(),
            "handing off the processor"
        );
        Some(next)
    }
}

// === impl Scheduler ===

impl Scheduler {
    fn new(quantum: u32, event_count: usize) -> Self {
        Self {
            quantum,
            events: event_count,
            core: Mutex::new(Core::new(event_count)),
            drain: Semaphore::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// Locks the core on behalf of `task`, parking the calling thread until
    /// the dispatcher has made `task` the runner.
    ///
    /// A task can lose the processor while it executes user code (a
    /// harness-thread `fork` may install a higher-priority sibling), so it
    /// must not touch scheduler state until it is handed back. A stale gate
    /// permit, left by a selection that raced one of these parks, is
    /// consumed and the check repeats, which keeps posts and waits balanced.
    fn lock_as_runner(&self, task: &TaskRef) -> MutexGuard<'_, Core> {
        loop {
            let core = self.core.lock().unwrap();
            if core.is_running(task) {
                return core;
            }
            drop(core);
            task.gate().acquire();
        }
    }

    /// Serializes entry into a scheduling primitive, returning the locked
    /// core and the calling task (if the caller is a task thread).
    fn enter(&self) -> (MutexGuard<'_, Core>, Option<TaskRef>) {
        match current_task() {
            Some(task) => {
                let core = self.lock_as_runner(&task);
                (core, Some(task))
            }
            None => (self.core.lock().unwrap(), None),
        }
    }

    /// Completes a dispatch decision once the core mutex has been released:
    /// posts the new runner's gate and, if the caller itself just lost the
    /// processor, parks it until it is rescheduled.
    fn handoff(&self, next: Option<TaskRef>, caller: Option<&TaskRef>) {
        let Some(next) = next else { return };
        if let Some(caller) = caller {
            if Arc::ptr_eq(&next, caller) {
                // Self-handoff: posting our own gate and immediately taking
                // it back would cancel out.
                return;
            }
            next.gate().release();
            drop(self.lock_as_runner(caller));
        } else {
            next.gate().release();
        }
    }

    fn fork(self: Arc<Self>, handler: Handler, priority: Priority) -> Result<TaskId, SpawnError> {
        let (mut core, caller) = self.enter();

        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task: TaskRef = Arc::new(Task::new(id, priority, handler));

        // Spawn before touching any scheduling state, so a refused spawn
        // leaves the scheduler exactly as it was. The thread parks on the
        // task's gate until the dispatcher selects it for the first time.
        let join = thread::Builder::new()
            .name(format!("baton-task-{id}"))
            .spawn({
                let scheduler = Arc::clone(&self);
                let task = Arc::clone(&task);
                move || task_main(&scheduler, &task)
            })?;
        task.set_join(join);

        // The fork itself costs the caller one time unit.
        core.charge_running();
        core.live += 1;
        core.ready.push(Arc::clone(&task));
        tracing::trace!(task = %id, priority = %priority, live = core.live, "forked");

        let next = core.dispatch(self.quantum);
        drop(core);
        self.handoff(next, caller.as_ref());
        Ok(id)
    }

    fn wait(&self, event: usize) -> Result<(), EventError> {
        if event >= self.events {
            return Err(EventError::UnknownEvent);
        }
        let (mut core, caller) = self.enter();
        core.charge_running();

        let Some(running) = core.running.clone() else {
            // Nothing holds the processor, so there is nothing to park.
            return Ok(());
        };
        running.set_waiting(true);
        core.waiters[event].push_back(Arc::clone(&running));
        tracing::trace!(task = %running.id(), event, "parked on event");

        let next = core.dispatch(self.quantum);
        drop(core);
        self.handoff(next, caller.as_ref());
        Ok(())
    }

    fn signal(&self, event: usize) -> Result<usize, EventError> {
        if event >= self.events {
            return Err(EventError::UnknownEvent);
        }
        let (mut core, caller) = self.enter();
        core.charge_running();

        // Drain the whole queue in arrival order; each waiter re-enters the
        // ready set at the tail of its own priority.
        let woken = core.waiters[event].len();
        while let Some(task) = core.waiters[event].pop_front() {
            task.set_waiting(false);
            core.ready.push(task);
        }
        if woken > 0 {
            tracing::trace!(event, woken, "signaled");
        }

        let next = core.dispatch(self.quantum);
        drop(core);
        self.handoff(next, caller.as_ref());
        Ok(woken)
    }

    fn exec(&self) {
        let (mut core, caller) = self.enter();
        core.charge_running();
        let next = core.dispatch(self.quantum);
        drop(core);
        self.handoff(next, caller.as_ref());
    }

    /// Waits until every live task has retired, then joins their threads and
    /// drops the retained descriptors.
    fn join_all(&self) {
        // The drain gate is posted on every transition of `live` to zero. A
        // harness fork after such a transition leaves a stale permit behind,
        // so the count is re-checked until it is really zero.
        let finished = loop {
            {
                let mut core = self.core.lock().unwrap();
                if core.live == 0 {
                    debug_assert!(core.ready.is_empty());
                    break mem::take(&mut core.finished);
                }
            }
            self.drain.acquire();
        };

        let mut panicked = 0_usize;
        for task in finished {
            if let Some(join) = task.take_join() {
                if join.join().is_err() {
                    panicked += 1;
                }
            }
        }
        if panicked > 0 {
            tracing::warn!(panicked, "task handlers panicked");
        }
        tracing::debug!("scheduler drained");
    }
}

/// Entry point of every task's OS thread.
///
/// Parks until dispatched for the first time, runs the handler, then
/// retires: the descriptor moves to the finished list, a successor is
/// dispatched with no incumbent, and the live count drops, releasing the
/// drain gate when it reaches zero.
fn task_main(scheduler: &Scheduler, task: &TaskRef) {
    drop(scheduler.lock_as_runner(task));

    CURRENT.with(|current| *current.borrow_mut() = Some(Arc::clone(task)));
    let handler = task.take_handler().expect("task handler already taken");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(task.priority())));
    if outcome.is_err() {
        tracing::warn!(task = %task.id(), "task handler panicked");
    }
    CURRENT.with(|current| current.borrow_mut().take());

    // Retirement must run as the task holding the processor; a harness fork
    // may have taken it away while the handler ran.
    let mut core = scheduler.lock_as_runner(task);
    core.finished.push(Arc::clone(task));
    core.running = None;
    let next = core.dispatch(scheduler.quantum);
    core.live -= 1;
    let drained = core.live == 0;
    tracing::trace!(task = %task.id(), live = core.live, "retired");
    drop(core);

    scheduler.handoff(next, None);
    if drained {
        scheduler.drain.release();
    }
    if let Err(payload) = outcome {
        // Leave the thread through the original unwind so the panic is also
        // visible as a join error at shutdown.
        panic::resume_unwind(payload);
    }
}
