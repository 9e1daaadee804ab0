// Copyright 2026 the baton authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::{Condvar, Mutex};

/// A counting semaphore built from a mutex and a condition variable.
///
/// The scheduler uses one of these per task as that task's *gate*: the
/// dispatcher posts a permit to hand the processor to the task, and the
/// task's own thread consumes a permit to take it. The shutdown drain gate
/// is the same primitive with a single post/wait pair.
///
/// Permits released while nobody is blocked are retained, so a post/wait
/// pair synchronizes regardless of which side arrives first. Acquisition
/// order among concurrent waiters is unspecified; the scheduler never has
/// more than one thread blocked on the same gate.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    notify: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            notify: Condvar::new(),
        }
    }

    /// Blocks the calling thread until a permit is available, then takes it.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.notify.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    /// Makes one permit available, waking a blocked [`acquire`] if there is
    /// one.
    ///
    /// [`acquire`]: Semaphore::acquire
    pub fn release(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::sync::atomic::{AtomicBool, Ordering};
    use crate::loom::thread;

    #[test]
    fn handoff_wakes_the_waiter() {
        // Thread A parks on the gate; the main thread posts it and A must
        // observe the wake-up, whichever side gets there first.
        crate::loom::model(|| {
            let gate = Arc::new(Semaphore::new(0));
            let woken = Arc::new(AtomicBool::new(false));

            let waiter = thread::spawn({
                let gate = Arc::clone(&gate);
                let woken = Arc::clone(&woken);
                move || {
                    gate.acquire();
                    woken.store(true, Ordering::Release);
                }
            });

            gate.release();
            waiter.join().unwrap();

            assert!(woken.load(Ordering::Acquire));
        });
    }

    #[test]
    fn permits_outlive_the_post() {
        crate::loom::model(|| {
            let gate = Semaphore::new(0);
            gate.release();
            // The permit was retained, so this must not block.
            gate.acquire();
        });
    }

    #[test]
    fn initial_permits_are_spendable() {
        crate::loom::model(|| {
            let gate = Semaphore::new(2);
            gate.acquire();
            gate.acquire();
        });
    }

    #[test]
    fn one_post_per_waiter() {
        crate::loom::model(|| {
            let gate = Arc::new(Semaphore::new(0));

            let waiters: Vec<_> = (0..2)
                .map(|_| {
                    let gate = Arc::clone(&gate);
                    thread::spawn(move || gate.acquire())
                })
                .collect();

            gate.release();
            gate.release();

            for waiter in waiters {
                waiter.join().unwrap();
            }
        });
    }
}
