// Copyright 2026 the baton authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use lazy_static::lazy_static;
use std::sync::{Mutex, MutexGuard};

lazy_static! {
    /// Serializes every test that installs the process-wide scheduler.
    static ref SCHEDULER_TESTS: Mutex<()> = Mutex::new(());
}

/// Takes the scheduler-test lock and makes sure tracing output is wired up.
///
/// The guard survives a previous test's panic; poisoning is ignored on
/// purpose so one failing scenario doesn't cascade.
pub(crate) fn serialize() -> MutexGuard<'static, ()> {
    trace_init();
    SCHEDULER_TESTS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn trace_init() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
