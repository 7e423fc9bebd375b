//! Startup barrier over required query builders.
//!
//! Builders register independently and asynchronously; initialization-time
//! operations that need a known set of them block here until the set is
//! covered. A builder unbinding after readiness was signalled is legal —
//! queries dispatched afterwards fail open to match-all, which is the
//! documented degradation, not a bug.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::time::{Duration, Instant};

pub struct BuilderAvailability {
    required: HashSet<String>,
    bound: Mutex<HashSet<String>>,
    all_available: Condvar,
}

impl BuilderAvailability {
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(required: I) -> Self {
        BuilderAvailability {
            required: required.into_iter().map(Into::into).collect(),
            bound: Mutex::new(HashSet::new()),
            all_available: Condvar::new(),
        }
    }

    /// Records a builder registration. Idempotent; broadcasts to waiters
    /// whenever the full required set is covered.
    pub fn bind(&self, id: impl Into<String>) {
        let mut bound = self.bound.lock();
        bound.insert(id.into());
        if self.required.is_subset(&bound) {
            self.all_available.notify_all();
        }
    }

    /// Records a builder deregistration. Idempotent.
    pub fn unbind(&self, id: &str) {
        self.bound.lock().remove(id);
    }

    pub fn are_all_available(&self) -> bool {
        self.required.is_subset(&self.bound.lock())
    }

    pub fn missing_ids(&self) -> Vec<String> {
        let bound = self.bound.lock();
        let mut missing: Vec<String> = self
            .required
            .difference(&bound)
            .cloned()
            .collect();
        missing.sort();
        missing
    }

    /// Blocks until every required builder id is bound, or the timeout
    /// elapses. Returns whether the set was covered. Never panics on
    /// timeout; waiters recompute their remaining budget against a
    /// monotonic clock so spurious wakeups do not extend the wait.
    pub fn wait_for_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut bound = self.bound.lock();
        while !self.required.is_subset(&bound) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let result = self.all_available.wait_for(&mut bound, deadline - now);
            if result.timed_out() && !self.required.is_subset(&bound) {
                return false;
            }
        }
        true
    }
}
