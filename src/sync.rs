// Synchronization helpers shared by the tracer and the per-thread state machines
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

// Poison recovery for Mutex, so one panicking holder does not cascade into every later locker
pub(crate) trait MutexPoisonRecover<T> {
    fn lock_or_poison(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexPoisonRecover<T> for Mutex<T> {
    fn lock_or_poison(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// Condvar waits with the same poison recovery
pub(crate) trait CondvarPoisonRecover {
    fn wait_or_poison<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T>;
    fn wait_deadline_or_poison<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Instant,
    ) -> (MutexGuard<'a, T>, bool);
}

impl CondvarPoisonRecover for Condvar {
    fn wait_or_poison<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    // returns false once the deadline has passed
    fn wait_deadline_or_poison<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Instant,
    ) -> (MutexGuard<'a, T>, bool) {
        let now = Instant::now();
        if now >= deadline {
            return (guard, false);
        }
        let timeout = deadline.saturating_duration_since(now).max(Duration::from_micros(1));
        let (guard, _) = self
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|e| e.into_inner());
        (guard, Instant::now() < deadline)
    }
}

// Counting wait primitive: each post releases exactly one wait
pub(crate) struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    pub(crate) const fn new() -> Self {
        Self {
            count: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn post(&self) {
        let mut count = self.count.lock_or_poison();
        *count += 1;
        self.condvar.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut count = self.count.lock_or_poison();
        while *count == 0 {
            count = self.condvar.wait_or_poison(count);
        }
        *count -= 1;
    }
}
