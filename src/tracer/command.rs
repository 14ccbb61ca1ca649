// Units of work for the command thread
use crate::error::{Error, Result};
use crate::sync::{CondvarPoisonRecover, MutexPoisonRecover};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex};

pub(super) type Job = Box<dyn FnOnce() + Send>;

// A panicking action must not take the drain loop down with it
pub(super) fn run_guarded<R>(action: impl FnOnce() -> Result<R>) -> Result<R> {
    panic::catch_unwind(AssertUnwindSafe(action)).unwrap_or_else(|_| Err(Error::CommandPanicked))
}

// Where a synchronous submitter waits for its action's result
pub(super) struct ResultSlot<R> {
    value: Mutex<Option<Result<R>>>,
    filled: Condvar,
}

impl<R> ResultSlot<R> {
    pub(super) fn new() -> Self {
        Self {
            value: Mutex::new(None),
            filled: Condvar::new(),
        }
    }

    pub(super) fn fill(&self, result: Result<R>) {
        *self.value.lock_or_poison() = Some(result);
        self.filled.notify_all();
    }

    pub(super) fn take(&self) -> Result<R> {
        let mut value = self.value.lock_or_poison();
        loop {
            if let Some(result) = value.take() {
                return result;
            }
            value = self.filled.wait_or_poison(value);
        }
    }
}
