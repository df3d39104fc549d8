use std::sync::{Mutex, PoisonError};

use tracing::warn;

use crate::error::{BoxError, SingletonError};
use crate::slot::{Access, AccessPath, SlotState};
use crate::strategy::InitializationStrategy;

use super::{construct, Progress};

/// Every access, including every read after initialization, goes through one
/// mutex. Correct by total ordering, and pays for it on the hot path.
pub(crate) struct LockedCell<T> {
    instance: Mutex<Option<Box<T>>>,
    progress: Progress,
}

impl<T> LockedCell<T> {
    pub(crate) const fn new() -> Self {
        Self {
            instance: Mutex::new(None),
            progress: Progress::new(),
        }
    }

    pub(crate) fn get_or_init<F>(&self, init: &F) -> Result<Access<'_, T>, SingletonError>
    where
        F: Fn() -> Result<T, BoxError>,
    {
        let epoch = self.progress.epoch();
        // A constructor that panicked poisons the lock but leaves `None` behind,
        // which is a valid state to continue from.
        let mut guard = self.instance.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = guard.as_deref() {
            let existing: *const T = existing;
            // SAFETY: the box is only replaced or dropped through `&mut self`,
            // so its contents outlive the `&self` borrow.
            return Ok(Access::new(unsafe { &*existing }, AccessPath::Locked));
        }

        if self.progress.failed_since(epoch) {
            warn!(
                strategy = %InitializationStrategy::GloballyLockedLazy,
                "construction failed while waiting for the lock"
            );
            return Err(SingletonError::ConcurrentFailure {
                strategy: InitializationStrategy::GloballyLockedLazy,
            });
        }

        let attempt = self.progress.begin();
        let value = construct(InitializationStrategy::GloballyLockedLazy, init)?;
        let stored: *const T = &**guard.insert(Box::new(value));
        attempt.succeed();

        // SAFETY: as above.
        Ok(Access::new(unsafe { &*stored }, AccessPath::Constructed))
    }

    pub(crate) fn peek(&self) -> Option<&T> {
        let guard = self.instance.lock().unwrap_or_else(PoisonError::into_inner);
        let existing: *const T = guard.as_deref()?;
        // SAFETY: see `get_or_init`.
        Some(unsafe { &*existing })
    }

    pub(crate) fn state(&self) -> SlotState {
        self.progress.state()
    }

    #[cfg(any(test, feature = "harness"))]
    pub(crate) fn reset(&mut self) {
        *self.instance.get_mut().unwrap_or_else(PoisonError::into_inner) = None;
        self.progress.clear();
    }
}
