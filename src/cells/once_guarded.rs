use tracing::warn;

use crate::error::{BoxError, SingletonError};
use crate::once::{OnceError, OnceGuard, OnceOutcome};
use crate::slot::{Access, AccessPath, SlotState};
use crate::strategy::InitializationStrategy;

use super::construct;

/// Hands the whole problem to [`OnceGuard`]; no ordering reasoning lives here.
pub(crate) struct OnceGuardedCell<T> {
    once: OnceGuard<T>,
}

impl<T> OnceGuardedCell<T> {
    pub(crate) const fn new() -> Self {
        Self {
            once: OnceGuard::new(),
        }
    }

    pub(crate) fn get_or_init<F>(&self, init: &F) -> Result<Access<'_, T>, SingletonError>
    where
        F: Fn() -> Result<T, BoxError>,
    {
        let strategy = InitializationStrategy::OnceGuardedLazy;
        match self.once.get_or_try_init(|| construct(strategy, init)) {
            Ok((instance, OnceOutcome::Ran)) => Ok(Access::new(instance, AccessPath::Constructed)),
            Ok((instance, OnceOutcome::Waited)) => Ok(Access::new(instance, AccessPath::Waited)),
            Ok((instance, OnceOutcome::Observed)) => {
                Ok(Access::new(instance, AccessPath::FastPath))
            }
            Err(OnceError::Failed(err)) => Err(err),
            Err(OnceError::Abandoned) => {
                warn!(%strategy, "construction failed while waiting on the once-guard");
                Err(SingletonError::ConcurrentFailure { strategy })
            }
        }
    }

    pub(crate) fn peek(&self) -> Option<&T> {
        self.once.get()
    }

    pub(crate) fn state(&self) -> SlotState {
        if self.once.is_completed() {
            SlotState::Initialized
        } else if self.once.is_running() {
            SlotState::Initializing
        } else {
            SlotState::Uninitialized
        }
    }

    #[cfg(any(test, feature = "harness"))]
    pub(crate) fn reset(&mut self) {
        self.once.reset();
    }
}
