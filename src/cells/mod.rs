//! Storage cells, one per initialization strategy.
//!
//! Every cell owns exactly the synchronization its protocol needs and nothing
//! more: `EagerCell` has none, `NaiveCell` has none (on purpose), `LockedCell`
//! a mutex, `DoubleCheckedCell` a mutex plus an acquire/release pointer, and
//! `OnceGuardedCell` a [`OnceGuard`](crate::OnceGuard).

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use tracing::{debug, warn};

use crate::error::{BoxError, SingletonError};
use crate::slot::SlotState;
use crate::strategy::InitializationStrategy;

mod double_checked;
mod eager;
mod locked;
mod naive;
mod once_guarded;

pub(crate) use double_checked::DoubleCheckedCell;
pub(crate) use eager::EagerCell;
pub(crate) use locked::LockedCell;
pub(crate) use naive::NaiveCell;
pub(crate) use once_guarded::OnceGuardedCell;

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;

/// Runs the user's constructor once and maps its failure into the slot's error.
pub(crate) fn construct<T, F>(
    strategy: InitializationStrategy,
    init: &F,
) -> Result<T, SingletonError>
where
    F: Fn() -> Result<T, BoxError>,
{
    debug!(%strategy, "constructing instance");
    init().map_err(|source| {
        warn!(%strategy, error = %source, "instance constructor failed");
        SingletonError::construction(strategy, source)
    })
}

/// State tag plus a failure counter shared by the lazy cells.
///
/// Waiters snapshot `epoch()` before blocking; if it moved by the time they
/// get in, some construction failed while they waited.
pub(crate) struct Progress {
    state: AtomicU8,
    failures: AtomicU64,
}

impl Progress {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
            failures: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> SlotState {
        match self.state.load(Ordering::Acquire) {
            INITIALIZED => SlotState::Initialized,
            INITIALIZING => SlotState::Initializing,
            _ => SlotState::Uninitialized,
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    pub(crate) fn failed_since(&self, epoch: u64) -> bool {
        self.epoch() != epoch
    }

    pub(crate) fn begin(&self) -> Attempt<'_> {
        self.state.store(INITIALIZING, Ordering::Release);
        Attempt {
            progress: self,
            succeeded: false,
        }
    }

    #[cfg(any(test, feature = "harness"))]
    pub(crate) fn clear(&mut self) {
        *self.state.get_mut() = UNINITIALIZED;
    }
}

/// One construction in flight. Dropping it without `succeed` (error return
/// or a panicking constructor) puts the slot back to uninitialized.
pub(crate) struct Attempt<'a> {
    progress: &'a Progress,
    succeeded: bool,
}

impl Attempt<'_> {
    pub(crate) fn succeed(mut self) {
        self.succeeded = true;
        self.progress.state.store(INITIALIZED, Ordering::Release);
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.succeeded {
            self.progress.failures.fetch_add(1, Ordering::Release);
            self.progress.state.store(UNINITIALIZED, Ordering::Release);
        }
    }
}
