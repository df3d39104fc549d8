use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::warn;

use crate::error::{BoxError, SingletonError};
use crate::slot::{Access, AccessPath, SlotState};
use crate::strategy::InitializationStrategy;

use super::{construct, Progress};

/// Check, lock, check again.
///
/// `published` is the only thing the fast path touches. The constructor's
/// writes are made visible by the Release store that publishes the pointer,
/// paired with the Acquire load on the fast path: whoever sees a non-null
/// pointer also sees everything written into the instance before it. With a
/// Relaxed load the fast path could hand out a pointer to memory whose
/// contents have not become visible to this thread yet.
pub(crate) struct DoubleCheckedCell<T> {
    published: AtomicPtr<T>,
    lock: Mutex<()>,
    progress: Progress,
    _owns: PhantomData<Box<T>>,
}

impl<T> DoubleCheckedCell<T> {
    pub(crate) const fn new() -> Self {
        Self {
            published: AtomicPtr::new(ptr::null_mut()),
            lock: Mutex::new(()),
            progress: Progress::new(),
            _owns: PhantomData,
        }
    }

    pub(crate) fn get_or_init<F>(&self, init: &F) -> Result<Access<'_, T>, SingletonError>
    where
        F: Fn() -> Result<T, BoxError>,
    {
        // First check: no lock.
        if let Some(instance) = self.peek() {
            return Ok(Access::new(instance, AccessPath::FastPath));
        }

        let epoch = self.progress.epoch();
        let _lock = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Second check: another caller may have published while we waited.
        // Relaxed is enough here since that store happened under this lock.
        let seen = self.published.load(Ordering::Relaxed);
        if !seen.is_null() {
            // SAFETY: published pointers stay valid until `&mut self`.
            return Ok(Access::new(unsafe { &*seen }, AccessPath::Locked));
        }

        if self.progress.failed_since(epoch) {
            warn!(
                strategy = %InitializationStrategy::DoubleCheckedLazy,
                "construction failed while waiting for the lock"
            );
            return Err(SingletonError::ConcurrentFailure {
                strategy: InitializationStrategy::DoubleCheckedLazy,
            });
        }

        let attempt = self.progress.begin();
        let value = construct(InitializationStrategy::DoubleCheckedLazy, init)?;
        let raw = Box::into_raw(Box::new(value));
        self.published.store(raw, Ordering::Release);
        attempt.succeed();

        // SAFETY: we just published it.
        Ok(Access::new(unsafe { &*raw }, AccessPath::Constructed))
    }

    pub(crate) fn peek(&self) -> Option<&T> {
        let seen = self.published.load(Ordering::Acquire);
        // SAFETY: a non-null pointer was published with Release after the
        // instance was fully written, and is only freed through `&mut self`.
        unsafe { seen.as_ref() }
    }

    pub(crate) fn state(&self) -> SlotState {
        self.progress.state()
    }

    #[cfg(any(test, feature = "harness"))]
    pub(crate) fn reset(&mut self) {
        self.release();
        self.progress.clear();
    }

    fn release(&mut self) {
        let raw = std::mem::replace(self.published.get_mut(), ptr::null_mut());
        if !raw.is_null() {
            // SAFETY: `raw` came from `Box::into_raw` and is no longer reachable.
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

impl<T> Drop for DoubleCheckedCell<T> {
    fn drop(&mut self) {
        self.release();
    }
}
