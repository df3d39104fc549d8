//! A run-once initialization guard.
//!
//! `OnceGuard<T>` runs an initializer exactly once across every concurrent
//! caller and publishes the value so that all of them see it fully built.
//! It is an atomic state machine:
//!
//! ```text
//!   UNINIT ──CAS──▶ RUNNING ──success──▶ DONE
//!      ▲               │
//!      └──failure/panic┘
//! ```
//!
//! Only the caller that wins the CAS runs the initializer. Everyone else spins
//! with exponential backoff, then parks on a condvar until the runner leaves
//! `RUNNING`. If the run fails, the waiters get [`OnceError::Abandoned`]
//! instead of a value that was never written.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use crossbeam::utils::Backoff;
use thiserror::Error;

const UNINIT: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;

/// Which role the caller played in [`OnceGuard::get_or_try_init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnceOutcome {
    /// This caller ran the initializer.
    Ran,
    /// This caller blocked while another caller ran the initializer.
    Waited,
    /// The value was already there on the first look.
    Observed,
}

#[derive(Debug, Error)]
pub enum OnceError<E> {
    /// This caller's initializer returned an error.
    #[error("initializer failed")]
    Failed(E),
    /// Another caller's initializer failed or panicked while this one waited.
    #[error("initializer failed on another thread")]
    Abandoned,
}

pub struct OnceGuard<T> {
    state: AtomicU8,
    // Bumped on every failed run so waiters can tell "failed" from "still empty".
    failures: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
    parked: Mutex<()>,
    wakeup: Condvar,
}

// SAFETY: the value is written once by the single runner before the Release
// store of DONE, and only read after an Acquire load observes DONE. Mutation
// after that needs `&mut self`.
unsafe impl<T: Send + Sync> Sync for OnceGuard<T> {}

impl<T> OnceGuard<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            failures: AtomicU64::new(0),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            parked: Mutex::new(()),
            wakeup: Condvar::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    /// True while some caller is inside the initializer.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Returns the value if initialization has completed.
    pub fn get(&self) -> Option<&T> {
        if self.is_completed() {
            // SAFETY: DONE was observed with Acquire.
            Some(unsafe { self.value_unchecked() })
        } else {
            None
        }
    }

    /// Returns the value, running `init` first if nobody has completed it yet.
    ///
    /// `init` runs on at most one thread at a time and is never run again
    /// once a run succeeds.
    pub fn get_or_try_init<E, F>(&self, init: F) -> Result<(&T, OnceOutcome), OnceError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut waited = false;
        loop {
            let epoch = self.failures.load(Ordering::Acquire);
            match self.state.load(Ordering::Acquire) {
                DONE => {
                    let outcome = if waited {
                        OnceOutcome::Waited
                    } else {
                        OnceOutcome::Observed
                    };
                    // SAFETY: DONE was observed with Acquire.
                    return Ok((unsafe { self.value_unchecked() }, outcome));
                }
                RUNNING => {
                    waited = true;
                    self.wait_while_running();
                    if self.state.load(Ordering::Acquire) != DONE
                        && self.failures.load(Ordering::Acquire) != epoch
                    {
                        return Err(OnceError::Abandoned);
                    }
                }
                _ => {
                    if self
                        .state
                        .compare_exchange(UNINIT, RUNNING, Ordering::Acquire, Ordering::Acquire)
                        .is_ok()
                    {
                        break;
                    }
                }
            }
        }

        let run = Run {
            once: self,
            completed: false,
        };
        match init() {
            Ok(value) => {
                // SAFETY: we hold RUNNING, so no other thread reads or writes the value.
                unsafe { (*self.value.get()).write(value) };
                run.complete();
                // SAFETY: this thread wrote the value and published DONE.
                Ok((unsafe { self.value_unchecked() }, OnceOutcome::Ran))
            }
            Err(err) => {
                drop(run);
                Err(OnceError::Failed(err))
            }
        }
    }

    /// Drops the value, if any, and returns the guard to its initial state.
    pub fn reset(&mut self) {
        if *self.state.get_mut() == DONE {
            // SAFETY: DONE means the value was written, and `&mut self` rules out readers.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
        *self.state.get_mut() = UNINIT;
    }

    unsafe fn value_unchecked(&self) -> &T {
        (*self.value.get()).assume_init_ref()
    }

    fn wait_while_running(&self) {
        let backoff = Backoff::new();
        while self.state.load(Ordering::Acquire) == RUNNING {
            if backoff.is_completed() {
                let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
                while self.state.load(Ordering::Acquire) == RUNNING {
                    parked = self
                        .wakeup
                        .wait(parked)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                return;
            }
            backoff.snooze();
        }
    }

    fn wake_all(&self) {
        // Taking the lock orders the notify after any waiter's state re-check.
        let _parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        self.wakeup.notify_all();
    }
}

impl<T> Default for OnceGuard<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for OnceGuard<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: fmt::Debug> fmt::Debug for OnceGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("OnceGuard");
        match self.get() {
            Some(value) => d.field("value", value),
            None => d.field("value", &format_args!("<uninit>")),
        };
        d.finish()
    }
}

/// Held by the runner while `init` executes. Dropping it without calling
/// `complete` (error return or unwinding) rolls the state back.
struct Run<'a, T> {
    once: &'a OnceGuard<T>,
    completed: bool,
}

impl<T> Run<'_, T> {
    fn complete(mut self) {
        self.completed = true;
        self.once.state.store(DONE, Ordering::Release);
        self.once.wake_all();
    }
}

impl<T> Drop for Run<'_, T> {
    fn drop(&mut self) {
        if !self.completed {
            self.once.failures.fetch_add(1, Ordering::Release);
            self.once.state.store(UNINIT, Ordering::Release);
            self.once.wake_all();
        }
    }
}
