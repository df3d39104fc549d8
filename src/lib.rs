// Singleton Slots
// Competing strategies for lazily creating exactly one shared instance under concurrent access.

//! # Singleton slots
//!
//! A [`SingletonSlot`] owns at most one instance and hands out borrowed
//! [`InstanceHandle`]s to it. How and when the instance gets built is fixed at
//! construction time by an [`InitializationStrategy`]:
//!
//! | Strategy              | Thread-safe | Recommended | Read cost after init |
//! |-----------------------|-------------|-------------|----------------------|
//! | `Eager`               | yes         | no          | plain read           |
//! | `NaiveLazy`           | **no**      | no          | atomic load          |
//! | `GloballyLockedLazy`  | yes         | no          | mutex lock           |
//! | `DoubleCheckedLazy`   | yes         | yes         | acquire load         |
//! | `OnceGuardedLazy`     | yes         | yes         | acquire load         |
//!
//! `NaiveLazy` is kept broken on purpose: it is the baseline that shows what a
//! check-then-act sequence does without synchronization. The concurrency
//! harness (feature `harness`) exists to prove that, and to prove the other
//! four correct.
//!
//! ```
//! use singleton_slots::{InitializationStrategy, SingletonSlot};
//!
//! let slot = SingletonSlot::new(InitializationStrategy::OnceGuardedLazy, || {
//!     Ok(String::from("config"))
//! })?;
//!
//! let a = slot.get_instance()?;
//! let b = slot.get_instance()?;
//! assert!(a.ptr_eq(&b));
//! # Ok::<(), singleton_slots::SingletonError>(())
//! ```
//!
//! Lazy slots can also be created in a `static` with
//! [`SingletonSlot::lazy`], which is `const`.

mod cells;
pub mod error;
pub mod once;
pub mod slot;
pub mod strategy;

#[cfg(any(test, feature = "harness"))]
pub mod config;
#[cfg(any(test, feature = "harness"))]
pub mod harness;

pub use error::{BoxError, SingletonError};
pub use once::{OnceError, OnceGuard, OnceOutcome};
pub use slot::{Access, AccessPath, InstanceHandle, SingletonSlot, SlotState};
pub use strategy::{InitializationStrategy, LazyStrategy, ParseStrategyError};

#[cfg(any(test, feature = "harness"))]
pub use config::{ConfigError, HarnessConfig};
#[cfg(any(test, feature = "harness"))]
pub use harness::{
    ConcurrencyHarness, CountingConstructor, Observations, Probe, RunReport, Verdict,
};
