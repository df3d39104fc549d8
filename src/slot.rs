use std::fmt;
use std::ops::Deref;
use std::ptr;

use tracing::debug;

use crate::cells::{DoubleCheckedCell, EagerCell, LockedCell, NaiveCell, OnceGuardedCell};
use crate::error::{BoxError, SingletonError};
use crate::strategy::{InitializationStrategy, LazyStrategy};

/// Lifecycle of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Uninitialized,
    Initializing,
    Initialized,
}

/// How a particular access reached the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessPath {
    /// Eager slot: the instance existed before anyone could ask.
    Preconstructed,
    /// Lock-free read of an already-published instance.
    FastPath,
    /// Took the slot's lock and found the instance already there.
    Locked,
    /// Blocked on another caller's construction, then got its result.
    Waited,
    /// This call ran the constructor.
    Constructed,
}

/// A borrowed reference to the instance held by a slot.
///
/// Two handles are the same instance iff [`ptr_eq`](Self::ptr_eq) holds.
pub struct InstanceHandle<'a, T> {
    instance: &'a T,
}

impl<'a, T> InstanceHandle<'a, T> {
    pub(crate) fn new(instance: &'a T) -> Self {
        Self { instance }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        ptr::eq(self.instance, other.instance)
    }

    /// Address of the instance, usable as a hashable identity.
    pub fn identity(&self) -> usize {
        self.instance as *const T as usize
    }

    pub fn get(self) -> &'a T {
        self.instance
    }
}

impl<T> Clone for InstanceHandle<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for InstanceHandle<'_, T> {}

impl<T> Deref for InstanceHandle<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.instance
    }
}

impl<T: fmt::Debug> fmt::Debug for InstanceHandle<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("identity", &format_args!("{:#x}", self.identity()))
            .field("instance", self.instance)
            .finish()
    }
}

/// A handle plus the path the access took to get it.
#[derive(Debug)]
pub struct Access<'a, T> {
    pub handle: InstanceHandle<'a, T>,
    pub path: AccessPath,
}

impl<'a, T> Access<'a, T> {
    pub(crate) fn new(instance: &'a T, path: AccessPath) -> Self {
        Self {
            handle: InstanceHandle::new(instance),
            path,
        }
    }
}

enum Cell<T> {
    Eager(EagerCell<T>),
    Naive(NaiveCell<T>),
    Locked(LockedCell<T>),
    DoubleChecked(DoubleCheckedCell<T>),
    OnceGuarded(OnceGuardedCell<T>),
}

/// Owns at most one instance of `T`, built by `init` according to a fixed
/// [`InitializationStrategy`].
///
/// The slot is the explicit owner of what would otherwise be a global: it
/// decides when the instance is built, hands out borrows of it, and drops
/// it (together with any extra instances a broken strategy built) when the
/// slot itself is dropped.
pub struct SingletonSlot<T, F> {
    cell: Cell<T>,
    init: F,
}

// SAFETY: handles to the instance are shared across threads (needs T: Sync)
// and the instance may be built on one thread and dropped on another (needs
// T: Send). Every cell synchronizes its own publication.
unsafe impl<T: Send + Sync, F: Sync> Sync for SingletonSlot<T, F> {}
unsafe impl<T: Send, F: Send> Send for SingletonSlot<T, F> {}

impl<T, F> SingletonSlot<T, F>
where
    F: Fn() -> Result<T, BoxError>,
{
    /// Creates a slot. For [`InitializationStrategy::Eager`] this runs `init`
    /// right away and fails if it fails; every other strategy starts empty.
    pub fn new(strategy: InitializationStrategy, init: F) -> Result<Self, SingletonError> {
        let slot = match strategy.as_lazy() {
            Some(lazy) => Self::lazy(lazy, init),
            None => Self {
                cell: Cell::Eager(EagerCell::build(&init)?),
                init,
            },
        };
        debug!(%strategy, "singleton slot created");
        Ok(slot)
    }

    /// Returns the instance, building it first if the strategy calls for it.
    pub fn get_instance(&self) -> Result<InstanceHandle<'_, T>, SingletonError> {
        self.access().map(|access| access.handle)
    }

    /// Like [`get_instance`](Self::get_instance), and also reports which path
    /// the access took.
    pub fn access(&self) -> Result<Access<'_, T>, SingletonError> {
        let access = match &self.cell {
            Cell::Eager(cell) => Ok(cell.get()),
            Cell::Naive(cell) => cell.get_or_init(&self.init),
            Cell::Locked(cell) => cell.get_or_init(&self.init),
            Cell::DoubleChecked(cell) => cell.get_or_init(&self.init),
            Cell::OnceGuarded(cell) => cell.get_or_init(&self.init),
        }?;
        if access.path == AccessPath::Constructed {
            debug!(
                strategy = %self.strategy(),
                identity = access.handle.identity(),
                "instance published"
            );
        }
        Ok(access)
    }

    /// Test-only: drops the instance and returns the slot to uninitialized.
    ///
    /// An eager slot is never observably empty, so it is rebuilt instead; if
    /// that rebuild fails the previous instance is kept and the error returned.
    /// `&mut self` guarantees nobody is inside `get_instance` meanwhile.
    #[cfg(any(test, feature = "harness"))]
    pub fn reset(&mut self) -> Result<(), SingletonError> {
        tracing::trace!(strategy = %self.strategy(), "resetting slot");
        match &mut self.cell {
            Cell::Eager(cell) => return cell.rebuild(&self.init),
            Cell::Naive(cell) => cell.reset(),
            Cell::Locked(cell) => cell.reset(),
            Cell::DoubleChecked(cell) => cell.reset(),
            Cell::OnceGuarded(cell) => cell.reset(),
        }
        Ok(())
    }
}

impl<T, F> SingletonSlot<T, F> {
    /// Creates an empty slot in a `const` context, so it can live in a
    /// `static` and be built on first use:
    ///
    /// ```
    /// use singleton_slots::{BoxError, LazyStrategy, SingletonSlot};
    ///
    /// fn load() -> Result<Vec<String>, BoxError> {
    ///     Ok(vec!["localhost".into()])
    /// }
    ///
    /// static HOSTS: SingletonSlot<Vec<String>, fn() -> Result<Vec<String>, BoxError>> =
    ///     SingletonSlot::lazy(LazyStrategy::OnceGuarded, load);
    ///
    /// assert_eq!(HOSTS.get_instance()?.len(), 1);
    /// # Ok::<(), singleton_slots::SingletonError>(())
    /// ```
    pub const fn lazy(strategy: LazyStrategy, init: F) -> Self {
        let cell = match strategy {
            LazyStrategy::Naive => Cell::Naive(NaiveCell::new()),
            LazyStrategy::GloballyLocked => Cell::Locked(LockedCell::new()),
            LazyStrategy::DoubleChecked => Cell::DoubleChecked(DoubleCheckedCell::new()),
            LazyStrategy::OnceGuarded => Cell::OnceGuarded(OnceGuardedCell::new()),
        };
        Self { cell, init }
    }

    pub fn strategy(&self) -> InitializationStrategy {
        match &self.cell {
            Cell::Eager(_) => InitializationStrategy::Eager,
            Cell::Naive(_) => InitializationStrategy::NaiveLazy,
            Cell::Locked(_) => InitializationStrategy::GloballyLockedLazy,
            Cell::DoubleChecked(_) => InitializationStrategy::DoubleCheckedLazy,
            Cell::OnceGuarded(_) => InitializationStrategy::OnceGuardedLazy,
        }
    }

    pub fn state(&self) -> SlotState {
        match &self.cell {
            Cell::Eager(_) => SlotState::Initialized,
            Cell::Naive(cell) => cell.state(),
            Cell::Locked(cell) => cell.state(),
            Cell::DoubleChecked(cell) => cell.state(),
            Cell::OnceGuarded(cell) => cell.state(),
        }
    }

    /// Peeks at the instance without ever constructing it.
    pub fn get(&self) -> Option<InstanceHandle<'_, T>> {
        let instance = match &self.cell {
            Cell::Eager(cell) => Some(cell.get().handle.get()),
            Cell::Naive(cell) => cell.peek(),
            Cell::Locked(cell) => cell.peek(),
            Cell::DoubleChecked(cell) => cell.peek(),
            Cell::OnceGuarded(cell) => cell.peek(),
        };
        instance.map(InstanceHandle::new)
    }
}

impl<T, F> fmt::Debug for SingletonSlot<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingletonSlot")
            .field("strategy", &self.strategy())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use proptest::prelude::*;

    const CORRECT: [InitializationStrategy; 4] = [
        InitializationStrategy::Eager,
        InitializationStrategy::GloballyLockedLazy,
        InitializationStrategy::DoubleCheckedLazy,
        InitializationStrategy::OnceGuardedLazy,
    ];

    #[derive(Debug)]
    struct Service {
        serial: usize,
    }

    type BuildService = fn() -> Result<Service, BoxError>;

    static STATIC_BUILDS: AtomicUsize = AtomicUsize::new(0);

    fn build_static_service() -> Result<Service, BoxError> {
        let serial = STATIC_BUILDS.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(2));
        Ok(Service { serial })
    }

    static LOCKED_SLOT: SingletonSlot<Service, BuildService> =
        SingletonSlot::lazy(LazyStrategy::GloballyLocked, build_static_service);
    static DOUBLE_CHECKED_SLOT: SingletonSlot<Service, BuildService> =
        SingletonSlot::lazy(LazyStrategy::DoubleChecked, build_static_service);
    static ONCE_GUARDED_SLOT: SingletonSlot<Service, BuildService> =
        SingletonSlot::lazy(LazyStrategy::OnceGuarded, build_static_service);

    #[test]
    fn test_static_slots_build_once_on_first_use() {
        const CALLERS: usize = 32;
        let slots = [&LOCKED_SLOT, &DOUBLE_CHECKED_SLOT, &ONCE_GUARDED_SLOT];

        for slot in slots {
            assert_eq!(slot.state(), SlotState::Uninitialized);
        }
        let barrier = Barrier::new(CALLERS);
        thread::scope(|s| {
            for _ in 0..CALLERS {
                s.spawn(|| {
                    barrier.wait();
                    for slot in slots {
                        slot.get_instance().unwrap();
                    }
                });
            }
        });

        for slot in slots {
            let first = slot.get_instance().unwrap();
            assert!(slot.get().unwrap().ptr_eq(&first), "{}", slot.strategy());
        }
        // One construction per static, no matter how many threads raced.
        assert_eq!(STATIC_BUILDS.load(Ordering::SeqCst), slots.len());
    }

    #[test]
    fn test_lazy_matches_new_for_lazy_strategies() {
        for strategy in InitializationStrategy::ALL.into_iter().filter(|s| s.is_lazy()) {
            let lazy = strategy.as_lazy().unwrap();
            let slot: SingletonSlot<Service, _> = SingletonSlot::lazy(lazy, || Ok::<_, BoxError>(Service { serial: 0 }));
            assert_eq!(slot.strategy(), strategy);
            assert_eq!(slot.state(), SlotState::Uninitialized);
        }
    }

    #[test]
    fn test_eager_builds_on_creation() {
        let calls = AtomicUsize::new(0);
        let slot = SingletonSlot::new(InitializationStrategy::Eager, || {
            Ok(Service {
                serial: calls.fetch_add(1, Ordering::SeqCst),
            })
        })
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(slot.state(), SlotState::Initialized);
        let access = slot.access().unwrap();
        assert_eq!(access.path, AccessPath::Preconstructed);
        assert_eq!(access.handle.serial, 0);
    }

    #[test]
    fn test_eager_failure_is_fatal_at_creation() {
        let result = SingletonSlot::<Service, _>::new(InitializationStrategy::Eager, || {
            Err("startup config missing".into())
        });
        let err = result.unwrap_err();
        assert_eq!(err.strategy(), InitializationStrategy::Eager);
    }

    #[test]
    fn test_lazy_slots_start_empty() {
        for strategy in InitializationStrategy::ALL.into_iter().filter(|s| s.is_lazy()) {
            let slot = SingletonSlot::new(strategy, || Ok(Service { serial: 0 })).unwrap();
            assert_eq!(slot.state(), SlotState::Uninitialized, "{strategy}");
            assert!(slot.get().is_none(), "{strategy}");

            let handle = slot.get_instance().unwrap();
            assert_eq!(slot.state(), SlotState::Initialized, "{strategy}");
            assert!(slot.get().unwrap().ptr_eq(&handle), "{strategy}");
        }
    }

    #[test]
    fn test_repeated_calls_are_idempotent() {
        for strategy in InitializationStrategy::ALL {
            let calls = AtomicUsize::new(0);
            let slot = SingletonSlot::new(strategy, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Service { serial: 1 })
            })
            .unwrap();

            let first = slot.get_instance().unwrap();
            for _ in 0..50 {
                assert!(slot.get_instance().unwrap().ptr_eq(&first), "{strategy}");
            }
            assert_eq!(calls.load(Ordering::SeqCst), 1, "{strategy}");
        }
    }

    #[test]
    fn test_access_paths_after_initialization() {
        let expected = [
            (InitializationStrategy::NaiveLazy, AccessPath::FastPath),
            (InitializationStrategy::GloballyLockedLazy, AccessPath::Locked),
            (InitializationStrategy::DoubleCheckedLazy, AccessPath::FastPath),
            (InitializationStrategy::OnceGuardedLazy, AccessPath::FastPath),
        ];
        for (strategy, later) in expected {
            let slot = SingletonSlot::new(strategy, || Ok(Service { serial: 2 })).unwrap();
            assert_eq!(slot.access().unwrap().path, AccessPath::Constructed, "{strategy}");
            assert_eq!(slot.access().unwrap().path, later, "{strategy}");
        }
    }

    #[test]
    fn test_failure_then_reset_constructs_exactly_once() {
        for strategy in InitializationStrategy::ALL.into_iter().filter(|s| s.is_lazy()) {
            let calls = AtomicUsize::new(0);
            let mut slot = SingletonSlot::new(strategy, || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call == 0 {
                    Err("first attempt fails".into())
                } else {
                    Ok(Service { serial: call })
                }
            })
            .unwrap();

            let err = slot.get_instance().unwrap_err();
            assert!(matches!(err, SingletonError::Construction { .. }), "{strategy}");
            assert_eq!(slot.state(), SlotState::Uninitialized, "{strategy}");

            slot.reset().unwrap();

            let first = slot.get_instance().unwrap();
            let second = slot.get_instance().unwrap();
            assert!(first.ptr_eq(&second), "{strategy}");
            assert_eq!(first.serial, 1, "{strategy}");
            assert_eq!(calls.load(Ordering::SeqCst), 2, "{strategy}");
        }
    }

    #[test]
    fn test_reset_drops_instance_and_rebuilds_lazily() {
        for strategy in InitializationStrategy::ALL.into_iter().filter(|s| s.is_lazy()) {
            let calls = AtomicUsize::new(0);
            let mut slot = SingletonSlot::new(strategy, || {
                Ok(Service {
                    serial: calls.fetch_add(1, Ordering::SeqCst),
                })
            })
            .unwrap();

            assert_eq!(slot.get_instance().unwrap().serial, 0);
            slot.reset().unwrap();
            assert_eq!(slot.state(), SlotState::Uninitialized, "{strategy}");
            assert!(slot.get().is_none(), "{strategy}");
            assert_eq!(slot.get_instance().unwrap().serial, 1, "{strategy}");
        }
    }

    #[test]
    fn test_eager_reset_rebuilds_immediately() {
        let calls = AtomicUsize::new(0);
        let mut slot = SingletonSlot::new(InitializationStrategy::Eager, || {
            Ok(Service {
                serial: calls.fetch_add(1, Ordering::SeqCst),
            })
        })
        .unwrap();

        slot.reset().unwrap();
        assert_eq!(slot.state(), SlotState::Initialized);
        assert_eq!(slot.get().unwrap().serial, 1);
    }

    #[test]
    fn test_eager_failed_reset_keeps_previous_instance() {
        let calls = AtomicUsize::new(0);
        let mut slot = SingletonSlot::new(InitializationStrategy::Eager, || {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(Service { serial: 0 }),
                _ => Err("rebuild failed".into()),
            }
        })
        .unwrap();

        assert!(slot.reset().is_err());
        assert_eq!(slot.get_instance().unwrap().serial, 0);
    }

    #[test]
    fn test_correct_strategies_share_one_instance() {
        const CALLERS: usize = 128;

        for strategy in CORRECT {
            let calls = AtomicUsize::new(0);
            let slot = SingletonSlot::new(strategy, || {
                let serial = calls.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                Ok(Service { serial })
            })
            .unwrap();
            let barrier = Barrier::new(CALLERS);

            let identities: Vec<usize> = thread::scope(|s| {
                let handles: Vec<_> = (0..CALLERS)
                    .map(|_| {
                        s.spawn(|| {
                            barrier.wait();
                            slot.get_instance().unwrap().identity()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert!(identities.windows(2).all(|w| w[0] == w[1]), "{strategy}");
            assert_eq!(calls.load(Ordering::SeqCst), 1, "{strategy}");
        }
    }

    #[test]
    fn test_locked_waiters_observe_concurrent_failure() {
        const WAITERS: usize = 16;

        for strategy in [
            InitializationStrategy::GloballyLockedLazy,
            InitializationStrategy::DoubleCheckedLazy,
            InitializationStrategy::OnceGuardedLazy,
        ] {
            let barrier = Barrier::new(WAITERS + 1);
            let slot = SingletonSlot::<Service, _>::new(strategy, || {
                thread::sleep(Duration::from_millis(30));
                Err("backend down".into())
            })
            .unwrap();

            let results: Vec<Result<usize, SingletonError>> = thread::scope(|s| {
                let handles: Vec<_> = (0..=WAITERS)
                    .map(|_| {
                        s.spawn(|| {
                            barrier.wait();
                            slot.get_instance().map(|h| h.serial)
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert!(results.iter().all(Result::is_err), "{strategy}");
            assert!(
                results.iter().any(|r| matches!(r, Err(SingletonError::Construction { .. }))),
                "{strategy}"
            );
            assert_eq!(slot.state(), SlotState::Uninitialized, "{strategy}");
        }
    }

    #[test]
    fn test_panicking_constructor_does_not_wedge_slot() {
        for strategy in InitializationStrategy::ALL.into_iter().filter(|s| s.is_lazy()) {
            let calls = AtomicUsize::new(0);
            let slot = SingletonSlot::new(strategy, || {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("constructor blew up");
                }
                Ok(Service { serial: 9 })
            })
            .unwrap();

            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let _ = slot.get_instance();
            }));
            assert!(outcome.is_err(), "{strategy}");
            assert_eq!(slot.state(), SlotState::Uninitialized, "{strategy}");
            assert_eq!(slot.get_instance().unwrap().serial, 9, "{strategy}");
        }
    }

    #[test]
    fn test_slot_is_sync_for_shared_types() {
        fn assert_sync<S: Sync>(_: &S) {}
        let slot = SingletonSlot::new(InitializationStrategy::OnceGuardedLazy, || {
            Ok(String::from("shared"))
        })
        .unwrap();
        assert_sync(&slot);
    }

    proptest! {
        #[test]
        fn prop_sequential_calls_never_reconstruct(index in 0usize..5, calls in 1usize..64) {
            let strategy = InitializationStrategy::ALL[index];
            let built = AtomicUsize::new(0);
            let slot = SingletonSlot::new(strategy, || {
                built.fetch_add(1, Ordering::SeqCst);
                Ok(Service { serial: 3 })
            })
            .unwrap();

            let first = slot.get_instance().unwrap().identity();
            for _ in 0..calls {
                prop_assert_eq!(slot.get_instance().unwrap().identity(), first);
            }
            prop_assert_eq!(built.load(Ordering::SeqCst), 1);
        }
    }
}
