use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::{BoxError, SingletonError};
use crate::slot::{Access, AccessPath, SlotState};
use crate::strategy::InitializationStrategy;

use super::{construct, Progress};

/// Check-then-act with nothing guarding the gap between the check and the act.
///
/// Two callers that both see an empty slot both construct, and the later
/// store silently replaces the earlier one. This is the broken baseline and
/// must stay broken.
///
/// The race is logical only. The pointer itself is published with
/// Release/Acquire so no caller ever reads a half-built instance, and every
/// instance any caller built is kept in `retained` until reset or drop so no
/// handle ever dangles.
pub(crate) struct NaiveCell<T> {
    current: AtomicPtr<T>,
    retained: Retained<T>,
    progress: Progress,
}

impl<T> NaiveCell<T> {
    pub(crate) const fn new() -> Self {
        Self {
            current: AtomicPtr::new(ptr::null_mut()),
            retained: Retained::new(),
            progress: Progress::new(),
        }
    }

    pub(crate) fn get_or_init<F>(&self, init: &F) -> Result<Access<'_, T>, SingletonError>
    where
        F: Fn() -> Result<T, BoxError>,
    {
        let seen = self.current.load(Ordering::Acquire);
        if !seen.is_null() {
            // SAFETY: non-null pointers come from `retained`, which outlives `&self`.
            return Ok(Access::new(unsafe { &*seen }, AccessPath::FastPath));
        }

        // Unsynchronized window: any number of callers can be here at once.
        let attempt = self.progress.begin();
        let value = construct(InitializationStrategy::NaiveLazy, init)?;
        let built = self.retained.keep(value);
        self.current.store(built, Ordering::Release);
        attempt.succeed();

        // SAFETY: as above.
        Ok(Access::new(unsafe { &*built }, AccessPath::Constructed))
    }

    pub(crate) fn peek(&self) -> Option<&T> {
        let seen = self.current.load(Ordering::Acquire);
        // SAFETY: non-null pointers come from `retained`, which outlives `&self`.
        unsafe { seen.as_ref() }
    }

    pub(crate) fn state(&self) -> SlotState {
        if self.current.load(Ordering::Acquire).is_null() {
            self.progress.state()
        } else {
            SlotState::Initialized
        }
    }

    /// Number of distinct instances this cell has built since the last reset.
    #[cfg(test)]
    pub(crate) fn instances_built(&self) -> usize {
        self.retained.len()
    }

    #[cfg(any(test, feature = "harness"))]
    pub(crate) fn reset(&mut self) {
        *self.current.get_mut() = ptr::null_mut();
        self.retained.clear();
        self.progress.clear();
    }
}

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// Append-only Treiber stack that owns every instance the naive cell built.
struct Retained<T> {
    head: AtomicPtr<Node<T>>,
    _owns: PhantomData<T>,
}

impl<T> Retained<T> {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _owns: PhantomData,
        }
    }

    /// Takes ownership of `value` and returns a pointer to it that stays valid
    /// until `clear` or drop.
    fn keep(&self, value: T) -> *mut T {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is not shared until the CAS below succeeds.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        // SAFETY: the node is never moved or freed while `&self` is alive.
        unsafe { ptr::addr_of_mut!((*node).value) }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            count += 1;
            // SAFETY: nodes are only freed through `&mut self`.
            cursor = unsafe { (*cursor).next };
        }
        count
    }

    fn clear(&mut self) {
        let mut cursor = std::mem::replace(self.head.get_mut(), ptr::null_mut());
        while !cursor.is_null() {
            // SAFETY: every node was created by `Box::into_raw` in `keep` and
            // is unlinked exactly once here.
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next;
        }
    }
}

impl<T> Drop for Retained<T> {
    fn drop(&mut self) {
        self.clear();
    }
}
