use crate::error::{BoxError, SingletonError};
use crate::slot::{Access, AccessPath};
use crate::strategy::InitializationStrategy;

use super::construct;

/// Built together with the slot, so it is never observably empty.
pub(crate) struct EagerCell<T> {
    instance: Box<T>,
}

impl<T> EagerCell<T> {
    pub(crate) fn build<F>(init: &F) -> Result<Self, SingletonError>
    where
        F: Fn() -> Result<T, BoxError>,
    {
        let instance = construct(InitializationStrategy::Eager, init)?;
        Ok(Self {
            instance: Box::new(instance),
        })
    }

    pub(crate) fn get(&self) -> Access<'_, T> {
        Access::new(&self.instance, AccessPath::Preconstructed)
    }

    /// Replaces the instance only once the new one is built.
    #[cfg(any(test, feature = "harness"))]
    pub(crate) fn rebuild<F>(&mut self, init: &F) -> Result<(), SingletonError>
    where
        F: Fn() -> Result<T, BoxError>,
    {
        *self = Self::build(init)?;
        Ok(())
    }
}
