use thiserror::Error;

use crate::strategy::InitializationStrategy;

/// Error type constructors hand back to the slot.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum SingletonError {
    /// The constructor ran on this caller's thread and failed. The slot is
    /// back to uninitialized, so a later call may retry.
    #[error("{strategy} slot: instance constructor failed")]
    Construction {
        strategy: InitializationStrategy,
        #[source]
        source: BoxError,
    },

    /// This caller was waiting for another caller's construction, and that
    /// construction failed or panicked.
    #[error("{strategy} slot: construction failed on another thread while this caller waited")]
    ConcurrentFailure { strategy: InitializationStrategy },
}

impl SingletonError {
    pub fn construction(strategy: InitializationStrategy, source: BoxError) -> Self {
        Self::Construction { strategy, source }
    }

    pub fn strategy(&self) -> InitializationStrategy {
        match self {
            Self::Construction { strategy, .. } | Self::ConcurrentFailure { strategy } => *strategy,
        }
    }

    /// True when the error came from a different thread's attempt.
    pub fn is_concurrent(&self) -> bool {
        matches!(self, Self::ConcurrentFailure { .. })
    }
}
