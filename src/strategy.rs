use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a [`SingletonSlot`](crate::SingletonSlot) creates its instance and
/// what guards that creation.
///
/// Chosen once when the slot is built and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializationStrategy {
    /// Built as part of slot construction; reads never branch or lock.
    Eager,
    /// Unsynchronized check-then-act. Broken under contention.
    NaiveLazy,
    /// Every access takes the slot's mutex.
    GloballyLockedLazy,
    /// Acquire-load fast path, mutex plus re-check on the slow path.
    DoubleCheckedLazy,
    /// Delegates to a [`OnceGuard`](crate::OnceGuard).
    OnceGuardedLazy,
}

impl InitializationStrategy {
    pub const ALL: [InitializationStrategy; 5] = [
        InitializationStrategy::Eager,
        InitializationStrategy::NaiveLazy,
        InitializationStrategy::GloballyLockedLazy,
        InitializationStrategy::DoubleCheckedLazy,
        InitializationStrategy::OnceGuardedLazy,
    ];

    pub fn name(self) -> &'static str {
        match self {
            InitializationStrategy::Eager => "eager",
            InitializationStrategy::NaiveLazy => "naive_lazy",
            InitializationStrategy::GloballyLockedLazy => "globally_locked_lazy",
            InitializationStrategy::DoubleCheckedLazy => "double_checked_lazy",
            InitializationStrategy::OnceGuardedLazy => "once_guarded_lazy",
        }
    }

    /// Whether concurrent callers are guaranteed to share one instance.
    pub fn is_thread_safe(self) -> bool {
        !matches!(self, InitializationStrategy::NaiveLazy)
    }

    /// Whether the strategy is correct without paying for it on every read
    /// or at startup.
    pub fn is_recommended(self) -> bool {
        matches!(
            self,
            InitializationStrategy::DoubleCheckedLazy | InitializationStrategy::OnceGuardedLazy
        )
    }

    pub fn is_lazy(self) -> bool {
        !matches!(self, InitializationStrategy::Eager)
    }
}

impl fmt::Display for InitializationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "unknown initialization strategy '{0}' (expected one of: eager, naive_lazy, \
     globally_locked_lazy, double_checked_lazy, once_guarded_lazy)"
)]
pub struct ParseStrategyError(pub String);

/// The strategies that build nothing up front, so a slot using one can be
/// created in a `const` context such as a `static`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LazyStrategy {
    Naive,
    GloballyLocked,
    DoubleChecked,
    OnceGuarded,
}

impl From<LazyStrategy> for InitializationStrategy {
    fn from(strategy: LazyStrategy) -> Self {
        match strategy {
            LazyStrategy::Naive => InitializationStrategy::NaiveLazy,
            LazyStrategy::GloballyLocked => InitializationStrategy::GloballyLockedLazy,
            LazyStrategy::DoubleChecked => InitializationStrategy::DoubleCheckedLazy,
            LazyStrategy::OnceGuarded => InitializationStrategy::OnceGuardedLazy,
        }
    }
}

impl InitializationStrategy {
    /// The lazy counterpart, or `None` for [`Eager`](Self::Eager).
    pub const fn as_lazy(self) -> Option<LazyStrategy> {
        match self {
            InitializationStrategy::Eager => None,
            InitializationStrategy::NaiveLazy => Some(LazyStrategy::Naive),
            InitializationStrategy::GloballyLockedLazy => Some(LazyStrategy::GloballyLocked),
            InitializationStrategy::DoubleCheckedLazy => Some(LazyStrategy::DoubleChecked),
            InitializationStrategy::OnceGuardedLazy => Some(LazyStrategy::OnceGuarded),
        }
    }
}

impl FromStr for InitializationStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        InitializationStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.name() == normalized)
            .ok_or_else(|| ParseStrategyError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_only_naive_is_unsafe() {
        let unsafe_ones: Vec<_> = InitializationStrategy::ALL
            .into_iter()
            .filter(|s| !s.is_thread_safe())
            .collect();
        assert_eq!(unsafe_ones, vec![InitializationStrategy::NaiveLazy]);
    }

    #[test]
    fn test_recommended_strategies() {
        assert!(InitializationStrategy::DoubleCheckedLazy.is_recommended());
        assert!(InitializationStrategy::OnceGuardedLazy.is_recommended());
        assert!(!InitializationStrategy::Eager.is_recommended());
        assert!(!InitializationStrategy::GloballyLockedLazy.is_recommended());
        assert!(!InitializationStrategy::NaiveLazy.is_recommended());
    }

    #[test]
    fn test_parse_accepts_kebab_and_case() {
        assert_eq!(
            "Double-Checked-Lazy".parse::<InitializationStrategy>(),
            Ok(InitializationStrategy::DoubleCheckedLazy)
        );
        assert!("holder_class".parse::<InitializationStrategy>().is_err());
    }

    #[test]
    fn test_serde_uses_snake_case_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            strategy: InitializationStrategy,
        }

        let parsed: Wrapper = toml::from_str("strategy = \"globally_locked_lazy\"").unwrap();
        assert_eq!(parsed.strategy, InitializationStrategy::GloballyLockedLazy);
    }

    #[test]
    fn test_lazy_strategies_map_both_ways() {
        assert_eq!(InitializationStrategy::Eager.as_lazy(), None);
        for strategy in InitializationStrategy::ALL.into_iter().filter(|s| s.is_lazy()) {
            let lazy = strategy.as_lazy().unwrap();
            assert_eq!(InitializationStrategy::from(lazy), strategy);
        }
    }

    proptest! {
        #[test]
        fn prop_display_parses_back(index in 0usize..5) {
            let strategy = InitializationStrategy::ALL[index];
            prop_assert_eq!(strategy.to_string().parse::<InitializationStrategy>(), Ok(strategy));
        }
    }
}
