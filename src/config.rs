use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::strategy::{InitializationStrategy, ParseStrategyError};

pub const MAX_CALLERS: usize = 10_000;
pub const MAX_CONSTRUCTOR_DELAY_MS: u64 = 10_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse harness config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Strategy(#[from] ParseStrategyError),

    #[error("Invalid value for field '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Settings for [`ConcurrencyHarness`](crate::ConcurrencyHarness).
///
/// ```toml
/// callers = 1000
/// constructor_delay_ms = 10
/// rounds = 5
/// strategies = ["naive_lazy", "double_checked_lazy"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Threads released at once against each fresh slot.
    pub callers: usize,
    /// How long the instrumented constructor sleeps, widening the race window.
    pub constructor_delay_ms: u64,
    /// Fresh slots tried per strategy before a run is declared clean.
    pub rounds: usize,
    pub strategies: Vec<InitializationStrategy>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            callers: (num_cpus::get() * 16).max(128),
            constructor_delay_ms: 5,
            rounds: 3,
            strategies: InitializationStrategy::ALL.to_vec(),
        }
    }
}

impl HarnessConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Builds a config from command-line style arguments: an optional
    /// `*.toml` path and an optional strategy name, in any order. The strategy,
    /// when given, replaces the file's strategy list.
    pub fn from_args<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut config = Self::default();
        let mut filter = None;
        for arg in args {
            let arg = arg.as_ref();
            if arg.ends_with(".toml") {
                config = Self::load(arg)?;
            } else {
                filter = Some(arg.parse::<InitializationStrategy>()?);
            }
        }
        if let Some(strategy) = filter {
            config = config.only(strategy);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=MAX_CALLERS).contains(&self.callers) {
            return Err(ConfigError::invalid(
                "callers",
                format!("{} is outside 2..={MAX_CALLERS}", self.callers),
            ));
        }
        if self.constructor_delay_ms > MAX_CONSTRUCTOR_DELAY_MS {
            return Err(ConfigError::invalid(
                "constructor_delay_ms",
                format!("{} exceeds {MAX_CONSTRUCTOR_DELAY_MS}", self.constructor_delay_ms),
            ));
        }
        if self.rounds == 0 {
            return Err(ConfigError::invalid("rounds", "must be at least 1"));
        }
        if self.strategies.is_empty() {
            return Err(ConfigError::invalid("strategies", "must name at least one strategy"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.strategies.iter().find(|s| !seen.insert(**s)) {
            return Err(ConfigError::invalid("strategies", format!("'{dup}' listed twice")));
        }
        Ok(())
    }

    pub fn constructor_delay(&self) -> Duration {
        Duration::from_millis(self.constructor_delay_ms)
    }

    /// Same settings, restricted to one strategy.
    pub fn only(mut self, strategy: InitializationStrategy) -> Self {
        self.strategies = vec![strategy];
        self
    }
}
