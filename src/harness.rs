//! Concurrency harness.
//!
//! Releases many threads at once against a fresh slot and records what each
//! of them got back. A correct strategy must come out of this with one
//! construction and one identity; `NaiveLazy` is expected not to.

use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{error, info, warn};

use crate::config::HarnessConfig;
use crate::error::{BoxError, SingletonError};
use crate::slot::{AccessPath, SingletonSlot};
use crate::strategy::InitializationStrategy;

pub const PROBE_MARKER: u64 = 0x5EED_CAFE_F00D_BEEF;
const PROBE_WORDS: usize = 64;

/// Instrumented instance: its constructor fills a payload and then sets a
/// marker, and [`is_fully_built`](Self::is_fully_built) checks both.
#[derive(Debug)]
pub struct Probe {
    serial: usize,
    payload: [u64; PROBE_WORDS],
    marker: u64,
}

impl Probe {
    pub fn build(serial: usize) -> Self {
        let mut payload = [0u64; PROBE_WORDS];
        for (index, word) in payload.iter_mut().enumerate() {
            *word = Self::expected_word(serial, index);
        }
        Self {
            serial,
            payload,
            marker: PROBE_MARKER,
        }
    }

    pub fn serial(&self) -> usize {
        self.serial
    }

    pub fn is_fully_built(&self) -> bool {
        self.marker == PROBE_MARKER
            && self
                .payload
                .iter()
                .enumerate()
                .all(|(index, word)| *word == Self::expected_word(self.serial, index))
    }

    fn expected_word(serial: usize, index: usize) -> u64 {
        (serial as u64).rotate_left(index as u32) ^ PROBE_MARKER
    }
}

/// Constructor that counts its calls and can be slowed down to widen the
/// window between "saw empty" and "stored".
pub struct CountingConstructor<T> {
    calls: AtomicUsize,
    delay: Duration,
    make: fn(usize) -> T,
}

impl<T> CountingConstructor<T> {
    pub fn new(delay: Duration, make: fn(usize) -> T) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            make,
        }
    }

    pub fn build(&self) -> Result<T, BoxError> {
        let serial = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok((self.make)(serial))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CountingConstructor<Probe> {
    pub fn probes(delay: Duration) -> Self {
        Self::new(delay, Probe::build)
    }
}

/// What a batch of concurrent callers saw.
#[derive(Debug, Default)]
pub struct Observations {
    /// Identity returned to each successful caller.
    pub identities: Vec<usize>,
    pub paths: FxHashMap<AccessPath, usize>,
    /// Error returned to each caller that got no handle.
    pub errors: Vec<SingletonError>,
    /// Handles whose instance failed the inspection callback.
    pub incomplete: usize,
    pub elapsed: Duration,
}

impl Observations {
    pub fn distinct_instances(&self) -> usize {
        self.identities.iter().collect::<FxHashSet<_>>().len()
    }

    pub fn count(&self, path: AccessPath) -> usize {
        self.paths.get(&path).copied().unwrap_or(0)
    }

    pub fn failures(&self) -> usize {
        self.errors.len()
    }

    /// Callers that gave up because someone else's construction failed.
    pub fn concurrent_failures(&self) -> usize {
        self.errors.iter().filter(|err| err.is_concurrent()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Thread-safe strategy, one construction, one identity.
    Upheld,
    /// Thread-safe strategy that built more than once. A real bug.
    Violated,
    /// `NaiveLazy` showed its documented race.
    DefectDemonstrated,
    /// `NaiveLazy` happened to stay unique this time.
    DefectNotReproduced,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub strategy: InitializationStrategy,
    /// Zero-based round that produced this report.
    pub round: usize,
    pub callers: usize,
    pub constructions: usize,
    pub distinct_instances: usize,
    pub fast_path_hits: usize,
    pub failures: usize,
    /// Subset of `failures` that were [`SingletonError::ConcurrentFailure`].
    pub concurrent_failures: usize,
    pub all_fully_built: bool,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn upholds_uniqueness(&self) -> bool {
        self.constructions == 1 && self.distinct_instances == 1
    }

    pub fn verdict(&self) -> Verdict {
        match (self.strategy.is_thread_safe(), self.upholds_uniqueness()) {
            (true, true) => Verdict::Upheld,
            (true, false) => Verdict::Violated,
            (false, false) => Verdict::DefectDemonstrated,
            (false, true) => Verdict::DefectNotReproduced,
        }
    }
}

pub struct ConcurrencyHarness {
    config: HarnessConfig,
}

impl ConcurrencyHarness {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Releases `callers` threads through a barrier against `slot` and records
    /// every outcome. `inspect` is applied to each instance a caller receives.
    pub fn hammer<T, F, I>(&self, slot: &SingletonSlot<T, F>, inspect: I) -> Observations
    where
        T: Send + Sync,
        F: Fn() -> Result<T, BoxError> + Sync,
        I: Fn(&T) -> bool + Sync,
    {
        let callers = self.config.callers;
        let barrier = Barrier::new(callers);
        let started = Instant::now();

        let outcomes: Vec<Result<(usize, AccessPath, bool), SingletonError>> = thread::scope(|s| {
            let handles: Vec<_> = (0..callers)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        slot.access().map(|access| {
                            let complete = inspect(access.handle.get());
                            (access.handle.identity(), access.path, complete)
                        })
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|payload| panic::resume_unwind(payload))
                })
                .collect()
        });

        let mut observed = Observations {
            elapsed: started.elapsed(),
            ..Observations::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok((identity, path, complete)) => {
                    observed.identities.push(identity);
                    *observed.paths.entry(path).or_insert(0) += 1;
                    if !complete {
                        observed.incomplete += 1;
                    }
                }
                Err(err) => observed.errors.push(err),
            }
        }
        observed
    }

    /// One round: a fresh slot over a counting [`Probe`] constructor, hammered once.
    pub fn run(&self, strategy: InitializationStrategy) -> Result<RunReport, SingletonError> {
        self.run_round(strategy, 0)
    }

    /// Up to `rounds` fresh runs, stopping at the first uniqueness violation.
    /// Returns the violating report, or the last clean one.
    pub fn run_rounds(
        &self,
        strategy: InitializationStrategy,
    ) -> Result<RunReport, SingletonError> {
        let mut last = self.run_round(strategy, 0)?;
        for round in 1..self.config.rounds {
            if !last.upholds_uniqueness() {
                break;
            }
            last = self.run_round(strategy, round)?;
        }
        Ok(last)
    }

    /// `run_rounds` for every strategy in the config, in order.
    pub fn run_all(&self) -> Result<Vec<RunReport>, SingletonError> {
        self.config
            .strategies
            .iter()
            .map(|&strategy| self.run_rounds(strategy))
            .collect()
    }

    fn run_round(
        &self,
        strategy: InitializationStrategy,
        round: usize,
    ) -> Result<RunReport, SingletonError> {
        let constructor = CountingConstructor::probes(self.config.constructor_delay());
        let slot = SingletonSlot::new(strategy, || constructor.build())?;
        let observed = self.hammer(&slot, Probe::is_fully_built);

        let report = RunReport {
            strategy,
            round,
            callers: self.config.callers,
            constructions: constructor.calls(),
            distinct_instances: observed.distinct_instances(),
            fast_path_hits: observed.count(AccessPath::FastPath),
            failures: observed.failures(),
            concurrent_failures: observed.concurrent_failures(),
            all_fully_built: observed.incomplete == 0,
            elapsed: observed.elapsed,
        };

        match report.verdict() {
            Verdict::Violated => error!(
                %strategy,
                round,
                constructions = report.constructions,
                distinct = report.distinct_instances,
                "uniqueness violated by a thread-safe strategy"
            ),
            Verdict::DefectDemonstrated => warn!(
                %strategy,
                round,
                constructions = report.constructions,
                distinct = report.distinct_instances,
                "unsynchronized strategy built more than one instance"
            ),
            Verdict::Upheld | Verdict::DefectNotReproduced => info!(
                %strategy,
                round,
                fast_path = report.fast_path_hits,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "harness run finished"
            ),
        }
        Ok(report)
    }
}
