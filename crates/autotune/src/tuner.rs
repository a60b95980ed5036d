//! Empirical search driver.

use convforge_problem::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Shared flag a caller flips to stop a running search.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Stop conditions for one search.
#[derive(Debug, Clone, Default)]
pub struct SearchBudget {
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl SearchBudget {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn stop_reason(&self, started: Instant) -> Option<Error> {
        if self.cancel.is_cancelled() {
            return Some(Error::Cancelled);
        }
        match self.timeout {
            Some(limit) if started.elapsed() >= limit => Some(Error::Timeout {
                what: "empirical search".into(),
                limit,
            }),
            _ => None,
        }
    }
}

/// Best configuration found and its average time.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement<C> {
    pub config: C,
    pub average: Duration,
}

impl<C> Measurement<C> {
    pub fn average_ms(&self) -> f64 {
        self.average.as_secs_f64() * 1000.0
    }
}

pub struct Autotuner {
    runs: usize,
    warmup_runs: usize,
    budget: SearchBudget,
}

impl Default for Autotuner {
    fn default() -> Self {
        Self::new()
    }
}

impl Autotuner {
    pub fn new() -> Self {
        Self {
            runs: 5,
            warmup_runs: 1,
            budget: SearchBudget::default(),
        }
    }

    /// Untimed launches before each configuration, then timed launches
    /// averaged into its score. At least one launch is always timed.
    pub fn with_repetitions(self, warmup_runs: usize, runs: usize) -> Self {
        Self {
            warmup_runs,
            runs: runs.max(1),
            ..self
        }
    }

    pub fn with_budget(mut self, budget: SearchBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn runs(&self) -> usize {
        self.runs
    }

    pub fn warmup_runs(&self) -> usize {
        self.warmup_runs
    }

    pub fn budget(&self) -> &SearchBudget {
        &self.budget
    }

    /// Times every candidate with `measure` and returns the fastest.
    ///
    /// Candidates whose measurement fails are skipped. A later candidate only
    /// replaces the best when strictly faster. When the budget runs out the
    /// best so far is returned; the stop reason is the error only if nothing
    /// was measured yet.
    pub fn tune<C, I, F>(&self, candidates: I, mut measure: F) -> Result<Measurement<C>>
    where
        C: fmt::Debug,
        I: IntoIterator<Item = C>,
        F: FnMut(&C) -> Result<Duration>,
    {
        let started = Instant::now();
        let mut best: Option<Measurement<C>> = None;
        let mut tried = 0usize;

        for config in candidates {
            if let Some(reason) = self.budget.stop_reason(started) {
                debug!(tried, reason = %reason, "search stopped early");
                return best.ok_or(reason);
            }
            tried += 1;

            let average = match self.time_config(&config, &mut measure) {
                Ok(average) => average,
                Err(err) => {
                    warn!(config = ?config, error = %err, "skipping configuration");
                    continue;
                }
            };

            match &best {
                Some(current) if average >= current.average => {}
                _ => {
                    debug!(config = ?config, ?average, "new best configuration");
                    best = Some(Measurement { config, average });
                }
            }
        }

        best.ok_or_else(|| Error::unsupported(format!("none of {tried} tuning configurations could be measured")))
    }

    fn time_config<C, F>(&self, config: &C, measure: &mut F) -> Result<Duration>
    where
        F: FnMut(&C) -> Result<Duration>,
    {
        // Discarded: first launches include program upload.
        for _ in 0..self.warmup_runs {
            measure(config)?;
        }

        let mut total = Duration::default();
        for _ in 0..self.runs {
            total += measure(config)?;
        }
        Ok(total / self.runs as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn fastest_average_wins_and_ties_keep_first() {
        let tuner = Autotuner::new().with_repetitions(0, 3);
        let times = [("a", 5), ("b", 3), ("c", 3), ("d", 4)];
        let best = tuner
            .tune(times.iter(), |(_, t)| Ok(ms(*t)))
            .unwrap();
        assert_eq!(best.config.0, "b");
        assert_eq!(best.average, ms(3));
    }

    #[test]
    fn warmup_runs_are_not_counted() {
        let calls = Cell::new(0u32);
        let tuner = Autotuner::new().with_repetitions(2, 4);
        let best = tuner
            .tune([1u32], |_| {
                calls.set(calls.get() + 1);
                // Warmups are slow; measured runs are fast.
                Ok(if calls.get() <= 2 { ms(100) } else { ms(2) })
            })
            .unwrap();
        assert_eq!(calls.get(), 6);
        assert_eq!(best.average, ms(2));
    }

    #[test]
    fn failing_configurations_are_skipped() {
        let tuner = Autotuner::new().with_repetitions(0, 1);
        let best = tuner
            .tune([1, 2, 3], |c| {
                if *c == 1 {
                    Err(Error::compilation("k.cl", "", "bad tile"))
                } else {
                    Ok(ms(*c as u64))
                }
            })
            .unwrap();
        assert_eq!(best.config, 2);

        let err = tuner
            .tune([1], |_| Err(Error::compilation("k.cl", "", "bad")))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedProblem(_)));
    }

    #[test]
    fn cancellation_returns_best_so_far() {
        let token = CancellationToken::new();
        let tuner = Autotuner::new()
            .with_repetitions(0, 1)
            .with_budget(SearchBudget::new(token.clone()));

        let best = tuner
            .tune([1u64, 2, 3], |c| {
                if *c == 2 {
                    token.cancel();
                }
                Ok(ms(10 - c))
            })
            .unwrap();
        assert_eq!(best.config, 2);

        let err = tuner.tune([1u64], |_| Ok(ms(1))).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn deadline_stops_search() {
        let tuner = Autotuner::new()
            .with_repetitions(0, 1)
            .with_budget(SearchBudget::default().with_timeout(Some(ms(0))));
        let err = tuner.tune([1u64, 2], |_| Ok(ms(1))).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
