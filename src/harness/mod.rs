//! Calibrated micro-benchmark harness.
//!
//! A [`Bench`] owns everything a measurement needs: the cycle-counter clock,
//! the open performance counters and the cache flusher. [`Bench::run`]
//! warms the operation up, decides how many calls to measure, times them and
//! returns a [`Report`].
//!
//! Two measurement modes exist:
//! - plain: one timed loop over all calls, counters read around the loop
//! - cache-clear: caches are evicted before every call and each call is
//!   timed and counted on its own; a time budget stops the loop early once
//!   the wall time since the first call (flushes included) exceeds it

pub mod clock;
pub mod flush;
pub mod peak;
pub mod perf;
pub mod report;

use std::time::Duration;

use crate::config::RunConfig;
use crate::error::Result;

pub use clock::{Stopwatch, TscClock, read_ticks};
pub use flush::{CacheFlusher, DEFAULT_FLUSH_BYTES};
pub use perf::{COUNTER_MASK, CounterSpec, HW_CYCLES, PerfCounter};
pub use report::{CounterAverage, Report};

/// How many calls to measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iterations {
    /// Exactly this many calls. `Count(1)` also skips the warm-up.
    Count(u64),
    /// As many calls as fit the budget, estimated from one timed call.
    Budget(Duration),
}

impl Iterations {
    /// Decodes the signed encoding used by `TIMES`: a positive value is a
    /// call count, a negative one a budget in milliseconds, zero is unset.
    pub fn from_raw(raw: i64) -> Option<Iterations> {
        match raw {
            0 => None,
            count if count > 0 => Some(Iterations::Count(count as u64)),
            budget => Some(Iterations::Budget(Duration::from_millis(budget.unsigned_abs()))),
        }
    }

    fn warm_up(self) -> bool {
        self != Iterations::Count(1)
    }
}

impl Default for Iterations {
    fn default() -> Self {
        Iterations::Budget(Duration::from_millis(1000))
    }
}

/// What is being measured: a label plus the optional inputs for rate lines.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    label: String,
    ops_per_call: Option<f64>,
    peak: Option<f64>,
    unit: String,
}

impl Workload {
    pub fn new(label: impl Into<String>) -> Self {
        Workload {
            label: label.into(),
            ops_per_call: None,
            peak: None,
            unit: "Ops".to_string(),
        }
    }

    pub fn ops_per_call(mut self, ops: f64) -> Self {
        self.ops_per_call = Some(ops);
        self
    }

    /// Peak rate in ops per second.
    pub fn peak(mut self, ops_per_second: f64) -> Self {
        self.peak = Some(ops_per_second);
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Measurement context.
#[derive(Debug)]
pub struct Bench {
    clock: TscClock,
    counters: Vec<PerfCounter>,
    flusher: CacheFlusher,
    clear_cache: bool,
    iterations: Option<Iterations>,
}

impl Bench {
    /// Uses the process-wide clock, calibrating it if this is the first use.
    pub fn new(config: &RunConfig) -> Self {
        Bench::with_clock(*TscClock::global(), config)
    }

    pub fn with_clock(clock: TscClock, config: &RunConfig) -> Self {
        Bench {
            clock,
            counters: Vec::new(),
            flusher: CacheFlusher::new(config.flush_bytes),
            clear_cache: config.clear_cache,
            iterations: config.iterations,
        }
    }

    /// Opens one perf counter per spec; any failure is returned.
    pub fn with_counters(mut self, specs: &[CounterSpec]) -> Result<Self> {
        for spec in specs {
            self.counters.push(PerfCounter::open(spec.clone())?);
        }
        Ok(self)
    }

    /// Evicts caches through `hook` instead of the scratch buffers.
    pub fn with_flush_hook(mut self, hook: impl FnMut() + 'static) -> Self {
        self.flusher = CacheFlusher::with_hook(hook);
        self
    }

    pub fn clock(&self) -> &TscClock {
        &self.clock
    }

    pub fn counters(&self) -> &[PerfCounter] {
        &self.counters
    }

    pub fn flusher(&self) -> &CacheFlusher {
        &self.flusher
    }

    /// Measures `op`. A configured iteration override replaces `iterations`.
    pub fn run(&mut self, workload: &Workload, iterations: Iterations, mut op: impl FnMut()) -> Report {
        let iterations = self.iterations.unwrap_or(iterations);

        if iterations.warm_up() {
            op();
            op();
        }

        let estimated = match iterations {
            Iterations::Count(count) => count.max(1),
            Iterations::Budget(budget) => {
                let start = read_ticks();
                op();
                let one_call = read_ticks().saturating_sub(start).max(1);
                (self.clock.to_ticks(budget.as_secs_f64()) / one_call).max(1)
            }
        };
        log::debug!("{}: measuring up to {estimated} calls", workload.label);

        let budget = match iterations {
            Iterations::Budget(budget) => Some(budget.as_secs_f64()),
            Iterations::Count(_) => None,
        };
        let (total_ticks, completed, sums) = if self.clear_cache {
            self.measure_flushed(estimated, budget, &mut op)
        } else {
            self.measure_loop(estimated, &mut op)
        };

        let total_seconds = self.clock.to_seconds(total_ticks);
        let counters = self
            .counters
            .iter()
            .zip(sums)
            .map(|(counter, sum)| CounterAverage {
                name: counter.name().to_string(),
                value: sum / completed,
            })
            .collect();

        Report {
            label: workload.label.clone(),
            avg_latency: total_seconds / completed as f64,
            iterations: completed,
            estimated_iterations: estimated,
            total_seconds,
            counters,
            ops_per_call: workload.ops_per_call,
            peak: workload.peak,
            unit: workload.unit.clone(),
        }
    }

    fn read_counters(&self) -> Vec<u64> {
        self.counters.iter().map(PerfCounter::read).collect()
    }

    fn measure_loop(&mut self, calls: u64, op: &mut impl FnMut()) -> (u64, u64, Vec<u64>) {
        let before = self.read_counters();
        let start = read_ticks();
        for _ in 0..calls {
            op();
        }
        let finish = read_ticks();
        let sums = self
            .read_counters()
            .into_iter()
            .zip(before)
            .map(|(after, before)| after.wrapping_sub(before) & COUNTER_MASK)
            .collect();
        (finish.saturating_sub(start), calls, sums)
    }

    fn measure_flushed(&mut self, calls: u64, budget: Option<f64>, op: &mut impl FnMut()) -> (u64, u64, Vec<u64>) {
        let mut sums = vec![0u64; self.counters.len()];
        let mut total = 0u64;
        let mut completed = 0u64;
        let first = read_ticks();

        while completed < calls {
            self.flusher.flush();
            let before = self.read_counters();
            let start = read_ticks();
            op();
            let finish = read_ticks();
            for ((sum, counter), before) in sums.iter_mut().zip(&self.counters).zip(before) {
                *sum += counter.read().wrapping_sub(before) & COUNTER_MASK;
            }
            total += finish.saturating_sub(start);
            completed += 1;

            if let Some(budget) = budget {
                if self.clock.to_seconds(finish.saturating_sub(first)) > budget {
                    log::debug!("budget of {budget}s spent after {completed} of {calls} calls");
                    break;
                }
            }
        }
        (total, completed, sums)
    }
}
