//! Cycle-counter clock.
//!
//! Timestamps come from `rdtsc`; its rate is measured once per process by
//! sleeping a fixed interval. Targets without a TSC fall back to a
//! nanosecond counter, which calibrates to roughly 1e9 ticks per second.

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
#[cfg(not(target_arch = "x86_64"))]
use std::time::Instant;

/// Sleep used to calibrate the process-wide clock.
pub const CALIBRATION_INTERVAL: Duration = Duration::from_secs(1);

static GLOBAL: OnceLock<TscClock> = OnceLock::new();

/// Current value of the cycle counter.
#[inline]
pub fn read_ticks() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: rdtsc is available on every x86-64 CPU.
        #[allow(unused_unsafe)]
        let ticks = unsafe { std::arch::x86_64::_rdtsc() };
        ticks
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

/// Rate of the cycle counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TscClock {
    ticks_per_second: u64,
}

impl TscClock {
    /// Measures the counter rate over `interval`.
    pub fn calibrate(interval: Duration) -> TscClock {
        log::info!("calibrating cycle counter over {interval:?}");
        let start = read_ticks();
        thread::sleep(interval);
        let delta = read_ticks().wrapping_sub(start);
        let clock = TscClock::from_ticks_per_second((delta as f64 / interval.as_secs_f64()) as u64);
        log::info!("cycle counter runs at {} ticks/s", clock.ticks_per_second);
        clock
    }

    /// Clock with a known rate, clamped to at least one tick per second.
    pub fn from_ticks_per_second(ticks_per_second: u64) -> TscClock {
        TscClock {
            ticks_per_second: ticks_per_second.max(1),
        }
    }

    /// Process-wide clock, calibrated on first use and never recomputed.
    pub fn global() -> &'static TscClock {
        GLOBAL.get_or_init(|| TscClock::calibrate(CALIBRATION_INTERVAL))
    }

    pub fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }

    pub fn to_seconds(&self, ticks: u64) -> f64 {
        ticks as f64 / self.ticks_per_second as f64
    }

    pub fn to_ticks(&self, seconds: f64) -> u64 {
        (seconds * self.ticks_per_second as f64) as u64
    }

    /// Seconds since `start`, a value of [`read_ticks`].
    pub fn since(&self, start: u64) -> f64 {
        self.to_seconds(read_ticks().saturating_sub(start))
    }
}

/// Named intervals between successive [`Stopwatch::start`] calls.
///
/// Starting a new interval (or calling [`Stopwatch::end`]) closes the
/// current one and logs its duration.
#[derive(Debug)]
pub struct Stopwatch {
    clock: TscClock,
    current: Option<(String, u64)>,
    laps: Vec<(String, f64)>,
}

impl Stopwatch {
    pub fn new(clock: TscClock) -> Self {
        Stopwatch {
            clock,
            current: None,
            laps: Vec::new(),
        }
    }

    pub fn start(&mut self, name: impl Into<String>) {
        self.close();
        self.current = Some((name.into(), read_ticks()));
    }

    pub fn end(&mut self) {
        self.close();
    }

    /// Closed intervals in seconds, oldest first.
    pub fn laps(&self) -> &[(String, f64)] {
        &self.laps
    }

    fn close(&mut self) {
        if let Some((name, start)) = self.current.take() {
            let seconds = self.clock.since(start);
            log::info!("[RDTSC] {name} took {:.2} us", seconds * 1e6);
            self.laps.push((name, seconds));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_are_deterministic() {
        let clock = TscClock::from_ticks_per_second(2_000_000_000);
        assert_eq!(clock.to_seconds(1_000_000_000), 0.5);
        assert_eq!(clock.to_ticks(0.25), 500_000_000);
        assert_eq!(TscClock::from_ticks_per_second(0).ticks_per_second(), 1);
    }

    #[test]
    fn test_calibration_measures_sleep() {
        let clock = TscClock::calibrate(Duration::from_millis(50));
        let start = read_ticks();
        thread::sleep(Duration::from_millis(20));
        let elapsed = clock.since(start);
        assert!(elapsed > 0.005, "measured {elapsed}s for a 20ms sleep");
    }

    #[test]
    fn test_stopwatch_records_laps() {
        let mut watch = Stopwatch::new(TscClock::from_ticks_per_second(1_000_000));
        watch.start("pack");
        watch.start("run");
        watch.end();
        watch.end();

        let names: Vec<&str> = watch.laps().iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["pack", "run"]);
        assert!(watch.laps().iter().all(|(_, seconds)| *seconds >= 0.0));
    }
}
