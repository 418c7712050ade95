use std::fmt;

use super::perf::HW_CYCLES;

/// Per-call average of one counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterAverage {
    pub name: String,
    pub value: u64,
}

/// Result of one [`Bench::run`](super::Bench::run).
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub label: String,
    /// Average seconds per measured call.
    pub avg_latency: f64,
    /// Calls actually measured.
    pub iterations: u64,
    /// Calls planned before measuring.
    pub estimated_iterations: u64,
    /// Seconds summed over the measured calls.
    pub total_seconds: f64,
    pub counters: Vec<CounterAverage>,
    pub ops_per_call: Option<f64>,
    /// Peak rate in ops per second.
    pub peak: Option<f64>,
    pub unit: String,
}

impl Report {
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counters.iter().find(|c| c.name == name).map(|c| c.value)
    }

    /// Achieved ops per second.
    pub fn throughput(&self) -> Option<f64> {
        let ops = self.ops_per_call.filter(|ops| *ops > 0.0)?;
        (self.avg_latency > 0.0).then(|| ops / self.avg_latency)
    }

    /// Achieved fraction of the peak rate.
    pub fn utilization(&self) -> Option<f64> {
        let peak = self.peak.filter(|peak| *peak > 0.0)?;
        Some(self.throughput()? / peak)
    }

    /// Ops per call divided by the average `HW_CYCLES` count.
    pub fn ops_per_cycle(&self) -> Option<f64> {
        let ops = self.ops_per_call.filter(|ops| *ops > 0.0)?;
        let cycles = self.counter(HW_CYCLES).filter(|cycles| *cycles > 0)?;
        Some(ops / cycles as f64)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t: {:.2} us x {}",
            self.label,
            self.avg_latency * 1e6,
            self.iterations
        )?;
        if let (Some(utilization), Some(throughput), Some(peak)) =
            (self.utilization(), self.throughput(), self.peak)
        {
            write!(
                f,
                ", {}% ({:.2} G{} /{:.2} G{})",
                (utilization * 100.0) as i64,
                throughput / 1e9,
                self.unit,
                peak / 1e9,
                self.unit
            )?;
        }
        for counter in &self.counters {
            write!(f, ", {}={}", counter.name, counter.value)?;
            if counter.name == HW_CYCLES {
                if let Some(ops_per_cycle) = self.ops_per_cycle() {
                    write!(f, " {ops_per_cycle:.2}(Ops/cycle)")?;
                }
            }
        }
        Ok(())
    }
}
