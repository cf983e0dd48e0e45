//! Per-run timing counters

use std::time::Duration;

/// Device time spent by one executed pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassResult {
    /// Nanoseconds spent in the kernel dispatch
    pub exec_nanos: u64,
    /// Nanoseconds spent in clears, uploads and downloads
    pub transfer_nanos: u64,
}

/// Accumulated counters of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    /// Total dispatch time in nanoseconds
    pub exec_nanos: u64,
    /// Total transfer time in nanoseconds, host staging included
    pub transfer_nanos: u64,
    /// Number of executed passes
    pub passes: usize,
}

impl Totals {
    /// Total dispatch time
    pub fn exec(&self) -> Duration {
        Duration::from_nanos(self.exec_nanos)
    }

    /// Total transfer time
    pub fn transfer(&self) -> Duration {
        Duration::from_nanos(self.transfer_nanos)
    }
}

/// Accumulates [`PassResult`]s across a run
#[derive(Debug, Default)]
pub struct Instrumentation {
    totals: Totals,
}

impl Instrumentation {
    /// Creates zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one executed pass
    pub fn record(&mut self, result: PassResult) {
        self.totals.exec_nanos = self.totals.exec_nanos.saturating_add(result.exec_nanos);
        self.totals.transfer_nanos = self.totals.transfer_nanos.saturating_add(result.transfer_nanos);
        self.totals.passes += 1;
    }

    /// Adds host-side staging time (mapped writes and reads)
    pub fn record_host_transfer(&mut self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.totals.transfer_nanos = self.totals.transfer_nanos.saturating_add(nanos);
    }

    /// Counters so far
    pub fn totals(&self) -> Totals {
        self.totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates() {
        let mut instrumentation = Instrumentation::new();
        instrumentation.record(PassResult { exec_nanos: 10, transfer_nanos: 5 });
        instrumentation.record(PassResult { exec_nanos: 0, transfer_nanos: 7 });
        instrumentation.record_host_transfer(Duration::from_nanos(3));

        let totals = instrumentation.totals();
        assert_eq!((totals.exec_nanos, totals.transfer_nanos, totals.passes), (10, 15, 2));
        assert_eq!(totals.exec(), Duration::from_nanos(10));
    }

    #[test]
    fn test_counters_saturate() {
        let mut instrumentation = Instrumentation::new();
        instrumentation.record(PassResult { exec_nanos: u64::MAX, transfer_nanos: 0 });
        instrumentation.record(PassResult { exec_nanos: 1, transfer_nanos: 0 });
        assert_eq!(instrumentation.totals().exec_nanos, u64::MAX);
    }
}
