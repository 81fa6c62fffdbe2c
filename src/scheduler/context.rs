use std::time::Duration;

/// Per-tick information handed to filters and jobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickContext {
    /// Index of this tick since the engine was last armed, starting at 0.
    pub tick: u64,
    /// Configured loop period.
    pub period: Duration,
    /// Time since the engine was armed.
    pub elapsed: Duration,
}

impl TickContext {
    pub fn new(tick: u64, period: Duration, elapsed: Duration) -> Self {
        Self {
            tick,
            period,
            elapsed,
        }
    }

    /// Integration step in seconds. Always the configured period, never the
    /// measured interval, so filter output does not depend on timer jitter.
    pub fn dt_secs(&self) -> f64 {
        self.period.as_secs_f64()
    }

    pub fn time_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}
