//! Engine counters, updated from the worker thread and read from anywhere.

use crate::error::QDaqError;
use crate::sync;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    ticks: AtomicU64,
    overruns: AtomicU64,
    compute_errors: AtomicU64,
    script_errors: AtomicU64,
    panics: AtomicU64,
    max_tick_us: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl EngineStats {
    pub(crate) fn reset(&self) {
        self.ticks.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
        self.compute_errors.store(0, Ordering::Relaxed);
        self.script_errors.store(0, Ordering::Relaxed);
        self.panics.store(0, Ordering::Relaxed);
        self.max_tick_us.store(0, Ordering::Relaxed);
        *sync::lock(&self.last_error) = None;
    }

    pub(crate) fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub(crate) fn record_tick(&self, took: Duration) {
        let us = took.as_micros().min(u64::MAX as u128) as u64;
        self.max_tick_us.fetch_max(us, Ordering::Relaxed);
        self.ticks.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, error: &QDaqError) {
        match error {
            QDaqError::Script { .. } => self.script_errors.fetch_add(1, Ordering::Relaxed),
            _ => self.compute_errors.fetch_add(1, Ordering::Relaxed),
        };
        *sync::lock(&self.last_error) = Some(error.to_string());
    }

    pub(crate) fn record_panic(&self, path: &str, tick: u64, message: &str) {
        self.panics.fetch_add(1, Ordering::Relaxed);
        *sync::lock(&self.last_error) =
            Some(format!("{} panicked at tick {}: {}", path, tick, message));
    }

    pub(crate) fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            ticks: self.ticks(),
            overruns: self.overruns.load(Ordering::Relaxed),
            compute_errors: self.compute_errors.load(Ordering::Relaxed),
            script_errors: self.script_errors.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            max_tick_time_us: self.max_tick_us.load(Ordering::Relaxed),
            last_error: sync::lock(&self.last_error).clone(),
        }
    }
}

/// Point-in-time copy of a loop engine's counters.
///
/// Counters restart from zero every time the loop is armed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    /// Completed ticks
    pub ticks: u64,
    /// Ticks whose work exceeded the period
    pub overruns: u64,
    /// Failed filter steps
    pub compute_errors: u64,
    /// Failed job steps
    pub script_errors: u64,
    /// Steps that panicked
    pub panics: u64,
    /// Longest tick so far, in microseconds
    pub max_tick_time_us: u64,
    /// Message of the most recent per-tick failure
    pub last_error: Option<String>,
}

impl EngineStatsSnapshot {
    /// Total failed steps of any kind.
    pub fn errors(&self) -> u64 {
        self.compute_errors + self.script_errors + self.panics
    }
}
