//! Channels: timestamped value holders.
//!
//! A channel is the only state shared between loop engines. Its current sample
//! and history sit behind a per-channel `RwLock`: one writer at a time, readers
//! always see the latest fully written sample.
//!
//! ## Source types
//!
//! - [`SourceType::Generic`] - changes only when pushed or written by a filter/job
//! - [`SourceType::Clock`] - set to wall-clock seconds since the Unix epoch on every tick
//! - [`SourceType::Random`] - set to a uniform random value in `[min, max)` on every tick
//! - [`SourceType::Increment`] / [`SourceType::Decrement`] - current value plus / minus one on every tick
//!
//! Source types are evaluated by the owning loop's engine once per tick, never on read.
//!
//! ## Processing
//!
//! Every raw value written to a channel (pushed, produced by its source, or
//! written by a filter or job) passes through the channel's [`Processing`]
//! before it becomes the current value:
//!
//! 1. the raw value enters a buffer of the last `depth` raw values,
//! 2. the buffer is reduced by the [`Averaging`] rule,
//! 3. `value = multiplier * average + offset`,
//! 4. the result is clamped to `limits` when set.
//!
//! The default processing passes raw values through unchanged. The spread of
//! the averaged values is available from [`Channel::deviation`].

use crate::error::{QDaqError, Result};
use crate::sync;
use crate::tree::NodeCore;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Default number of samples kept in a channel's history ring.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Largest accepted averaging depth.
pub const MAX_AVERAGING_DEPTH: usize = 65_536;

/// Forgetting factor used when none is given.
pub const DEFAULT_FORGETTING_FACTOR: f64 = 0.99;

/// A single timestamped value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    /// Sample stamped with the current wall-clock time.
    pub fn now(value: f64) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
        }
    }
}

/// How a channel acquires its value on each tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum SourceType {
    /// Unchanged unless pushed.
    #[default]
    Generic,
    /// Wall-clock time in seconds.
    Clock,
    /// Uniform random value in `[min, max)`.
    Random { min: f64, max: f64 },
    /// Current value plus one.
    Increment,
    /// Current value minus one.
    Decrement,
}

impl SourceType {
    /// Random source over `[0, 1)`.
    pub fn uniform() -> Self {
        SourceType::Random { min: 0.0, max: 1.0 }
    }

    fn validate(&self) -> Result<()> {
        if let SourceType::Random { min, max } = *self {
            if !min.is_finite() || !max.is_finite() || min > max {
                return Err(QDaqError::Config(format!(
                    "Invalid random range [{}, {})",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

/// How the buffered raw values of a channel are reduced to one value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Averaging {
    /// Latest raw value
    #[default]
    None,
    /// Arithmetic mean of the buffer
    Running,
    /// Mean of successive differences with alternating sign. Demodulates a
    /// signal whose sign flips on every write.
    Delta,
    /// Exponentially weighted mean; the k-th newest value has weight
    /// `(1 - f) * f^k`.
    ForgettingFactor(f64),
}

/// Signal conditioning applied to every raw value written to a channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Processing {
    pub averaging: Averaging,
    /// Number of raw values averaged, at least 1
    pub depth: usize,
    pub multiplier: f64,
    pub offset: f64,
    /// Inclusive `(low, high)` clamp applied last
    pub limits: Option<(f64, f64)>,
}

impl Default for Processing {
    fn default() -> Self {
        Self {
            averaging: Averaging::None,
            depth: 1,
            multiplier: 1.0,
            offset: 0.0,
            limits: None,
        }
    }
}

impl Processing {
    pub fn validate(&self) -> Result<()> {
        if self.depth == 0 || self.depth > MAX_AVERAGING_DEPTH {
            return Err(QDaqError::Config(format!(
                "averaging depth must be in 1..={}, got {}",
                MAX_AVERAGING_DEPTH, self.depth
            )));
        }
        if let Averaging::ForgettingFactor(f) = self.averaging {
            if !(f > 0.0 && f < 1.0) {
                return Err(QDaqError::Config(format!(
                    "forgetting factor must be in (0, 1), got {}",
                    f
                )));
            }
        }
        if !self.multiplier.is_finite() || !self.offset.is_finite() {
            return Err(QDaqError::Config(format!(
                "multiplier and offset must be finite, got {} and {}",
                self.multiplier, self.offset
            )));
        }
        if let Some((low, high)) = self.limits {
            if !(low <= high) {
                return Err(QDaqError::Config(format!("Invalid limits [{}, {}]", low, high)));
            }
        }
        Ok(())
    }

    /// Reduce `raw` (newest first, never empty) to `(mean, deviation)`.
    /// `writes` is the number of raw values seen since the buffer was reset.
    fn average(&self, raw: &VecDeque<f64>, writes: u64) -> (f64, f64) {
        let m = raw.len();
        let (mean, mean_sq) = match self.averaging {
            Averaging::None => return (raw[0], 0.0),
            _ if m < 2 => return (raw[0], 0.0),
            Averaging::Running => {
                let n = m as f64;
                (
                    raw.iter().sum::<f64>() / n,
                    raw.iter().map(|y| y * y).sum::<f64>() / n,
                )
            }
            Averaging::Delta => {
                let mut sign = if writes % 2 == 1 { -1.0 } else { 1.0 };
                let (mut sum, mut sum_sq) = (0.0, 0.0);
                for (newer, older) in raw.iter().zip(raw.iter().skip(1)) {
                    let d = older - newer;
                    sum += d * sign;
                    sum_sq += d * d;
                    sign = -sign;
                }
                let n = (m - 1) as f64;
                (sum / (2.0 * n), sum_sq / (4.0 * n))
            }
            Averaging::ForgettingFactor(f) => {
                let mut weight = 1.0 - f;
                let (mut sum, mut sum_sq) = (0.0, 0.0);
                for y in raw {
                    sum += y * weight;
                    sum_sq += y * y * weight;
                    weight *= f;
                }
                // Normalized over the values actually buffered.
                let norm = 1.0 / (1.0 - f.powi(m as i32));
                (sum * norm, sum_sq * norm)
            }
        };
        (mean, (mean_sq - mean * mean).max(0.0).sqrt())
    }

    fn scale(&self, mean: f64) -> f64 {
        let mut value = if self.multiplier != 1.0 || self.offset != 0.0 {
            self.multiplier * mean + self.offset
        } else {
            mean
        };
        // Comparisons rather than `f64::clamp` so NaN passes through.
        if let Some((low, high)) = self.limits {
            if value < low {
                value = low;
            } else if value > high {
                value = high;
            }
        }
        value
    }
}

/// Receives value-change notifications from a channel.
///
/// Called on the thread that performed the write: the engine thread for
/// tick-driven changes, the caller's thread for [`Channel::push`].
#[cfg_attr(test, mockall::automock)]
pub trait ChannelObserver: Send + Sync {
    fn value_changed(&self, path: &str, sample: &Sample);
}

/// Handle returned by [`Channel::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

struct ChannelState {
    current: Sample,
    deviation: f64,
    history: VecDeque<Sample>,
    capacity: usize,
    processing: Processing,
    /// Raw values, newest first, at most `processing.depth`
    raw: VecDeque<f64>,
    writes: u64,
}

impl ChannelState {
    /// Feed one raw value through the processing chain and record the result.
    fn apply(&mut self, raw: f64, timestamp: DateTime<Utc>) -> (Sample, Sample) {
        let processing = self.processing;
        self.raw.push_front(raw);
        self.raw.truncate(processing.depth);
        self.writes += 1;

        let (mean, deviation) = processing.average(&self.raw, self.writes);
        self.deviation = processing.multiplier.abs() * deviation;
        let sample = Sample {
            value: processing.scale(mean),
            timestamp,
        };
        (self.record(sample), sample)
    }

    /// Latest raw value, or the current value when nothing is buffered.
    fn last_raw(&self) -> f64 {
        self.raw.front().copied().unwrap_or(self.current.value)
    }

    fn reset_averaging(&mut self) {
        self.raw.clear();
        self.writes = 0;
    }

    fn record(&mut self, sample: Sample) -> Sample {
        let prev = std::mem::replace(&mut self.current, sample);
        if self.capacity > 0 {
            while self.history.len() >= self.capacity {
                self.history.pop_front();
            }
            self.history.push_back(sample);
        }
        prev
    }
}

/// A named, timestamped data holder.
pub struct Channel {
    core: NodeCore,
    source: RwLock<SourceType>,
    state: RwLock<ChannelState>,
    observers: RwLock<Vec<(ObserverId, Arc<dyn ChannelObserver>)>>,
    next_observer_id: AtomicU64,
}

impl Channel {
    /// Create a generic channel with value 0.
    pub fn new(name: impl Into<String>) -> Result<Arc<Self>> {
        Self::with_source(name, SourceType::Generic)
    }

    /// Create a channel with the given source type.
    pub fn with_source(name: impl Into<String>, source: SourceType) -> Result<Arc<Self>> {
        source.validate()?;
        Ok(Arc::new(Self {
            core: NodeCore::new(name)?,
            source: RwLock::new(source),
            state: RwLock::new(ChannelState {
                current: Sample::now(0.0),
                deviation: 0.0,
                history: VecDeque::new(),
                capacity: DEFAULT_HISTORY_CAPACITY,
                processing: Processing::default(),
                raw: VecDeque::new(),
                writes: 0,
            }),
            observers: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(0),
        }))
    }

    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn full_path(&self) -> String {
        self.core.full_path()
    }

    pub fn source_type(&self) -> SourceType {
        *sync::read(&self.source)
    }

    /// Change the source type. Rejected while the owning loop runs.
    pub fn set_source_type(&self, source: SourceType) -> Result<()> {
        source.validate()?;
        if self.core.owner_running() {
            return Err(QDaqError::ConfigurationWhileRunning(self.full_path()));
        }
        *sync::write(&self.source) = source;
        Ok(())
    }

    pub fn processing(&self) -> Processing {
        sync::read(&self.state).processing
    }

    /// Replace the processing chain and empty the averaging buffer. Rejected
    /// while the owning loop runs.
    pub fn set_processing(&self, processing: Processing) -> Result<()> {
        processing.validate()?;
        if self.core.owner_running() {
            return Err(QDaqError::ConfigurationWhileRunning(self.full_path()));
        }
        let mut state = sync::write(&self.state);
        state.processing = processing;
        state.reset_averaging();
        Ok(())
    }

    /// Forget buffered raw values; the next write starts a fresh average.
    pub fn reset_averaging(&self) {
        sync::write(&self.state).reset_averaging();
    }

    /// Standard deviation of the values behind the current average, scaled by
    /// the multiplier. Zero without averaging.
    pub fn deviation(&self) -> f64 {
        sync::read(&self.state).deviation
    }

    /// Current value.
    pub fn value(&self) -> f64 {
        sync::read(&self.state).current.value
    }

    /// Current value and the time it was written.
    pub fn sample(&self) -> Sample {
        sync::read(&self.state).current
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        sync::read(&self.state).current.timestamp
    }

    /// Copy of the history ring, oldest first.
    pub fn history(&self) -> Vec<Sample> {
        sync::read(&self.state).history.iter().copied().collect()
    }

    pub fn history_capacity(&self) -> usize {
        sync::read(&self.state).capacity
    }

    /// Resize the history ring. A capacity of 0 disables history.
    pub fn set_history_capacity(&self, capacity: usize) {
        let mut state = sync::write(&self.state);
        state.capacity = capacity;
        while state.history.len() > capacity {
            state.history.pop_front();
        }
    }

    pub fn clear_history(&self) {
        sync::write(&self.state).history.clear();
    }

    /// Write a raw value, stamped now, and notify observers if the processed
    /// value changed.
    ///
    /// Dependent filters only see the new value on their loop's next tick.
    pub fn push(&self, value: f64) {
        let (prev, sample) = self.store(value);
        if changed(&prev, &sample) {
            self.notify(&sample);
        }
    }

    /// Write without notifying. Returns the previous and new samples.
    pub(crate) fn store(&self, value: f64) -> (Sample, Sample) {
        sync::write(&self.state).apply(value, Utc::now())
    }

    /// Apply the source-type rule for one tick.
    pub(crate) fn evaluate_source(self: &Arc<Self>, changes: &mut ChangeSet) {
        match self.source_type() {
            SourceType::Generic => {}
            SourceType::Clock => {
                let now = Utc::now();
                let secs = now.timestamp_micros() as f64 / 1e6;
                // Wall clocks can step backwards; a clock channel never does.
                let mut state = sync::write(&self.state);
                let raw = secs.max(state.last_raw());
                let (prev, sample) = state.apply(raw, now);
                drop(state);
                changes.record(self, prev, sample);
            }
            SourceType::Random { min, max } => {
                let value = if max > min {
                    rand::thread_rng().gen_range(min..max)
                } else {
                    min
                };
                changes.write(self, value);
            }
            SourceType::Increment => {
                changes.write(self, self.value() + 1.0);
            }
            SourceType::Decrement => {
                changes.write(self, self.value() - 1.0);
            }
        }
    }

    /// Register an observer for value changes.
    pub fn subscribe(&self, observer: Arc<dyn ChannelObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::Relaxed));
        sync::write(&self.observers).push((id, observer));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = sync::write(&self.observers);
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        sync::read(&self.observers).len()
    }

    pub(crate) fn notify(&self, sample: &Sample) {
        let observers: Vec<Arc<dyn ChannelObserver>> = sync::read(&self.observers)
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        if observers.is_empty() {
            return;
        }
        let path = self.full_path();
        for observer in observers {
            observer.value_changed(&path, sample);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("path", &self.full_path())
            .field("source", &self.source_type())
            .field("processing", &self.processing())
            .field("value", &self.value())
            .finish()
    }
}

fn changed(prev: &Sample, new: &Sample) -> bool {
    prev.value.to_bits() != new.value.to_bits()
}

/// Channel writes made during one step, notified after the step completes.
#[derive(Default)]
pub struct ChangeSet {
    entries: Vec<(Arc<Channel>, Sample)>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value` to `channel`, recording it if the value changed.
    pub fn write(&mut self, channel: &Arc<Channel>, value: f64) -> Sample {
        let (prev, sample) = channel.store(value);
        self.record(channel, prev, sample);
        sample
    }

    fn record(&mut self, channel: &Arc<Channel>, prev: Sample, sample: Sample) {
        if !changed(&prev, &sample) {
            return;
        }
        match self
            .entries
            .iter_mut()
            .find(|(c, _)| Arc::ptr_eq(c, channel))
        {
            Some(entry) => entry.1 = sample,
            None => self.entries.push((channel.clone(), sample)),
        }
    }

    /// Move all recorded changes into `other`.
    pub fn merge_into(self, other: &mut ChangeSet) {
        for (channel, sample) in self.entries {
            match other
                .entries
                .iter_mut()
                .find(|(c, _)| Arc::ptr_eq(c, &channel))
            {
                Some(entry) => entry.1 = sample,
                None => other.entries.push((channel, sample)),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Paths of the changed channels, in first-write order.
    pub fn paths(&self) -> Vec<String> {
        self.entries.iter().map(|(c, _)| c.full_path()).collect()
    }

    /// Notify observers of every changed channel with its latest sample.
    pub fn notify(self) {
        for (channel, sample) in self.entries {
            channel.notify(&sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_push_updates_value_and_history() {
        let ch = Channel::new("u").unwrap();
        ch.push(1.0);
        ch.push(2.5);
        assert_eq!(ch.value(), 2.5);
        let history = ch.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].value, 1.0);
        assert!(history[0].timestamp <= history[1].timestamp);
    }

    #[test]
    fn test_history_is_bounded() {
        let ch = Channel::new("u").unwrap();
        ch.set_history_capacity(3);
        for i in 0..10 {
            ch.push(i as f64);
        }
        let values: Vec<f64> = ch.history().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![7.0, 8.0, 9.0]);

        ch.set_history_capacity(0);
        ch.push(42.0);
        assert!(ch.history().is_empty());
        assert_eq!(ch.value(), 42.0);
    }

    #[test]
    fn test_generic_source_unchanged_by_tick() {
        let ch = Channel::new("g").unwrap();
        ch.push(3.0);
        let mut changes = ChangeSet::new();
        ch.evaluate_source(&mut changes);
        assert!(changes.is_empty());
        assert_eq!(ch.value(), 3.0);
    }

    #[test]
    fn test_clock_source_non_decreasing() {
        let ch = Channel::with_source("t", SourceType::Clock).unwrap();
        let mut last = f64::MIN;
        for _ in 0..100 {
            let mut changes = ChangeSet::new();
            ch.evaluate_source(&mut changes);
            assert!(ch.value() >= last);
            last = ch.value();
        }
        assert!(last > 1.0e9, "clock should be seconds since the epoch");
    }

    #[test]
    fn test_random_source_range() {
        let ch = Channel::with_source("r", SourceType::Random { min: 2.0, max: 3.0 }).unwrap();
        for _ in 0..200 {
            let mut changes = ChangeSet::new();
            ch.evaluate_source(&mut changes);
            let v = ch.value();
            assert!((2.0..3.0).contains(&v), "{} out of range", v);
        }

        let fixed = Channel::with_source("f", SourceType::Random { min: 5.0, max: 5.0 }).unwrap();
        let mut changes = ChangeSet::new();
        fixed.evaluate_source(&mut changes);
        assert_eq!(fixed.value(), 5.0);
    }

    #[test]
    fn test_invalid_random_range_rejected() {
        let err = Channel::with_source("r", SourceType::Random { min: 1.0, max: 0.0 });
        assert!(matches!(err, Err(QDaqError::Config(_))));
    }

    #[test]
    fn test_push_notifies_observer() {
        let ch = Channel::new("y").unwrap();
        let mut mock = MockChannelObserver::new();
        mock.expect_value_changed()
            .withf(|path, s| path == "y" && s.value == 4.0)
            .times(1)
            .return_const(());
        ch.subscribe(Arc::new(mock));
        ch.push(4.0);
        // Same value again is not a change
        ch.push(4.0);
    }

    #[test]
    fn test_unsubscribe() {
        let ch = Channel::new("y").unwrap();
        let mut mock = MockChannelObserver::new();
        mock.expect_value_changed().times(0);
        let id = ch.subscribe(Arc::new(mock));
        assert_eq!(ch.observer_count(), 1);
        assert!(ch.unsubscribe(id));
        assert!(!ch.unsubscribe(id));
        ch.push(1.0);
    }

    #[test]
    fn test_change_set_keeps_latest_per_channel() {
        let a = Channel::new("a").unwrap();
        let b = Channel::new("b").unwrap();
        let mut changes = ChangeSet::new();
        changes.write(&a, 1.0);
        changes.write(&b, 2.0);
        changes.write(&a, 3.0);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes.paths(), vec!["a".to_string(), "b".to_string()]);

        let mut mock = MockChannelObserver::new();
        mock.expect_value_changed()
            .withf(|path, s| path == "a" && s.value == 3.0)
            .times(1)
            .return_const(());
        a.subscribe(Arc::new(mock));
        changes.notify();
    }

    #[test]
    fn test_increment_and_decrement_sources() {
        let up = Channel::with_source("up", SourceType::Increment).unwrap();
        let down = Channel::with_source("down", SourceType::Decrement).unwrap();
        up.push(10.0);
        for _ in 0..3 {
            let mut changes = ChangeSet::new();
            up.evaluate_source(&mut changes);
            down.evaluate_source(&mut changes);
            assert_eq!(changes.len(), 2);
        }
        assert_eq!(up.value(), 13.0);
        assert_eq!(down.value(), -3.0);
    }

    #[test]
    fn test_default_processing_passes_raw_values() {
        let ch = Channel::new("x").unwrap();
        for v in [1.5, -0.0, f64::INFINITY, 7.25] {
            ch.push(v);
            assert_eq!(ch.value().to_bits(), v.to_bits());
        }
        ch.push(f64::NAN);
        assert!(ch.value().is_nan());
        assert_eq!(ch.deviation(), 0.0);
    }

    #[test]
    fn test_running_average_and_deviation() {
        let ch = Channel::new("x").unwrap();
        ch.set_processing(Processing {
            averaging: Averaging::Running,
            depth: 4,
            ..Processing::default()
        })
        .unwrap();

        ch.push(2.0);
        assert_eq!(ch.value(), 2.0);
        ch.push(4.0);
        assert_eq!(ch.value(), 3.0);
        assert!((ch.deviation() - 1.0).abs() < 1e-12);

        for v in [4.0, 4.0, 4.0, 4.0] {
            ch.push(v);
        }
        // Older values fell out of the window
        assert_eq!(ch.value(), 4.0);
        assert_eq!(ch.deviation(), 0.0);
    }

    #[test]
    fn test_delta_average_demodulates_alternating_signal() {
        let ch = Channel::new("x").unwrap();
        ch.set_processing(Processing {
            averaging: Averaging::Delta,
            depth: 5,
            ..Processing::default()
        })
        .unwrap();
        // Square wave of amplitude 1.5 around 10
        for i in 0..8 {
            ch.push(if i % 2 == 0 { 11.5 } else { 8.5 });
            if i > 0 {
                assert!((ch.value().abs() - 1.5).abs() < 1e-12, "write {}", i);
                assert!(ch.deviation() < 1e-12);
            }
        }
    }

    #[test]
    fn test_forgetting_factor_weights_recent_values() {
        let ch = Channel::new("x").unwrap();
        ch.set_processing(Processing {
            averaging: Averaging::ForgettingFactor(0.5),
            depth: 2,
            ..Processing::default()
        })
        .unwrap();
        ch.push(0.0);
        ch.push(3.0);
        // Weights 0.5 and 0.25 normalized by 1 / (1 - 0.25)
        assert!((ch.value() - 2.0).abs() < 1e-12);

        ch.set_processing(Processing {
            averaging: Averaging::ForgettingFactor(DEFAULT_FORGETTING_FACTOR),
            depth: 10,
            ..Processing::default()
        })
        .unwrap();
        for _ in 0..10 {
            ch.push(5.0);
        }
        assert!((ch.value() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_scaling_and_limits() {
        let ch = Channel::new("x").unwrap();
        ch.set_processing(Processing {
            multiplier: 2.0,
            offset: 1.0,
            limits: Some((0.0, 10.0)),
            ..Processing::default()
        })
        .unwrap();
        ch.push(3.0);
        assert_eq!(ch.value(), 7.0);
        ch.push(100.0);
        assert_eq!(ch.value(), 10.0);
        ch.push(-5.0);
        assert_eq!(ch.value(), 0.0);
        ch.push(f64::NAN);
        assert!(ch.value().is_nan());
    }

    #[test]
    fn test_invalid_processing_rejected() {
        let ch = Channel::new("x").unwrap();
        let bad = [
            Processing {
                depth: 0,
                ..Processing::default()
            },
            Processing {
                averaging: Averaging::ForgettingFactor(1.0),
                ..Processing::default()
            },
            Processing {
                multiplier: f64::NAN,
                ..Processing::default()
            },
            Processing {
                limits: Some((1.0, f64::NAN)),
                ..Processing::default()
            },
            Processing {
                limits: Some((2.0, 1.0)),
                ..Processing::default()
            },
        ];
        for p in bad {
            assert!(matches!(ch.set_processing(p), Err(QDaqError::Config(_))), "{:?}", p);
        }
        assert_eq!(ch.processing(), Processing::default());
    }

    #[test]
    fn test_reset_averaging_starts_fresh() {
        let ch = Channel::new("x").unwrap();
        ch.set_processing(Processing {
            averaging: Averaging::Running,
            depth: 8,
            ..Processing::default()
        })
        .unwrap();
        ch.push(100.0);
        ch.reset_averaging();
        ch.push(1.0);
        assert_eq!(ch.value(), 1.0);
    }

    proptest! {
        #[test]
        fn prop_random_source_within_range(min in -1.0e6f64..1.0e6, width in 0.0f64..1.0e3) {
            let max = min + width;
            let ch = Channel::with_source("r", SourceType::Random { min, max }).unwrap();
            let mut changes = ChangeSet::new();
            ch.evaluate_source(&mut changes);
            let v = ch.value();
            prop_assert!(v >= min && (v < max || (max == min && v == min)));
        }

        #[test]
        fn prop_clock_never_below_pushed_value(offset in 0.0f64..1.0e9) {
            let ch = Channel::with_source("t", SourceType::Clock).unwrap();
            let ahead = Utc::now().timestamp() as f64 + offset;
            ch.push(ahead);
            let mut changes = ChangeSet::new();
            ch.evaluate_source(&mut changes);
            prop_assert!(ch.value() >= ahead);
        }

        #[test]
        fn prop_running_average_within_window_bounds(
            values in proptest::collection::vec(-1.0e6f64..1.0e6, 1..40),
            depth in 1usize..10,
        ) {
            let ch = Channel::new("x").unwrap();
            ch.set_processing(Processing {
                averaging: Averaging::Running,
                depth,
                ..Processing::default()
            })
            .unwrap();
            for v in &values {
                ch.push(*v);
            }
            let window = &values[values.len().saturating_sub(depth)..];
            let lo = window.iter().cloned().fold(f64::INFINITY, f64::min);
            let hi = window.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let v = ch.value();
            prop_assert!(v >= lo - 1e-6 && v <= hi + 1e-6, "{} not in [{}, {}]", v, lo, hi);
        }
    }
}
