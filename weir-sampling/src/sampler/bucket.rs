use std::fmt::Write;

use rand_pcg::Pcg32;

use crate::observation::Observation;
use crate::protocol::MetricType;

use super::reservoir::TimerValue;

/// Computes the number of original observations a single line stands for,
/// given the sample rate the producer already applied.
pub(super) fn effective_count(sample_rate: f64) -> f64 {
    if sample_rate > 0.0 && sample_rate < 1.0 {
        1.0 / sample_rate
    } else {
        1.0
    }
}

/// Formats one output line into the reused buffer.
///
/// Output lines always carry the `@<rate>` clause so that downstream
/// aggregators can un-sample them.
pub(super) fn format_line(buffer: &mut String, key: &str, value: f64, ty: MetricType, rate: f64) {
    buffer.clear();
    write!(buffer, "{key}:{value}|{ty}@{rate}").ok();
}

/// Window aggregation state for a sampled counter key.
#[derive(Clone, Debug, Default)]
pub(super) struct CounterValue {
    /// Accumulated sum, compensated for pre-applied sampling.
    pub sum: f64,
    /// Effective observation count, compensated for pre-applied sampling.
    pub count: f64,
}

impl CounterValue {
    /// Absorbs one observation into the window aggregate.
    ///
    /// The value is un-sampled first: an observation sent at rate `r`
    /// stands for `1/r` originals, so both the contributed value and the
    /// contributed count are scaled by `1/r`.
    pub fn absorb(&mut self, value: f64, sample_rate: f64) {
        let count = effective_count(sample_rate);
        self.sum += value * count;
        self.count += count;
    }

    /// Serializes the aggregate as a single counter line and resets it.
    ///
    /// The line reports the mean at an effective rate of `1/count`:
    /// downstream reads it as one observation sampled at that rate, which
    /// un-samples back to the accumulated sum.
    ///
    /// The caller must ensure `count` is non-zero.
    pub fn flush_into<F>(&mut self, key: &str, buffer: &mut String, emit: &mut F) -> u64
    where
        F: FnMut(&str, &str),
    {
        format_line(
            buffer,
            key,
            self.sum / self.count,
            MetricType::Counter,
            1.0 / self.count,
        );
        emit(key, buffer.as_str());

        self.sum = 0.0;
        self.count = 0.0;
        1
    }
}

/// The per-type window aggregation of a [`Bucket`].
#[derive(Clone, Debug)]
pub(super) enum BucketValue {
    /// Sum/count aggregation for counters.
    Counter(CounterValue),
    /// Reservoir plus extrema for timers.
    Timer(TimerValue),
}

impl BucketValue {
    /// Creates the aggregation state for a metric type.
    ///
    /// Returns `None` for the types the sampler forwards untouched.
    pub fn new(ty: MetricType, reservoir_size: usize) -> Option<Self> {
        match ty {
            MetricType::Counter => Some(Self::Counter(CounterValue::default())),
            MetricType::Timer => Some(Self::Timer(TimerValue::new(reservoir_size))),
            _ => None,
        }
    }

    /// Returns the metric type this aggregation was created for.
    pub fn ty(&self) -> MetricType {
        match self {
            Self::Counter(_) => MetricType::Counter,
            Self::Timer(_) => MetricType::Timer,
        }
    }

    fn count(&self) -> f64 {
        match self {
            Self::Counter(counter) => counter.count,
            Self::Timer(timer) => timer.count,
        }
    }

    /// Discards the window aggregation without emitting it.
    fn reset(&mut self) {
        match self {
            Self::Counter(counter) => {
                counter.sum = 0.0;
                counter.count = 0.0;
            }
            Self::Timer(timer) => timer.reset(),
        }
    }
}

/// Per-key sampling state.
///
/// A bucket is created on first observation of its key and lives for the
/// lifetime of the engine. Its metric type is fixed at creation by the
/// [`BucketValue`] variant.
#[derive(Clone, Debug)]
pub(super) struct Bucket {
    sampling: bool,
    last_window_count: u64,
    value: BucketValue,
}

impl Bucket {
    /// Creates a bucket for a key whose first observation just arrived.
    ///
    /// The first arrival is already recorded in the window counter.
    pub fn new(value: BucketValue) -> Self {
        Self {
            sampling: false,
            last_window_count: 1,
            value,
        }
    }

    pub fn ty(&self) -> MetricType {
        self.value.ty()
    }

    pub fn is_sampling(&self) -> bool {
        self.sampling
    }

    #[cfg(test)]
    pub fn last_window_count(&self) -> u64 {
        self.last_window_count
    }

    /// Records an arrival for this window.
    ///
    /// Returns `true` if this arrival moved the bucket from passthrough
    /// into sampling mode.
    pub fn record_arrival(&mut self, threshold: u64) -> bool {
        self.last_window_count += 1;

        if !self.sampling && self.last_window_count > threshold {
            self.sampling = true;
            return true;
        }

        false
    }

    /// Absorbs an observation into the window aggregation.
    ///
    /// Must only be called while the bucket is sampling and with an
    /// observation of the bucket's own type.
    pub fn absorb(&mut self, observation: &Observation<'_>, rng: &mut Pcg32) {
        match &mut self.value {
            BucketValue::Counter(counter) => {
                counter.absorb(observation.value, observation.sample_rate)
            }
            BucketValue::Timer(timer) => timer.absorb(
                observation.value,
                observation.sample_rate,
                self.last_window_count,
                rng,
            ),
        }
    }

    /// Runs the window-boundary update.
    ///
    /// A bucket whose window count exceeded `threshold` stays in (or
    /// enters) sampling mode for the next window; otherwise sampling
    /// disengages and the candidate pool is dropped. The window counter
    /// starts over either way.
    ///
    /// Returns `true` if the bucket left sampling mode.
    pub fn advance_window(&mut self, threshold: u64) -> bool {
        let mut stopped = false;

        if self.last_window_count > threshold {
            self.sampling = true;
        } else if self.sampling {
            self.sampling = false;
            // Anything absorbed but never emitted is dropped with the mode.
            self.value.reset();
            stopped = true;
        }

        self.last_window_count = 0;
        stopped
    }

    /// Emits the window summary through `emit` and resets the aggregation.
    ///
    /// Buckets that are not sampling, or absorbed nothing this window, emit
    /// no lines; their window aggregation is discarded so that no stale
    /// extremum survives into the next window. Returns the number of lines
    /// emitted.
    pub fn flush_into<F>(&mut self, key: &str, buffer: &mut String, emit: &mut F) -> u64
    where
        F: FnMut(&str, &str),
    {
        if !self.sampling || self.value.count() == 0.0 {
            self.value.reset();
            return 0;
        }

        match &mut self.value {
            BucketValue::Counter(counter) => counter.flush_into(key, buffer, emit),
            BucketValue::Timer(timer) => timer.flush_into(key, buffer, emit),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_effective_count() {
        assert_eq!(effective_count(1.0), 1.0);
        assert_eq!(effective_count(0.5), 2.0);
        assert_eq!(effective_count(0.25), 4.0);
    }

    #[test]
    fn test_format_line() {
        let mut buffer = String::new();

        format_line(&mut buffer, "foo", 5.0, MetricType::Counter, 0.5);
        assert_eq!(buffer, "foo:5|c@0.5");

        format_line(&mut buffer, "t", 42.5, MetricType::Timer, 1.0);
        assert_eq!(buffer, "t:42.5|ms@1");
    }

    #[test]
    fn test_counter_absorb_compensates_rate() {
        let mut counter = CounterValue::default();

        counter.absorb(1.0, 0.5);
        counter.absorb(1.0, 0.5);

        assert_eq!(counter.sum, 4.0);
        assert_eq!(counter.count, 4.0);
    }

    #[test]
    fn test_counter_flush_emits_mean_and_rate() {
        let mut counter = CounterValue::default();
        counter.absorb(4.0, 1.0);
        counter.absorb(6.0, 1.0);

        let mut lines = Vec::new();
        let mut buffer = String::new();
        let emitted = counter.flush_into("foo", &mut buffer, &mut |_key, line| {
            lines.push(line.to_owned());
        });

        assert_eq!(emitted, 1);
        assert_eq!(lines, ["foo:5|c@0.5"]);
        assert_eq!(counter.sum, 0.0);
        assert_eq!(counter.count, 0.0);
    }

    #[test]
    fn test_bucket_value_new() {
        assert!(BucketValue::new(MetricType::Counter, 3).is_some());
        assert!(BucketValue::new(MetricType::Timer, 3).is_some());
        assert!(BucketValue::new(MetricType::Gauge, 3).is_none());
        assert!(BucketValue::new(MetricType::KeyValue, 3).is_none());
        assert!(BucketValue::new(MetricType::Histogram, 3).is_none());
        assert!(BucketValue::new(MetricType::Set, 3).is_none());
    }

    #[test]
    fn test_record_arrival_engages_past_threshold() {
        let mut bucket = Bucket::new(BucketValue::new(MetricType::Counter, 3).unwrap());

        // The creating arrival is already counted.
        assert!(!bucket.record_arrival(3));
        assert!(!bucket.record_arrival(3));
        assert!(bucket.record_arrival(3));
        assert!(bucket.is_sampling());

        // The transition is reported only once.
        assert!(!bucket.record_arrival(3));
    }

    #[test]
    fn test_advance_window_keeps_busy_buckets_sampling() {
        let mut bucket = Bucket::new(BucketValue::new(MetricType::Counter, 3).unwrap());
        for _ in 0..4 {
            bucket.record_arrival(3);
        }
        assert!(bucket.is_sampling());

        // Five arrivals this window: sampling persists across the boundary.
        assert!(!bucket.advance_window(3));
        assert!(bucket.is_sampling());
        assert_eq!(bucket.last_window_count(), 0);

        // A quiet window disengages.
        assert!(bucket.advance_window(3));
        assert!(!bucket.is_sampling());
    }
}
