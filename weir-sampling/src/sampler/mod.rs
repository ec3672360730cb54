//! Core functionality of adaptive metric sampling.
//!
//! The [`Sampler`] tracks one [`Bucket`] per metric key. Keys below the
//! configured arrival threshold pass through untouched; keys above it are
//! summarized per flush window and re-emitted as compact statsd lines with
//! effective sample rates, so downstream aggregators see the stream as if
//! it had been naturally sampled.

use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use rand::SeedableRng;
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};

use crate::observation::Observation;
use crate::statsd::{SamplerCounters, SamplerGauges, SamplerTimers};

mod bucket;
mod reservoir;

use self::bucket::{Bucket, BucketValue};

/// Parameters used by the [`Sampler`].
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Number of arrivals per window above which a key enters sampling.
    ///
    /// Defaults to `100`.
    pub threshold: u64,

    /// The nominal flush period in seconds.
    ///
    /// The sampler does not schedule itself; the host is expected to call
    /// [`Sampler::flush`] on this cadence. Defaults to `10`.
    pub window: u64,

    /// Number of timer values retained per sampled key.
    ///
    /// Bounds the reservoir allocation, its fill phase, and the random
    /// replacement cap. Defaults to `100`.
    pub reservoir_size: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            threshold: 100,
            window: 10,
            reservoir_size: 100,
        }
    }
}

/// Tells the caller of [`Sampler::consider`] what happened to an
/// observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplingResult {
    /// The key is being sampled and the observation was absorbed into its
    /// window summary. The raw line must not be forwarded; a replacement
    /// is emitted at the next flush.
    Sampling,

    /// The key is in passthrough; the caller forwards the raw line
    /// downstream unchanged.
    NotSampling,
}

impl SamplingResult {
    /// Returns `true` if the observation was absorbed by the sampler.
    pub fn is_sampling(self) -> bool {
        matches!(self, Self::Sampling)
    }
}

/// Adaptive sampling engine for statsd metric streams.
///
/// The sampler owns all per-key state. All mutating operations take
/// `&mut self`; a flush can therefore never observe a half-applied ingest.
/// The surrounding service may run several independent instances (e.g.
/// sharded by key), each with its own table and RNG.
///
/// # Example
///
/// ```
/// use weir_sampling::{Observation, Sampler, SamplerConfig, SamplingResult};
///
/// let mut sampler = Sampler::new(SamplerConfig {
///     threshold: 3,
///     window: 10,
///     reservoir_size: 3,
/// });
///
/// let observation = Observation::parse(b"endpoint.hits:1|c").unwrap();
/// if sampler.consider(&observation) == SamplingResult::NotSampling {
///     // forward the raw line downstream
/// }
///
/// // Every `window` seconds:
/// sampler.flush(|_key, line| {
///     // relay the summarized `line` downstream
///     let _ = line;
/// });
/// ```
#[derive(Debug)]
pub struct Sampler {
    config: SamplerConfig,
    buckets: HashMap<String, Bucket>,
    rng: Pcg32,
}

impl Sampler {
    /// Creates a sampler with the given configuration.
    ///
    /// The reservoir RNG is seeded from the wall clock; use
    /// [`Sampler::with_seed`] for reproducible behavior.
    pub fn new(config: SamplerConfig) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self::with_seed(config, seed)
    }

    /// Creates a sampler with a fixed RNG seed.
    ///
    /// Reservoir replacement becomes deterministic for a given observation
    /// sequence, which tests rely on.
    pub fn with_seed(config: SamplerConfig, seed: u64) -> Self {
        Self {
            config,
            buckets: HashMap::new(),
            rng: Pcg32::seed_from_u64(seed),
        }
    }

    /// Returns the sampler configuration.
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Returns the number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Returns `true` if no key is tracked yet.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Considers one observation for sampling.
    ///
    /// Only counter and timer observations are considered; all other types
    /// return [`SamplingResult::NotSampling`] without touching any state,
    /// as does an observation whose type conflicts with the existing bucket
    /// of its key.
    pub fn consider(&mut self, observation: &Observation<'_>) -> SamplingResult {
        if let Some(bucket) = self.buckets.get_mut(observation.key) {
            if bucket.ty() != observation.ty {
                // A bucket never changes its type.
                return SamplingResult::NotSampling;
            }

            if bucket.record_arrival(self.config.threshold) {
                weir_log::debug!("started sampling {} '{}'", bucket.ty(), observation.key);
                weir_statsd::metric!(
                    counter(SamplerCounters::SamplingStarted) += 1,
                    ty = bucket.ty().as_str(),
                );
            }

            return if bucket.is_sampling() {
                bucket.absorb(observation, &mut self.rng);
                SamplingResult::Sampling
            } else {
                SamplingResult::NotSampling
            };
        }

        let Some(value) = BucketValue::new(observation.ty, self.config.reservoir_size) else {
            return SamplingResult::NotSampling;
        };

        self.buckets
            .insert(observation.key.to_owned(), Bucket::new(value));

        SamplingResult::NotSampling
    }

    /// Walks all buckets, emits their window summaries, and starts a new
    /// window.
    ///
    /// `emit` receives `(key, line)` for every replacement line. Both
    /// borrows end when the callback returns; the callback is invoked
    /// synchronously on this path and should not block.
    pub fn flush<F>(&mut self, mut emit: F)
    where
        F: FnMut(&str, &str),
    {
        let mut buffer = String::new();
        let mut lines: u64 = 0;

        weir_statsd::metric!(timer(SamplerTimers::FlushDuration), {
            for (key, bucket) in self.buckets.iter_mut() {
                lines += bucket.flush_into(key, &mut buffer, &mut emit);
                advance_bucket(key, bucket, self.config.threshold);
            }
        });

        weir_statsd::metric!(counter(SamplerCounters::LinesFlushed) += lines as i64);
        weir_statsd::metric!(gauge(SamplerGauges::TrackedKeys) = self.buckets.len() as u64);
    }

    /// Starts a new window for all buckets without emitting anything.
    ///
    /// Used when the window elapses but no output is required.
    pub fn update_flags(&mut self) {
        for (key, bucket) in self.buckets.iter_mut() {
            advance_bucket(key, bucket, self.config.threshold);
        }
    }

    /// Reports whether a key is currently in sampling mode.
    ///
    /// Unknown keys report [`SamplingResult::NotSampling`]. This is a
    /// diagnostic; the ingest path uses the return value of
    /// [`Sampler::consider`] instead.
    pub fn is_sampling(&self, key: &str) -> SamplingResult {
        match self.buckets.get(key) {
            Some(bucket) if bucket.is_sampling() => SamplingResult::Sampling,
            _ => SamplingResult::NotSampling,
        }
    }
}

/// Runs the window-boundary update for one bucket and reports disengagement.
fn advance_bucket(key: &str, bucket: &mut Bucket, threshold: u64) {
    if bucket.advance_window(threshold) {
        weir_log::debug!("stopped sampling {} '{}'", bucket.ty(), key);
        weir_statsd::metric!(
            counter(SamplerCounters::SamplingStopped) += 1,
            ty = bucket.ty().as_str(),
        );
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use crate::observation::Observation;

    use super::*;

    fn test_config() -> SamplerConfig {
        SamplerConfig {
            threshold: 3,
            window: 10,
            reservoir_size: 3,
        }
    }

    fn test_sampler() -> Sampler {
        Sampler::with_seed(test_config(), 42)
    }

    /// Feeds a raw line into the sampler.
    fn consider(sampler: &mut Sampler, line: &str) -> SamplingResult {
        let observation = Observation::parse(line.as_bytes()).unwrap();
        sampler.consider(&observation)
    }

    /// Flushes the sampler and returns all emitted lines.
    fn flush_lines(sampler: &mut Sampler) -> Vec<String> {
        let mut lines = Vec::new();
        sampler.flush(|_key, line| lines.push(line.to_owned()));
        lines
    }

    #[test]
    fn test_passthrough_below_threshold() {
        let mut sampler = test_sampler();

        for line in ["foo:1|c", "foo:2|c", "foo:3|c"] {
            assert_eq!(consider(&mut sampler, line), SamplingResult::NotSampling);
        }

        assert!(flush_lines(&mut sampler).is_empty());

        // The window counter was reset: three more observations still stay
        // below the threshold.
        for line in ["foo:1|c", "foo:2|c", "foo:3|c"] {
            assert_eq!(consider(&mut sampler, line), SamplingResult::NotSampling);
        }
    }

    #[test]
    fn test_counter_sampling_engages() {
        let mut sampler = test_sampler();

        assert_eq!(consider(&mut sampler, "foo:1|c"), SamplingResult::NotSampling);
        assert_eq!(consider(&mut sampler, "foo:2|c"), SamplingResult::NotSampling);
        assert_eq!(consider(&mut sampler, "foo:3|c"), SamplingResult::NotSampling);
        assert_eq!(consider(&mut sampler, "foo:4|c"), SamplingResult::Sampling);
        assert_eq!(consider(&mut sampler, "foo:6|c"), SamplingResult::Sampling);

        assert_eq!(sampler.is_sampling("foo"), SamplingResult::Sampling);

        // Values 4 and 6 were absorbed: mean 5 at an effective rate of
        // 1/2, which un-samples back to the accumulated sum of 10.
        assert_eq!(flush_lines(&mut sampler), ["foo:5|c@0.5"]);
    }

    #[test]
    fn test_counter_presampled_rate() {
        let mut sampler = test_sampler();

        for _ in 0..4 {
            consider(&mut sampler, "bar:1|c|@0.5");
        }

        // The fourth observation was absorbed with an effective count of 2.
        assert_eq!(flush_lines(&mut sampler), ["bar:1|c@0.5"]);
    }

    #[test]
    fn test_counter_fractional_effective_rate() {
        let mut sampler = test_sampler();

        for _ in 0..5 {
            consider(&mut sampler, "baz:2|c|@0.5");
        }

        // Two absorbed observations, each standing for two originals.
        assert_eq!(flush_lines(&mut sampler), ["baz:2|c@0.25"]);
    }

    #[test]
    fn test_timer_extrema_preserved() {
        let mut sampler = test_sampler();

        for line in ["t:10|ms", "t:20|ms", "t:30|ms"] {
            assert_eq!(consider(&mut sampler, line), SamplingResult::NotSampling);
        }
        for line in ["t:5|ms", "t:40|ms", "t:25|ms"] {
            assert_eq!(consider(&mut sampler, line), SamplingResult::Sampling);
        }

        // Max and min lead the flush, then the reservoir.
        assert_eq!(
            flush_lines(&mut sampler),
            ["t:40|ms@1", "t:5|ms@1", "t:25|ms@1"]
        );
    }

    #[test]
    fn test_timer_extrema_carry_producer_rate() {
        let mut sampler = test_sampler();

        for line in ["t:10|ms", "t:11|ms", "t:12|ms"] {
            consider(&mut sampler, line);
        }
        consider(&mut sampler, "t:100|ms|@0.2");
        consider(&mut sampler, "t:1|ms|@0.5");
        consider(&mut sampler, "t:50|ms");

        let lines = flush_lines(&mut sampler);
        // 100 displaced the first adopted maximum; 1 became the minimum.
        assert_eq!(lines[0], "t:100|ms@0.2");
        assert_eq!(lines[1], "t:1|ms@0.5");
    }

    #[test]
    fn test_invalid_line_creates_no_bucket() {
        let sampler = test_sampler();

        assert!(Observation::parse(b"noSeparator|c").is_err());
        assert_eq!(
            sampler.is_sampling("noSeparator"),
            SamplingResult::NotSampling
        );
        assert!(sampler.is_empty());
    }

    #[test]
    fn test_passthrough_types_create_no_bucket() {
        let mut sampler = test_sampler();

        for line in ["a:1|g", "a:2|h", "a:3|s", "a:4|kv"] {
            assert_eq!(consider(&mut sampler, line), SamplingResult::NotSampling);
        }

        assert!(sampler.is_empty());
    }

    #[test]
    fn test_conflicting_type_does_not_mutate() {
        let mut sampler = test_sampler();

        for value in 1..=4 {
            consider(&mut sampler, &format!("foo:{value}|c"));
        }
        assert_eq!(sampler.is_sampling("foo"), SamplingResult::Sampling);

        // A timer observation for a counter key passes through and does
        // not advance the counter's window.
        assert_eq!(consider(&mut sampler, "foo:9|ms"), SamplingResult::NotSampling);

        // Only the absorbed counter observation is flushed.
        assert_eq!(flush_lines(&mut sampler), ["foo:4|c@1"]);
    }

    #[test]
    fn test_sampling_persists_across_busy_windows() {
        let mut sampler = test_sampler();

        for value in 1..=4 {
            consider(&mut sampler, &format!("foo:{value}|c"));
        }
        flush_lines(&mut sampler);

        // Sampling stayed engaged, so the next window absorbs from its
        // first observation.
        assert_eq!(consider(&mut sampler, "foo:8|c"), SamplingResult::Sampling);
        assert_eq!(flush_lines(&mut sampler), ["foo:8|c@1"]);

        // That window stayed below the threshold, so sampling disengaged.
        assert_eq!(consider(&mut sampler, "foo:1|c"), SamplingResult::NotSampling);
    }

    #[test]
    fn test_update_flags_advances_without_emission() {
        let mut sampler = test_sampler();

        for value in 1..=4 {
            consider(&mut sampler, &format!("foo:{value}|c"));
        }

        // First boundary: the window was busy, sampling stays engaged.
        sampler.update_flags();
        assert_eq!(sampler.is_sampling("foo"), SamplingResult::Sampling);

        // Second boundary: a quiet window disengages.
        sampler.update_flags();
        assert_eq!(sampler.is_sampling("foo"), SamplingResult::NotSampling);

        assert_eq!(consider(&mut sampler, "foo:1|c"), SamplingResult::NotSampling);
    }

    #[test]
    fn test_flush_resets_timer_state() {
        let mut sampler = test_sampler();

        for line in ["t:1|ms", "t:2|ms", "t:3|ms", "t:4|ms", "t:5|ms", "t:6|ms"] {
            consider(&mut sampler, line);
        }
        flush_lines(&mut sampler);

        // The next window starts from scratch: nothing of the previous
        // window's extrema or reservoir may resurface.
        for line in ["t:100|ms", "t:200|ms", "t:300|ms", "t:400|ms"] {
            consider(&mut sampler, line);
        }

        let lines = flush_lines(&mut sampler);
        assert_eq!(
            lines,
            ["t:400|ms@1", "t:100|ms@1", "t:200|ms@1", "t:300|ms@1"]
        );
    }

    #[test]
    fn test_reservoir_stays_bounded() {
        let mut sampler = test_sampler();

        for value in 1..=100 {
            consider(&mut sampler, &format!("t:{value}|ms"));
        }

        let lines = flush_lines(&mut sampler);

        // At most max + min + reservoir_size lines. The minimum is 4: the
        // first three arrivals passed through before sampling engaged.
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "t:100|ms@1");
        assert_eq!(lines[1], "t:4|ms@1");
    }

    #[test]
    fn test_flush_output_reparses() {
        let mut sampler = test_sampler();

        for value in 1..=50 {
            consider(&mut sampler, &format!("t:{value}|ms|@0.5"));
            consider(&mut sampler, &format!("c:{value}|c|@0.5"));
        }

        for line in flush_lines(&mut sampler) {
            let observation = Observation::parse(line.as_bytes())
                .unwrap_or_else(|_| panic!("emitted line does not reparse: {line:?}"));
            assert!(observation.sample_rate > 0.0 && observation.sample_rate <= 1.0);
        }
    }

    #[test]
    fn test_seeded_samplers_are_deterministic() {
        let run = || {
            let mut sampler = Sampler::with_seed(test_config(), 4711);
            for value in 1..=100 {
                consider(&mut sampler, &format!("t:{value}|ms"));
            }
            flush_lines(&mut sampler)
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_len_tracks_keys() {
        let mut sampler = test_sampler();
        assert!(sampler.is_empty());

        consider(&mut sampler, "foo:1|c");
        consider(&mut sampler, "bar:1|ms");
        consider(&mut sampler, "foo:2|c");

        assert_eq!(sampler.len(), 2);
    }

    #[test]
    fn test_transition_telemetry() {
        let captures = weir_statsd::with_capturing_test_client(|| {
            let mut sampler = test_sampler();
            for value in 1..=4 {
                consider(&mut sampler, &format!("foo:{value}|c"));
            }
            sampler.update_flags();
            sampler.update_flags();
        });

        assert!(captures.contains(&"sampling.keys.started:1|c|#ty:c".to_owned()));
        assert!(captures.contains(&"sampling.keys.stopped:1|c|#ty:c".to_owned()));
    }

    #[test]
    fn test_config_defaults() {
        let config: SamplerConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.threshold, 100);
        assert_eq!(config.window, 10);
        assert_eq!(config.reservoir_size, 100);
    }

    #[test]
    fn test_config_partial_override() {
        let config: SamplerConfig = serde_json::from_str(r#"{"threshold": 20}"#).unwrap();

        assert_eq!(config.threshold, 20);
        assert_eq!(config.window, 10);
    }
}
