use rand::Rng;
use rand_pcg::Pcg32;

use crate::protocol::MetricType;

use super::bucket::{effective_count, format_line};

/// A per-window timer extremum, held outside the reservoir.
///
/// Extrema survive random replacement by design: the long tail is the part
/// of a timer distribution that sampling must not lose.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(super) struct Extremum {
    /// The extreme value.
    pub value: f64,
    /// The producer-declared sample rate at the moment the extremum was
    /// adopted, relayed verbatim downstream.
    pub sample_rate: f64,
}

/// A fixed-capacity pool of timer values with random replacement.
///
/// While the pool is filling, every offered value is taken. Once full, an
/// offered value replaces a uniformly chosen slot with probability
/// `capacity / window_count`, so the pool remains a uniform sample of the
/// whole window rather than favoring early arrivals (algorithm R).
#[derive(Clone, Debug)]
pub(super) struct Reservoir {
    samples: Vec<f64>,
    capacity: usize,
}

impl Reservoir {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns the number of values currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the values currently held, in slot order.
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Offers a value to the pool.
    ///
    /// `window_count` is the number of arrivals seen for the key in the
    /// current window, which acts as the replacement denominator.
    pub fn offer(&mut self, value: f64, window_count: u64, rng: &mut Pcg32) {
        if self.samples.len() < self.capacity {
            self.samples.push(value);
        } else {
            let k = rng.gen_range(0..window_count) as usize;
            if k < self.samples.len() {
                self.samples[k] = value;
            }
        }
    }
}

/// Window aggregation state for a sampled timer key.
#[derive(Clone, Debug)]
pub(super) struct TimerValue {
    /// Sum of all values that entered the candidate pool.
    pub sum: f64,
    /// Effective observation count, compensated for pre-applied sampling.
    pub count: f64,
    /// The window maximum, if any value was adopted.
    pub upper: Option<Extremum>,
    /// The window minimum, if any value was adopted.
    pub lower: Option<Extremum>,
    /// Candidate pool of regular (non-extreme) values.
    pub reservoir: Reservoir,
}

impl TimerValue {
    pub fn new(reservoir_size: usize) -> Self {
        Self {
            sum: 0.0,
            count: 0.0,
            upper: None,
            lower: None,
            reservoir: Reservoir::with_capacity(reservoir_size),
        }
    }

    /// Absorbs one observation into the window summary.
    ///
    /// A value that strictly exceeds the current maximum (or strictly
    /// undercuts the minimum) becomes the new extremum and the displaced
    /// extremum is demoted into the candidate pool. When there was no
    /// previous extremum to demote, the observation is consumed entirely as
    /// the extremum: it does not enter the reservoir and does not count
    /// towards `sum`/`count`, since it will be emitted verbatim at flush.
    /// Ties never displace an extremum.
    pub fn absorb(&mut self, value: f64, sample_rate: f64, window_count: u64, rng: &mut Pcg32) {
        let mut value = value;

        if self.upper.map_or(true, |upper| value > upper.value) {
            match self.upper.replace(Extremum { value, sample_rate }) {
                Some(previous) => value = previous.value,
                None => return,
            }
        }

        if self.lower.map_or(true, |lower| value < lower.value) {
            match self.lower.replace(Extremum { value, sample_rate }) {
                Some(previous) => value = previous.value,
                None => return,
            }
        }

        self.reservoir.offer(value, window_count, rng);
        self.sum += value;
        self.count += effective_count(sample_rate);
    }

    /// Serializes the window summary into timer lines and resets it.
    ///
    /// Lines are emitted in the order: maximum, minimum, reservoir samples.
    /// The extrema carry the producer-declared rate they were observed at;
    /// reservoir samples carry the derived rate `num_samples / count` so
    /// that downstream reconstructs the effective window count.
    ///
    /// The caller must ensure `count` is non-zero. Returns the number of
    /// lines emitted.
    pub fn flush_into<F>(&mut self, key: &str, buffer: &mut String, emit: &mut F) -> u64
    where
        F: FnMut(&str, &str),
    {
        let mut lines = 0;

        if let Some(upper) = self.upper {
            format_line(buffer, key, upper.value, MetricType::Timer, upper.sample_rate);
            emit(key, buffer.as_str());
            lines += 1;
        }

        if let Some(lower) = self.lower {
            format_line(buffer, key, lower.value, MetricType::Timer, lower.sample_rate);
            emit(key, buffer.as_str());
            lines += 1;
        }

        if !self.reservoir.is_empty() {
            let sample_rate = self.reservoir.len() as f64 / self.count;
            for &sample in self.reservoir.samples() {
                format_line(buffer, key, sample, MetricType::Timer, sample_rate);
                emit(key, buffer.as_str());
                lines += 1;
            }
        }

        self.reset();
        lines
    }

    /// Discards the window summary without emitting it.
    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0.0;
        self.upper = None;
        self.lower = None;
        self.reservoir.clear();
    }
}
