use weir_statsd::{CounterMetric, GaugeMetric, TimerMetric};

/// Counter metrics emitted by the sampling engine.
pub enum SamplerCounters {
    /// Number of raw lines rejected by the protocol parser.
    ///
    /// This metric is tagged with:
    ///  - `reason`: The rejection class, see
    ///    [`ParseObservationError::reason`](crate::ParseObservationError::reason).
    LineRejected,

    /// Number of keys that entered sampling mode.
    ///
    /// This metric is tagged with:
    ///  - `ty`: The metric type of the key.
    SamplingStarted,

    /// Number of keys that left sampling mode at a window boundary.
    ///
    /// This metric is tagged with:
    ///  - `ty`: The metric type of the key.
    SamplingStopped,

    /// Number of summarized lines emitted by flushes.
    LinesFlushed,
}

impl CounterMetric for SamplerCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::LineRejected => "sampling.lines.rejected",
            Self::SamplingStarted => "sampling.keys.started",
            Self::SamplingStopped => "sampling.keys.stopped",
            Self::LinesFlushed => "sampling.lines.flushed",
        }
    }
}

/// Gauge metrics emitted by the sampling engine.
pub enum SamplerGauges {
    /// The total number of keys tracked by the sampler.
    ///
    /// Buckets are created on first observation of a key and live for the
    /// lifetime of the engine, so this gauge reflects key cardinality.
    TrackedKeys,
}

impl GaugeMetric for SamplerGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::TrackedKeys => "sampling.keys.tracked",
        }
    }
}

/// Timer metrics emitted by the sampling engine.
pub enum SamplerTimers {
    /// Time spent walking all buckets in a flush, including serialization
    /// and the window-boundary update.
    ///
    /// The flush callback runs synchronously on this path, so a slow
    /// downstream shows up here.
    FlushDuration,
}

impl TimerMetric for SamplerTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::FlushDuration => "sampling.flush.duration",
        }
    }
}
