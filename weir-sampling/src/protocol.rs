use std::fmt;
use std::str::FromStr;

/// The type of a statsd metric observation.
///
/// The type is carried on the wire as the token following the first `|` of a
/// line. The set of tokens is closed; lines with any other token are
/// rejected.
///
/// Only [`Counter`](Self::Counter) and [`Timer`](Self::Timer) observations
/// are considered for sampling. All other types pass through the engine
/// untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricType {
    /// Counts instances of an event.
    ///
    /// Declared as `"c"`:
    ///
    /// ```text
    /// endpoint.hits:1|c
    /// ```
    Counter,

    /// A millisecond timing between a start and an end time.
    ///
    /// Declared as `"ms"`:
    ///
    /// ```text
    /// endpoint.response_time:57|ms
    /// ```
    Timer,

    /// An arbitrary key/value pair, forwarded verbatim.
    ///
    /// Declared as `"kv"`.
    KeyValue,

    /// An instantaneous measurement of a value.
    ///
    /// Declared as `"g"`.
    Gauge,

    /// A histogram sample.
    ///
    /// Declared as `"h"`.
    Histogram,

    /// An element of a set for unique counting.
    ///
    /// Declared as `"s"`.
    Set,
}

impl MetricType {
    /// Returns the wire token for this metric type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "c",
            MetricType::Timer => "ms",
            MetricType::KeyValue => "kv",
            MetricType::Gauge => "g",
            MetricType::Histogram => "h",
            MetricType::Set => "s",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = ParseMetricTypeError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        Ok(match string {
            "c" => Self::Counter,
            "ms" => Self::Timer,
            "kv" => Self::KeyValue,
            "g" => Self::Gauge,
            "h" => Self::Histogram,
            "s" => Self::Set,
            _ => return Err(ParseMetricTypeError),
        })
    }
}

/// An error returned when a metric type token is not in the closed set.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("unknown metric type")]
pub struct ParseMetricTypeError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_types() {
        assert_eq!("c".parse::<MetricType>().unwrap(), MetricType::Counter);
        assert_eq!("ms".parse::<MetricType>().unwrap(), MetricType::Timer);
        assert_eq!("kv".parse::<MetricType>().unwrap(), MetricType::KeyValue);
        assert_eq!("g".parse::<MetricType>().unwrap(), MetricType::Gauge);
        assert_eq!("h".parse::<MetricType>().unwrap(), MetricType::Histogram);
        assert_eq!("s".parse::<MetricType>().unwrap(), MetricType::Set);
    }

    #[test]
    fn test_parse_unknown_types() {
        for token in ["", "a", "b", "abc", " ", "ss", "m", "cc", "C", "MS"] {
            assert!(token.parse::<MetricType>().is_err(), "accepted {token:?}");
        }
    }

    #[test]
    fn test_display_round_trip() {
        for ty in [
            MetricType::Counter,
            MetricType::Timer,
            MetricType::KeyValue,
            MetricType::Gauge,
            MetricType::Histogram,
            MetricType::Set,
        ] {
            assert_eq!(ty.to_string().parse::<MetricType>().unwrap(), ty);
        }
    }
}
