use std::fmt;
use std::iter::FusedIterator;

use crate::protocol::MetricType;
use crate::statsd::SamplerCounters;

/// The sample rate assumed when a line carries no `@` clause.
const DEFAULT_SAMPLE_RATE: f64 = 1.0;

/// A single metric observation parsed from the raw line protocol.
///
/// Observations borrow their key from the input line and are consumed
/// immediately by the ingest path; they never outlive the line they were
/// parsed from.
///
/// # Submission Protocol
///
/// ```text
/// <key>:<value>|<type>[|@<rate>]
/// ```
///
/// The key is resolved on the *rightmost* `:` of the line. Keys carrying
/// tags in dotted notation may embed `:` inside tag values, so a
/// left-to-right scan would cut the line short:
///
/// ```text
/// svc.req.__region=us:west:42.0|ms|@0.1
///                          ^^^^--- value
/// ```
///
/// The rate clause is accepted both as its own `|@<rate>` component and in
/// the compact form emitted by flushes, where it is appended directly to
/// the type token (`foo:5|c@0.5`). Every flushed line parses back into an
/// observation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation<'a> {
    /// The metric key, without the trailing `:`.
    pub key: &'a str,

    /// The observed value. Always finite.
    pub value: f64,

    /// The metric type.
    pub ty: MetricType,

    /// The sample rate the producer already applied before sending.
    ///
    /// Lies in `(0, 1]` and defaults to `1.0` when the line carries no `@`
    /// clause. A rate of `0.1` means the producer forwarded one in ten
    /// observations, so this line stands for ten originals.
    pub sample_rate: f64,
}

impl<'a> Observation<'a> {
    /// Parses a single observation from a raw statsd line.
    ///
    /// The line must not include a trailing newline. Rejected lines are
    /// counted into the `sampling.lines.rejected` counter, tagged with the
    /// rejection reason.
    ///
    /// # Example
    ///
    /// ```
    /// use weir_sampling::{MetricType, Observation};
    ///
    /// let observation = Observation::parse(b"endpoint.hits:1|c")
    ///     .expect("line should parse");
    ///
    /// assert_eq!(observation.key, "endpoint.hits");
    /// assert_eq!(observation.ty, MetricType::Counter);
    /// ```
    pub fn parse(slice: &'a [u8]) -> Result<Self, ParseObservationError> {
        std::str::from_utf8(slice)
            .map_err(|_| ParseObservationError::new(ErrorKind::InvalidUtf8))
            .and_then(Self::parse_str)
            .map_err(ParseObservationError::track)
    }

    /// Parses a set of observations from a raw multi-line payload.
    ///
    /// Returns a result for each line in `slice`, ignoring empty lines. Both
    /// UNIX newlines (`\n`) and Windows newlines (`\r\n`) are supported.
    ///
    /// It is possible to continue consuming the iterator after `Err` is
    /// yielded, so one bad line does not drop the rest of a datagram.
    ///
    /// # Example
    ///
    /// ```
    /// use weir_sampling::Observation;
    ///
    /// let data = b"endpoint.response_time:57|ms\nendpoint.hits:1|c\n";
    ///
    /// for result in Observation::parse_all(data) {
    ///     let observation = result.expect("line should parse");
    ///     println!("{}: {}", observation.key, observation.value);
    /// }
    /// ```
    pub fn parse_all(slice: &'a [u8]) -> ParseObservations<'a> {
        ParseObservations { slice }
    }

    fn parse_str(string: &'a str) -> Result<Self, ParseObservationError> {
        // Search backwards for the key separator, otherwise tag values
        // embedding ':' would eat part of the line. See the type docs.
        let (key, rest) = string
            .rsplit_once(':')
            .ok_or_else(|| ParseObservationError::new(ErrorKind::MissingValueSeparator))?;

        if key.is_empty() {
            return Err(ParseObservationError::new(ErrorKind::EmptyKey));
        }

        let mut components = rest.split('|');

        let value = components
            .next()
            .unwrap_or_default()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| ParseObservationError::new(ErrorKind::InvalidValue))?;

        let ty_token = components
            .next()
            .ok_or_else(|| ParseObservationError::new(ErrorKind::MissingType))?;

        // Flushed lines append the rate directly to the type token
        // (`foo:5|c@0.5`), so split an embedded '@' off before matching the
        // type against the closed token set.
        let (ty_token, compact_rate) = match ty_token.split_once('@') {
            Some((ty_token, rate)) => (ty_token, Some(rate)),
            None => (ty_token, None),
        };

        let ty = ty_token
            .parse::<MetricType>()
            .map_err(|_| ParseObservationError::new(ErrorKind::UnknownType))?;

        let sample_rate = match compact_rate {
            Some(rate) => parse_sample_rate(rate)?,
            None => match components.next() {
                Some(rate) => {
                    let rate = rate.strip_prefix('@').ok_or_else(|| {
                        ParseObservationError::new(ErrorKind::MissingRateSpecifier)
                    })?;

                    parse_sample_rate(rate)?
                }
                None => DEFAULT_SAMPLE_RATE,
            },
        };

        if components.next().is_some() {
            return Err(ParseObservationError::new(ErrorKind::TrailingData));
        }

        Ok(Observation {
            key,
            value,
            ty,
            sample_rate,
        })
    }
}

fn parse_sample_rate(rate: &str) -> Result<f64, ParseObservationError> {
    if rate.is_empty() {
        return Err(ParseObservationError::new(ErrorKind::EmptySampleRate));
    }

    rate.parse::<f64>()
        .ok()
        .filter(|rate| *rate > 0.0 && *rate <= 1.0)
        .ok_or_else(|| ParseObservationError::new(ErrorKind::InvalidSampleRate))
}

/// An error returned when a raw line does not conform to the line protocol.
///
/// The error exposes a stable [`reason`](Self::reason) identifier for each
/// rejection class, which doubles as the tag value of the rejection counter.
#[derive(Debug, thiserror::Error)]
#[error("invalid metric line: {kind}")]
pub struct ParseObservationError {
    kind: ErrorKind,
}

impl ParseObservationError {
    fn new(kind: ErrorKind) -> Self {
        Self { kind }
    }

    /// Counts and logs the rejection once, at the public parse boundary.
    fn track(self) -> Self {
        weir_log::debug!("dropping invalid metric line: {}", self.kind);
        weir_statsd::metric!(
            counter(SamplerCounters::LineRejected) += 1,
            reason = self.reason(),
        );
        self
    }

    /// Returns a short stable identifier for the rejection class, suitable
    /// as a metric tag value.
    pub fn reason(&self) -> &'static str {
        match self.kind {
            ErrorKind::MissingValueSeparator => "missing_value_separator",
            ErrorKind::EmptyKey => "empty_key",
            ErrorKind::InvalidValue => "invalid_value",
            ErrorKind::MissingType => "missing_type",
            ErrorKind::UnknownType => "unknown_type",
            ErrorKind::MissingRateSpecifier => "missing_rate_specifier",
            ErrorKind::EmptySampleRate => "empty_sample_rate",
            ErrorKind::InvalidSampleRate => "invalid_sample_rate",
            ErrorKind::TrailingData => "trailing_data",
            ErrorKind::InvalidUtf8 => "invalid_utf8",
        }
    }
}

#[derive(Clone, Copy, Debug, thiserror::Error)]
enum ErrorKind {
    #[error("missing ':' between key and value")]
    MissingValueSeparator,
    #[error("zero length key")]
    EmptyKey,
    #[error("unable to parse value as a finite double")]
    InvalidValue,
    #[error("missing '|' after the value")]
    MissingType,
    #[error("unknown stat type")]
    UnknownType,
    #[error("no '@' sample rate specifier")]
    MissingRateSpecifier,
    #[error("'@' sample with no rate")]
    EmptySampleRate,
    #[error("sample rate is not a finite double in (0, 1]")]
    InvalidSampleRate,
    #[error("unexpected data after the sample rate")]
    TrailingData,
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// Iterator over parsed observations returned from [`Observation::parse_all`].
#[derive(Clone, Debug, Default)]
pub struct ParseObservations<'a> {
    slice: &'a [u8],
}

impl<'a> Iterator for ParseObservations<'a> {
    type Item = Result<Observation<'a>, ParseObservationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.slice.is_empty() {
                return None;
            }

            let mut split = self.slice.splitn(2, |&b| b == b'\n');
            let current = split.next()?;
            self.slice = split.next().unwrap_or_default();

            let current = current.strip_suffix(b"\r").unwrap_or(current);
            if !current.is_empty() {
                return Some(Observation::parse(current));
            }
        }
    }
}

impl FusedIterator for ParseObservations<'_> {}

impl fmt::Display for Observation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}|{}", self.key, self.value, self.ty)?;
        if self.sample_rate != DEFAULT_SAMPLE_RATE {
            write!(f, "|@{}", self.sample_rate)?;
        }
        Ok(())
    }
}
