//! Adaptive sampling and aggregation for statsd metric streams.
//!
//! High-volume statsd traffic is dominated by a handful of hot keys. This
//! crate ingests a line-oriented stream of metric observations and, for any
//! key whose arrival rate exceeds a configured threshold within a flush
//! window, transparently switches from forwarding every observation to
//! producing a compact summarization that approximates the original
//! distribution. Downstream aggregators consume the replacement lines as if
//! the observations had been naturally sampled.
//!
//! # Protocol
//!
//! Observations are submitted in the classic statsd text protocol:
//!
//! ```text
//! <key>:<value>|<type>[|@<rate>]
//! ```
//!
//! For example:
//!
//! ```text
//! endpoint.response_time:57|ms
//! endpoint.hits:1|c|@0.5
//! ```
//!
//! The optional `@<rate>` clause declares the sample rate the *producer*
//! already applied; a line at rate `0.5` stands for two original
//! observations. Keys may carry tags in dotted notation whose values embed
//! `:`; the parser resolves the key/value split on the rightmost `:` of the
//! line. See [`Observation`].
//!
//! # Sampling
//!
//! The [`Sampler`] keeps one bucket per key. A key starts in passthrough:
//! [`Sampler::consider`] returns
//! [`NotSampling`](SamplingResult::NotSampling) and the caller forwards the
//! raw line. Once more than `threshold` observations arrive within one
//! window, the key enters sampling mode and observations are absorbed
//! instead:
//!
//! - **Counters** accumulate a sum and an effective count, both compensated
//!   by the inverse of the producer's pre-applied rate.
//! - **Timers** feed a bounded reservoir with random replacement, while the
//!   per-window maximum and minimum are held outside the reservoir so the
//!   long tail survives sampling.
//!
//! On each flush the engine emits replacement lines (a mean-with-rate line
//! per counter; extrema plus reservoir samples per timer) and the window
//! starts over. Keys that fall back below the threshold return to
//! passthrough at the next window boundary.
//!
//! Gauge, histogram, set, and key/value observations are never sampled and
//! pass through untouched.
//!
//! # Example
//!
//! ```
//! use weir_sampling::{Observation, Sampler, SamplerConfig, SamplingResult};
//!
//! let mut sampler = Sampler::new(SamplerConfig {
//!     threshold: 3,
//!     window: 10,
//!     reservoir_size: 3,
//! });
//!
//! let payload = b"endpoint.hits:1|c\nendpoint.response_time:57|ms\n";
//! for result in Observation::parse_all(payload) {
//!     let observation = result.expect("line should parse");
//!     if sampler.consider(&observation) == SamplingResult::NotSampling {
//!         // forward the raw line downstream
//!     }
//! }
//!
//! // Every `window` seconds:
//! sampler.flush(|_key, line| {
//!     // relay the summarized `line` downstream
//!     let _ = line;
//! });
//! ```
#![warn(missing_docs)]

mod elide;
mod observation;
mod protocol;
mod sampler;
mod statsd;

pub use self::elide::*;
pub use self::observation::*;
pub use self::protocol::*;
pub use self::sampler::*;
