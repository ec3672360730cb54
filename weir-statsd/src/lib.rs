//! A high-level StatsD metric client built on cadence.
//!
//! ## Defining Metrics
//!
//! In order to use metrics, one needs to first define one of the metric
//! traits on a custom enum. The following types of metrics are available:
//! `counter`, `timer`, `gauge`, and `histogram`. For explanations on what
//! that means see [Metric Types].
//!
//! The metric traits serve only to provide a type safe metric name. All
//! metric types have exactly the same form, they are different only to
//! ensure that a metric can only be used for the type for which it was
//! defined, (e.g. a counter metric cannot be used as a timer metric). See
//! the traits for more detailed examples.
//!
//! ## Initializing the Client
//!
//! Metrics can be used without initializing a statsd client. In that case,
//! invoking `with_client` or the [`metric!`] macro will become a noop. Only
//! when configured, metrics will actually be collected.
//!
//! To initialize the client, use [`init`] to create a default client with
//! known arguments:
//!
//! ```no_run
//! # use std::collections::BTreeMap;
//! # use weir_statsd::MetricsConfig;
//!
//! weir_statsd::init(MetricsConfig {
//!     prefix: "myprefix".to_owned(),
//!     host: "localhost:8125".to_owned(),
//!     default_tags: BTreeMap::new(),
//! }).unwrap();
//! ```
//!
//! ## Macro Usage
//!
//! The recommended way to record metrics is by using the [`metric!`] macro.
//! See the trait docs for more information on how to record each type of
//! metric.
//!
//! ```
//! use weir_statsd::{metric, CounterMetric};
//!
//! struct MyCounter;
//!
//! impl CounterMetric for MyCounter {
//!     fn name(&self) -> &'static str {
//!         "counter"
//!     }
//! }
//!
//! metric!(counter(MyCounter) += 1);
//! ```
//! [Metric Types]: https://github.com/statsd/statsd/blob/master/docs/metric_types.md
#![warn(missing_docs)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::UdpSocket;
use std::ops::Deref;
use std::sync::Arc;

use cadence::{BufferedUdpMetricSink, Metric, MetricBuilder, QueuingMetricSink, StatsdClient};
use parking_lot::RwLock;

#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

static METRICS_CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

thread_local! {
    static CURRENT_CLIENT: RefCell<Option<Arc<MetricsClient>>> =
        RefCell::new(METRICS_CLIENT.read().clone());
}

/// Client configuration used for initialization of the metrics sub-system.
#[derive(Debug)]
pub struct MetricsConfig {
    /// Prefix which is prepended to all metric names.
    pub prefix: String,
    /// Host of the metrics upstream.
    pub host: String,
    /// Tags that are added to all metrics.
    pub default_tags: BTreeMap<String, String>,
}

/// Error returned from [`init`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Binding the local UDP socket failed.
    #[error("failed to bind local statsd socket")]
    Io(#[from] std::io::Error),
    /// The upstream address could not be resolved into a metric sink.
    #[error("failed to create statsd sink")]
    Sink(#[from] cadence::MetricError),
}

/// The globally configured statsd client with default tags.
pub struct MetricsClient {
    /// The raw statsd client.
    pub statsd_client: StatsdClient,
    /// Tags that are added to every metric.
    pub default_tags: BTreeMap<String, String>,
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &Self::Target {
        &self.statsd_client
    }
}

impl std::fmt::Debug for MetricsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsClient")
            .field("statsd_client", &format_args!("StatsdClient"))
            .field("default_tags", &self.default_tags)
            .finish()
    }
}

impl MetricsClient {
    /// Sends a fully configured metric, applying the default tags.
    ///
    /// Send failures are logged and otherwise ignored; telemetry must never
    /// take down the pipeline it observes.
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, 'a, T>)
    where
        T: Metric + From<String>,
    {
        for (k, v) in &self.default_tags {
            metric = metric.with_tag(k, v);
        }

        if let Err(error) = metric.try_send() {
            weir_log::error!("error sending a metric: {error}");
        }
    }
}

/// Invokes a callback with the current statsd client.
///
/// If no client is configured, the callback is not invoked and the default
/// value of `R` is returned. This is primarily used by the [`metric!`]
/// macro.
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    CURRENT_CLIENT.with(|client| {
        if let Some(client) = client.borrow().as_deref() {
            f(client)
        } else {
            R::default()
        }
    })
}

/// Set a test client for the period of the called function (only affects the
/// current thread).
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let (rx, sink) = cadence::SpyMetricSink::new();
    let test_client = MetricsClient {
        statsd_client: StatsdClient::from_sink("", sink),
        default_tags: Default::default(),
    };

    CURRENT_CLIENT.with(|cell| *cell.borrow_mut() = Some(Arc::new(test_client)));
    f();
    CURRENT_CLIENT.with(|cell| *cell.borrow_mut() = METRICS_CLIENT.read().clone());

    rx.try_iter()
        .map(|x| String::from_utf8(x).unwrap())
        .collect()
}

/// Sets the global statsd client.
pub fn set_client(client: MetricsClient) {
    *METRICS_CLIENT.write() = Some(Arc::new(client));
    CURRENT_CLIENT.with(|cell| *cell.borrow_mut() = METRICS_CLIENT.read().clone());
}

/// Tell the metrics system to report to statsd.
pub fn init(config: MetricsConfig) -> Result<(), Error> {
    weir_log::info!("reporting metrics to statsd at {}", config.host);

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;

    let udp_sink = BufferedUdpMetricSink::from(config.host.as_str(), socket)?;
    let queuing_sink = QueuingMetricSink::from(udp_sink);
    let statsd_client = StatsdClient::from_sink(&config.prefix, queuing_sink);

    set_client(MetricsClient {
        statsd_client,
        default_tags: config.default_tags,
    });

    Ok(())
}

/// A metric for capturing timings.
///
/// Timings are a positive number of milliseconds between a start and end
/// time. Examples include time taken to render a web page or time taken for
/// a database call to return.
///
/// ## Example
///
/// ```
/// use weir_statsd::{metric, TimerMetric};
///
/// enum MyTimer {
///     ProcessA,
///     ProcessB,
/// }
///
/// impl TimerMetric for MyTimer {
///     fn name(&self) -> &'static str {
///         match self {
///             Self::ProcessA => "process_a",
///             Self::ProcessB => "process_b",
///         }
///     }
/// }
///
/// # fn process_a() {}
///
/// // measure time by explicitly setting a std::timer::Duration
/// # use std::time::Instant;
/// let start_time = Instant::now();
/// process_a();
/// metric!(timer(MyTimer::ProcessA) = start_time.elapsed());
///
/// // measure time implicitly by enclosing a code block in a metric
/// metric!(timer(MyTimer::ProcessB), {
///     process_a();
/// });
/// ```
pub trait TimerMetric {
    /// Returns the timer metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing counters.
///
/// Counters are simple values incremented or decremented by a client. The
/// rates at which these events occur or average values will be determined
/// by the server receiving them. Examples of counter uses include number of
/// logins to a system or requests received.
///
/// ## Example
///
/// ```
/// use weir_statsd::{metric, CounterMetric};
///
/// enum MyCounter {
///     TotalRequests,
///     TotalBytes,
/// }
///
/// impl CounterMetric for MyCounter {
///     fn name(&self) -> &'static str {
///         match self {
///             Self::TotalRequests => "total_requests",
///             Self::TotalBytes => "total_bytes",
///         }
///     }
/// }
///
/// # let buffer = &[(), ()];
///
/// // add to the counter
/// metric!(counter(MyCounter::TotalRequests) += 1);
/// metric!(counter(MyCounter::TotalBytes) += buffer.len() as i64);
///
/// // add to the counter and provide tags
/// metric!(
///     counter(MyCounter::TotalRequests) += 1,
///     server = "s1",
///     host = "h1"
/// );
/// ```
pub trait CounterMetric {
    /// Returns the counter metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing histograms.
///
/// Histograms are values whose distribution is calculated by the server.
/// The distribution calculated for histograms is often similar to that of
/// timers. Histograms can be thought of as a more general form of timers.
///
/// ## Example
///
/// ```
/// use weir_statsd::{metric, HistogramMetric};
///
/// struct QueueSize;
///
/// impl HistogramMetric for QueueSize {
///     fn name(&self) -> &'static str {
///         "queue_size"
///     }
/// }
///
/// # use std::collections::VecDeque;
/// let queue = VecDeque::new();
/// # let _hint: &VecDeque<()> = &queue;
///
/// // record a histogram value
/// metric!(histogram(QueueSize) = queue.len() as u64);
///
/// // record with tags
/// metric!(
///     histogram(QueueSize) = queue.len() as u64,
///     server = "server1",
///     host = "host1",
/// );
/// ```
pub trait HistogramMetric {
    /// Returns the histogram metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing gauges.
///
/// Gauge values are an instantaneous measurement of a value determined by
/// the client. They do not change unless changed by the client. Examples
/// include things like load average or how many connections are active.
///
/// ## Example
///
/// ```
/// use weir_statsd::{metric, GaugeMetric};
///
/// struct QueueSize;
///
/// impl GaugeMetric for QueueSize {
///     fn name(&self) -> &'static str {
///         "queue_size"
///     }
/// }
///
/// # use std::collections::VecDeque;
/// let queue = VecDeque::new();
/// # let _hint: &VecDeque<()> = &queue;
///
/// // a simple gauge value
/// metric!(gauge(QueueSize) = queue.len() as u64);
///
/// // a gauge with tags
/// metric!(
///     gauge(QueueSize) = queue.len() as u64,
///     server = "server1",
///     host = "host1"
/// );
/// ```
pub trait GaugeMetric {
    /// Returns the gauge metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing sets.
///
/// Sets count the number of unique elements in a group. Examples include
/// the number of unique visitors or unique metric keys seen.
///
/// ## Example
///
/// ```
/// use weir_statsd::{metric, SetMetric};
///
/// struct UniqueKeys;
///
/// impl SetMetric for UniqueKeys {
///     fn name(&self) -> &'static str {
///         "unique_keys"
///     }
/// }
///
/// # use std::collections::BTreeSet;
/// let keys = BTreeSet::new();
/// # let _hint: &BTreeSet<i64> = &keys;
///
/// // record a set element
/// metric!(set(UniqueKeys) = keys.len() as i64);
/// ```
pub trait SetMetric {
    /// Returns the set metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// Emits a metric.
///
/// See [crate-level documentation](self) for examples.
#[macro_export]
macro_rules! metric {
    // counter increment
    (counter($id:expr) += $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.count_with_tags($crate::CounterMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // counter decrement
    (counter($id:expr) -= $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.count_with_tags($crate::CounterMetric::name(&$id), -$value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // gauge set
    (gauge($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.gauge_with_tags($crate::GaugeMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // histogram
    (histogram($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.histogram_with_tags($crate::HistogramMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // sets (count unique occurrences of a value per time interval)
    (set($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.set_with_tags($crate::SetMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // timer value (duration)
    (timer($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.time_with_tags($crate::TimerMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // timed block
    (timer($id:expr), $($($k:ident).* = $v:expr,)* $block:block) => {{
        let now = std::time::Instant::now();
        let rv = {$block};
        $crate::metric!(timer($id) = now.elapsed() $(, $($k).* = $v)*);
        rv
    }};
}
