//! Logging facade for all weir crates.
//!
//! This crate re-exports the [`tracing`] macros so that workspace crates log
//! through a single name, and owns the subscriber setup for binaries and
//! tests.
//!
//! # Initialization
//!
//! In a service entry point, configure logging once:
//!
//! ```
//! let config = weir_log::LogConfig {
//!     enable_backtraces: true,
//!     ..Default::default()
//! };
//!
//! weir_log::init(&config);
//! ```
//!
//! In tests, use [`init_test!`](crate::init_test) instead, which registers a
//! test writer and raises workspace crates to TRACE:
//!
//! ```
//! weir_log::init_test!();
//! ```
#![warn(missing_docs)]

mod setup;
mod utils;

pub use self::setup::*;
#[doc(hidden)]
pub use self::test::*;
pub use self::utils::*;

pub use tracing::{debug, error, info, trace, warn, Level};

/// All crates in the weir workspace, used to build default log filters.
pub(crate) const CRATE_NAMES: &[&str] = &["weir_log", "weir_sampling", "weir_statsd"];
