//! The concurrent pipeline: sync artifacts in, scan them against the
//! current ruleset, persist every match.
//!
//! Four concerns run under one lifecycle:
//! - discovering and fetching new bucket objects without re-fetching known
//!   ones ([`ObjectSyncer`] + [`IgnoreTracker`]),
//! - recompiling and atomically swapping the ruleset as rule files change
//!   (delegated to `quarry-rules`, driven by a filesystem watch),
//! - dispatching scan work across a worker pool, with every artifact
//!   re-evaluated whenever the ruleset changes (fan-in of new arrivals and
//!   rescan triggers),
//! - persisting results off the scanning path through one dedicated
//!   consumer.
//!
//! All coordination happens over bounded channels (backpressure by
//! blocking sends) plus one read-mostly ruleset snapshot. Shutdown stops
//! producers first, then lets channel closure cascade from producer to
//! consumer so in-flight work drains instead of being dropped.

pub mod error;
mod ignore;
mod persist;
mod pipeline;
mod scan;
mod sync;
mod watch;

pub use crate::ignore::IgnoreTracker;
pub use crate::pipeline::{Pipeline, PipelineConfig};
pub use crate::scan::{ScanCause, ScanRequest};
pub use crate::sync::ObjectSyncer;
