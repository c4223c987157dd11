//! Progress reporting: position-tracked iteration over a batch source plus
//! pluggable stats sinks (console, JSON lines, dashboard spool).

mod reporter;
mod sink;

pub use reporter::{ProgressReporter, Tracked};
pub use sink::{ConsoleSink, DashboardSink, JsonSink, Record, Sink};
