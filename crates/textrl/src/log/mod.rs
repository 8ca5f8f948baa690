//! Training metric sinks: console, JSON-lines file, and composites.

mod console;
mod jsonl;
mod logger;

pub use console::ConsoleLogger;
pub use jsonl::JsonlLogger;
pub use logger::{CompositeLogger, MetricLogger, NoOpLogger, RoundMetrics};
