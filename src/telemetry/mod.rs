//! Logging setup and router counters.

mod logging;
mod metrics;

pub use logging::{init_logging, is_known_format, is_known_level, LogConfig};
pub use metrics::{Counter, MetricsSnapshot, RouterMetrics};
