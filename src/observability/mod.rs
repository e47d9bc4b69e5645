//! Observability for the tracker: structured logging and transport counters

pub mod logging;
pub mod metrics;

pub use logging::{flush, init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot, QueueKind};

pub use logging::{bus_span, link_span};
