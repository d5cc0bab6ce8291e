//! Cross-cutting services module
//!
//! Observability shared by both capture backends: the event dispatcher with
//! its logging and metrics handlers, and the metrics collector.

pub mod events;
pub mod metrics;

// Re-export commonly used types
pub use events::{
    CaptureEvent, DiscardEvent, EventDispatcher, EventHandler, ExchangeEvent, FailureEvent,
    FetchEvent, LoggingHandler, MetricsHandler, RecordEvent, TransportEvent, ViolationEvent,
};
pub use metrics::{CaptureMetrics, FailureStage, GlobalStats, HostStats, MetricsSnapshot};
