//! Event system for the capture pipeline.
//!
//! Every per-exchange outcome (finished, discarded, failed, extracted) and
//! every transport failure is reported as a [`CaptureEvent`]; handlers turn
//! them into log lines and metrics.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::{CaptureMetrics, FailureStage};
use crate::engine::core::{DiscardReason, Exchange, ExchangeId, ProtocolViolation};

#[derive(Debug, Clone)]
pub struct ExchangeEvent {
    pub id: ExchangeId,
    pub url: String,
    pub status: Option<u16>,
    pub matched: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DiscardEvent {
    pub id: ExchangeId,
    pub url: String,
    pub reason: DiscardReason,
    pub timestamp: DateTime<Utc>,
}

impl DiscardEvent {
    pub fn from_exchange(exchange: &Exchange, reason: DiscardReason) -> Self {
        Self {
            id: exchange.id().clone(),
            url: exchange.url().to_string(),
            reason,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViolationEvent {
    pub violation: ProtocolViolation,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub id: ExchangeId,
    pub url: String,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub stage: FailureStage,
    /// Exchange URL, or the raw log line for the log-tail backend.
    pub source: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RecordEvent {
    pub source_url: Option<String>,
    pub product_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub backend: &'static str,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum CaptureEvent {
    ExchangeFinished(ExchangeEvent),
    ExchangeDiscarded(DiscardEvent),
    ProtocolViolation(ViolationEvent),
    BodyFetched(FetchEvent),
    Failure(FailureEvent),
    RecordExtracted(RecordEvent),
    TransportFailed(TransportEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &CaptureEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Dispatcher with the [`LoggingHandler`] already registered.
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: CaptureEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Host portion of a URL, or an empty string for anything unparseable.
pub(crate) fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &CaptureEvent) {
        match event {
            CaptureEvent::ExchangeFinished(finished) => {
                log::debug!(
                    "<- [{}] {} status={:?} matched={}",
                    finished.id,
                    finished.url,
                    finished.status,
                    finished.matched
                );
            }
            CaptureEvent::ExchangeDiscarded(discarded) => {
                log::warn!("discarded [{}] {} ({})", discarded.id, discarded.url, discarded.reason);
            }
            CaptureEvent::ProtocolViolation(violation) => {
                log::warn!("protocol violation: {}", violation.violation);
            }
            CaptureEvent::BodyFetched(fetched) => {
                log::debug!(
                    "body [{}] {} fetched in {:.3}s",
                    fetched.id,
                    fetched.url,
                    fetched.latency.as_secs_f64()
                );
            }
            CaptureEvent::Failure(failure) => {
                log::warn!("{:?} failure {} -> {}", failure.stage, failure.source, failure.error);
            }
            CaptureEvent::RecordExtracted(record) => {
                log::info!(
                    "record product={:?} from {}",
                    record.product_id,
                    record.source_url.as_deref().unwrap_or("<unknown>")
                );
            }
            CaptureEvent::TransportFailed(transport) => {
                log::error!("{} transport failed: {}", transport.backend, transport.error);
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: CaptureMetrics,
}

impl MetricsHandler {
    pub fn new(metrics: CaptureMetrics) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &CaptureEvent) {
        match event {
            CaptureEvent::ExchangeFinished(finished) => {
                self.metrics
                    .record_finished(&host_of(&finished.url), finished.status, finished.matched);
            }
            CaptureEvent::ExchangeDiscarded(discarded) => {
                self.metrics.record_discarded(&host_of(&discarded.url));
            }
            CaptureEvent::ProtocolViolation(_) => self.metrics.record_violation(),
            CaptureEvent::BodyFetched(fetched) => {
                self.metrics.record_fetch(&host_of(&fetched.url), fetched.latency);
            }
            CaptureEvent::Failure(failure) => {
                self.metrics
                    .record_failure(&host_of(&failure.source), failure.stage);
            }
            CaptureEvent::RecordExtracted(record) => {
                let host = record.source_url.as_deref().map(host_of).unwrap_or_default();
                self.metrics.record_extracted(&host);
            }
            CaptureEvent::TransportFailed(_) => self.metrics.record_transport_failure(),
        }
    }
}
