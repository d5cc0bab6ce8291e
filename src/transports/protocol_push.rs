//! Protocol-push capture backend.
//!
//! Consumes typed lifecycle events from a single event channel, runs them
//! through the [`ExchangeCorrelator`], and for every finished exchange the
//! [`EndpointFilter`] accepts, fetches the body from the remote session,
//! decodes it, and extracts a record.
//!
//! Events are handled one at a time on the loop that owns the correlator;
//! the body fetch runs inline, so a slow fetch delays later events rather
//! than racing them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::{CaptureError, CaptureResult, FetchError, StopSignal, TransportFailure};
use crate::engine::core::{DiscardReason, Exchange, ExchangeId, FetchedBody, NetworkEvent};
use crate::engine::correlator::{CorrelatorConfig, ExchangeCorrelator, Ingested};
use crate::engine::extractors::{ExtractedRecord, RecordExtractor};
use crate::engine::filters::EndpointFilter;
use crate::modules::events::{
    CaptureEvent, DiscardEvent, EventDispatcher, ExchangeEvent, FailureEvent, FetchEvent,
    RecordEvent, TransportEvent, ViolationEvent,
};
use crate::modules::metrics::FailureStage;

const BACKEND_NAME: &str = "protocol-push";
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Fetches a response body from the remote-debugging session by exchange id.
#[async_trait]
pub trait BodyFetcher: Send + Sync {
    async fn fetch_body(&self, id: &ExchangeId) -> Result<FetchedBody, FetchError>;
}

#[async_trait]
impl<F: BodyFetcher + ?Sized> BodyFetcher for Arc<F> {
    async fn fetch_body(&self, id: &ExchangeId) -> Result<FetchedBody, FetchError> {
        (**self).fetch_body(id).await
    }
}

/// Counters returned when the event loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub events: u64,
    pub records: u64,
    pub discarded_on_shutdown: u64,
}

pub struct ProtocolPushBackend<F> {
    correlator: ExchangeCorrelator,
    filter: Arc<EndpointFilter>,
    extractor: RecordExtractor,
    fetcher: F,
    events: Arc<EventDispatcher>,
    sweep_interval: Duration,
}

impl<F: BodyFetcher> ProtocolPushBackend<F> {
    pub fn new(
        fetcher: F,
        filter: Arc<EndpointFilter>,
        extractor: RecordExtractor,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            correlator: ExchangeCorrelator::default(),
            filter,
            extractor,
            fetcher,
            events,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_correlator_config(mut self, config: CorrelatorConfig) -> Self {
        self.correlator = ExchangeCorrelator::new(config);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval.max(Duration::from_millis(10));
        self
    }

    pub fn correlator(&self) -> &ExchangeCorrelator {
        &self.correlator
    }

    /// Handle one lifecycle event, returning a record if it completed an
    /// extraction. Every failure along the way is dispatched and swallowed.
    pub async fn handle_event(&mut self, event: NetworkEvent) -> Option<ExtractedRecord> {
        let error_text = match &event {
            NetworkEvent::LoadingFailed { error_text, .. } => Some(error_text.clone()),
            _ => None,
        };

        match self.correlator.ingest(event) {
            Err(violation) => {
                self.events
                    .dispatch(CaptureEvent::ProtocolViolation(ViolationEvent {
                        violation,
                        timestamp: Utc::now(),
                    }));
                None
            }
            Ok(Ingested::Tracked { evicted }) => {
                if let Some(exchange) = evicted {
                    self.report_discarded(&exchange, DiscardReason::Evicted);
                }
                None
            }
            Ok(Ingested::Updated) => None,
            Ok(Ingested::Failed(exchange)) => {
                if let Some(text) = error_text.filter(|t| !t.is_empty()) {
                    log::debug!("exchange [{}] failed upstream: {}", exchange.id(), text);
                }
                self.report_discarded(&exchange, DiscardReason::LoadingFailed);
                None
            }
            Ok(Ingested::Finished(exchange)) => {
                let matched = self.filter.matches(exchange.url());
                self.events
                    .dispatch(CaptureEvent::ExchangeFinished(ExchangeEvent {
                        id: exchange.id().clone(),
                        url: exchange.url().to_string(),
                        status: exchange.status(),
                        matched,
                        timestamp: Utc::now(),
                    }));
                if matched {
                    self.extract(&exchange).await
                } else {
                    None
                }
            }
        }
    }

    /// Evict exchanges that outlived the table's age bound.
    pub fn sweep(&mut self) -> usize {
        let evicted = self.correlator.evict_expired(Utc::now());
        for exchange in &evicted {
            self.report_discarded(exchange, DiscardReason::Evicted);
        }
        evicted.len()
    }

    /// Discard everything still in flight with an explicit signal.
    pub fn shutdown(&mut self) -> usize {
        let drained = self.correlator.drain_in_flight();
        for exchange in &drained {
            self.report_discarded(exchange, DiscardReason::Shutdown);
        }
        drained.len()
    }

    /// Run the event loop until `stop` fires or the event channel closes.
    ///
    /// A closed channel without a stop request is a transport failure and is
    /// returned to the caller. Extracted records go to `records`; if that
    /// receiver is gone the loop stops as if asked to.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<NetworkEvent>,
        records: mpsc::UnboundedSender<ExtractedRecord>,
        mut stop: StopSignal,
    ) -> CaptureResult<PushSummary> {
        let mut summary = PushSummary::default();
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if stop.is_stopped() {
                summary.discarded_on_shutdown = self.shutdown() as u64;
                return Ok(summary);
            }

            tokio::select! {
                biased;
                _ = stop.stopped() => {}
                maybe_event = events.recv() => {
                    let Some(event) = maybe_event else {
                        let discarded = self.shutdown();
                        log::debug!(
                            "event channel closed after {} events; {} exchanges discarded",
                            summary.events,
                            discarded
                        );
                        let failure = TransportFailure::ChannelClosed;
                        self.events.dispatch(CaptureEvent::TransportFailed(TransportEvent {
                            backend: BACKEND_NAME,
                            error: failure.to_string(),
                            timestamp: Utc::now(),
                        }));
                        return Err(CaptureError::TransportFailure(failure));
                    };
                    summary.events += 1;
                    if let Some(record) = self.handle_event(event).await {
                        summary.records += 1;
                        if records.send(record).is_err() {
                            log::debug!("record consumer dropped; stopping protocol-push loop");
                            summary.discarded_on_shutdown = self.shutdown() as u64;
                            return Ok(summary);
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.sweep();
                }
            }
        }
    }

    async fn extract(&self, exchange: &Exchange) -> Option<ExtractedRecord> {
        let started = Instant::now();
        let body = match self.fetcher.fetch_body(exchange.id()).await {
            Ok(body) => body,
            Err(err) => {
                self.report_failure(exchange, FailureStage::Fetch, err.to_string());
                return None;
            }
        };
        self.events.dispatch(CaptureEvent::BodyFetched(FetchEvent {
            id: exchange.id().clone(),
            url: exchange.url().to_string(),
            latency: started.elapsed(),
            timestamp: Utc::now(),
        }));

        let text = match body.decode() {
            Ok(text) => text,
            Err(err) => {
                self.report_failure(exchange, FailureStage::Decode, err.to_string());
                return None;
            }
        };

        match self.extractor.extract_with_source(&text, Some(exchange.url())) {
            Ok(record) => {
                self.events.dispatch(CaptureEvent::RecordExtracted(RecordEvent {
                    source_url: record.source_url.clone(),
                    product_id: record.product_id,
                    timestamp: Utc::now(),
                }));
                Some(record)
            }
            Err(err) => {
                self.report_failure(exchange, FailureStage::Extraction, err.to_string());
                None
            }
        }
    }

    fn report_discarded(&self, exchange: &Exchange, reason: DiscardReason) {
        self.events
            .dispatch(CaptureEvent::ExchangeDiscarded(DiscardEvent::from_exchange(
                exchange, reason,
            )));
    }

    fn report_failure(&self, exchange: &Exchange, stage: FailureStage, error: String) {
        self.events.dispatch(CaptureEvent::Failure(FailureEvent {
            stage,
            source: exchange.url().to_string(),
            error,
            timestamp: Utc::now(),
        }));
    }
}
