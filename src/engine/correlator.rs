//! Exchange correlator.
//!
//! Owns the correlation table that maps exchange ids to in-flight
//! [`Exchange`]s, applies lifecycle events to it, and hands finished
//! exchanges back to the caller. The table is bounded both by entry count
//! and by age; anything pushed out is returned as an explicitly
//! `Discarded` exchange so the caller can report it.
//!
//! Every lifecycle operation is a constant-time table access and never
//! performs I/O. Age-based eviction is a separate sweep the owner runs on
//! its own cadence.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::engine::core::{
    DiscardReason, Exchange, ExchangeId, ExchangeState, LifecycleKind, NetworkEvent,
    ProtocolViolation,
};

const DEFAULT_MAX_EXCHANGES: usize = 1024;
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60);

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| {
        let millis = duration.as_millis().min(i64::MAX as u128);
        chrono::Duration::milliseconds(millis as i64)
    })
}

/// Bounds applied to the correlation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatorConfig {
    pub max_exchanges: usize,
    pub max_age: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            max_exchanges: DEFAULT_MAX_EXCHANGES,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

/// Outcome of feeding one [`NetworkEvent`] to the correlator.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// A new exchange entered the table, possibly pushing the oldest out.
    Tracked { evicted: Option<Exchange> },
    /// Status recorded on an exchange that is still in flight.
    Updated,
    /// The exchange finished and left the table.
    Finished(Exchange),
    /// The exchange failed upstream and left the table.
    Failed(Exchange),
}

#[derive(Debug)]
struct Slot {
    // Insertion sequence; tells a live entry apart from a stale `order`
    // entry left behind by an earlier exchange with the same id.
    seq: u64,
    exchange: Exchange,
}

#[derive(Debug)]
pub struct ExchangeCorrelator {
    config: CorrelatorConfig,
    table: HashMap<ExchangeId, Slot>,
    // Insertion order; may hold entries already removed from `table`.
    order: VecDeque<(u64, ExchangeId)>,
    next_seq: u64,
}

impl ExchangeCorrelator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config: CorrelatorConfig {
                max_exchanges: config.max_exchanges.max(1),
                ..config
            },
            table: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
        }
    }

    pub fn config(&self) -> CorrelatorConfig {
        self.config
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get(&self, id: &ExchangeId) -> Option<&Exchange> {
        self.table.get(id).map(|slot| &slot.exchange)
    }

    /// Apply a typed lifecycle event.
    pub fn ingest(&mut self, event: NetworkEvent) -> Result<Ingested, ProtocolViolation> {
        match event {
            NetworkEvent::RequestInitiated { id, url } => self
                .on_request_initiated(id, url)
                .map(|evicted| Ingested::Tracked { evicted }),
            NetworkEvent::ResponseReceived { id, status } => {
                self.on_response_received(&id, status).map(|_| Ingested::Updated)
            }
            NetworkEvent::LoadFinished { id } => self.on_load_finished(&id).map(Ingested::Finished),
            NetworkEvent::LoadingFailed { id, .. } => {
                self.on_loading_failed(&id).map(Ingested::Failed)
            }
        }
    }

    /// Start tracking a new exchange in `Pending`.
    ///
    /// A duplicate id is rejected and the existing entry is kept as is. When
    /// the table is full, the oldest live entry is discarded and returned.
    pub fn on_request_initiated(
        &mut self,
        id: ExchangeId,
        url: impl Into<String>,
    ) -> Result<Option<Exchange>, ProtocolViolation> {
        if self.table.contains_key(&id) {
            return Err(ProtocolViolation::DuplicateExchange { id });
        }

        let evicted = if self.table.len() >= self.config.max_exchanges {
            self.evict_oldest()
        } else {
            None
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        let exchange = Exchange::new(id.clone(), url.into(), Utc::now());
        self.order.push_back((seq, id.clone()));
        self.table.insert(id, Slot { seq, exchange });
        self.compact_order();
        Ok(evicted)
    }

    /// Record response headers. Resent headers overwrite the status.
    pub fn on_response_received(
        &mut self,
        id: &ExchangeId,
        status: u16,
    ) -> Result<(), ProtocolViolation> {
        let exchange = self
            .table
            .get_mut(id)
            .map(|slot| &mut slot.exchange)
            .ok_or_else(|| ProtocolViolation::UnknownExchange {
                id: id.clone(),
                event: LifecycleKind::ResponseReceived,
            })?;

        exchange.record_status(status);
        if exchange.state() == ExchangeState::Pending {
            exchange.advance(ExchangeState::Responded, Utc::now())?;
        }
        Ok(())
    }

    /// Mark the exchange finished and remove it from the table.
    pub fn on_load_finished(&mut self, id: &ExchangeId) -> Result<Exchange, ProtocolViolation> {
        let mut exchange = self
            .table
            .remove(id)
            .map(|slot| slot.exchange)
            .ok_or_else(|| ProtocolViolation::UnknownExchange {
                id: id.clone(),
                event: LifecycleKind::LoadFinished,
            })?;
        exchange.advance(ExchangeState::Finished, Utc::now())?;
        Ok(exchange)
    }

    /// Discard an exchange the remote session reported as failed.
    pub fn on_loading_failed(&mut self, id: &ExchangeId) -> Result<Exchange, ProtocolViolation> {
        let mut exchange = self
            .table
            .remove(id)
            .map(|slot| slot.exchange)
            .ok_or_else(|| ProtocolViolation::UnknownExchange {
                id: id.clone(),
                event: LifecycleKind::LoadingFailed,
            })?;
        exchange.advance(
            ExchangeState::Discarded(DiscardReason::LoadingFailed),
            Utc::now(),
        )?;
        Ok(exchange)
    }

    /// Discard every exchange whose last transition is older than the
    /// configured maximum age at `now`.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> Vec<Exchange> {
        let cutoff = now - chrono_duration(self.config.max_age);
        let expired: Vec<ExchangeId> = self
            .table
            .values()
            .filter(|slot| slot.exchange.captured_at() < cutoff)
            .map(|slot| slot.exchange.id().clone())
            .collect();

        let evicted = expired
            .iter()
            .filter_map(|id| self.discard(id, DiscardReason::Evicted, now))
            .collect();
        self.compact_order();
        evicted
    }

    /// Discard everything still in flight, for shutdown.
    pub fn drain_in_flight(&mut self) -> Vec<Exchange> {
        let now = Utc::now();
        let mut drained = Vec::with_capacity(self.table.len());
        while let Some((seq, id)) = self.order.pop_front() {
            if self.is_live(seq, &id)
                && let Some(exchange) = self.discard(&id, DiscardReason::Shutdown, now)
            {
                drained.push(exchange);
            }
        }
        drained
    }

    fn evict_oldest(&mut self) -> Option<Exchange> {
        while let Some((seq, id)) = self.order.pop_front() {
            if self.is_live(seq, &id) {
                return self.discard(&id, DiscardReason::Evicted, Utc::now());
            }
        }
        None
    }

    fn is_live(&self, seq: u64, id: &ExchangeId) -> bool {
        self.table.get(id).is_some_and(|slot| slot.seq == seq)
    }

    fn discard(
        &mut self,
        id: &ExchangeId,
        reason: DiscardReason,
        now: DateTime<Utc>,
    ) -> Option<Exchange> {
        let mut exchange = self.table.remove(id)?.exchange;
        match exchange.advance(ExchangeState::Discarded(reason), now) {
            Ok(()) => Some(exchange),
            Err(violation) => {
                log::warn!("cannot discard exchange: {}", violation);
                None
            }
        }
    }

    fn compact_order(&mut self) {
        if self.order.len() > self.table.len() * 2 + 16 {
            let table = &self.table;
            self.order
                .retain(|(seq, id)| table.get(id).is_some_and(|slot| slot.seq == *seq));
        }
    }
}

impl Default for ExchangeCorrelator {
    fn default() -> Self {
        Self::new(CorrelatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://shopee.tw/api/v4/pdp/get_pc?itemid=5";

    fn id(raw: &str) -> ExchangeId {
        ExchangeId::new(raw)
    }

    #[test]
    fn full_lifecycle_emits_finished_exchange() {
        let mut correlator = ExchangeCorrelator::default();
        correlator.on_request_initiated(id("1"), URL).unwrap();
        assert_eq!(correlator.get(&id("1")).unwrap().state(), ExchangeState::Pending);

        correlator.on_response_received(&id("1"), 200).unwrap();
        assert_eq!(correlator.get(&id("1")).unwrap().state(), ExchangeState::Responded);

        let finished = correlator.on_load_finished(&id("1")).unwrap();
        assert_eq!(finished.state(), ExchangeState::Finished);
        assert_eq!(finished.status(), Some(200));
        assert_eq!(finished.url(), URL);
        assert!(correlator.is_empty());
    }

    #[test]
    fn finish_before_response_still_emits_once() {
        let mut correlator = ExchangeCorrelator::default();
        let events = vec![
            NetworkEvent::RequestInitiated { id: id("9"), url: URL.into() },
            NetworkEvent::LoadFinished { id: id("9") },
            NetworkEvent::ResponseReceived { id: id("9"), status: 200 },
        ];

        let mut emitted = Vec::new();
        let mut violations = 0;
        for event in events {
            match correlator.ingest(event) {
                Ok(Ingested::Finished(exchange)) => emitted.push(exchange),
                Ok(_) => {}
                Err(_) => violations += 1,
            }
        }

        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].status(), None);
        assert_eq!(emitted[0].state(), ExchangeState::Finished);
        assert_eq!(violations, 1, "late response is reported, not applied");
        assert!(correlator.is_empty());
    }

    #[test]
    fn orphan_response_does_not_create_entry() {
        let mut correlator = ExchangeCorrelator::default();
        correlator.on_request_initiated(id("1"), URL).unwrap();

        let err = correlator.on_response_received(&id("2"), 200).unwrap_err();
        assert_eq!(
            err,
            ProtocolViolation::UnknownExchange {
                id: id("2"),
                event: LifecycleKind::ResponseReceived
            }
        );
        assert_eq!(correlator.len(), 1);
        assert!(correlator.get(&id("2")).is_none());
    }

    #[test]
    fn unknown_finish_leaves_table_empty() {
        let mut correlator = ExchangeCorrelator::default();
        let err = correlator.on_load_finished(&id("404")).unwrap_err();
        assert!(matches!(
            err,
            ProtocolViolation::UnknownExchange { event: LifecycleKind::LoadFinished, .. }
        ));
        assert!(correlator.is_empty());
    }

    #[test]
    fn duplicate_request_keeps_original_url() {
        let mut correlator = ExchangeCorrelator::default();
        correlator.on_request_initiated(id("1"), URL).unwrap();
        let err = correlator
            .on_request_initiated(id("1"), "https://example.com/other")
            .unwrap_err();
        assert_eq!(err, ProtocolViolation::DuplicateExchange { id: id("1") });
        assert_eq!(correlator.get(&id("1")).unwrap().url(), URL);
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn resent_headers_update_status() {
        let mut correlator = ExchangeCorrelator::default();
        correlator.on_request_initiated(id("1"), URL).unwrap();
        correlator.on_response_received(&id("1"), 304).unwrap();
        correlator.on_response_received(&id("1"), 200).unwrap();

        let exchange = correlator.get(&id("1")).unwrap();
        assert_eq!(exchange.status(), Some(200));
        assert_eq!(exchange.state(), ExchangeState::Responded);
    }

    #[test]
    fn loading_failed_discards() {
        let mut correlator = ExchangeCorrelator::default();
        correlator.on_request_initiated(id("1"), URL).unwrap();
        let failed = correlator
            .ingest(NetworkEvent::LoadingFailed {
                id: id("1"),
                error_text: "net::ERR_ABORTED".into(),
            })
            .unwrap();
        match failed {
            Ingested::Failed(exchange) => assert_eq!(
                exchange.state(),
                ExchangeState::Discarded(DiscardReason::LoadingFailed)
            ),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(correlator.is_empty());
    }

    #[test]
    fn full_table_evicts_oldest() {
        let mut correlator = ExchangeCorrelator::new(CorrelatorConfig {
            max_exchanges: 2,
            ..CorrelatorConfig::default()
        });
        assert!(correlator.on_request_initiated(id("a"), URL).unwrap().is_none());
        assert!(correlator.on_request_initiated(id("b"), URL).unwrap().is_none());
        correlator.on_load_finished(&id("a")).unwrap();
        assert!(correlator.on_request_initiated(id("c"), URL).unwrap().is_none());

        let evicted = correlator
            .on_request_initiated(id("d"), URL)
            .unwrap()
            .expect("table was full");
        assert_eq!(evicted.id(), &id("b"));
        assert_eq!(evicted.state(), ExchangeState::Discarded(DiscardReason::Evicted));
        assert_eq!(correlator.len(), 2);
        assert!(correlator.get(&id("c")).is_some());
        assert!(correlator.get(&id("d")).is_some());
    }

    #[test]
    fn reused_id_does_not_jump_the_eviction_queue() {
        let mut correlator = ExchangeCorrelator::new(CorrelatorConfig {
            max_exchanges: 2,
            ..CorrelatorConfig::default()
        });
        correlator.on_request_initiated(id("a"), URL).unwrap();
        correlator.on_load_finished(&id("a")).unwrap();
        correlator.on_request_initiated(id("b"), URL).unwrap();
        correlator.on_request_initiated(id("a"), URL).unwrap();

        let evicted = correlator
            .on_request_initiated(id("c"), URL)
            .unwrap()
            .expect("table was full");
        assert_eq!(evicted.id(), &id("b"));
        assert!(correlator.get(&id("a")).is_some());
        assert!(correlator.get(&id("c")).is_some());

        let evicted = correlator
            .on_request_initiated(id("d"), URL)
            .unwrap()
            .expect("table was full");
        assert_eq!(evicted.id(), &id("a"));
    }

    #[test]
    fn shutdown_drains_each_live_exchange_once() {
        let mut correlator = ExchangeCorrelator::default();
        correlator.on_request_initiated(id("a"), URL).unwrap();
        correlator.on_load_finished(&id("a")).unwrap();
        correlator.on_request_initiated(id("a"), URL).unwrap();
        correlator.on_request_initiated(id("b"), URL).unwrap();

        let drained = correlator.drain_in_flight();
        let ids: Vec<_> = drained.iter().map(|e| e.id().as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(correlator.is_empty());
    }

    #[test]
    fn expired_exchanges_are_evicted() {
        let mut correlator = ExchangeCorrelator::new(CorrelatorConfig {
            max_age: Duration::from_secs(30),
            ..CorrelatorConfig::default()
        });
        correlator.on_request_initiated(id("1"), URL).unwrap();
        correlator.on_request_initiated(id("2"), URL).unwrap();

        assert!(correlator.evict_expired(Utc::now()).is_empty());

        let later = Utc::now() + chrono::Duration::seconds(31);
        let mut evicted = correlator.evict_expired(later);
        evicted.sort_by(|a, b| a.id().cmp(b.id()));
        assert_eq!(evicted.len(), 2);
        assert!(evicted
            .iter()
            .all(|ex| ex.state() == ExchangeState::Discarded(DiscardReason::Evicted)));
        assert!(correlator.is_empty());

        // An evicted id behaves like any unknown id afterwards.
        assert!(correlator.on_load_finished(&id("1")).is_err());
    }

    #[test]
    fn drain_discards_everything_in_flight() {
        let mut correlator = ExchangeCorrelator::default();
        correlator.on_request_initiated(id("1"), URL).unwrap();
        correlator.on_request_initiated(id("2"), URL).unwrap();
        correlator.on_response_received(&id("2"), 200).unwrap();

        let drained = correlator.drain_in_flight();
        assert_eq!(drained.len(), 2);
        assert!(drained
            .iter()
            .all(|ex| ex.state() == ExchangeState::Discarded(DiscardReason::Shutdown)));
        assert!(correlator.is_empty());
    }

    #[test]
    fn order_index_stays_bounded() {
        let mut correlator = ExchangeCorrelator::default();
        for n in 0..500 {
            let key = id(&n.to_string());
            correlator.on_request_initiated(key.clone(), URL).unwrap();
            correlator.on_load_finished(&key).unwrap();
        }
        assert!(correlator.order.len() <= 16 + 2);
    }
}
