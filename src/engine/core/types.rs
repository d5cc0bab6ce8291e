//! Core data structures shared by the correlator, the capture transports, and
//! the record extractor.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque exchange identifier assigned by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(String);

impl ExchangeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ExchangeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Why an exchange left the table without being extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// Removed by the count or age bound of the correlation table.
    Evicted,
    /// The remote session reported the load as failed.
    LoadingFailed,
    /// Still in flight when the backend was stopped.
    Shutdown,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscardReason::Evicted => f.write_str("evicted"),
            DiscardReason::LoadingFailed => f.write_str("loading failed"),
            DiscardReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Lifecycle state of a tracked exchange.
///
/// Legal transitions are `Pending -> Responded -> Finished`, the shortcut
/// `Pending -> Finished` (load finished before headers were reported), and
/// `Pending | Responded -> Discarded`. `Finished` and `Discarded` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Pending,
    Responded,
    Finished,
    Discarded(DiscardReason),
}

impl ExchangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExchangeState::Finished | ExchangeState::Discarded(_))
    }

    pub fn can_transition_to(&self, next: &ExchangeState) -> bool {
        use ExchangeState::*;
        matches!(
            (self, next),
            (Pending, Responded)
                | (Pending, Finished)
                | (Responded, Finished)
                | (Pending, Discarded(_))
                | (Responded, Discarded(_))
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExchangeState::Pending => "pending",
            ExchangeState::Responded => "responded",
            ExchangeState::Finished => "finished",
            ExchangeState::Discarded(_) => "discarded",
        }
    }
}

/// Kind of lifecycle event, used when reporting protocol violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleKind {
    RequestInitiated,
    ResponseReceived,
    LoadFinished,
    LoadingFailed,
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleKind::RequestInitiated => "request-initiated",
            LifecycleKind::ResponseReceived => "response-received",
            LifecycleKind::LoadFinished => "load-finished",
            LifecycleKind::LoadingFailed => "loading-failed",
        };
        f.write_str(label)
    }
}

/// Event that references an exchange the correlator cannot accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("{event} for unknown exchange {id}")]
    UnknownExchange { id: ExchangeId, event: LifecycleKind },
    #[error("duplicate request-initiated for exchange {id}")]
    DuplicateExchange { id: ExchangeId },
    #[error("illegal transition for exchange {id}: {from} -> {to}")]
    IllegalTransition {
        id: ExchangeId,
        from: &'static str,
        to: &'static str,
    },
}

impl ProtocolViolation {
    pub fn exchange_id(&self) -> &ExchangeId {
        match self {
            ProtocolViolation::UnknownExchange { id, .. }
            | ProtocolViolation::DuplicateExchange { id }
            | ProtocolViolation::IllegalTransition { id, .. } => id,
        }
    }
}

/// One logical request/response cycle.
///
/// The URL is fixed at creation; state only moves forward through
/// [`ExchangeState::can_transition_to`].
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    id: ExchangeId,
    url: String,
    status: Option<u16>,
    state: ExchangeState,
    captured_at: DateTime<Utc>,
}

impl Exchange {
    pub(crate) fn new(id: ExchangeId, url: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            url,
            status: None,
            state: ExchangeState::Pending,
            captured_at: now,
        }
    }

    pub fn id(&self) -> &ExchangeId {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Timestamp of the last state transition.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub(crate) fn advance(
        &mut self,
        next: ExchangeState,
        now: DateTime<Utc>,
    ) -> Result<(), ProtocolViolation> {
        if !self.state.can_transition_to(&next) {
            return Err(ProtocolViolation::IllegalTransition {
                id: self.id.clone(),
                from: self.state.label(),
                to: next.label(),
            });
        }
        self.state = next;
        self.captured_at = now;
        Ok(())
    }

    /// Headers may be resent; the latest status wins without a state change.
    pub(crate) fn record_status(&mut self, status: u16) {
        self.status = Some(status);
    }
}

/// Typed lifecycle event delivered by a protocol-push transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    RequestInitiated { id: ExchangeId, url: String },
    ResponseReceived { id: ExchangeId, status: u16 },
    LoadFinished { id: ExchangeId },
    LoadingFailed { id: ExchangeId, error_text: String },
}

impl NetworkEvent {
    pub fn id(&self) -> &ExchangeId {
        match self {
            NetworkEvent::RequestInitiated { id, .. }
            | NetworkEvent::ResponseReceived { id, .. }
            | NetworkEvent::LoadFinished { id }
            | NetworkEvent::LoadingFailed { id, .. } => id,
        }
    }

    pub fn kind(&self) -> LifecycleKind {
        match self {
            NetworkEvent::RequestInitiated { .. } => LifecycleKind::RequestInitiated,
            NetworkEvent::ResponseReceived { .. } => LifecycleKind::ResponseReceived,
            NetworkEvent::LoadFinished { .. } => LifecycleKind::LoadFinished,
            NetworkEvent::LoadingFailed { .. } => LifecycleKind::LoadingFailed,
        }
    }
}

/// Raw log line captured by the log-tail backend, stamped on arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedEvent {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

impl CapturedEvent {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            line: line.into(),
        }
    }
}

/// Response body as returned by the remote session's fetch-body command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedBody {
    pub body: String,
    #[serde(default)]
    pub base64_encoded: bool,
}

impl FetchedBody {
    pub fn plain(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            base64_encoded: false,
        }
    }

    pub fn base64(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            base64_encoded: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        use ExchangeState::*;
        assert!(Pending.can_transition_to(&Responded));
        assert!(Pending.can_transition_to(&Finished));
        assert!(Responded.can_transition_to(&Finished));
        assert!(Responded.can_transition_to(&Discarded(DiscardReason::Evicted)));
        assert!(!Responded.can_transition_to(&Pending));
        assert!(!Finished.can_transition_to(&Responded));
        assert!(!Finished.can_transition_to(&Discarded(DiscardReason::Shutdown)));
        assert!(!Discarded(DiscardReason::Evicted).can_transition_to(&Finished));
    }

    #[test]
    fn illegal_transition_leaves_exchange_untouched() {
        let now = Utc::now();
        let mut exchange = Exchange::new("7".into(), "https://example.com/a".into(), now);
        exchange.advance(ExchangeState::Finished, now).unwrap();

        let err = exchange
            .advance(ExchangeState::Responded, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::IllegalTransition { from: "finished", .. }));
        assert_eq!(exchange.state(), ExchangeState::Finished);
        assert_eq!(exchange.url(), "https://example.com/a");
    }

    #[test]
    fn fetched_body_uses_protocol_field_names() {
        let body: FetchedBody =
            serde_json::from_str(r#"{"body":"e30=","base64Encoded":true}"#).unwrap();
        assert_eq!(body, FetchedBody::base64("e30="));
    }
}
