//! Capture transports.
//!
//! Two backends deliver captured traffic behind the same record stream:
//! the protocol-push backend consumes lifecycle events from a
//! remote-debugging session, and the log-tail backend reads a device log
//! stream on a dedicated thread. Session-specific details (how the events
//! and bodies are obtained) stay behind the [`BodyFetcher`] trait and the
//! event channel so the engine never depends on a particular client.

pub mod handoff;
pub mod log_tail;
pub mod protocol_push;

pub use handoff::{Drained, HandoffReceiver, HandoffSender, handoff_queue};
pub use log_tail::{LogTailBackend, LogTailer, LogcatCommand, TailSummary};
pub use protocol_push::{BodyFetcher, ProtocolPushBackend, PushSummary};

use thiserror::Error;
use tokio::sync::watch;

use crate::engine::core::ExchangeId;
use crate::engine::extractors::ExtractedRecord;

/// Result alias used by the capture backends.
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Backend-level failure. Per-exchange problems never surface here.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportFailure),
    #[error("failed to start capture: {0}")]
    Spawn(#[from] std::io::Error),
}

/// The underlying event or log stream can no longer be read.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportFailure {
    #[error("stream ended unexpectedly after {lines} lines")]
    StreamEnded { lines: u64 },
    #[error("event channel closed without a stop request")]
    ChannelClosed,
    #[error("stream read failed: {0}")]
    StreamError(String),
    #[error("capture thread panicked")]
    ProducerPanicked,
}

/// What a backend still held when it was stopped.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub records: Vec<ExtractedRecord>,
    /// Failure that ended the backend before the stop and was not reported
    /// earlier.
    pub failure: Option<CaptureError>,
}

/// Body-fetch failure. Logged and the exchange is dropped; never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("exchange {0} no longer held by the remote session")]
    Evicted(ExchangeId),
    #[error("body fetch transport error: {0}")]
    Transport(String),
    #[error("remote session rejected body fetch: {0}")]
    Session(String),
}

/// Create a stop handle and the signal a backend observes.
pub fn stop_signal() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

/// Requests a backend to stop. Dropping the handle also counts as a stop.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        // send_replace never fails, even with no receivers left.
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once a stop was requested or the handle was dropped.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}
