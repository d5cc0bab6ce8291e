//! # trafficscraper-rs
//!
//! Extracts structured product records by passively observing the network
//! traffic a real rendering session produces, instead of calling the target's
//! signed APIs directly.
//!
//! ## Features
//!
//! - Protocol-push capture from a remote-debugging session (typed lifecycle
//!   events plus a body-fetch seam)
//! - Log-tail capture from a device log stream (`adb logcat`) on a dedicated
//!   thread
//! - Bounded exchange correlation with count and age eviction
//! - Regex endpoint filtering and configurable record field paths
//! - Event dispatch with logging and metrics handlers
//!
//! ## Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use trafficscraper_rs::{DriverError, ExtractionSession, LogcatCommand, NavigationDriver};
//!
//! struct Adb;
//!
//! #[async_trait]
//! impl NavigationDriver for Adb {
//!     async fn navigate(&mut self, _url: &str) -> Result<(), DriverError> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut session = ExtractionSession::<Adb>::builder()
//!         .build_logcat(Adb, &LogcatCommand::default().with_serial("emulator-5554"))?;
//!     let records = session.run(["https://shopee.tw/product/1/2"]).await?;
//!     trafficscraper_rs::write_records_json("records.json", &records)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod modules;
pub mod session;
pub mod transports;

pub use crate::config::{
    CaptureConfig,
    ConfigError,
};

pub use crate::engine::core::{
    CapturedEvent,
    DecodeError,
    DiscardReason,
    Exchange,
    ExchangeId,
    ExchangeState,
    FetchedBody,
    LifecycleKind,
    NetworkEvent,
    ProtocolViolation,
    WireError,
    decode_payload,
};
pub use crate::engine::correlator::{
    CorrelatorConfig,
    ExchangeCorrelator,
    Ingested,
};
pub use crate::engine::extractors::{
    ExtractedRecord,
    ExtractionError,
    FieldPaths,
    RecordExtractor,
};
pub use crate::engine::filters::{
    EndpointFilter,
    FilterError,
};

pub use crate::modules::{
    CaptureEvent,
    CaptureMetrics,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    MetricsHandler,
    MetricsSnapshot,
};

pub use crate::session::{
    DriverError,
    ExtractionSession,
    ExtractionSessionBuilder,
    NavigationDriver,
    SessionError,
    SessionResult,
    write_records_json,
};

pub use crate::transports::{
    BodyFetcher,
    CaptureError,
    CaptureResult,
    FetchError,
    LogTailBackend,
    LogTailer,
    LogcatCommand,
    ProtocolPushBackend,
    PushSummary,
    ShutdownReport,
    StopHandle,
    StopSignal,
    TransportFailure,
    handoff_queue,
    stop_signal,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
