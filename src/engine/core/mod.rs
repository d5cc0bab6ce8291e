//! Core types shared by the correlator, transports, and extractors.

pub mod cdp;
pub mod decoder;
pub mod types;

pub use cdp::WireError;
pub use decoder::{DecodeError, decode_payload};
pub use types::{
    CapturedEvent, DiscardReason, Exchange, ExchangeId, ExchangeState, FetchedBody, LifecycleKind,
    NetworkEvent, ProtocolViolation,
};
