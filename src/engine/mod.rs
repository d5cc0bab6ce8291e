//! Correlation and extraction engine.

pub mod core;
pub mod correlator;
pub mod extractors;
pub mod filters;
