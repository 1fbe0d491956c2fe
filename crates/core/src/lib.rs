//! Domain layer for the Twilio exporter.
//!
//! Everything in this crate is synchronous and free of I/O: record types fetched
//! from the provider, the label mappings and aggregation that turn them into
//! bounded gauge values, the gauge registry and its text rendering, report
//! window resolution, and webhook authentication and classification.

pub mod aggregate;
pub mod form;
pub mod gauge;
pub mod signature;
pub mod types;
pub mod webhook;
pub mod window;

/// Label value used whenever the provider omits a field that feeds a label.
pub const UNKNOWN_LABEL: &str = "unknown";
