//! Common types for twinsync: errors, events, polling, and telemetry

#![deny(missing_docs)]

pub mod error;
pub mod events;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager / reporting component name used on every write and event
pub const CONTROLLER_NAME: &str = "twinsync-pod-syncer";
