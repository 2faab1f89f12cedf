//! Shared types for Supernetes: errors, well-known labels, configuration and
//! the partition/node filter.

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod filter;
pub mod labels;
pub mod net;
pub mod telemetry;

pub use error::Error;
pub use filter::Filter;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
