//! Common types, wire payloads, and errors shared across `streamhooks` crates.

pub mod error;
pub mod protocol;

pub use error::ServiceError;
