//! Driver implementations
//!
//! - `memory`: process-local driver with fault injection, behind the default
//!   `memory` feature
//! - `mongodb`: the official MongoDB client, behind the `mongodb` feature

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "mongodb")]
pub mod mongodb;
