//! Testing utilities for mongo-resilient
//!
//! - [`fixtures`]: rstest fixtures around the in-memory driver
//! - [`containers`]: a containerized MongoDB server for tests against a real cluster
//! - [`logging`]: one-time subscriber setup and log capture

pub mod containers;
pub mod fixtures;
pub mod logging;

pub use containers::{MongoServer, mongodb_server};
pub use fixtures::{memory_driver, memory_session, people, test_config};
pub use logging::{LogCapture, capture_logs, init_test_logging};
