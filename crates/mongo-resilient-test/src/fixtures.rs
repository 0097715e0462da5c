//! rstest fixtures around the in-memory driver

use bson::{Document, doc};
use mongo_resilient::{MemoryDriver, Session, SessionConfig};
use rstest::fixture;
use std::sync::Arc;
use std::time::Duration;

/// Database name used by the fixtures
pub const TEST_DATABASE: &str = "test";

/// Session configuration for tests
///
/// Three attempts per operation and a short refresh wait, so tests that
/// exercise concurrent refreshes stay fast.
#[fixture]
pub fn test_config() -> SessionConfig {
	SessionConfig::new()
		.with_max_retries(3)
		.with_refresh_wait(Duration::from_millis(50))
}

/// Fresh in-memory driver
#[fixture]
pub fn memory_driver() -> MemoryDriver {
	MemoryDriver::new()
}

/// Session over a fresh in-memory driver, together with the driver for
/// fault injection and inspection
///
/// # Examples
///
/// ```rust
/// use mongo_resilient_test::fixtures::{memory_driver, memory_session, test_config};
///
/// let (driver, session) = memory_session(memory_driver(), test_config());
/// assert_eq!(session.name(), "test");
/// assert!(!driver.is_closed());
/// ```
#[fixture]
pub fn memory_session(memory_driver: MemoryDriver, test_config: SessionConfig) -> (MemoryDriver, Session) {
	crate::logging::init_test_logging();
	let session = Session::with_driver(Arc::new(memory_driver.clone()), TEST_DATABASE, &test_config);
	(memory_driver, session)
}

/// Sample documents with distinct names and ages
#[fixture]
pub fn people() -> Vec<Document> {
	vec![
		doc! { "_id": 1, "name": "Ada", "age": 36, "tags": ["math", "computing"] },
		doc! { "_id": 2, "name": "Alan", "age": 41, "tags": ["computing"] },
		doc! { "_id": 3, "name": "Grace", "age": 85, "tags": ["navy", "computing"] },
		doc! { "_id": 4, "name": "Edsger", "age": 72, "tags": ["math"] },
	]
}
