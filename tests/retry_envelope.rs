//! Retry envelope tests
//!
//! Exercises refresh-and-retry through the collection handle against the
//! in-memory driver with injected faults.

use bson::{Document, doc};
use mongo_resilient::{Error, FailurePolicy, MemoryDriver, Op, Session, SessionConfig};
use mongo_resilient_test::{capture_logs, memory_session, people};
use rstest::rstest;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Test that a single dropped connection is invisible to the caller
///
/// This test verifies that:
/// 1. The failed insert is sent again after one refresh
/// 2. The document is stored exactly once
#[rstest]
#[tokio::test]
async fn test_insert_survives_dropped_connection(
	memory_session: (MemoryDriver, Session),
	people: Vec<Document>,
) {
	// Arrange
	let (driver, session) = memory_session;
	driver.fail_next(Op::Insert, Error::EndOfStream);

	// Act
	let result = session.collection("people").insert(&people[..1]).await;

	// Assert
	assert!(result.is_ok());
	assert_eq!(driver.op_count(Op::Insert), 2);
	assert_eq!(driver.op_count(Op::Refresh), 1);
	assert_eq!(driver.documents("test", "people").len(), 1);
}

/// Test that the retry budget bounds the number of attempts
///
/// This test verifies that:
/// 1. Exactly `max_retries` attempts are made
/// 2. Every failed attempt is followed by a refresh
/// 3. The last attempt's error is returned unchanged
#[rstest]
#[tokio::test]
async fn test_budget_exhaustion_returns_last_error(memory_session: (MemoryDriver, Session)) {
	// Arrange
	let (driver, session) = memory_session;
	driver.fail_times(
		Op::Count,
		10,
		Error::network(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer")),
	);

	// Act
	let err = session.collection("people").count().await.unwrap_err();

	// Assert
	assert!(matches!(err, Error::Network(_)));
	assert_eq!(err.to_string(), "connection reset by peer");
	assert_eq!(driver.op_count(Op::Count), 3);
	assert_eq!(driver.op_count(Op::Refresh), 3);
}

#[rstest]
#[case(0, 1)]
#[case(1, 1)]
#[case(5, 5)]
#[tokio::test]
async fn test_attempts_follow_max_retries(#[case] max_retries: usize, #[case] attempts: usize) {
	let driver = MemoryDriver::new();
	let config = SessionConfig::new()
		.with_max_retries(max_retries)
		.with_refresh_wait(Duration::from_millis(10));
	let session = Session::with_driver(Arc::new(driver.clone()), "test", &config);
	driver.fail_times(Op::Find, 10, Error::EndOfStream);

	let result: mongo_resilient::Result<Document> = session.collection("people").find(&doc! {}).one().await;

	assert!(matches!(result, Err(Error::EndOfStream)));
	assert_eq!(driver.op_count(Op::Find), attempts);
}

/// Test that application errors are never retried
#[rstest]
#[tokio::test]
async fn test_permanent_error_is_not_retried(
	memory_session: (MemoryDriver, Session),
	people: Vec<Document>,
) {
	let (driver, session) = memory_session;
	let collection = session.collection("people");
	collection.insert(&people).await.unwrap();

	let err = collection.insert(&people[..1]).await.unwrap_err();

	assert!(err.is_duplicate_key());
	assert_eq!(driver.op_count(Op::Insert), 2);
	assert_eq!(driver.op_count(Op::Refresh), 0);
}

/// Test that a severed link heals with a single refresh
#[rstest]
#[tokio::test]
async fn test_severed_link_needs_one_refresh(
	memory_session: (MemoryDriver, Session),
	people: Vec<Document>,
) {
	let (driver, session) = memory_session;
	let collection = session.collection("people");
	collection.insert(&people).await.unwrap();
	driver.sever();

	let count = collection.count().await.unwrap();

	assert_eq!(count, 4);
	assert_eq!(driver.op_count(Op::Refresh), 1);
	assert!(!driver.is_severed());
}

/// Test that a closed session fails fast without reaching the driver
#[rstest]
#[tokio::test]
async fn test_closed_session_fails_fast(memory_session: (MemoryDriver, Session), people: Vec<Document>) {
	let (driver, session) = memory_session;
	let collection = session.collection("people");
	session.close().await;

	let insert = collection.insert(&people).await;
	let query: mongo_resilient::Result<Vec<Document>> = collection.find(&doc! {}).all().await;
	let ping = session.ping().await;

	assert!(matches!(insert, Err(Error::SessionClosed)));
	assert!(matches!(query, Err(Error::SessionClosed)));
	assert!(matches!(ping, Err(Error::SessionClosed)));
	assert_eq!(driver.op_count(Op::Insert), 0);
	assert_eq!(driver.op_count(Op::Find), 0);
	assert_eq!(driver.op_count(Op::Command), 0);
	assert_eq!(driver.op_count(Op::Refresh), 0);
}

/// Test that commands get exactly one refresh and one more attempt
///
/// This test verifies that:
/// 1. `run` ignores the retry budget
/// 2. The second attempt's error is returned
#[rstest]
#[tokio::test]
async fn test_run_retries_exactly_once(memory_session: (MemoryDriver, Session)) {
	// Arrange
	let (driver, session) = memory_session;
	assert_eq!(session.max_retries(), 3);
	driver.fail_times(Op::Command, 5, Error::EndOfStream);

	// Act
	let result: mongo_resilient::Result<Document> = session.run(&doc! { "ping": 1 }).await;

	// Assert
	assert!(matches!(result, Err(Error::EndOfStream)));
	assert_eq!(driver.op_count(Op::Command), 2);
	assert_eq!(driver.op_count(Op::Refresh), 1);
}

#[rstest]
#[tokio::test]
async fn test_run_recovers_after_one_failure(memory_session: (MemoryDriver, Session)) {
	let (driver, session) = memory_session;
	driver.fail_next(Op::Command, Error::Driver("connection closed".to_string()));

	session.ping().await.unwrap();

	assert_eq!(driver.op_count(Op::Command), 2);
}

#[rstest]
#[tokio::test]
async fn test_run_does_not_retry_permanent_errors(memory_session: (MemoryDriver, Session)) {
	let (driver, session) = memory_session;

	let err = session
		.run::<_, Document>(&doc! { "shutdown": 1 })
		.await
		.unwrap_err();

	assert_eq!(err.code(), Some(59));
	assert_eq!(driver.op_count(Op::Command), 1);
	assert_eq!(driver.op_count(Op::Refresh), 0);
}

#[rstest]
#[case(FailurePolicy::Strict, 1)]
#[case(FailurePolicy::Lenient, 3)]
#[tokio::test]
async fn test_failure_policy_decides_retries(#[case] policy: FailurePolicy, #[case] attempts: usize) {
	let driver = MemoryDriver::new();
	let config = SessionConfig::new()
		.with_max_retries(3)
		.with_refresh_wait(Duration::from_millis(10))
		.with_failure_policy(policy);
	let session = Session::with_driver(Arc::new(driver.clone()), "test", &config);
	driver.fail_times(Op::Remove, 10, Error::Driver("server is in shutdown".to_string()));

	let result = session.collection("people").remove_all(&doc! {}).await;

	assert!(result.is_err());
	assert_eq!(driver.op_count(Op::Remove), attempts);
}

/// Test that failures are logged before retrying and when giving up
#[rstest]
#[tokio::test]
async fn test_retries_are_logged(memory_session: (MemoryDriver, Session)) {
	// Arrange
	let (driver, session) = memory_session;
	let (logs, _guard) = capture_logs();
	driver.fail_times(Op::Update, 3, Error::EndOfStream);

	// Act
	let result = session
		.collection("people")
		.update_all(&doc! {}, &doc! { "$set": { "seen": true } })
		.await;

	// Assert
	assert!(result.is_err());
	assert!(logs.contains(tracing::Level::WARN, "transient network failure, retrying"));
	assert!(logs.contains(tracing::Level::ERROR, "giving up after repeated network failures"));
}

/// Test that a refresh failure is swallowed and reported by the next attempt
#[rstest]
#[tokio::test]
async fn test_refresh_failure_is_swallowed(
	memory_session: (MemoryDriver, Session),
	people: Vec<Document>,
) {
	let (driver, session) = memory_session;
	driver.fail_next(Op::Insert, Error::EndOfStream);
	driver.fail_next(Op::Refresh, Error::Driver("no reachable servers".to_string()));

	session.collection("people").insert(&people).await.unwrap();

	assert_eq!(driver.op_count(Op::Refresh), 1);
	assert_eq!(driver.documents("test", "people").len(), 4);
}
