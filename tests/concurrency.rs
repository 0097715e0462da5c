//! Concurrent refresh and retry tests

use bson::{Document, doc};
use futures::future::join_all;
use mongo_resilient::{Error, MemoryDriver, Op, Session, SessionConfig};
use mongo_resilient_test::{memory_driver, memory_session, test_config};
use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;

/// Test that concurrent refreshes collapse into one
///
/// This test verifies that:
/// 1. Only the first caller reaches the driver
/// 2. The other callers wait and return without refreshing
/// 3. The refresh flag is cleared afterwards
#[rstest]
#[tokio::test(start_paused = true)]
async fn test_concurrent_refreshes_are_deduplicated(memory_session: (MemoryDriver, Session)) {
	// Arrange
	let (driver, session) = memory_session;
	driver.set_refresh_latency(Duration::from_millis(100));
	let other = session.clone();
	let view = session.db("audit");

	// Act
	tokio::join!(session.refresh(), other.refresh(), view.refresh());

	// Assert
	assert_eq!(driver.op_count(Op::Refresh), 1);

	session.refresh().await;
	assert_eq!(driver.op_count(Op::Refresh), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_cancelled_refresh_releases_the_flag(memory_session: (MemoryDriver, Session)) {
	let (driver, session) = memory_session;
	driver.set_refresh_latency(Duration::from_millis(100));

	let cancelled = tokio::time::timeout(Duration::from_millis(10), session.refresh()).await;
	session.refresh().await;

	assert!(cancelled.is_err());
	assert_eq!(driver.op_count(Op::Refresh), 2);
}

/// Test that callers hit by the same outage all recover
#[rstest]
#[tokio::test(start_paused = true)]
async fn test_severed_link_with_concurrent_writers(memory_driver: MemoryDriver) {
	// Arrange
	let config = SessionConfig::new()
		.with_max_retries(10)
		.with_refresh_wait(Duration::from_millis(50));
	let session = Session::with_driver(Arc::new(memory_driver.clone()), "test", &config);
	let collection = session.collection("events");
	memory_driver.set_refresh_latency(Duration::from_millis(100));
	memory_driver.sever();

	// Act
	let (d1, d2, d3) = ([doc! { "_id": 1 }], [doc! { "_id": 2 }], [doc! { "_id": 3 }]);
	let (a, b, c) = tokio::join!(
		collection.insert(&d1),
		collection.insert(&d2),
		collection.insert(&d3),
	);

	// Assert
	assert!(a.is_ok() && b.is_ok() && c.is_ok());
	assert!(!memory_driver.is_severed());
	assert_eq!(memory_driver.documents("test", "events").len(), 3);
	assert!(memory_driver.op_count(Op::Refresh) < memory_driver.op_count(Op::Insert));
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_inserts_share_the_retry_budget_per_call(
	memory_driver: MemoryDriver,
	test_config: SessionConfig,
) {
	let session = Session::with_driver(Arc::new(memory_driver.clone()), "test", &test_config);
	memory_driver.fail_times(Op::Insert, 2, Error::EndOfStream);

	let handles: Vec<_> = (0..8)
		.map(|n| {
			let collection = session.collection("events");
			tokio::spawn(async move { collection.insert(&[doc! { "_id": n }]).await })
		})
		.collect();
	let results = join_all(handles).await;

	for result in results {
		result.unwrap().unwrap();
	}
	let stored: Vec<Document> = memory_driver.documents("test", "events");
	assert_eq!(stored.len(), 8);
	assert_eq!(memory_driver.op_count(Op::Insert), 10);
	let refreshes = memory_driver.op_count(Op::Refresh);
	assert!((1..=2).contains(&refreshes));
}

/// Test that closing the session while a retry waits on a refresh ends the
/// envelope with the last failure
#[rstest]
#[tokio::test(start_paused = true)]
async fn test_close_during_refresh_stops_retrying(memory_session: (MemoryDriver, Session)) {
	let (driver, session) = memory_session;
	driver.set_refresh_latency(Duration::from_millis(100));
	driver.fail_times(Op::Count, 10, Error::EndOfStream);
	let collection = session.collection("events");

	let (result, ()) = tokio::join!(collection.count(), async {
		tokio::time::sleep(Duration::from_millis(10)).await;
		session.close().await;
	});

	assert!(matches!(result, Err(Error::EndOfStream)));
	assert_eq!(driver.op_count(Op::Count), 1);
	assert!(driver.is_closed());
}
