//! Session connect and lifecycle tests

use async_trait::async_trait;
use bson::{Document, doc};
use mongo_resilient::{
	ConnectTarget, Dialer, Driver, Error, MemoryDriver, Mode, Op, Session, SessionConfig,
};
use mongo_resilient_test::memory_session;
use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;

/// Dialer that never answers in time
struct StalledDialer;

#[async_trait]
impl Dialer for StalledDialer {
	async fn dial(
		&self,
		_target: &ConnectTarget,
		_config: &SessionConfig,
	) -> mongo_resilient::Result<Arc<dyn Driver>> {
		tokio::time::sleep(Duration::from_secs(3600)).await;
		Ok(Arc::new(MemoryDriver::new()))
	}
}

/// Test connecting through the in-memory dialer
///
/// This test verifies that:
/// 1. The database name comes from the path
/// 2. `maxRetries` sets the retry budget
/// 3. The session is usable right away
#[rstest]
#[tokio::test]
async fn test_connect_reads_target_options() {
	// Arrange
	let driver = MemoryDriver::new();

	// Act
	let session = Session::connect_with(&driver, "mem://localhost:27017/app?maxRetries=5")
		.await
		.unwrap();

	// Assert
	assert_eq!(session.name(), "app");
	assert_eq!(session.max_retries(), 5);
	session.ping().await.unwrap();
}

#[rstest]
#[case("mem://localhost/ignored?db=app", "app", 2)]
#[case("mem://localhost/app", "app", 2)]
#[case("mem://h1,h2?db=audit&maxRetries=0", "audit", 0)]
#[tokio::test]
async fn test_connect_database_and_budget(
	#[case] target: &str,
	#[case] database: &str,
	#[case] max_retries: usize,
) {
	let session = Session::connect_with(&MemoryDriver::new(), target)
		.await
		.unwrap();

	assert_eq!(session.name(), database);
	assert_eq!(session.max_retries(), max_retries);
}

#[rstest]
#[case("localhost/app")]
#[case("mem://localhost")]
#[case("mem://localhost/app?maxRetries=-1")]
#[case("mem://localhost/app?maxRetries=many")]
#[case("mem://a,,b/app")]
#[tokio::test]
async fn test_malformed_target_is_a_configuration_error(#[case] target: &str) {
	let driver = MemoryDriver::new();

	let err = Session::connect_with(&driver, target).await.unwrap_err();

	assert!(matches!(err, Error::Configuration(_)), "{}: {:?}", target, err);
}

#[rstest]
#[tokio::test]
async fn test_zero_timeout_is_a_configuration_error() {
	let config = SessionConfig::new().with_connect_timeout(Duration::ZERO);

	let err = Session::connect_with_config(&MemoryDriver::new(), "mem://localhost/app", config)
		.await
		.unwrap_err();

	assert!(matches!(err, Error::Configuration(_)));
}

/// Test that an unreachable cluster is reported as a connection error
#[rstest]
#[tokio::test]
async fn test_refused_dial_is_a_connection_error() {
	// Arrange
	let driver = MemoryDriver::new();
	driver.refuse_dial("connection refused");

	// Act
	let err = Session::connect_with(&driver, "mem://db1:27017/app")
		.await
		.unwrap_err();

	// Assert
	match err {
		Error::Connection(message) => {
			assert!(message.contains("db1:27017"));
			assert!(message.contains("connection refused"));
		}
		other => panic!("expected a connection error, got {:?}", other),
	}

	driver.accept_dial();
	assert!(Session::connect_with(&driver, "mem://db1:27017/app").await.is_ok());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_stalled_dial_times_out() {
	let config = SessionConfig::new().with_connect_timeout(Duration::from_secs(2));

	let err = Session::connect_with_config(&StalledDialer, "mem://localhost/app", config)
		.await
		.unwrap_err();

	match err {
		Error::Connection(message) => assert!(message.contains("timed out")),
		other => panic!("expected a connection error, got {:?}", other),
	}
}

#[rstest]
#[tokio::test]
async fn test_connect_applies_configured_mode() {
	let driver = MemoryDriver::new();
	let config = SessionConfig::new().with_mode(Mode::Nearest);

	let session = Session::connect_with_config(&driver, "mem://localhost/app", config)
		.await
		.unwrap();

	assert_eq!(session.mode(), Mode::Nearest);
	assert_eq!(driver.mode(), Mode::Nearest);
}

/// Test changing the consistency mode of a live session
#[rstest]
#[tokio::test]
async fn test_set_mode(memory_session: (MemoryDriver, Session)) {
	let (driver, session) = memory_session;

	session.set_mode(Mode::SecondaryPreferred, false).await;
	assert_eq!(session.mode(), Mode::SecondaryPreferred);
	assert_eq!(driver.op_count(Op::Refresh), 0);

	session.set_mode(Mode::STRONG, true).await;
	assert_eq!(driver.mode(), Mode::Primary);
	assert_eq!(driver.op_count(Op::Refresh), 1);
}

#[rstest]
#[tokio::test]
async fn test_db_view_shares_connections(memory_session: (MemoryDriver, Session)) {
	let (driver, session) = memory_session;
	let audit = session.db("audit");

	audit.collection("events").insert(&[doc! { "kind": "login" }]).await.unwrap();
	session.close().await;

	assert_eq!(audit.name(), "audit");
	assert_eq!(audit.max_retries(), session.max_retries());
	assert_eq!(driver.documents("audit", "events").len(), 1);
	assert!(audit.is_closed());
	assert!(driver.is_closed());
}

#[rstest]
#[tokio::test]
async fn test_close_twice_is_a_noop(memory_session: (MemoryDriver, Session)) {
	let (_driver, session) = memory_session;

	session.close().await;
	session.close().await;

	assert!(session.is_closed());
	assert!(matches!(session.build_info().await, Err(Error::SessionClosed)));
}

#[rstest]
#[tokio::test]
async fn test_build_info(memory_session: (MemoryDriver, Session)) {
	let (_driver, session) = memory_session;

	let info = session.build_info().await.unwrap();

	assert_eq!(info.version, "7.0.0");
	assert!(info.version_at_least(&[3, 6]));
	assert!(!info.version_at_least(&[8]));
}

#[rstest]
#[tokio::test]
async fn test_run_command_reply(memory_session: (MemoryDriver, Session)) {
	let (_driver, session) = memory_session;
	session
		.collection("people")
		.insert(&[doc! { "name": "Ada" }, doc! { "name": "Alan" }])
		.await
		.unwrap();

	let reply: Document = session.run(&doc! { "count": "people" }).await.unwrap();

	assert_eq!(reply.get_i64("n").unwrap(), 2);
}
