//! Session handle and retry envelope
//!
//! A [`Session`] owns the shared driver, the working database name and the
//! retry budget. Every retried operation of the derived handles runs through
//! [`Session::retry`]:
//!
//! ```text
//! attempt = 0
//! while attempt < max(max_retries, 1):
//!     result = operation()
//!     if result is not a transient failure: return result
//!     session.refresh()
//!     attempt += 1
//! return result
//! ```
//!
//! The loop stops on the first non-transient outcome, success or error. Only
//! transient network failures (see [`FailurePolicy`]) refresh and retry.

use bson::Document;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::classify::FailurePolicy;
use crate::collection::Collection;
use crate::config::SessionConfig;
use crate::driver::{Dialer, Driver};
use crate::error::{Error, Result};
use crate::target::ConnectTarget;
use crate::types::{BuildInfo, Mode};

struct SessionShared {
	driver: Arc<dyn Driver>,
	refreshing: AtomicBool,
	closed: AtomicBool,
	strict: AtomicBool,
	/// `<namespace>:<index name>` of indexes known to exist
	index_cache: Mutex<HashSet<String>>,
	policy: FailurePolicy,
	refresh_wait: Duration,
}

/// Clears the refresh flag on every exit path, including cancellation
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

/// Connection-resilient session handle
///
/// Cloning is cheap: clones share the driver, the refresh flag and the
/// index cache. Handles derived from a session ([`Collection`], queries,
/// cursors) hold a clone and route their retries through it.
///
/// # Example
///
/// ```rust
/// use mongo_resilient::{MemoryDriver, Session};
/// use bson::doc;
///
/// # async fn example() -> mongo_resilient::Result<()> {
/// let driver = MemoryDriver::new();
/// let session = Session::connect_with(&driver, "mem://localhost/app?maxRetries=3").await?;
/// assert_eq!(session.name(), "app");
/// assert_eq!(session.max_retries(), 3);
///
/// let people = session.collection("people");
/// people.insert(&[doc! { "name": "Ada" }]).await?;
/// session.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
	shared: Arc<SessionShared>,
	database: String,
	max_retries: usize,
}

impl Session {
	/// Connect to a cluster through the official driver
	///
	/// See [`ConnectTarget`] for the accepted target format.
	#[cfg(feature = "mongodb")]
	pub async fn connect(target: &str) -> Result<Self> {
		Self::connect_with(&crate::backends::mongodb::MongoDialer, target).await
	}

	/// Connect with the default configuration through `dialer`
	pub async fn connect_with(dialer: &dyn Dialer, target: &str) -> Result<Self> {
		Self::connect_with_config(dialer, target, SessionConfig::default()).await
	}

	/// Connect through `dialer`
	///
	/// Options of the target override the matching `config` fields. Fails
	/// with [`Error::Configuration`] on a malformed target or configuration
	/// and with [`Error::Connection`] when the dial fails or times out.
	pub async fn connect_with_config(
		dialer: &dyn Dialer,
		target: &str,
		config: SessionConfig,
	) -> Result<Self> {
		let target = ConnectTarget::parse(target)?;
		let config = config.apply_target(&target);
		config.validate().map_err(Error::Configuration)?;

		tracing::info!(
			uri = %target,
			database = target.database(),
			max_retries = config.max_retries,
			"connecting session"
		);

		let driver = match tokio::time::timeout(config.connect_timeout, dialer.dial(&target, &config))
			.await
		{
			Ok(Ok(driver)) => driver,
			Ok(Err(Error::Connection(message))) => return Err(Error::Connection(message)),
			Ok(Err(e)) => {
				return Err(Error::Connection(format!(
					"failed to connect to {}: {}",
					target, e
				)));
			}
			Err(_) => {
				return Err(Error::Connection(format!(
					"timed out after {:?} connecting to {}",
					config.connect_timeout, target
				)));
			}
		};

		Ok(Self::with_driver(driver, target.database(), &config))
	}

	/// Wrap an already established driver
	pub fn with_driver(
		driver: Arc<dyn Driver>,
		database: impl Into<String>,
		config: &SessionConfig,
	) -> Self {
		driver.set_mode(config.mode);
		Self {
			shared: Arc::new(SessionShared {
				driver,
				refreshing: AtomicBool::new(false),
				closed: AtomicBool::new(false),
				strict: AtomicBool::new(config.strict),
				index_cache: Mutex::new(HashSet::new()),
				policy: config.failure_policy,
				refresh_wait: config.refresh_wait,
			}),
			database: database.into(),
			max_retries: config.max_retries,
		}
	}

	/// Working database name
	pub fn name(&self) -> &str {
		&self.database
	}

	/// Attempts per logical operation
	pub fn max_retries(&self) -> usize {
		self.max_retries
	}

	/// Failure policy applied by every retry of this session
	pub fn failure_policy(&self) -> FailurePolicy {
		self.shared.policy
	}

	/// View of another database over the same connections
	///
	/// This does not reconnect; the view shares the driver, the retry budget
	/// and the refresh flag with `self`.
	pub fn db(&self, name: impl Into<String>) -> Session {
		Session {
			shared: Arc::clone(&self.shared),
			database: name.into(),
			max_retries: self.max_retries,
		}
	}

	/// Collection handle in the working database
	pub fn collection(&self, name: impl Into<String>) -> Collection {
		Collection::new(self.clone(), name.into())
	}

	/// Discard and re-establish the pooled connections
	///
	/// At most one refresh runs at a time. A caller arriving while another
	/// refresh is in progress sleeps for the configured refresh wait and
	/// returns without refreshing. Driver refresh failures are logged and
	/// swallowed; the next attempt of the retried operation reports them.
	pub async fn refresh(&self) {
		if self.shared.refreshing.swap(true, Ordering::AcqRel) {
			tracing::debug!(
				database = %self.database,
				"refresh already in progress, waiting {:?}",
				self.shared.refresh_wait
			);
			tokio::time::sleep(self.shared.refresh_wait).await;
			return;
		}
		let _guard = RefreshGuard(&self.shared.refreshing);

		tracing::info!(database = %self.database, "refreshing session connections");
		if let Err(e) = self.shared.driver.refresh().await {
			tracing::warn!(database = %self.database, error = %e, "session refresh failed");
		}
	}

	/// Release the driver and its connection pool
	///
	/// Every handle derived from this session fails with
	/// [`Error::SessionClosed`] afterwards. Closing twice is a no-op.
	pub async fn close(&self) {
		if self.shared.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		tracing::info!(database = %self.database, "closing session");
		self.shared.driver.close().await;
	}

	pub fn is_closed(&self) -> bool {
		self.shared.closed.load(Ordering::Acquire)
	}

	/// Run a database command against the working database
	///
	/// A transient failure triggers exactly one refresh and one more attempt,
	/// whose outcome is returned as is. The retry budget does not apply.
	pub async fn run<C, R>(&self, command: &C) -> Result<R>
	where
		C: Serialize,
		R: DeserializeOwned,
	{
		self.ensure_open()?;
		let command = bson::serialize_to_document(command)?;
		let driver = self.driver();

		let mut reply = driver.run_command(&self.database, command.clone()).await;
		if self.shared.policy.is_transient(reply.as_ref().err()) {
			if let Err(e) = &reply {
				tracing::warn!(
					database = %self.database,
					error = %e,
					"command failed on a closed connection, refreshing and retrying once"
				);
			}
			self.refresh().await;
			reply = driver.run_command(&self.database, command).await;
		}

		Ok(bson::deserialize_from_document(reply?)?)
	}

	/// Check that the server answers
	pub async fn ping(&self) -> Result<()> {
		let _: Document = self.run(&bson::doc! { "ping": 1 }).await?;
		Ok(())
	}

	/// Server build information
	pub async fn build_info(&self) -> Result<BuildInfo> {
		self.ensure_open()?;
		self.driver().build_info().await
	}

	/// Change the consistency mode, optionally refreshing the connections
	pub async fn set_mode(&self, mode: Mode, refresh: bool) {
		self.shared.driver.set_mode(mode);
		if refresh {
			self.refresh().await;
		}
	}

	pub fn mode(&self) -> Mode {
		self.shared.driver.mode()
	}

	/// Toggle strict writes
	///
	/// In strict mode (the default) updating or removing a single document
	/// that matches nothing fails with [`Error::NotFound`].
	pub fn set_strict(&self, strict: bool) {
		self.shared.strict.store(strict, Ordering::Release);
	}

	pub fn strict(&self) -> bool {
		self.shared.strict.load(Ordering::Acquire)
	}

	/// Forget which indexes are known to exist
	///
	/// The next `ensure_index` of each index reaches the server again.
	pub fn reset_index_cache(&self) {
		self.shared.index_cache.lock().clear();
	}

	pub(crate) fn driver(&self) -> &dyn Driver {
		&*self.shared.driver
	}

	pub(crate) fn index_known(&self, key: &str) -> bool {
		self.shared.index_cache.lock().contains(key)
	}

	pub(crate) fn remember_index(&self, key: String) {
		self.shared.index_cache.lock().insert(key);
	}

	pub(crate) fn forget_index(&self, key: &str) {
		self.shared.index_cache.lock().remove(key);
	}

	pub(crate) fn forget_indexes(&self, prefix: &str) {
		self.shared
			.index_cache
			.lock()
			.retain(|key| !key.starts_with(prefix));
	}

	pub(crate) fn ensure_open(&self) -> Result<()> {
		if self.is_closed() {
			return Err(Error::SessionClosed);
		}
		Ok(())
	}

	/// Run `operation` inside the retry envelope
	pub(crate) async fn retry<T, F, Fut>(&self, op: &'static str, mut operation: F) -> Result<T>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		self.ensure_open()?;
		let mut attempts = self.attempts(op);
		loop {
			let result = operation().await;
			if !attempts.retry_after(&result).await {
				return result;
			}
		}
	}

	/// Attempt counter for envelopes whose operation needs `&mut` state
	/// between attempts, such as draining a cursor
	pub(crate) fn attempts(&self, op: &'static str) -> Attempts<'_> {
		Attempts {
			session: self,
			op,
			attempt: 0,
			budget: self.max_retries.max(1),
		}
	}
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("database", &self.database)
			.field("max_retries", &self.max_retries)
			.field("closed", &self.is_closed())
			.finish()
	}
}

/// Retry bookkeeping of a single logical operation
pub(crate) struct Attempts<'a> {
	session: &'a Session,
	op: &'static str,
	attempt: usize,
	budget: usize,
}

impl Attempts<'_> {
	/// Decide whether another attempt follows `result`
	///
	/// A transient failure refreshes the session before returning. Returns
	/// `false` on success, on any other error, once the budget is spent, or
	/// when the session was closed in the meantime.
	pub(crate) async fn retry_after<T>(&mut self, result: &Result<T>) -> bool {
		let Err(err) = result else {
			return false;
		};
		if !self.session.shared.policy.is_transient(Some(err)) {
			return false;
		}

		self.session.refresh().await;
		self.attempt += 1;

		if self.attempt >= self.budget {
			tracing::error!(
				op = self.op,
				attempts = self.attempt,
				error = %err,
				"giving up after repeated network failures"
			);
			return false;
		}
		if self.session.is_closed() {
			return false;
		}

		tracing::warn!(
			op = self.op,
			attempt = self.attempt,
			max_retries = self.budget,
			error = %err,
			"transient network failure, retrying"
		);
		true
	}
}

#[cfg(all(test, feature = "memory"))]
mod tests {
	use super::*;
	use crate::backends::memory::{MemoryDriver, Op};
	use rstest::rstest;
	use std::sync::atomic::AtomicUsize;

	fn session(driver: &MemoryDriver, max_retries: usize) -> Session {
		let config = SessionConfig::new()
			.with_max_retries(max_retries)
			.with_refresh_wait(Duration::from_millis(10));
		Session::with_driver(Arc::new(driver.clone()), "app", &config)
	}

	#[rstest]
	#[tokio::test]
	async fn test_retry_stops_on_success() {
		let driver = MemoryDriver::new();
		let session = session(&driver, 3);
		let calls = AtomicUsize::new(0);

		let result = session
			.retry("op", || async {
				calls.fetch_add(1, Ordering::SeqCst);
				Ok::<_, Error>(7)
			})
			.await;

		assert_eq!(result.unwrap(), 7);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(driver.op_count(Op::Refresh), 0);
	}

	#[rstest]
	#[case(0, 1)]
	#[case(1, 1)]
	#[case(2, 2)]
	#[case(4, 4)]
	#[tokio::test]
	async fn test_retry_budget_is_exact(#[case] max_retries: usize, #[case] expected: usize) {
		let driver = MemoryDriver::new();
		let session = session(&driver, max_retries);
		let calls = AtomicUsize::new(0);

		let result: Result<()> = session
			.retry("op", || async {
				let n = calls.fetch_add(1, Ordering::SeqCst);
				Err(Error::Driver(format!("attempt {} closed", n)))
			})
			.await;

		assert_eq!(calls.load(Ordering::SeqCst), expected);
		assert_eq!(driver.op_count(Op::Refresh), expected);
		// The last attempt's error comes back unchanged
		assert_eq!(
			result.unwrap_err().to_string(),
			format!("attempt {} closed", expected - 1)
		);
	}

	#[rstest]
	#[tokio::test]
	async fn test_retry_returns_first_permanent_error() {
		let driver = MemoryDriver::new();
		let session = session(&driver, 5);
		let calls = AtomicUsize::new(0);

		let result: Result<()> = session
			.retry("op", || async {
				calls.fetch_add(1, Ordering::SeqCst);
				Err(Error::server(11000, "E11000 duplicate key error"))
			})
			.await;

		assert!(result.unwrap_err().is_duplicate_key());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(driver.op_count(Op::Refresh), 0);
	}

	#[rstest]
	#[tokio::test]
	async fn test_retry_recovers_after_transient_failure() {
		let driver = MemoryDriver::new();
		let session = session(&driver, 3);
		let calls = AtomicUsize::new(0);

		let result = session
			.retry("op", || async {
				match calls.fetch_add(1, Ordering::SeqCst) {
					0 => Err(Error::EndOfStream),
					n => Ok(n),
				}
			})
			.await;

		assert_eq!(result.unwrap(), 1);
		assert_eq!(driver.op_count(Op::Refresh), 1);
	}

	#[rstest]
	#[tokio::test]
	async fn test_lenient_policy_retries_connection_messages() {
		let driver = MemoryDriver::new();
		let config = SessionConfig::new()
			.with_max_retries(2)
			.with_failure_policy(FailurePolicy::Lenient);
		let session = Session::with_driver(Arc::new(driver.clone()), "app", &config);
		let calls = AtomicUsize::new(0);

		let _: Result<()> = session
			.retry("op", || async {
				calls.fetch_add(1, Ordering::SeqCst);
				Err(Error::Driver("connection reset by peer".to_string()))
			})
			.await;

		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[rstest]
	#[tokio::test]
	async fn test_closed_session_never_reaches_the_operation() {
		let driver = MemoryDriver::new();
		let session = session(&driver, 3);
		session.close().await;

		let calls = AtomicUsize::new(0);
		let result = session
			.retry("op", || async {
				calls.fetch_add(1, Ordering::SeqCst);
				Ok::<_, Error>(())
			})
			.await;

		assert!(matches!(result, Err(Error::SessionClosed)));
		assert_eq!(calls.load(Ordering::SeqCst), 0);
		assert!(driver.is_closed());
	}

	#[rstest]
	#[tokio::test]
	async fn test_db_view_shares_connection() {
		let driver = MemoryDriver::new();
		let session = session(&driver, 3);
		let other = session.db("other");

		assert_eq!(other.name(), "other");
		assert_eq!(other.max_retries(), 3);
		assert_eq!(session.name(), "app");

		other.close().await;
		assert!(session.is_closed());
	}
}
