//! Session configuration

use std::time::Duration;

use crate::classify::FailurePolicy;
use crate::target::{ConnectTarget, DEFAULT_MAX_RETRIES};
use crate::types::Mode;

/// Session configuration
///
/// Values set here are defaults; a `maxRetries` option in the connect target
/// overrides `max_retries`.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct SessionConfig {
	/// Attempts per logical operation (0 still performs one attempt)
	pub max_retries: usize,
	/// How long a caller waits when another refresh is already in progress
	pub refresh_wait: Duration,
	/// Timeout of the initial dial
	pub connect_timeout: Duration,
	/// Timeout of a single round trip on an established connection
	pub socket_timeout: Duration,
	/// Timeout for finding a suitable server (primary election, topology sync)
	pub sync_timeout: Duration,
	/// Which errors count as transient
	pub failure_policy: FailurePolicy,
	/// Initial consistency mode
	pub mode: Mode,
	/// Fail single-document updates and removals that match nothing
	pub strict: bool,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			max_retries: DEFAULT_MAX_RETRIES,
			refresh_wait: Duration::from_secs(1),
			connect_timeout: Duration::from_secs(10),
			socket_timeout: Duration::from_secs(60),
			sync_timeout: Duration::from_secs(60),
			failure_policy: FailurePolicy::Strict,
			mode: Mode::Primary,
			strict: true,
		}
	}
}

impl SessionConfig {
	/// Create a new session configuration with default values
	///
	/// # Examples
	///
	/// ```rust
	/// use mongo_resilient::SessionConfig;
	///
	/// let config = SessionConfig::new();
	/// assert_eq!(config.max_retries, 2);
	/// ```
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_max_retries(mut self, max_retries: usize) -> Self {
		self.max_retries = max_retries;
		self
	}

	pub fn with_refresh_wait(mut self, wait: Duration) -> Self {
		self.refresh_wait = wait;
		self
	}

	pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
		self.connect_timeout = timeout;
		self
	}

	pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
		self.socket_timeout = timeout;
		self
	}

	pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
		self.sync_timeout = timeout;
		self
	}

	pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
		self.failure_policy = policy;
		self
	}

	pub fn with_mode(mut self, mode: Mode) -> Self {
		self.mode = mode;
		self
	}

	pub fn with_strict(mut self, strict: bool) -> Self {
		self.strict = strict;
		self
	}

	/// Apply the overrides carried by a connect target
	pub fn apply_target(mut self, target: &ConnectTarget) -> Self {
		if let Some(max_retries) = target.max_retries() {
			self.max_retries = max_retries;
		}
		self
	}

	/// Validate the configuration
	pub fn validate(&self) -> Result<(), String> {
		if self.connect_timeout.is_zero() {
			return Err("connect_timeout must be greater than zero".to_string());
		}
		if self.socket_timeout.is_zero() {
			return Err("socket_timeout must be greater than zero".to_string());
		}
		if self.sync_timeout.is_zero() {
			return Err("sync_timeout must be greater than zero".to_string());
		}
		Ok(())
	}
}
