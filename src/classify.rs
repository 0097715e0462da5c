//! Transient network failure classification
//!
//! Pooled sockets are closed server-side once they sit idle for long enough.
//! The driver surfaces this as an end-of-stream error, a socket error, or a
//! plain message ending in "closed", never as a dedicated error type, so
//! detection has to work on the error kind and message text.

use crate::error::Error;

/// Policy deciding which errors count as transient network failures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
	/// EOF, socket errors, and messages starting or ending with "closed"
	#[default]
	Strict,
	/// `Strict`, plus any message mentioning "close", "shutdown" or "connection"
	Lenient,
}

impl FailurePolicy {
	/// Returns `true` when `err` is a transient network failure under this policy
	///
	/// # Examples
	///
	/// ```rust
	/// use mongo_resilient::{Error, FailurePolicy};
	///
	/// let policy = FailurePolicy::Strict;
	/// assert!(!policy.is_transient(None));
	/// assert!(policy.is_transient(Some(&Error::EndOfStream)));
	/// assert!(!policy.is_transient(Some(&Error::NotFound)));
	/// ```
	pub fn is_transient(self, err: Option<&Error>) -> bool {
		let Some(err) = err else {
			return false;
		};

		match err {
			Error::EndOfStream | Error::Network(_) => return true,
			// Raised by this crate before any I/O happens
			Error::SessionClosed | Error::Configuration(_) => return false,
			_ => {}
		}

		let message = err.to_string().to_lowercase();
		if message.starts_with("closed") || message.ends_with("closed") {
			return true;
		}

		match self {
			FailurePolicy::Strict => false,
			FailurePolicy::Lenient => {
				message.contains("close")
					|| message.contains("shutdown")
					|| message.contains("connection")
			}
		}
	}
}

/// Returns `true` when `err` is a transient network failure under
/// [`FailurePolicy::Strict`]
pub fn is_network_error(err: Option<&Error>) -> bool {
	FailurePolicy::Strict.is_transient(err)
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;
	use std::io;

	#[rstest]
	fn test_no_error_is_not_transient() {
		assert!(!is_network_error(None));
	}

	#[rstest]
	fn test_end_of_stream_is_transient() {
		assert!(is_network_error(Some(&Error::EndOfStream)));
	}

	#[rstest]
	#[case(io::ErrorKind::ConnectionReset)]
	#[case(io::ErrorKind::BrokenPipe)]
	#[case(io::ErrorKind::TimedOut)]
	#[case(io::ErrorKind::ConnectionRefused)]
	fn test_socket_errors_are_transient(#[case] kind: io::ErrorKind) {
		let err = Error::network(io::Error::new(kind, "socket"));
		assert!(is_network_error(Some(&err)));
	}

	#[rstest]
	#[case("Closed explicitly")]
	#[case("closed")]
	#[case("socket was CLOSED")]
	fn test_closed_messages_are_transient(#[case] message: &str) {
		let err = Error::Driver(message.to_string());
		assert!(is_network_error(Some(&err)));
	}

	#[rstest]
	#[case(Error::NotFound)]
	#[case(Error::Driver("document not found".to_string()))]
	#[case(Error::server(11000, "E11000 duplicate key error"))]
	#[case(Error::server(2, "unknown operator: $foo"))]
	#[case(Error::Driver("connection closed by peer".to_string()))]
	#[case(Error::InvalidArgument("empty sort field".to_string()))]
	#[case(Error::Serialization("invalid type".to_string()))]
	#[case(Error::SessionClosed)]
	fn test_other_errors_are_not_transient(#[case] err: Error) {
		assert!(!is_network_error(Some(&err)));
	}

	#[rstest]
	#[case("connection closed by peer", true)]
	#[case("server is in shutdown", true)]
	#[case("failed to close cursor", true)]
	#[case("no reachable connection", true)]
	#[case("document not found", false)]
	fn test_lenient_policy(#[case] message: &str, #[case] expected: bool) {
		let err = Error::Driver(message.to_string());
		assert_eq!(FailurePolicy::Lenient.is_transient(Some(&err)), expected);
	}

	#[rstest]
	fn test_lenient_policy_never_retries_a_closed_session() {
		assert!(!FailurePolicy::Lenient.is_transient(Some(&Error::SessionClosed)));
	}
}
