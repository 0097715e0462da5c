//! Error types
//!
//! A single error type is shared by the session handles and the driver seam,
//! so a failure raised by the driver reaches the caller unchanged after the
//! retry envelope gives up.

use std::io;
use std::sync::Arc;

/// Result type for session, collection, query and cursor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type
///
/// `Error` is `Clone` because a cursor caches the outcome of its first close
/// and hands the same value back on every later call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// Malformed connect target, missing database name or bad option value
	#[error("Configuration error: {0}")]
	Configuration(String),

	/// The initial dial to the cluster failed
	#[error("Connection error: {0}")]
	Connection(String),

	/// An operation was issued on a session after `close()`
	#[error("Session already shut down")]
	SessionClosed,

	/// No document matched (query `one`, `apply`, strict `update`/`remove`)
	#[error("not found")]
	NotFound,

	/// The transport reached end of stream while a reply was expected
	#[error("EOF")]
	EndOfStream,

	/// Operating-system level socket error, including socket timeouts
	#[error("{0}")]
	Network(Arc<io::Error>),

	/// Error reported by the server (duplicate key, malformed query, ...)
	#[error("{message}")]
	Server {
		/// Server error code
		code: i32,
		/// Server error message
		message: String,
	},

	/// The caller supplied an invalid argument (bad sort key, empty index key, ...)
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	/// Document could not be converted to or from BSON
	#[error("Serialization error: {0}")]
	Serialization(String),

	/// Any other driver error, passed through unchanged
	#[error("{0}")]
	Driver(String),
}

impl Error {
	/// Wrap an I/O error as a network failure
	pub fn network(err: io::Error) -> Self {
		if err.kind() == io::ErrorKind::UnexpectedEof {
			return Error::EndOfStream;
		}
		Error::Network(Arc::new(err))
	}

	/// Build a server-reported error
	pub fn server(code: i32, message: impl Into<String>) -> Self {
		Error::Server {
			code,
			message: message.into(),
		}
	}

	/// Server error code, if the server reported one
	pub fn code(&self) -> Option<i32> {
		match self {
			Error::Server { code, .. } => Some(*code),
			_ => None,
		}
	}

	/// Whether this is a duplicate key violation
	pub fn is_duplicate_key(&self) -> bool {
		matches!(self.code(), Some(11000) | Some(11001) | Some(12582))
	}
}

impl From<io::Error> for Error {
	fn from(err: io::Error) -> Self {
		Error::network(err)
	}
}

// In bson v3.x, both ser::Error and de::Error are type aliases for bson::error::Error
impl From<bson::error::Error> for Error {
	fn from(err: bson::error::Error) -> Self {
		Error::Serialization(err.to_string())
	}
}

#[cfg(feature = "mongodb")]
impl From<mongodb::error::Error> for Error {
	fn from(err: mongodb::error::Error) -> Self {
		use mongodb::error::{ErrorKind, WriteFailure};

		match err.kind.as_ref() {
			ErrorKind::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => Error::EndOfStream,
			ErrorKind::Io(io) => Error::Network(Arc::clone(io)),
			ErrorKind::ConnectionPoolCleared { message } => Error::Network(Arc::new(io::Error::new(
				io::ErrorKind::ConnectionAborted,
				message.clone(),
			))),
			ErrorKind::Command(command) => Error::server(command.code, command.message.clone()),
			ErrorKind::Write(WriteFailure::WriteError(write)) => {
				Error::server(write.code, write.message.clone())
			}
			ErrorKind::Authentication { .. } => Error::Connection(err.to_string()),
			ErrorKind::InvalidArgument { message, .. } => Error::InvalidArgument(message.clone()),
			ErrorKind::Shutdown => Error::SessionClosed,
			_ => Error::Driver(err.to_string()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	fn test_unexpected_eof_becomes_end_of_stream() {
		let err = Error::network(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
		assert!(matches!(err, Error::EndOfStream));
	}

	#[rstest]
	fn test_reset_stays_network() {
		let err: Error = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer").into();
		assert!(matches!(err, Error::Network(_)));
		assert_eq!(err.to_string(), "reset by peer");
	}

	#[rstest]
	#[case(11000, true)]
	#[case(11001, true)]
	#[case(2, false)]
	fn test_duplicate_key_codes(#[case] code: i32, #[case] expected: bool) {
		assert_eq!(Error::server(code, "E11000").is_duplicate_key(), expected);
	}

	#[rstest]
	fn test_server_display_is_the_server_message() {
		let err = Error::server(26, "ns not found");
		assert_eq!(err.to_string(), "ns not found");
		assert_eq!(err.code(), Some(26));
	}
}
