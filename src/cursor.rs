//! Cursor handle
//!
//! ```text
//!            next() -> None           close()
//!   Open ─────────────────> Exhausted ───────> Closed
//!     │ failure                                  ^
//!     └──────> Errored ──────────────────────────┘
//! ```
//!
//! `next` is a single attempt; failures are recorded and reported by
//! [`Cursor::err`]. `close` and `all` run in the retry envelope. Dropping an
//! unclosed cursor kills its server-side cursor in the background.

use bson::Document;
use serde::de::DeserializeOwned;

use crate::driver::DriverCursor;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::types::{Namespace, PipeOptions, QuerySpec};

/// Lifecycle state of a cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
	/// The server cursor may still return documents
	Open,
	/// Every document was returned
	Exhausted,
	/// Closed explicitly or after `all`
	Closed,
	/// A failure was recorded; `next` returns `None`
	Errored,
}

/// What to run again when a drain has to start over
#[derive(Debug, Clone)]
pub(crate) enum CursorOrigin {
	Find(QuerySpec),
	Aggregate {
		pipeline: Vec<Document>,
		options: PipeOptions,
	},
	/// Built from a raw batch; only the same server cursor can be resumed
	Resumed,
}

/// Iterator over a query or pipeline result
pub struct Cursor {
	session: Session,
	ns: Namespace,
	origin: CursorOrigin,
	inner: Option<Box<dyn DriverCursor>>,
	state: CursorState,
	err: Option<Error>,
	/// Outcome of the first `close`, returned by every later call
	closed: Option<Result<()>>,
}

impl Cursor {
	pub(crate) fn lazy(
		session: Session,
		ns: Namespace,
		origin: CursorOrigin,
		invalid: Option<Error>,
	) -> Self {
		let state = if invalid.is_some() {
			CursorState::Errored
		} else {
			CursorState::Open
		};
		Self {
			session,
			ns,
			origin,
			inner: None,
			state,
			err: invalid,
			closed: None,
		}
	}

	pub(crate) fn resumed(session: Session, ns: Namespace, inner: Box<dyn DriverCursor>) -> Self {
		Self {
			session,
			ns,
			origin: CursorOrigin::Resumed,
			inner: Some(inner),
			state: CursorState::Open,
			err: None,
			closed: None,
		}
	}

	pub fn state(&self) -> CursorState {
		self.state
	}

	/// Server cursor id; 0 when not opened yet or no longer alive
	pub fn cursor_id(&self) -> i64 {
		self.inner.as_ref().map_or(0, |inner| inner.cursor_id())
	}

	async fn open(&mut self) -> Result<&mut Box<dyn DriverCursor>> {
		if self.inner.is_none() {
			self.session.ensure_open()?;
			let driver = self.session.driver();
			let inner = match &self.origin {
				CursorOrigin::Find(spec) => driver.open_cursor(&self.ns, spec).await?,
				CursorOrigin::Aggregate { pipeline, options } => {
					driver.aggregate(&self.ns, pipeline, options).await?
				}
				CursorOrigin::Resumed => {
					return Err(Error::Driver("resumed cursor has no server cursor".to_string()));
				}
			};
			self.inner = Some(inner);
		}
		self.inner
			.as_mut()
			.ok_or_else(|| Error::Driver("cursor not open".to_string()))
	}

	fn fail(&mut self, err: Error) {
		self.state = CursorState::Errored;
		self.err = Some(err);
	}

	async fn next_document(&mut self) -> Option<Document> {
		if self.state != CursorState::Open {
			return None;
		}
		if self.session.is_closed() {
			self.fail(Error::SessionClosed);
			return None;
		}

		let inner = match self.open().await {
			Ok(inner) => inner,
			Err(e) => {
				self.fail(e);
				return None;
			}
		};

		match inner.next().await {
			Some(doc) => Some(doc),
			None => {
				if let Some(e) = inner.take_err() {
					self.fail(e);
				} else if !inner.timeout() {
					self.state = CursorState::Exhausted;
				}
				None
			}
		}
	}

	/// Next document, or `None` at the end, on failure, or on a tailable
	/// cursor timeout
	///
	/// Failures, including documents that do not decode into `T`, are
	/// reported by [`Cursor::err`].
	pub async fn next<T: DeserializeOwned>(&mut self) -> Option<T> {
		let doc = self.next_document().await?;
		match bson::deserialize_from_document(doc) {
			Ok(value) => Some(value),
			Err(e) => {
				self.fail(e.into());
				None
			}
		}
	}

	/// Failure recorded while iterating, if any
	pub fn err(&self) -> Option<&Error> {
		self.err.as_ref()
	}

	/// Whether no more documents can be returned
	///
	/// May fetch the next batch to tell a drained buffer from the end of the
	/// result. Tailable cursors are only done once the server cursor is gone.
	pub async fn done(&mut self) -> bool {
		if self.state != CursorState::Open {
			return true;
		}
		match self.open().await {
			Ok(inner) => inner.done().await,
			Err(e) => {
				self.fail(e);
				true
			}
		}
	}

	/// Whether the last `None` from a tailable cursor was a timeout
	///
	/// Iteration may resume after a timeout.
	pub fn timeout(&self) -> bool {
		self.state == CursorState::Open && self.inner.as_ref().is_some_and(|inner| inner.timeout())
	}

	/// Kill the server cursor
	///
	/// Retried on transient failures. The first outcome is kept: later calls
	/// return it again without touching the server.
	pub async fn close(&mut self) -> Result<()> {
		if let Some(result) = &self.closed {
			return result.clone();
		}

		let result = match self.inner.as_mut() {
			None => Ok(()),
			Some(inner) => {
				let mut attempts = self.session.attempts("cursor.close");
				loop {
					let result = inner.close().await;
					if !attempts.retry_after(&result).await {
						break result;
					}
				}
			}
		};

		self.state = CursorState::Closed;
		if let Some(inner) = self.inner.take() {
			if result.is_err() {
				kill_in_background(inner);
			}
		}
		self.closed = Some(result.clone());
		result
	}

	/// Drain every remaining document and close the cursor
	pub async fn all<T: DeserializeOwned>(&mut self) -> Result<Vec<T>> {
		let mut out = Vec::new();
		self.all_into(&mut out).await?;
		Ok(out)
	}

	/// Like [`Cursor::all`], into a caller-provided vector
	///
	/// `out` is cleared first. On a transient failure the session refreshes
	/// and the query or pipeline behind the cursor runs again from the start.
	/// Resumed cursors continue with the same server cursor instead.
	pub async fn all_into<T: DeserializeOwned>(&mut self, out: &mut Vec<T>) -> Result<()> {
		out.clear();
		if let Some(e) = &self.err {
			return Err(e.clone());
		}
		self.session.ensure_open()?;

		let session = self.session.clone();
		let mut attempts = session.attempts("cursor.all");
		loop {
			let result = self.drain(out).await;
			if !attempts.retry_after(&result).await {
				if result.is_err() {
					return result;
				}
				break;
			}
			self.restart(out);
		}

		self.close().await
	}

	async fn drain<T: DeserializeOwned>(&mut self, out: &mut Vec<T>) -> Result<()> {
		while let Some(doc) = self.next_document().await {
			out.push(bson::deserialize_from_document(doc)?);
		}
		match &self.err {
			Some(e) => Err(e.clone()),
			None => Ok(()),
		}
	}

	/// Prepare for another drain after a transient failure
	fn restart<T>(&mut self, out: &mut Vec<T>) {
		self.err = None;
		self.state = CursorState::Open;
		match self.origin {
			CursorOrigin::Resumed => {}
			CursorOrigin::Find(_) | CursorOrigin::Aggregate { .. } => {
				out.clear();
				if let Some(stale) = self.inner.take() {
					kill_in_background(stale);
				}
			}
		}
	}
}

/// Best-effort kill of a server cursor nobody reads anymore
fn kill_in_background(mut inner: Box<dyn DriverCursor>) {
	if inner.cursor_id() == 0 {
		return;
	}
	match tokio::runtime::Handle::try_current() {
		Ok(handle) => {
			handle.spawn(async move {
				if let Err(e) = inner.close().await {
					tracing::debug!(error = %e, "failed to kill abandoned cursor");
				}
			});
		}
		Err(_) => {
			tracing::debug!(
				cursor_id = inner.cursor_id(),
				"no runtime available, leaving server cursor to expire"
			);
		}
	}
}

impl Drop for Cursor {
	fn drop(&mut self) {
		if self.closed.is_none() {
			if let Some(inner) = self.inner.take() {
				kill_in_background(inner);
			}
		}
	}
}

impl std::fmt::Debug for Cursor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Cursor")
			.field("ns", &self.ns)
			.field("state", &self.state)
			.field("cursor_id", &self.cursor_id())
			.field("err", &self.err)
			.finish()
	}
}
