//! Cursor over a server-side cursor of the in-memory driver

use async_trait::async_trait;
use bson::Document;
use std::collections::VecDeque;
use std::time::Duration;

use super::MemoryDriver;
use super::faults::Op;
use super::store::Batch;
use crate::driver::DriverCursor;
use crate::error::{Error, Result};
use crate::types::Namespace;

/// Delay between polls of a tailable cursor waiting for new documents
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct MemoryCursor {
	driver: MemoryDriver,
	ns: Namespace,
	buffer: VecDeque<Document>,
	cursor_id: i64,
	tailable: bool,
	await_timeout: Option<Duration>,
	err: Option<Error>,
	timed_out: bool,
}

impl MemoryCursor {
	pub(crate) fn new(
		driver: MemoryDriver,
		ns: Namespace,
		batch: Batch,
		await_timeout: Option<Duration>,
	) -> Self {
		Self {
			driver,
			ns,
			buffer: batch.docs.into(),
			cursor_id: batch.cursor_id,
			tailable: batch.tailable,
			await_timeout,
			err: None,
			timed_out: false,
		}
	}

	pub(crate) fn resumed(
		driver: MemoryDriver,
		ns: Namespace,
		first_batch: Vec<Document>,
		cursor_id: i64,
		err: Option<Error>,
	) -> Self {
		Self {
			driver,
			ns,
			buffer: first_batch.into(),
			cursor_id,
			tailable: false,
			await_timeout: None,
			err,
			timed_out: false,
		}
	}

	/// One getMore round trip; `None` when a tailable cursor has nothing new
	fn get_more(&self) -> Result<Option<Batch>> {
		self.driver.enter(Op::GetMore)?;
		self.driver.inner.store.lock().get_more(self.cursor_id)
	}

	/// Refill the buffer, waiting for new documents on tailable cursors
	async fn fetch(&mut self) -> Result<()> {
		let deadline = self
			.await_timeout
			.map(|timeout| tokio::time::Instant::now() + timeout);

		loop {
			let polled = self.get_more()?;
			match polled {
				Some(batch) => {
					self.cursor_id = batch.cursor_id;
					self.buffer.extend(batch.docs);
					if !self.buffer.is_empty() || self.cursor_id == 0 {
						return Ok(());
					}
				}
				None => {
					if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
						self.timed_out = true;
						return Ok(());
					}
				}
			}
			tokio::time::sleep(TAIL_POLL_INTERVAL).await;
		}
	}
}

#[async_trait]
impl DriverCursor for MemoryCursor {
	async fn next(&mut self) -> Option<Document> {
		self.timed_out = false;
		if let Some(doc) = self.buffer.pop_front() {
			return Some(doc);
		}
		if self.err.is_some() || self.cursor_id == 0 {
			return None;
		}
		if let Err(e) = self.fetch().await {
			tracing::debug!(ns = %self.ns, cursor_id = self.cursor_id, error = %e, "getMore failed");
			self.err = Some(e);
			return None;
		}
		self.buffer.pop_front()
	}

	fn take_err(&mut self) -> Option<Error> {
		// A failure attached to a resumed batch surfaces once the batch is consumed
		if self.buffer.is_empty() {
			self.err.take()
		} else {
			None
		}
	}

	async fn done(&mut self) -> bool {
		if !self.buffer.is_empty() {
			return false;
		}
		if self.tailable {
			return self.cursor_id == 0;
		}
		self.cursor_id == 0 && self.err.is_none()
	}

	fn timeout(&self) -> bool {
		self.timed_out
	}

	async fn close(&mut self) -> Result<()> {
		self.buffer.clear();
		if self.cursor_id == 0 {
			return Ok(());
		}
		self.driver.enter(Op::KillCursors)?;
		self.driver.inner.store.lock().kill_cursor(self.cursor_id);
		self.cursor_id = 0;
		Ok(())
	}

	fn cursor_id(&self) -> i64 {
		self.cursor_id
	}
}
