//! Server-side cursor driven by `getMore` and `killCursors` commands

use async_trait::async_trait;
use bson::Document;
use mongodb::ClientSession;
use std::collections::VecDeque;
use std::time::Duration;

use super::commands;
use super::connection::MongoDriver;
use crate::driver::DriverCursor;
use crate::error::{Error, Result};
use crate::types::Namespace;

/// Longest single `getMore` wait of a tailable cursor
const MAX_AWAIT: Duration = Duration::from_secs(1);

pub(crate) struct MongoCursor {
	driver: MongoDriver,
	/// Session that opened the cursor; resumed cursors have none
	session: Option<ClientSession>,
	ns: Namespace,
	buffer: VecDeque<Document>,
	cursor_id: i64,
	batch_size: u32,
	/// `Some(timeout)` for tailable cursors
	tailing: Option<Option<Duration>>,
	err: Option<Error>,
	timed_out: bool,
}

impl MongoCursor {
	pub(crate) fn new(
		driver: MongoDriver,
		session: Option<ClientSession>,
		ns: Namespace,
		first_batch: Vec<Document>,
		cursor_id: i64,
		batch_size: u32,
		tailing: Option<Option<Duration>>,
	) -> Self {
		Self {
			driver,
			session,
			ns,
			buffer: first_batch.into(),
			cursor_id,
			batch_size,
			tailing,
			err: None,
			timed_out: false,
		}
	}

	/// Report `err` once the first batch is consumed
	pub(crate) fn set_pending_error(&mut self, err: Option<Error>) {
		self.err = err;
	}

	async fn command(&mut self, command: Document) -> Result<Document> {
		match self.session.as_mut() {
			Some(session) => {
				let client = session.client();
				self.driver
					.execute(&client, Some(session), &self.ns.database, command, true)
					.await
			}
			None => {
				let client = self.driver.client();
				self.driver
					.execute(&client, None, &self.ns.database, command, true)
					.await
			}
		}
	}

	async fn fetch(&mut self) -> Result<()> {
		let deadline = match self.tailing {
			Some(Some(timeout)) => Some(tokio::time::Instant::now() + timeout),
			_ => None,
		};

		loop {
			let max_await = self.tailing.map(|_| match deadline {
				Some(deadline) => deadline
					.saturating_duration_since(tokio::time::Instant::now())
					.clamp(Duration::from_millis(1), MAX_AWAIT),
				None => MAX_AWAIT,
			});
			let command = commands::get_more(&self.ns, self.cursor_id, self.batch_size, max_await);
			let reply = self.command(command).await?;
			let (cursor_id, batch) = commands::parse_cursor(&reply, "nextBatch")?;
			self.cursor_id = cursor_id;
			self.buffer.extend(batch);

			if !self.buffer.is_empty() || self.cursor_id == 0 {
				return Ok(());
			}
			if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
				self.timed_out = true;
				return Ok(());
			}
		}
	}
}

#[async_trait]
impl DriverCursor for MongoCursor {
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
		if self.tailing.is_some() {
			return self.cursor_id == 0;
		}
		if self.cursor_id == 0 {
			return self.err.is_none();
		}
		// A live cursor may still come back empty; find out
		if let Err(e) = self.fetch().await {
			self.err = Some(e);
			return false;
		}
		self.buffer.is_empty() && self.cursor_id == 0
	}

	fn timeout(&self) -> bool {
		self.timed_out
	}

	async fn close(&mut self) -> Result<()> {
		self.buffer.clear();
		if self.cursor_id == 0 {
			return Ok(());
		}
		let command = commands::kill_cursors(&self.ns, self.cursor_id);
		self.command(command).await?;
		self.cursor_id = 0;
		Ok(())
	}

	fn cursor_id(&self) -> i64 {
		self.cursor_id
	}
}
