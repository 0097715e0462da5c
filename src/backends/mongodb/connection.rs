//! MongoDB connection and driver implementation
//!
//! Every operation is issued as a database command through
//! [`mongodb::Database::run_command`], so the reply carries the same counters
//! and cursor ids the session handles expose. Cursors run their `find` and
//! `getMore` commands inside one explicit [`ClientSession`], as required by
//! servers that bind cursors to the session that created them.
//!
//! # Example
//!
//! ```rust,no_run
//! use mongo_resilient::Session;
//! use bson::doc;
//!
//! # async fn example() -> mongo_resilient::Result<()> {
//! let session = Session::connect("mongodb://localhost:27017/myapp?maxRetries=3").await?;
//! session.collection("users").insert(&[doc! { "name": "Alice" }]).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use mongodb::options::{ClientOptions, ReadPreference, SelectionCriteria};
use mongodb::{Client, ClientSession};
use parking_lot::RwLock;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::commands;
use super::cursor::MongoCursor;
use crate::config::SessionConfig;
use crate::driver::{Dialer, Driver, DriverCursor};
use crate::error::{Error, Result};
use crate::index::Index;
use crate::target::ConnectTarget;
use crate::types::{
	BuildInfo, BulkOp, BulkResult, Change, ChangeInfo, CollectionInfo, MapReduce, MapReduceInfo,
	Mode, Namespace, PipeOptions, QuerySpec,
};

/// Read preference used for reads in `mode`
///
/// `Monotonic` maps to `PrimaryPreferred`: reads never switch back to a
/// secondary after a write.
fn read_preference(mode: Mode) -> ReadPreference {
	match mode {
		Mode::Primary => ReadPreference::Primary,
		Mode::Monotonic | Mode::PrimaryPreferred => ReadPreference::PrimaryPreferred {
			options: Default::default(),
		},
		Mode::Secondary => ReadPreference::Secondary {
			options: Default::default(),
		},
		Mode::SecondaryPreferred => ReadPreference::SecondaryPreferred {
			options: Default::default(),
		},
		Mode::Eventual | Mode::Nearest => ReadPreference::Nearest {
			options: Default::default(),
		},
	}
}

/// Whether a pipeline writes its output to a collection
fn writes_output(pipeline: &[Document]) -> bool {
	pipeline
		.last()
		.is_some_and(|stage| stage.contains_key("$out") || stage.contains_key("$merge"))
}

struct MongoInner {
	/// Parsed options, reused to build a fresh client on refresh
	options: ClientOptions,
	client: RwLock<Client>,
	mode: RwLock<Mode>,
	socket_timeout: Duration,
	closed: AtomicBool,
}

/// Driver backed by the official MongoDB client
///
/// Refreshing replaces the pooled [`Client`] with a freshly built one; the old
/// pool is released once the last cursor using it is gone.
#[derive(Clone)]
pub struct MongoDriver {
	inner: Arc<MongoInner>,
}

impl MongoDriver {
	/// Build a client for `target` and check that a server answers
	pub async fn connect(target: &ConnectTarget, config: &SessionConfig) -> Result<Self> {
		let mut options = ClientOptions::parse(target.driver_uri())
			.await
			.map_err(|e| Error::Connection(format!("invalid connection string {}: {}", target, e)))?;
		options.connect_timeout = Some(config.connect_timeout);
		options.server_selection_timeout = Some(config.sync_timeout);
		if options.app_name.is_none() {
			options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
		}

		let client = Client::with_options(options.clone())
			.map_err(|e| Error::Connection(e.to_string()))?;

		let driver = Self {
			inner: Arc::new(MongoInner {
				options,
				client: RwLock::new(client),
				mode: RwLock::new(config.mode),
				socket_timeout: config.socket_timeout,
				closed: AtomicBool::new(false),
			}),
		};

		driver
			.command("admin", doc! { "ping": 1 }, true)
			.await
			.map_err(|e| Error::Connection(format!("no reachable servers at {}: {}", target, e)))?;

		tracing::debug!(uri = %target, "connected to MongoDB");
		Ok(driver)
	}

	pub(crate) fn client(&self) -> Client {
		self.inner.client.read().clone()
	}

	fn criteria(&self) -> SelectionCriteria {
		SelectionCriteria::ReadPreference(read_preference(self.mode()))
	}

	fn ensure_open(&self) -> Result<()> {
		if self.inner.closed.load(Ordering::Acquire) {
			return Err(Error::SessionClosed);
		}
		Ok(())
	}

	/// Start the explicit session a cursor runs its commands in
	pub(crate) async fn start_session(&self) -> Result<ClientSession> {
		self.ensure_open()?;
		Ok(self.client().start_session().await?)
	}

	/// Run `command` on `client`, bounded by the socket timeout
	///
	/// Reads honour the current consistency mode; everything else goes to the
	/// primary.
	pub(crate) async fn execute(
		&self,
		client: &Client,
		session: Option<&mut ClientSession>,
		database: &str,
		command: Document,
		read: bool,
	) -> Result<Document> {
		self.ensure_open()?;
		let db = client.database(database);
		let mut action = db.run_command(command);
		if read {
			action = action.selection_criteria(self.criteria());
		}
		let outcome = match session {
			Some(session) => tokio::time::timeout(self.inner.socket_timeout, action.session(session)).await,
			None => tokio::time::timeout(self.inner.socket_timeout, action).await,
		};
		match outcome {
			Ok(reply) => Ok(reply?),
			Err(_) => Err(Error::network(io::Error::new(
				io::ErrorKind::TimedOut,
				format!("i/o timeout after {:?}", self.inner.socket_timeout),
			))),
		}
	}

	async fn command(&self, database: &str, command: Document, read: bool) -> Result<Document> {
		let client = self.client();
		self.execute(&client, None, database, command, read).await
	}

	async fn write(&self, ns: &Namespace, command: Document) -> Result<Document> {
		let reply = self.command(&ns.database, command, false).await?;
		commands::check_write_errors(&reply)?;
		Ok(reply)
	}

	/// Run a cursor-opening command in a fresh session
	async fn open(
		&self,
		ns: &Namespace,
		command: Document,
		read: bool,
		batch_size: u32,
		tailing: Option<Option<Duration>>,
	) -> Result<Box<dyn DriverCursor>> {
		let mut session = self.start_session().await?;
		let client = session.client();
		let reply = self
			.execute(&client, Some(&mut session), &ns.database, command, read)
			.await?;
		let (cursor_id, first_batch) = commands::parse_cursor(&reply, "firstBatch")?;
		tracing::debug!(%ns, cursor_id, returned = first_batch.len(), "opened cursor");
		Ok(Box::new(MongoCursor::new(
			self.clone(),
			Some(session),
			ns.clone(),
			first_batch,
			cursor_id,
			batch_size,
			tailing,
		)))
	}
}

impl std::fmt::Debug for MongoDriver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MongoDriver")
			.field("hosts", &self.inner.options.hosts)
			.field("mode", &self.mode())
			.field("closed", &self.inner.closed.load(Ordering::Acquire))
			.finish()
	}
}

#[async_trait]
impl Driver for MongoDriver {
	async fn refresh(&self) -> Result<()> {
		self.ensure_open()?;
		let fresh = Client::with_options(self.inner.options.clone())?;
		let stale = std::mem::replace(&mut *self.inner.client.write(), fresh);
		drop(stale);
		tracing::debug!("replaced MongoDB client");
		Ok(())
	}

	async fn close(&self) {
		if self.inner.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		let client = self.client();
		if tokio::time::timeout(self.inner.socket_timeout, client.shutdown())
			.await
			.is_err()
		{
			tracing::warn!("timed out shutting down MongoDB client");
		}
	}

	fn set_mode(&self, mode: Mode) {
		*self.inner.mode.write() = mode;
	}

	fn mode(&self) -> Mode {
		*self.inner.mode.read()
	}

	async fn run_command(&self, database: &str, command: Document) -> Result<Document> {
		self.command(database, command, false).await
	}

	async fn build_info(&self) -> Result<BuildInfo> {
		let reply = self.command("admin", doc! { "buildInfo": 1 }, false).await?;
		Ok(commands::parse_build_info(&reply))
	}

	async fn insert(&self, ns: &Namespace, docs: &[Document]) -> Result<()> {
		let command = doc! {
			"insert": ns.collection.as_str(),
			"documents": docs.iter().cloned().map(Bson::Document).collect::<Vec<_>>(),
			"ordered": true,
		};
		self.write(ns, command).await.map(|_| ())
	}

	async fn count(&self, ns: &Namespace, spec: &QuerySpec) -> Result<u64> {
		let reply = self
			.command(&ns.database, commands::count(ns, spec)?, true)
			.await?;
		Ok(commands::get_number(&reply, "n").unwrap_or(0).max(0) as u64)
	}

	async fn create_collection(&self, ns: &Namespace, info: &CollectionInfo) -> Result<()> {
		self.command(&ns.database, commands::create(ns, info), false)
			.await
			.map(|_| ())
	}

	async fn drop_collection(&self, ns: &Namespace) -> Result<()> {
		self.command(&ns.database, doc! { "drop": ns.collection.as_str() }, false)
			.await
			.map(|_| ())
	}

	async fn create_index(&self, ns: &Namespace, index: &Index) -> Result<()> {
		let command = doc! {
			"createIndexes": ns.collection.as_str(),
			"indexes": [commands::index_spec(index)?],
		};
		self.command(&ns.database, command, false).await.map(|_| ())
	}

	async fn drop_index(&self, ns: &Namespace, name: &str) -> Result<()> {
		let command = doc! {
			"dropIndexes": ns.collection.as_str(),
			"index": name,
		};
		self.command(&ns.database, command, false).await.map(|_| ())
	}

	async fn indexes(&self, ns: &Namespace) -> Result<Vec<Index>> {
		let command = doc! { "listIndexes": ns.collection.as_str() };
		let mut cursor = self.open(ns, command, false, 0, None).await?;
		let mut indexes = Vec::new();
		while let Some(spec) = cursor.next().await {
			indexes.push(commands::parse_index(&spec)?);
		}
		if let Some(e) = cursor.take_err() {
			return Err(e);
		}
		Ok(indexes)
	}

	async fn remove(&self, ns: &Namespace, selector: &Document, multi: bool) -> Result<ChangeInfo> {
		let reply = self.write(ns, commands::delete(ns, selector, multi)).await?;
		commands::parse_delete(&reply)
	}

	async fn update(
		&self,
		ns: &Namespace,
		selector: &Document,
		update: &Document,
		multi: bool,
		upsert: bool,
	) -> Result<ChangeInfo> {
		let command = commands::update(ns, selector, update, multi, upsert);
		let reply = self.write(ns, command).await?;
		commands::parse_update(&reply)
	}

	async fn find_one(&self, ns: &Namespace, spec: &QuerySpec) -> Result<Option<Document>> {
		let mut single = spec.clone();
		single.limit = -1;
		let reply = self
			.command(&ns.database, commands::find(ns, &single)?, true)
			.await?;
		let (_, mut batch) = commands::parse_cursor(&reply, "firstBatch")?;
		Ok(if batch.is_empty() {
			None
		} else {
			Some(batch.swap_remove(0))
		})
	}

	async fn explain(&self, ns: &Namespace, spec: &QuerySpec) -> Result<Document> {
		let command = doc! {
			"explain": commands::find(ns, spec)?,
			"verbosity": "queryPlanner",
		};
		self.command(&ns.database, command, true).await
	}

	async fn find_and_modify(
		&self,
		ns: &Namespace,
		spec: &QuerySpec,
		change: &Change,
	) -> Result<(ChangeInfo, Option<Document>)> {
		let command = commands::find_and_modify(ns, spec, change)?;
		let reply = self.write(ns, command).await?;
		Ok(commands::parse_find_and_modify(&reply, change.remove))
	}

	async fn distinct(&self, ns: &Namespace, key: &str, spec: &QuerySpec) -> Result<Vec<Bson>> {
		let reply = self
			.command(&ns.database, commands::distinct(ns, key, spec), true)
			.await?;
		Ok(reply.get_array("values").cloned().unwrap_or_default())
	}

	async fn map_reduce(
		&self,
		ns: &Namespace,
		spec: &QuerySpec,
		job: &MapReduce,
	) -> Result<(MapReduceInfo, Vec<Document>)> {
		let inline = job.out.is_none();
		let reply = self
			.command(&ns.database, commands::map_reduce(ns, spec, job)?, inline)
			.await?;
		Ok(commands::parse_map_reduce(&reply))
	}

	async fn aggregate(
		&self,
		ns: &Namespace,
		pipeline: &[Document],
		options: &PipeOptions,
	) -> Result<Box<dyn DriverCursor>> {
		let command = commands::aggregate(ns, pipeline, options);
		self.open(ns, command, !writes_output(pipeline), options.batch_size, None)
			.await
	}

	async fn open_cursor(&self, ns: &Namespace, spec: &QuerySpec) -> Result<Box<dyn DriverCursor>> {
		let command = commands::find(ns, spec)?;
		let tailing = spec.tailable.then_some(spec.await_timeout);
		self.open(ns, command, true, spec.batch_size, tailing).await
	}

	fn resume_cursor(
		&self,
		ns: &Namespace,
		first_batch: Vec<Document>,
		cursor_id: i64,
		err: Option<Error>,
	) -> Box<dyn DriverCursor> {
		let mut cursor = MongoCursor::new(
			self.clone(),
			None,
			ns.clone(),
			first_batch,
			cursor_id,
			0,
			None,
		);
		cursor.set_pending_error(err);
		Box::new(cursor)
	}

	async fn bulk(&self, ns: &Namespace, ops: &[BulkOp], ordered: bool) -> Result<BulkResult> {
		let mut result = BulkResult::default();
		let mut first_error = None;

		for op in ops {
			let outcome = match op {
				BulkOp::Insert(doc) => self
					.insert(ns, std::slice::from_ref(doc))
					.await
					.map(|()| result.inserted += 1),
				BulkOp::Update {
					selector,
					update,
					multi,
					upsert,
				} => self
					.update(ns, selector, update, *multi, *upsert)
					.await
					.map(|info| {
						result.matched += info.matched;
						result.modified += info.updated;
						if info.upserted_id.is_some() {
							result.upserted += 1;
						}
					}),
				BulkOp::Remove { selector, multi } => self
					.remove(ns, selector, *multi)
					.await
					.map(|info| result.removed += info.removed),
			};

			if let Err(e) = outcome {
				if ordered {
					return Err(e);
				}
				first_error.get_or_insert(e);
			}
		}

		match first_error {
			Some(e) => Err(e),
			None => Ok(result),
		}
	}
}

/// Dials [`MongoDriver`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoDialer;

#[async_trait]
impl Dialer for MongoDialer {
	async fn dial(&self, target: &ConnectTarget, config: &SessionConfig) -> Result<Arc<dyn Driver>> {
		Ok(Arc::new(MongoDriver::connect(target, config).await?))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	fn test_read_preference() {
		assert!(matches!(read_preference(Mode::Primary), ReadPreference::Primary));
		assert!(matches!(
			read_preference(Mode::Eventual),
			ReadPreference::Nearest { .. }
		));
		assert!(matches!(
			read_preference(Mode::Monotonic),
			ReadPreference::PrimaryPreferred { .. }
		));
		assert!(matches!(
			read_preference(Mode::SecondaryPreferred),
			ReadPreference::SecondaryPreferred { .. }
		));
	}

	#[rstest]
	fn test_output_stages_run_on_primary() {
		assert!(writes_output(&[doc! { "$match": {} }, doc! { "$out": "copy" }]));
		assert!(!writes_output(&[doc! { "$match": {} }]));
		assert!(!writes_output(&[]));
	}
}
