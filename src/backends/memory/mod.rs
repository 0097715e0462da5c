//! In-memory driver
//!
//! [`MemoryDriver`] keeps documents per namespace inside the process and
//! answers every [`Driver`] call from them. It evaluates a small dialect of
//! filters (`$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`,
//! `$exists`, `$and`, `$or`, `$nor`, `$not`), updates (`$set`,
//! `$setOnInsert`, `$unset`, `$inc`, `$push` and replacements), sorts and
//! projections, and keeps server-side cursors addressed by id. It is a test
//! double: anything outside that dialect is rejected with the server's
//! error codes.
//!
//! Faults can be injected per operation to exercise the retry envelope:
//!
//! ```rust
//! use mongo_resilient::{Error, MemoryDriver, Op, Session};
//! use bson::doc;
//!
//! # async fn example() -> mongo_resilient::Result<()> {
//! let driver = MemoryDriver::new();
//! let session = Session::connect_with(&driver, "mem://localhost/app").await?;
//!
//! driver.fail_next(Op::Insert, Error::EndOfStream);
//! session.collection("people").insert(&[doc! { "name": "Ada" }]).await?;
//! assert_eq!(driver.op_count(Op::Insert), 2);
//! assert_eq!(driver.op_count(Op::Refresh), 1);
//! # Ok(())
//! # }
//! ```

mod cursor;
mod faults;
mod matcher;
mod store;

pub use faults::Op;

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use self::cursor::MemoryCursor;
use self::faults::Faults;
use self::store::Store;
use crate::config::SessionConfig;
use crate::driver::{Dialer, Driver, DriverCursor};
use crate::error::{Error, Result};
use crate::index::Index;
use crate::target::ConnectTarget;
use crate::types::{
	BuildInfo, BulkOp, BulkResult, Change, ChangeInfo, CollectionInfo, MapReduce, MapReduceInfo,
	Mode, Namespace, PipeOptions, QuerySpec,
};

const MAX_OBJECT_SIZE: i64 = 16 * 1024 * 1024;

#[derive(Debug, Default)]
struct MemoryInner {
	store: Mutex<Store>,
	faults: Mutex<Faults>,
	mode: RwLock<Mode>,
	closed: AtomicBool,
}

/// Process-local driver with fault injection
///
/// Clones share the same data and faults. The driver also acts as its own
/// [`Dialer`], so a session can be connected to it with
/// [`Session::connect_with`](crate::Session::connect_with).
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
	inner: Arc<MemoryInner>,
}

impl MemoryDriver {
	pub fn new() -> Self {
		Self::default()
	}

	/// Fail the next call of `op` with `err`
	pub fn fail_next(&self, op: Op, err: Error) {
		self.inner.faults.lock().queue(op, err);
	}

	/// Fail the next `times` calls of `op` with `err`
	pub fn fail_times(&self, op: Op, times: usize, err: Error) {
		let mut faults = self.inner.faults.lock();
		for _ in 0..times {
			faults.queue(op, err.clone());
		}
	}

	/// Drop every queued failure and restore the link
	pub fn clear_faults(&self) {
		let mut faults = self.inner.faults.lock();
		faults.clear_queue();
		faults.set_severed(false);
	}

	/// Fail every call with [`Error::EndOfStream`] until the next refresh
	pub fn sever(&self) {
		tracing::debug!("severing in-memory link");
		self.inner.faults.lock().set_severed(true);
	}

	pub fn is_severed(&self) -> bool {
		self.inner.faults.lock().severed()
	}

	/// Make dialing fail with [`Error::Connection`] carrying `message`
	pub fn refuse_dial(&self, message: impl Into<String>) {
		self.inner.faults.lock().set_refuse_dial(Some(message.into()));
	}

	pub fn accept_dial(&self) {
		self.inner.faults.lock().set_refuse_dial(None);
	}

	/// Time each refresh takes
	pub fn set_refresh_latency(&self, latency: Duration) {
		self.inner.faults.lock().refresh_latency = latency;
	}

	/// Number of calls of `op` so far, failed ones included
	pub fn op_count(&self, op: Op) -> usize {
		self.inner.faults.lock().calls(op)
	}

	pub fn reset_counts(&self) {
		self.inner.faults.lock().reset_calls();
	}

	/// Number of live server-side cursors
	pub fn open_cursors(&self) -> usize {
		self.inner.store.lock().open_cursors()
	}

	/// Whether the driver was closed and not dialed again since
	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::Acquire)
	}

	/// Stored documents of a collection, in insertion order
	pub fn documents(&self, database: &str, collection: &str) -> Vec<Document> {
		self.inner
			.store
			.lock()
			.documents(&Namespace::new(database, collection))
	}

	/// Record a call of `op` and fail it when a fault is pending
	pub(crate) fn enter(&self, op: Op) -> Result<()> {
		let fault = self.inner.faults.lock().enter(op);
		if self.is_closed() {
			return Err(Error::SessionClosed);
		}
		if let Err(e) = &fault {
			tracing::debug!(?op, error = %e, "injecting fault");
		}
		fault
	}

	fn store(&self) -> parking_lot::MutexGuard<'_, Store> {
		self.inner.store.lock()
	}

	fn build_info_document() -> Document {
		doc! {
			"version": "7.0.0",
			"versionArray": [7, 0, 0, 0],
			"gitVersion": "memory",
			"sysInfo": "in-memory driver",
			"bits": 64,
			"debug": false,
			"maxBsonObjectSize": MAX_OBJECT_SIZE,
			"ok": 1.0,
		}
	}
}

#[async_trait]
impl Driver for MemoryDriver {
	async fn refresh(&self) -> Result<()> {
		let (fault, latency) = {
			let mut faults = self.inner.faults.lock();
			(faults.enter(Op::Refresh), faults.refresh_latency)
		};
		if !latency.is_zero() {
			tokio::time::sleep(latency).await;
		}
		if self.is_closed() {
			return Err(Error::SessionClosed);
		}
		fault?;
		self.inner.faults.lock().set_severed(false);
		Ok(())
	}

	async fn close(&self) {
		self.inner.closed.store(true, Ordering::Release);
	}

	fn set_mode(&self, mode: Mode) {
		*self.inner.mode.write() = mode;
	}

	fn mode(&self) -> Mode {
		*self.inner.mode.read()
	}

	async fn run_command(&self, database: &str, command: Document) -> Result<Document> {
		self.enter(Op::Command)?;
		let Some((name, arg)) = command.iter().next() else {
			return Err(Error::server(59, "no command given"));
		};

		match name.as_str() {
			"ping" => Ok(doc! { "ok": 1.0 }),
			"buildInfo" | "buildinfo" => Ok(Self::build_info_document()),
			"hello" | "isMaster" | "ismaster" => Ok(doc! {
				"isWritablePrimary": true,
				"ismaster": true,
				"maxBsonObjectSize": MAX_OBJECT_SIZE,
				"ok": 1.0,
			}),
			"count" => {
				let Bson::String(collection) = arg else {
					return Err(Error::server(2, "collection name has invalid type"));
				};
				let filter = command.get_document("query").cloned().unwrap_or_default();
				let ns = Namespace::new(database, collection.as_str());
				let n = self.store().count(&ns, &QuerySpec::new(filter))?;
				Ok(doc! { "n": n as i64, "ok": 1.0 })
			}
			other => Err(Error::server(59, format!("no such command: '{}'", other))),
		}
	}

	async fn build_info(&self) -> Result<BuildInfo> {
		self.enter(Op::BuildInfo)?;
		Ok(BuildInfo {
			version: "7.0.0".to_string(),
			version_array: vec![7, 0, 0, 0],
			git_version: "memory".to_string(),
			sys_info: "in-memory driver".to_string(),
			bits: 64,
			debug: false,
			max_object_size: MAX_OBJECT_SIZE,
		})
	}

	async fn insert(&self, ns: &Namespace, docs: &[Document]) -> Result<()> {
		self.enter(Op::Insert)?;
		self.store().insert(ns, docs)
	}

	async fn count(&self, ns: &Namespace, spec: &QuerySpec) -> Result<u64> {
		self.enter(Op::Count)?;
		self.store().count(ns, spec)
	}

	async fn create_collection(&self, ns: &Namespace, info: &CollectionInfo) -> Result<()> {
		self.enter(Op::Create)?;
		self.store().create_collection(ns, info)
	}

	async fn drop_collection(&self, ns: &Namespace) -> Result<()> {
		self.enter(Op::Drop)?;
		self.store().drop_collection(ns)
	}

	async fn create_index(&self, ns: &Namespace, index: &Index) -> Result<()> {
		self.enter(Op::CreateIndex)?;
		self.store().create_index(ns, index)
	}

	async fn drop_index(&self, ns: &Namespace, name: &str) -> Result<()> {
		self.enter(Op::DropIndex)?;
		self.store().drop_index(ns, name)
	}

	async fn indexes(&self, ns: &Namespace) -> Result<Vec<Index>> {
		self.enter(Op::ListIndexes)?;
		self.store().indexes(ns)
	}

	async fn remove(&self, ns: &Namespace, selector: &Document, multi: bool) -> Result<ChangeInfo> {
		self.enter(Op::Remove)?;
		self.store().remove(ns, selector, multi)
	}

	async fn update(
		&self,
		ns: &Namespace,
		selector: &Document,
		update: &Document,
		multi: bool,
		upsert: bool,
	) -> Result<ChangeInfo> {
		self.enter(Op::Update)?;
		self.store().update(ns, selector, update, multi, upsert)
	}

	async fn find_one(&self, ns: &Namespace, spec: &QuerySpec) -> Result<Option<Document>> {
		self.enter(Op::Find)?;
		self.store().find_one(ns, spec)
	}

	async fn explain(&self, ns: &Namespace, spec: &QuerySpec) -> Result<Document> {
		self.enter(Op::Explain)?;
		self.store().explain(ns, spec)
	}

	async fn find_and_modify(
		&self,
		ns: &Namespace,
		spec: &QuerySpec,
		change: &Change,
	) -> Result<(ChangeInfo, Option<Document>)> {
		self.enter(Op::FindAndModify)?;
		self.store().find_and_modify(ns, spec, change)
	}

	async fn distinct(&self, ns: &Namespace, key: &str, spec: &QuerySpec) -> Result<Vec<Bson>> {
		self.enter(Op::Distinct)?;
		self.store().distinct(ns, key, spec)
	}

	async fn map_reduce(
		&self,
		_ns: &Namespace,
		_spec: &QuerySpec,
		_job: &MapReduce,
	) -> Result<(MapReduceInfo, Vec<Document>)> {
		self.enter(Op::MapReduce)?;
		Err(Error::server(
			115,
			"mapReduce needs a JavaScript engine, which the in-memory driver does not have",
		))
	}

	async fn aggregate(
		&self,
		ns: &Namespace,
		pipeline: &[Document],
		options: &PipeOptions,
	) -> Result<Box<dyn DriverCursor>> {
		self.enter(Op::Aggregate)?;
		let batch = self.store().aggregate(ns, pipeline, options)?;
		Ok(Box::new(MemoryCursor::new(self.clone(), ns.clone(), batch, None)))
	}

	async fn open_cursor(&self, ns: &Namespace, spec: &QuerySpec) -> Result<Box<dyn DriverCursor>> {
		self.enter(Op::Find)?;
		let batch = self.store().open(ns, spec)?;
		tracing::debug!(%ns, cursor_id = batch.cursor_id, returned = batch.docs.len(), "opened cursor");
		Ok(Box::new(MemoryCursor::new(
			self.clone(),
			ns.clone(),
			batch,
			spec.await_timeout,
		)))
	}

	fn resume_cursor(
		&self,
		ns: &Namespace,
		first_batch: Vec<Document>,
		cursor_id: i64,
		err: Option<Error>,
	) -> Box<dyn DriverCursor> {
		Box::new(MemoryCursor::resumed(
			self.clone(),
			ns.clone(),
			first_batch,
			cursor_id,
			err,
		))
	}

	async fn bulk(&self, ns: &Namespace, ops: &[BulkOp], ordered: bool) -> Result<BulkResult> {
		self.enter(Op::Bulk)?;
		self.store().bulk(ns, ops, ordered)
	}
}

#[async_trait]
impl Dialer for MemoryDriver {
	async fn dial(&self, target: &ConnectTarget, config: &SessionConfig) -> Result<Arc<dyn Driver>> {
		if let Some(message) = self.inner.faults.lock().refuse_dial() {
			return Err(Error::Connection(format!(
				"no reachable servers at {}: {}",
				target, message
			)));
		}
		self.inner.closed.store(false, Ordering::Release);
		self.set_mode(config.mode);
		tracing::debug!(uri = %target, "dialed in-memory driver");
		Ok(Arc::new(self.clone()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	fn ns() -> Namespace {
		Namespace::new("app", "people")
	}

	#[rstest]
	#[tokio::test]
	async fn test_severed_link_heals_on_refresh() {
		let driver = MemoryDriver::new();
		driver.sever();

		let err = driver.count(&ns(), &QuerySpec::default()).await.unwrap_err();
		assert!(matches!(err, Error::EndOfStream));

		driver.refresh().await.unwrap();
		assert!(!driver.is_severed());
		assert_eq!(driver.count(&ns(), &QuerySpec::default()).await.unwrap(), 0);
	}

	#[rstest]
	#[tokio::test]
	async fn test_closed_driver_rejects_calls() {
		let driver = MemoryDriver::new();
		driver.close().await;

		let err = driver.insert(&ns(), &[doc! { "a": 1 }]).await.unwrap_err();
		assert!(matches!(err, Error::SessionClosed));
		assert!(driver.documents("app", "people").is_empty());
	}

	#[rstest]
	#[tokio::test]
	async fn test_run_command() {
		let driver = MemoryDriver::new();
		driver
			.insert(&ns(), &[doc! { "a": 1 }, doc! { "a": 2 }])
			.await
			.unwrap();

		let reply = driver
			.run_command("app", doc! { "count": "people", "query": { "a": 2 } })
			.await
			.unwrap();
		assert_eq!(reply.get_i64("n").unwrap(), 1);

		let err = driver
			.run_command("app", doc! { "shutdown": 1 })
			.await
			.unwrap_err();
		assert_eq!(err.code(), Some(59));
	}

	#[rstest]
	#[tokio::test]
	async fn test_cursor_close_kills_server_cursor() {
		let driver = MemoryDriver::new();
		let docs: Vec<Document> = (0..5).map(|i| doc! { "i": i }).collect();
		driver.insert(&ns(), &docs).await.unwrap();

		let spec = QuerySpec {
			batch_size: 2,
			..QuerySpec::default()
		};
		let mut cursor = driver.open_cursor(&ns(), &spec).await.unwrap();
		assert!(cursor.next().await.is_some());
		assert_eq!(driver.open_cursors(), 1);

		cursor.close().await.unwrap();
		assert_eq!(driver.open_cursors(), 0);
		assert_eq!(cursor.cursor_id(), 0);
		assert!(cursor.next().await.is_none());
	}

	#[rstest]
	#[tokio::test]
	async fn test_dial_refusal() {
		let driver = MemoryDriver::new();
		driver.refuse_dial("connection refused");
		let target = ConnectTarget::parse("mem://localhost/app").unwrap();

		let err = driver
			.dial(&target, &SessionConfig::default())
			.await
			.err()
			.unwrap();
		assert!(matches!(err, Error::Connection(ref m) if m.contains("connection refused")));

		driver.accept_dial();
		assert!(driver.dial(&target, &SessionConfig::default()).await.is_ok());
	}
}
