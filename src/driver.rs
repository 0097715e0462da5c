//! Driver seam
//!
//! The session handles never talk to a cluster directly. Every round trip goes
//! through a [`Driver`], which owns the connection pool, and every server-side
//! cursor through a [`DriverCursor`]. A [`Dialer`] produces the driver during
//! connect.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryDriver`](crate::backends::memory::MemoryDriver), an embedded
//!   process-local collaborator with fault injection
//! - `MongoDriver` (feature `mongodb`), backed by the official driver

use async_trait::async_trait;
use bson::{Bson, Document};
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::target::ConnectTarget;
use crate::types::{
	BuildInfo, BulkOp, BulkResult, Change, ChangeInfo, CollectionInfo, MapReduce, MapReduceInfo,
	Mode, Namespace, PipeOptions, QuerySpec,
};

/// Underlying driver session shared by every handle derived from a session
///
/// Implementations must be safe to call concurrently. A failed call must leave
/// the driver usable after [`Driver::refresh`].
#[async_trait]
pub trait Driver: Send + Sync + 'static {
	/// Discard pooled connections and establish fresh ones
	async fn refresh(&self) -> Result<()>;

	/// Release the connection pool; later calls fail
	async fn close(&self);

	/// Change the consistency mode used by later operations
	fn set_mode(&self, mode: Mode);

	/// Current consistency mode
	fn mode(&self) -> Mode;

	/// Run a database command and return the raw reply
	async fn run_command(&self, database: &str, command: Document) -> Result<Document>;

	/// Server build information
	async fn build_info(&self) -> Result<BuildInfo>;

	/// Insert documents in order, stopping at the first failure
	async fn insert(&self, ns: &Namespace, docs: &[Document]) -> Result<()>;

	/// Number of documents matching the query filter, honouring skip and limit
	async fn count(&self, ns: &Namespace, spec: &QuerySpec) -> Result<u64>;

	async fn create_collection(&self, ns: &Namespace, info: &CollectionInfo) -> Result<()>;

	async fn drop_collection(&self, ns: &Namespace) -> Result<()>;

	/// Create an index unless an identical one exists
	async fn create_index(&self, ns: &Namespace, index: &Index) -> Result<()>;

	async fn drop_index(&self, ns: &Namespace, name: &str) -> Result<()>;

	async fn indexes(&self, ns: &Namespace) -> Result<Vec<Index>>;

	/// Remove the first matching document, or every one when `multi` is set
	async fn remove(&self, ns: &Namespace, selector: &Document, multi: bool) -> Result<ChangeInfo>;

	/// Apply `update` to the first matching document, or every one when
	/// `multi` is set. With `upsert`, insert a document when nothing matches.
	async fn update(
		&self,
		ns: &Namespace,
		selector: &Document,
		update: &Document,
		multi: bool,
		upsert: bool,
	) -> Result<ChangeInfo>;

	/// First document matching the query
	async fn find_one(&self, ns: &Namespace, spec: &QuerySpec) -> Result<Option<Document>>;

	/// Query plan of the query
	async fn explain(&self, ns: &Namespace, spec: &QuerySpec) -> Result<Document>;

	/// Atomically modify the first document matching the query
	async fn find_and_modify(
		&self,
		ns: &Namespace,
		spec: &QuerySpec,
		change: &Change,
	) -> Result<(ChangeInfo, Option<Document>)>;

	async fn distinct(&self, ns: &Namespace, key: &str, spec: &QuerySpec) -> Result<Vec<Bson>>;

	async fn map_reduce(
		&self,
		ns: &Namespace,
		spec: &QuerySpec,
		job: &MapReduce,
	) -> Result<(MapReduceInfo, Vec<Document>)>;

	/// Run an aggregation pipeline and open a cursor over its output
	async fn aggregate(
		&self,
		ns: &Namespace,
		pipeline: &[Document],
		options: &PipeOptions,
	) -> Result<Box<dyn DriverCursor>>;

	/// Run the query and open a cursor over its result
	async fn open_cursor(&self, ns: &Namespace, spec: &QuerySpec) -> Result<Box<dyn DriverCursor>>;

	/// Wrap an already fetched batch and a live server cursor id
	///
	/// `err` is reported once the batch is consumed.
	fn resume_cursor(
		&self,
		ns: &Namespace,
		first_batch: Vec<Document>,
		cursor_id: i64,
		err: Option<Error>,
	) -> Box<dyn DriverCursor>;

	/// Execute a batch of writes
	async fn bulk(&self, ns: &Namespace, ops: &[BulkOp], ordered: bool) -> Result<BulkResult>;
}

/// Server-side cursor state: batch buffer and cursor id
#[async_trait]
pub trait DriverCursor: Send + 'static {
	/// Next document, fetching another batch when the buffer is drained
	///
	/// Returns `None` at the end of the result, on a tailable cursor timeout,
	/// or after a failure that [`DriverCursor::take_err`] reports.
	async fn next(&mut self) -> Option<Document>;

	/// Take the failure recorded by the last `next`, if any
	///
	/// Iteration may be attempted again afterwards, reusing the same server
	/// cursor.
	fn take_err(&mut self) -> Option<Error>;

	/// Whether no more documents can be returned
	async fn done(&mut self) -> bool;

	/// Whether the last `None` was a tailable cursor timing out
	fn timeout(&self) -> bool;

	/// Kill the server-side cursor, if still alive
	async fn close(&mut self) -> Result<()>;

	/// Server cursor id; 0 once the server side is exhausted or killed
	fn cursor_id(&self) -> i64;
}

/// Produces a driver for a parsed connect target
#[async_trait]
pub trait Dialer: Send + Sync {
	async fn dial(&self, target: &ConnectTarget, config: &SessionConfig) -> Result<Arc<dyn Driver>>;
}
