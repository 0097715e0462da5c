//! Query handle
//!
//! Builder methods only change the accumulated [`QuerySpec`]. Terminal
//! operations `one`, `explain`, `apply` and `all` run in the retry envelope;
//! `count`, `distinct` and `map_reduce` are single attempts.

use bson::{Bson, Document};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::collection::{Collection, to_document};
use crate::cursor::{Cursor, CursorOrigin};
use crate::error::{Error, Result};
use crate::types::{Change, ChangeInfo, MapReduce, MapReduceInfo, QuerySpec};

/// Query over a collection
///
/// # Example
///
/// ```rust
/// use mongo_resilient::{MemoryDriver, Session};
/// use bson::{Document, doc};
///
/// # async fn example() -> mongo_resilient::Result<()> {
/// let session = Session::connect_with(&MemoryDriver::new(), "mem://localhost/app").await?;
/// let people = session.collection("people");
/// people.insert(&[doc! { "name": "Ada", "age": 36 }, doc! { "name": "Alan", "age": 41 }]).await?;
///
/// let oldest: Document = people
///     .find(&doc! { "age": { "$gt": 30 } })
///     .sort(["-age"])
///     .one()
///     .await?;
/// assert_eq!(oldest.get_str("name").unwrap(), "Alan");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Query {
	collection: Collection,
	spec: QuerySpec,
	/// Deferred builder failure, reported by the terminal operation
	invalid: Option<Error>,
}

impl Query {
	pub(crate) fn new(collection: Collection, filter: Document) -> Self {
		Self {
			collection,
			spec: QuerySpec::new(filter),
			invalid: None,
		}
	}

	pub(crate) fn failed(collection: Collection, err: Error) -> Self {
		Self {
			collection,
			spec: QuerySpec::default(),
			invalid: Some(err),
		}
	}

	/// Accumulated query state
	pub fn spec(&self) -> &QuerySpec {
		&self.spec
	}

	/// Documents per batch
	pub fn batch(mut self, n: u32) -> Self {
		self.spec.batch_size = n;
		self
	}

	/// Fraction of the batch left unread when the next batch is requested
	///
	/// Stored and forwarded; batch scheduling belongs to the driver.
	pub fn prefetch(mut self, fraction: f64) -> Self {
		self.spec.prefetch = fraction;
		self
	}

	pub fn skip(mut self, n: u64) -> Self {
		self.spec.skip = n;
		self
	}

	/// Maximum number of documents; 0 removes the limit
	pub fn limit(mut self, n: i64) -> Self {
		self.spec.limit = n;
		self
	}

	/// Field projection, e.g. `doc! { "name": 1, "_id": 0 }`
	pub fn select<S: Serialize>(mut self, projection: &S) -> Self {
		match to_document(projection) {
			Ok(projection) => self.spec.projection = Some(projection),
			Err(e) => self.invalid = self.invalid.or(Some(e)),
		}
		self
	}

	/// Sort order in `[$<kind>:][-]<field>` form, e.g. `["lastname", "-age"]`
	pub fn sort<I, S>(mut self, fields: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.spec.sort = fields.into_iter().map(Into::into).collect();
		self
	}

	/// Force the index with the given key
	pub fn hint<I, S>(mut self, key: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.spec.hint = key.into_iter().map(Into::into).collect();
		self
	}

	/// Maximum number of documents the server scans
	pub fn set_max_scan(mut self, n: u64) -> Self {
		self.spec.max_scan = n;
		self
	}

	/// Maximum server-side execution time
	pub fn set_max_time(mut self, d: Duration) -> Self {
		self.spec.max_time = Some(d);
		self
	}

	pub fn snapshot(mut self) -> Self {
		self.spec.snapshot = true;
		self
	}

	/// Tag the query in the server profiler output
	pub fn comment(mut self, comment: impl Into<String>) -> Self {
		self.spec.comment = Some(comment.into());
		self
	}

	/// Optimise a `ts` range query over the oplog
	pub fn log_replay(mut self) -> Self {
		self.spec.log_replay = true;
		self
	}

	fn check(&self) -> Result<()> {
		match &self.invalid {
			Some(e) => Err(e.clone()),
			None => Ok(()),
		}
	}

	/// First matching document
	///
	/// Fails with [`Error::NotFound`] when nothing matches.
	pub async fn one<T: DeserializeOwned>(&self) -> Result<T> {
		self.check()?;
		let session = &self.collection.session;
		let driver = session.driver();
		let ns = &self.collection.ns;
		let spec = &self.spec;
		let found = session
			.retry("query.one", move || driver.find_one(ns, spec))
			.await?;
		match found {
			Some(doc) => Ok(bson::deserialize_from_document(doc)?),
			None => Err(Error::NotFound),
		}
	}

	/// Query plan chosen by the server
	pub async fn explain<T: DeserializeOwned>(&self) -> Result<T> {
		self.check()?;
		let session = &self.collection.session;
		let driver = session.driver();
		let ns = &self.collection.ns;
		let spec = &self.spec;
		let plan = session
			.retry("query.explain", move || driver.explain(ns, spec))
			.await?;
		Ok(bson::deserialize_from_document(plan)?)
	}

	/// Atomically update or remove the first matching document
	///
	/// Returns the change summary and the document before the change, or
	/// after it with [`Change::return_new`]. Fails with [`Error::NotFound`]
	/// when nothing matched and no document was upserted.
	pub async fn apply<T: DeserializeOwned>(&self, change: Change) -> Result<(ChangeInfo, Option<T>)> {
		self.check()?;
		let session = &self.collection.session;
		let driver = session.driver();
		let ns = &self.collection.ns;
		let spec = &self.spec;
		let change = &change;
		let (info, doc) = session
			.retry("query.apply", move || driver.find_and_modify(ns, spec, change))
			.await?;

		if doc.is_none() && info.matched == 0 && info.upserted_id.is_none() {
			return Err(Error::NotFound);
		}
		let doc = doc.map(bson::deserialize_from_document).transpose()?;
		Ok((info, doc))
	}

	/// Every matching document
	///
	/// The server cursor is closed once exhausted. A transient failure while
	/// draining re-runs the whole query.
	pub async fn all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
		let mut out = Vec::new();
		self.all_into(&mut out).await?;
		Ok(out)
	}

	/// Like [`Query::all`], into a caller-provided vector
	///
	/// `out` is cleared first.
	pub async fn all_into<T: DeserializeOwned>(&self, out: &mut Vec<T>) -> Result<()> {
		out.clear();
		self.check()?;
		self.clone().iter().all_into(out).await
	}

	/// Number of matching documents, honouring skip and limit
	pub async fn count(&self) -> Result<u64> {
		self.check()?;
		let session = &self.collection.session;
		session.ensure_open()?;
		session
			.driver()
			.count(&self.collection.ns, &self.spec)
			.await
	}

	/// Distinct values of `key` among matching documents
	pub async fn distinct<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
		self.check()?;
		let session = &self.collection.session;
		session.ensure_open()?;
		let values = session
			.driver()
			.distinct(&self.collection.ns, key, &self.spec)
			.await?;
		values
			.into_iter()
			.map(|v: Bson| Ok(bson::deserialize_from_bson(v)?))
			.collect()
	}

	/// Run a map/reduce job over matching documents
	///
	/// Results are returned when the job outputs inline; otherwise the vector
	/// is empty and [`MapReduceInfo`] names the output collection.
	pub async fn map_reduce<T: DeserializeOwned>(
		&self,
		job: &MapReduce,
	) -> Result<(MapReduceInfo, Vec<T>)> {
		self.check()?;
		let session = &self.collection.session;
		session.ensure_open()?;
		let (info, docs) = session
			.driver()
			.map_reduce(&self.collection.ns, &self.spec, job)
			.await?;
		let docs = docs
			.into_iter()
			.map(|d| Ok(bson::deserialize_from_document(d)?))
			.collect::<Result<Vec<T>>>()?;
		Ok((info, docs))
	}

	/// Cursor over the matching documents
	///
	/// The query runs on the first call to [`Cursor::next`].
	pub fn iter(self) -> Cursor {
		let Query {
			collection,
			spec,
			invalid,
		} = self;
		Cursor::lazy(
			collection.session,
			collection.ns,
			CursorOrigin::Find(spec),
			invalid,
		)
	}

	/// Tailable cursor over a capped collection
	///
	/// The cursor stays open at the end of the collection and waits up to
	/// `timeout` for new documents (`None` waits indefinitely). After a
	/// timeout [`Cursor::timeout`] is `true` and iteration may resume.
	pub fn tail(mut self, timeout: Option<Duration>) -> Cursor {
		self.spec.tailable = true;
		self.spec.await_timeout = timeout;
		self.iter()
	}
}
