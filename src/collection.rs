//! Collection handle
//!
//! Every reading and mutating operation runs inside the owning session's
//! retry envelope. Query, pipeline and bulk builders are returned without
//! touching the network.

use bson::{Document, doc};
use serde::Serialize;

use crate::bulk::Bulk;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::index::{Index, parse_index_key};
use crate::pipe::Pipe;
use crate::query::Query;
use crate::session::Session;
use crate::types::{ChangeInfo, CollectionInfo, Namespace, QuerySpec};

/// Handle on a collection of the session's working database
#[derive(Debug, Clone)]
pub struct Collection {
	pub(crate) session: Session,
	pub(crate) ns: Namespace,
}

pub(crate) fn to_document<S: Serialize>(value: &S) -> Result<Document> {
	Ok(bson::serialize_to_document(value)?)
}

fn id_selector<I: Serialize>(id: &I) -> Result<Document> {
	Ok(doc! { "_id": bson::serialize_to_bson(id)? })
}

impl Collection {
	pub(crate) fn new(session: Session, name: String) -> Self {
		let ns = Namespace::new(session.name(), name);
		Self { session, ns }
	}

	/// Collection name
	pub fn name(&self) -> &str {
		&self.ns.collection
	}

	/// Fully qualified name, `<database>.<collection>`
	pub fn full_name(&self) -> String {
		self.ns.to_string()
	}

	pub fn session(&self) -> &Session {
		&self.session
	}

	fn index_cache_key(&self, name: &str) -> String {
		format!("{}:{}", self.ns, name)
	}

	/// Insert one or more documents
	///
	/// Documents without an `_id` get a generated one. A write interrupted by
	/// a transient failure is sent again in full.
	pub async fn insert<D: Serialize>(&self, docs: &[D]) -> Result<()> {
		let docs = docs.iter().map(to_document).collect::<Result<Vec<_>>>()?;
		let driver = self.session.driver();
		let ns = &self.ns;
		let docs = &docs;
		self.session
			.retry("insert", move || driver.insert(ns, docs))
			.await
	}

	/// Number of documents in the collection
	pub async fn count(&self) -> Result<u64> {
		let driver = self.session.driver();
		let ns = &self.ns;
		let spec = QuerySpec::default();
		let spec = &spec;
		self.session
			.retry("count", move || driver.count(ns, spec))
			.await
	}

	/// Explicitly create the collection, e.g. to make it capped
	pub async fn create(&self, info: &CollectionInfo) -> Result<()> {
		let driver = self.session.driver();
		let ns = &self.ns;
		self.session
			.retry("create", move || driver.create_collection(ns, info))
			.await
	}

	/// Drop the collection with its documents and indexes
	pub async fn drop_collection(&self) -> Result<()> {
		let driver = self.session.driver();
		let ns = &self.ns;
		self.session
			.retry("drop_collection", move || driver.drop_collection(ns))
			.await?;
		self.session.forget_indexes(&self.index_cache_key(""));
		Ok(())
	}

	/// Drop the index called `name`
	pub async fn drop_index_name(&self, name: &str) -> Result<()> {
		let driver = self.session.driver();
		let ns = &self.ns;
		self.session
			.retry("drop_index", move || driver.drop_index(ns, name))
			.await?;
		self.session.forget_index(&self.index_cache_key(name));
		Ok(())
	}

	/// Drop the index with the given key, e.g. `&["lastname", "-age"]`
	pub async fn drop_index<S: AsRef<str>>(&self, key: &[S]) -> Result<()> {
		let key = parse_index_key(key)?;
		self.drop_index_name(&key.name).await
	}

	/// Create the index unless it is known to exist
	///
	/// Indexes ensured once are remembered by the session, so repeated calls
	/// do not reach the server until the index is dropped or
	/// [`Session::reset_index_cache`] is called.
	pub async fn ensure_index(&self, index: Index) -> Result<()> {
		let cache_key = self.index_cache_key(&index.key_name()?);
		if self.session.index_known(&cache_key) {
			return Ok(());
		}

		let driver = self.session.driver();
		let ns = &self.ns;
		let index = &index;
		self.session
			.retry("ensure_index", move || driver.create_index(ns, index))
			.await?;

		tracing::debug!(ns = %self.ns, index = %cache_key, "index ensured");
		self.session.remember_index(cache_key);
		Ok(())
	}

	/// Shorthand for an index with default options
	pub async fn ensure_index_key<S: AsRef<str>>(&self, key: &[S]) -> Result<()> {
		self.ensure_index(Index::new(key.iter().map(|k| k.as_ref().to_string())))
			.await
	}

	/// Indexes of the collection
	pub async fn indexes(&self) -> Result<Vec<Index>> {
		let driver = self.session.driver();
		let ns = &self.ns;
		self.session
			.retry("indexes", move || driver.indexes(ns))
			.await
	}

	/// Remove a single document matching `selector`
	///
	/// In strict mode a selector matching nothing fails with
	/// [`Error::NotFound`].
	pub async fn remove<S: Serialize>(&self, selector: &S) -> Result<()> {
		let selector = to_document(selector)?;
		let info = self.remove_with(selector, false).await?;
		if info.removed == 0 && self.session.strict() {
			return Err(Error::NotFound);
		}
		Ok(())
	}

	/// Remove the document with the given `_id`
	pub async fn remove_id<I: Serialize>(&self, id: &I) -> Result<()> {
		self.remove(&id_selector(id)?).await
	}

	/// Remove every document matching `selector`
	pub async fn remove_all<S: Serialize>(&self, selector: &S) -> Result<ChangeInfo> {
		let selector = to_document(selector)?;
		self.remove_with(selector, true).await
	}

	async fn remove_with(&self, selector: Document, multi: bool) -> Result<ChangeInfo> {
		let driver = self.session.driver();
		let ns = &self.ns;
		let selector = &selector;
		self.session
			.retry("remove", move || driver.remove(ns, selector, multi))
			.await
	}

	/// Update a single document matching `selector`
	///
	/// An `update` without `$` operators replaces the whole document, keeping
	/// its `_id`. In strict mode a selector matching nothing fails with
	/// [`Error::NotFound`]; otherwise it succeeds without effect.
	pub async fn update<S, U>(&self, selector: &S, update: &U) -> Result<()>
	where
		S: Serialize,
		U: Serialize,
	{
		let info = self
			.update_with(to_document(selector)?, to_document(update)?, false, false)
			.await?;
		if info.matched == 0 && self.session.strict() {
			return Err(Error::NotFound);
		}
		Ok(())
	}

	/// Update the document with the given `_id`
	pub async fn update_id<I, U>(&self, id: &I, update: &U) -> Result<()>
	where
		I: Serialize,
		U: Serialize,
	{
		self.update(&id_selector(id)?, update).await
	}

	/// Update every document matching `selector`
	pub async fn update_all<S, U>(&self, selector: &S, update: &U) -> Result<ChangeInfo>
	where
		S: Serialize,
		U: Serialize,
	{
		self.update_with(to_document(selector)?, to_document(update)?, true, false)
			.await
	}

	/// Update the document matching `selector`, inserting one if none does
	///
	/// `ChangeInfo::upserted_id` is set when a document was inserted.
	pub async fn upsert<S, U>(&self, selector: &S, update: &U) -> Result<ChangeInfo>
	where
		S: Serialize,
		U: Serialize,
	{
		self.update_with(to_document(selector)?, to_document(update)?, false, true)
			.await
	}

	/// Upsert the document with the given `_id`
	pub async fn upsert_id<I, U>(&self, id: &I, update: &U) -> Result<ChangeInfo>
	where
		I: Serialize,
		U: Serialize,
	{
		self.upsert(&id_selector(id)?, update).await
	}

	async fn update_with(
		&self,
		selector: Document,
		update: Document,
		multi: bool,
		upsert: bool,
	) -> Result<ChangeInfo> {
		let driver = self.session.driver();
		let ns = &self.ns;
		let selector = &selector;
		let update = &update;
		let op = if upsert { "upsert" } else { "update" };
		self.session
			.retry(op, move || driver.update(ns, selector, update, multi, upsert))
			.await
	}

	/// Start a query over the documents matching `selector`
	///
	/// Nothing is sent until a terminal operation of the query runs. A
	/// selector that cannot be serialized fails that terminal operation.
	pub fn find<S: Serialize>(&self, selector: &S) -> Query {
		match to_document(selector) {
			Ok(filter) => Query::new(self.clone(), filter),
			Err(e) => Query::failed(self.clone(), e),
		}
	}

	/// Query by `_id`
	pub fn find_id<I: Serialize>(&self, id: &I) -> Query {
		match id_selector(id) {
			Ok(filter) => Query::new(self.clone(), filter),
			Err(e) => Query::failed(self.clone(), e),
		}
	}

	/// Start an aggregation pipeline
	pub fn pipe<P: Serialize>(&self, pipeline: &[P]) -> Pipe {
		match pipeline.iter().map(to_document).collect::<Result<Vec<_>>>() {
			Ok(stages) => Pipe::new(self.clone(), stages),
			Err(e) => Pipe::failed(self.clone(), e),
		}
	}

	/// Start a batch of writes
	pub fn bulk(&self) -> Bulk {
		Bulk::new(self.clone())
	}

	/// Cursor over a batch fetched elsewhere and its live server cursor
	///
	/// `err` is reported by the cursor once `first_batch` is consumed.
	pub fn new_iter(&self, first_batch: Vec<Document>, cursor_id: i64, err: Option<Error>) -> Cursor {
		let inner = self
			.session
			.driver()
			.resume_cursor(&self.ns, first_batch, cursor_id, err);
		Cursor::resumed(self.session.clone(), self.ns.clone(), inner)
	}
}
