//! Collections, indexes and server-side cursors of the in-memory driver

use bson::oid::ObjectId;
use bson::{Bson, Document, doc};
use std::collections::{HashMap, VecDeque};

use super::matcher::{
	apply_update, compare, is_operator_update, lookup, matches, project, sort_order,
	upsert_base, values_equal,
};
use crate::error::{Error, Result};
use crate::index::{Index, parse_index_key, parse_sort};
use crate::types::{
	BulkOp, BulkResult, Change, ChangeInfo, CollectionInfo, Namespace, PipeOptions, QuerySpec,
};

/// Batch size used when the caller leaves it to the server
const DEFAULT_BATCH_SIZE: usize = 101;

const ID_INDEX: &str = "_id_";

fn ns_not_found(ns: &Namespace) -> Error {
	Error::server(26, format!("ns not found: {}", ns))
}

fn cursor_not_found(id: i64) -> Error {
	Error::server(43, format!("cursor id {} not found", id))
}

fn duplicate_key(ns: &Namespace, index: &str, key: &Document) -> Error {
	Error::server(
		11000,
		format!(
			"E11000 duplicate key error collection: {} index: {} dup key: {}",
			ns, index, key
		),
	)
}

#[derive(Debug, Default)]
pub(crate) struct CollectionData {
	info: CollectionInfo,
	/// Documents with their insertion sequence number
	docs: Vec<(u64, Document)>,
	/// Secondary indexes; the `_id` index is implicit
	indexes: Vec<Index>,
}

/// Tailable cursor position
#[derive(Debug)]
struct Tail {
	filter: Document,
	projection: Option<Document>,
	last_seq: u64,
}

#[derive(Debug)]
struct ServerCursor {
	ns: Namespace,
	pending: VecDeque<Document>,
	batch_size: usize,
	tail: Option<Tail>,
}

/// One batch of a cursor
#[derive(Debug, Default)]
pub(crate) struct Batch {
	pub(crate) docs: Vec<Document>,
	/// 0 once the server cursor is exhausted
	pub(crate) cursor_id: i64,
	pub(crate) tailable: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Store {
	collections: HashMap<Namespace, CollectionData>,
	cursors: HashMap<i64, ServerCursor>,
	next_cursor_id: i64,
	next_seq: u64,
}

/// Document with `_id` as its first field, generating one when missing
fn with_id_first(doc: &Document) -> Document {
	let id = doc
		.get("_id")
		.cloned()
		.unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
	let mut out = Document::new();
	out.insert("_id", id);
	for (key, value) in doc {
		if key != "_id" {
			out.insert(key.clone(), value.clone());
		}
	}
	out
}

fn batch_size(requested: u32) -> usize {
	if requested == 0 {
		DEFAULT_BATCH_SIZE
	} else {
		requested as usize
	}
}

fn key_values<'a>(doc: &'a Document, key: &Document) -> Vec<Option<&'a Bson>> {
	key.keys().map(|field| lookup(doc, field)).collect()
}

fn same_key(a: &[Option<&Bson>], b: &[Option<&Bson>]) -> bool {
	a.iter()
		.zip(b.iter())
		.all(|(x, y)| compare(*x, *y) == std::cmp::Ordering::Equal)
}

impl CollectionData {
	fn new(info: CollectionInfo) -> Self {
		Self {
			info,
			..Default::default()
		}
	}

	/// Fail when `doc` would violate the `_id` index or a unique index
	///
	/// `skip` is the sequence number of the document being replaced.
	fn check_unique(&self, ns: &Namespace, doc: &Document, skip: Option<u64>) -> Result<()> {
		let others = || self.docs.iter().filter(move |(seq, _)| Some(*seq) != skip);

		if let Some(id) = doc.get("_id") {
			if others().any(|(_, other)| other.get("_id").is_some_and(|o| values_equal(o, id))) {
				return Err(duplicate_key(ns, ID_INDEX, &doc! { "_id": id.clone() }));
			}
		}

		for index in self.indexes.iter().filter(|index| index.unique) {
			let key = index.parse_key()?;
			let values = key_values(doc, &key.key);
			if index.sparse && values.iter().all(Option::is_none) {
				continue;
			}
			if others().any(|(_, other)| same_key(&values, &key_values(other, &key.key))) {
				let mut dup = Document::new();
				for (field, value) in key.key.keys().zip(values) {
					dup.insert(field.clone(), value.cloned().unwrap_or(Bson::Null));
				}
				return Err(duplicate_key(ns, &index.key_name()?, &dup));
			}
		}
		Ok(())
	}

	fn push(&mut self, seq: u64, doc: Document) {
		self.docs.push((seq, doc));
		if self.info.capped && self.info.max_docs > 0 {
			let max = self.info.max_docs as usize;
			if self.docs.len() > max {
				let excess = self.docs.len() - max;
				self.docs.drain(..excess);
			}
		}
	}

	fn has_index(&self, key: &Document) -> bool {
		if key == &doc! { "_id": 1 } {
			return true;
		}
		self.indexes
			.iter()
			.any(|index| index.parse_key().is_ok_and(|parsed| &parsed.key == key))
	}

	fn last_seq(&self) -> u64 {
		self.docs.last().map_or(0, |(seq, _)| *seq)
	}
}

impl Store {
	fn next_seq(&mut self) -> u64 {
		self.next_seq += 1;
		self.next_seq
	}

	fn collection_mut(&mut self, ns: &Namespace) -> &mut CollectionData {
		self.collections
			.entry(ns.clone())
			.or_insert_with(|| CollectionData::new(CollectionInfo::default()))
	}

	pub(crate) fn documents(&self, ns: &Namespace) -> Vec<Document> {
		self.collections
			.get(ns)
			.map(|coll| coll.docs.iter().map(|(_, doc)| doc.clone()).collect())
			.unwrap_or_default()
	}

	pub(crate) fn open_cursors(&self) -> usize {
		self.cursors.len()
	}

	pub(crate) fn insert(&mut self, ns: &Namespace, docs: &[Document]) -> Result<()> {
		for doc in docs {
			let doc = with_id_first(doc);
			let seq = self.next_seq();
			let coll = self.collection_mut(ns);
			coll.check_unique(ns, &doc, None)?;
			coll.push(seq, doc);
		}
		Ok(())
	}

	/// Matching documents in result order, before projection
	fn select(&self, ns: &Namespace, spec: &QuerySpec) -> Result<Vec<(u64, Document)>> {
		let sort = parse_sort(&spec.sort)?;
		let Some(coll) = self.collections.get(ns) else {
			return Ok(Vec::new());
		};

		if !spec.hint.is_empty() {
			let hint = parse_index_key(&spec.hint)?;
			if !coll.has_index(&hint.key) {
				return Err(Error::server(
					2,
					"error processing query: planner returned error :: caused by :: \
					 hint provided does not correspond to an existing index",
				));
			}
		}

		let scan = if spec.max_scan > 0 {
			spec.max_scan as usize
		} else {
			usize::MAX
		};
		let mut selected = Vec::new();
		for (seq, doc) in coll.docs.iter().take(scan) {
			if matches(doc, &spec.filter)? {
				selected.push((*seq, doc.clone()));
			}
		}

		if !sort.is_empty() {
			selected.sort_by(|(a_seq, a), (b_seq, b)| sort_order(&sort, (*a_seq, a), (*b_seq, b)));
		}

		let mut selected: Vec<_> = selected.into_iter().skip(spec.skip as usize).collect();
		if spec.limit != 0 {
			selected.truncate(spec.limit.unsigned_abs() as usize);
		}
		Ok(selected)
	}

	fn projected(doc: Document, projection: Option<&Document>) -> Document {
		match projection {
			Some(projection) => project(&doc, projection),
			None => doc,
		}
	}

	pub(crate) fn count(&self, ns: &Namespace, spec: &QuerySpec) -> Result<u64> {
		Ok(self.select(ns, spec)?.len() as u64)
	}

	pub(crate) fn find_one(&self, ns: &Namespace, spec: &QuerySpec) -> Result<Option<Document>> {
		let first = self.select(ns, spec)?.into_iter().next();
		Ok(first.map(|(_, doc)| Self::projected(doc, spec.projection.as_ref())))
	}

	pub(crate) fn explain(&self, ns: &Namespace, spec: &QuerySpec) -> Result<Document> {
		let returned = self.select(ns, spec)?.len() as i64;
		let examined = self.collections.get(ns).map_or(0, |coll| coll.docs.len()) as i64;
		let stage = if spec.hint.is_empty() { "COLLSCAN" } else { "IXSCAN" };
		Ok(doc! {
			"queryPlanner": {
				"namespace": ns.to_string(),
				"parsedQuery": spec.filter.clone(),
				"winningPlan": { "stage": stage },
			},
			"executionStats": {
				"nReturned": returned,
				"totalDocsExamined": examined,
			},
			"ok": 1.0,
		})
	}

	pub(crate) fn distinct(&self, ns: &Namespace, key: &str, spec: &QuerySpec) -> Result<Vec<Bson>> {
		let mut values: Vec<Bson> = Vec::new();
		for (_, doc) in self.select(ns, spec)? {
			let found: Vec<Bson> = match lookup(&doc, key) {
				None => continue,
				Some(Bson::Array(items)) => items.clone(),
				Some(value) => vec![value.clone()],
			};
			for value in found {
				if !values.iter().any(|known| values_equal(known, &value)) {
					values.push(value);
				}
			}
		}
		Ok(values)
	}

	fn register_cursor(&mut self, cursor: ServerCursor) -> i64 {
		self.next_cursor_id += 1;
		let id = self.next_cursor_id;
		self.cursors.insert(id, cursor);
		id
	}

	/// Run a query and return its first batch, keeping the rest server-side
	pub(crate) fn open(&mut self, ns: &Namespace, spec: &QuerySpec) -> Result<Batch> {
		let tail = if spec.tailable {
			let coll = self.collections.get(ns).ok_or_else(|| ns_not_found(ns))?;
			if !coll.info.capped {
				return Err(Error::server(
					2,
					format!(
						"error processing query: ns={} tailable cursor requested on non capped collection",
						ns
					),
				));
			}
			Some(Tail {
				filter: spec.filter.clone(),
				projection: spec.projection.clone(),
				last_seq: coll.last_seq(),
			})
		} else {
			None
		};

		let docs: VecDeque<Document> = self
			.select(ns, spec)?
			.into_iter()
			.map(|(_, doc)| Self::projected(doc, spec.projection.as_ref()))
			.collect();
		self.start_cursor(ns, docs, batch_size(spec.batch_size), spec.limit < 0, tail)
	}

	fn start_cursor(
		&mut self,
		ns: &Namespace,
		mut docs: VecDeque<Document>,
		batch_size: usize,
		single_batch: bool,
		tail: Option<Tail>,
	) -> Result<Batch> {
		let first: Vec<Document> = docs.drain(..batch_size.min(docs.len())).collect();
		let tailable = tail.is_some();
		if single_batch || (docs.is_empty() && !tailable) {
			return Ok(Batch {
				docs: first,
				cursor_id: 0,
				tailable,
			});
		}
		let id = self.register_cursor(ServerCursor {
			ns: ns.clone(),
			pending: docs,
			batch_size,
			tail,
		});
		Ok(Batch {
			docs: first,
			cursor_id: id,
			tailable,
		})
	}

	/// Next batch of a cursor; `None` when a tailable cursor has nothing new
	pub(crate) fn get_more(&mut self, id: i64) -> Result<Option<Batch>> {
		let Store {
			collections,
			cursors,
			..
		} = self;
		let cursor = cursors.get_mut(&id).ok_or_else(|| cursor_not_found(id))?;

		if cursor.pending.is_empty() {
			let Some(tail) = cursor.tail.as_mut() else {
				cursors.remove(&id);
				return Ok(Some(Batch::default()));
			};
			let Some(coll) = collections.get(&cursor.ns) else {
				// The capped collection was dropped under the cursor
				cursors.remove(&id);
				return Ok(Some(Batch {
					tailable: true,
					..Default::default()
				}));
			};
			let seen = tail.last_seq;
			for (seq, doc) in coll.docs.iter().filter(|(seq, _)| *seq > seen) {
				tail.last_seq = *seq;
				if matches(doc, &tail.filter)? {
					cursor
						.pending
						.push_back(Self::projected(doc.clone(), tail.projection.as_ref()));
				}
			}
			if cursor.pending.is_empty() {
				return Ok(None);
			}
		}

		let take = cursor.batch_size.min(cursor.pending.len());
		let docs: Vec<Document> = cursor.pending.drain(..take).collect();
		let tailable = cursor.tail.is_some();
		let cursor_id = if cursor.pending.is_empty() && !tailable {
			cursors.remove(&id);
			0
		} else {
			id
		};
		Ok(Some(Batch {
			docs,
			cursor_id,
			tailable,
		}))
	}

	pub(crate) fn kill_cursor(&mut self, id: i64) {
		self.cursors.remove(&id);
	}

	pub(crate) fn remove(&mut self, ns: &Namespace, selector: &Document, multi: bool) -> Result<ChangeInfo> {
		let Some(coll) = self.collections.get_mut(ns) else {
			return Ok(ChangeInfo::default());
		};

		let mut doomed = Vec::new();
		for (seq, doc) in &coll.docs {
			if matches(doc, selector)? {
				doomed.push(*seq);
				if !multi {
					break;
				}
			}
		}
		coll.docs.retain(|(seq, _)| !doomed.contains(seq));

		let n = doomed.len() as u64;
		Ok(ChangeInfo {
			removed: n,
			matched: n,
			..Default::default()
		})
	}

	/// Build and insert the document of an upsert, returning its `_id`
	fn upsert_insert(&mut self, ns: &Namespace, selector: &Document, update: &Document) -> Result<Document> {
		let base = upsert_base(selector)?;
		let mut doc = if is_operator_update(update) {
			base
		} else {
			let mut doc = Document::new();
			if let Some(id) = base.get("_id") {
				doc.insert("_id", id.clone());
			}
			doc
		};
		apply_update(&mut doc, update, true)?;
		let doc = with_id_first(&doc);

		let seq = self.next_seq();
		let coll = self.collection_mut(ns);
		coll.check_unique(ns, &doc, None)?;
		coll.push(seq, doc.clone());
		Ok(doc)
	}

	pub(crate) fn update(
		&mut self,
		ns: &Namespace,
		selector: &Document,
		update: &Document,
		multi: bool,
		upsert: bool,
	) -> Result<ChangeInfo> {
		if multi && !is_operator_update(update) {
			return Err(Error::server(
				9,
				"multi update is not supported for replacement-style update",
			));
		}

		let mut info = ChangeInfo::default();
		if let Some(coll) = self.collections.get_mut(ns) {
			for i in 0..coll.docs.len() {
				if !matches(&coll.docs[i].1, selector)? {
					continue;
				}
				info.matched += 1;

				let (seq, current) = &coll.docs[i];
				let seq = *seq;
				let mut updated = current.clone();
				apply_update(&mut updated, update, false)?;
				if &updated != current {
					coll.check_unique(ns, &updated, Some(seq))?;
					coll.docs[i].1 = updated;
					info.updated += 1;
				}
				if !multi {
					break;
				}
			}
		}

		if info.matched == 0 && upsert {
			let doc = self.upsert_insert(ns, selector, update)?;
			info.upserted_id = doc.get("_id").cloned();
		}
		Ok(info)
	}

	pub(crate) fn find_and_modify(
		&mut self,
		ns: &Namespace,
		spec: &QuerySpec,
		change: &Change,
	) -> Result<(ChangeInfo, Option<Document>)> {
		if !change.remove && change.update.is_none() {
			return Err(Error::server(9, "Either an update or remove=true must be specified"));
		}

		let found = self.select(ns, spec)?.into_iter().next();
		let projection = spec.projection.as_ref();
		let mut info = ChangeInfo::default();

		let Some((seq, old)) = found else {
			let Some(update) = change.update.as_ref().filter(|_| change.upsert && !change.remove) else {
				return Ok((info, None));
			};
			let doc = self.upsert_insert(ns, &spec.filter, update)?;
			info.upserted_id = doc.get("_id").cloned();
			let returned = change.return_new.then(|| Self::projected(doc, projection));
			return Ok((info, returned));
		};

		let coll = self.collection_mut(ns);
		let position = coll
			.docs
			.iter()
			.position(|(s, _)| *s == seq)
			.ok_or_else(|| ns_not_found(ns))?;
		info.matched = 1;

		if change.remove {
			coll.docs.remove(position);
			info.removed = 1;
			return Ok((info, Some(Self::projected(old, projection))));
		}

		let mut updated = old.clone();
		if let Some(update) = &change.update {
			apply_update(&mut updated, update, false)?;
		}
		coll.check_unique(ns, &updated, Some(seq))?;
		coll.docs[position].1 = updated.clone();
		info.updated = 1;

		let returned = if change.return_new { updated } else { old };
		Ok((info, Some(Self::projected(returned, projection))))
	}

	pub(crate) fn create_collection(&mut self, ns: &Namespace, info: &CollectionInfo) -> Result<()> {
		if self.collections.contains_key(ns) {
			return Err(Error::server(48, format!("Collection {} already exists.", ns)));
		}
		if info.capped && info.max_bytes == 0 {
			return Err(Error::server(72, "the 'size' field is required when 'capped' is true"));
		}
		self.collections
			.insert(ns.clone(), CollectionData::new(info.clone()));
		Ok(())
	}

	pub(crate) fn drop_collection(&mut self, ns: &Namespace) -> Result<()> {
		self.collections
			.remove(ns)
			.map(|_| ())
			.ok_or_else(|| ns_not_found(ns))
	}

	pub(crate) fn create_index(&mut self, ns: &Namespace, index: &Index) -> Result<()> {
		let key = index.parse_key()?;
		let name = index.key_name()?;
		let coll = self.collection_mut(ns);

		if name == ID_INDEX || key.key == doc! { "_id": 1 } {
			return Ok(());
		}
		if let Some(existing) = coll
			.indexes
			.iter()
			.find(|i| i.key_name().ok().as_deref() == Some(name.as_str()))
		{
			if existing.parse_key()?.key == key.key && existing.unique == index.unique {
				return Ok(());
			}
			return Err(Error::server(
				86,
				format!("Index with name: {} already exists with different options", name),
			));
		}

		let mut stored = index.clone();
		stored.name = Some(name);
		coll.indexes.push(stored);

		if index.unique {
			// Reject the index when existing documents already collide
			let docs: Vec<(u64, Document)> = coll.docs.clone();
			for (seq, doc) in &docs {
				if let Err(e) = coll.check_unique(ns, doc, Some(*seq)) {
					if e.is_duplicate_key() {
						coll.indexes.pop();
						return Err(e);
					}
				}
			}
		}
		Ok(())
	}

	pub(crate) fn drop_index(&mut self, ns: &Namespace, name: &str) -> Result<()> {
		let coll = self.collections.get_mut(ns).ok_or_else(|| ns_not_found(ns))?;
		if name == ID_INDEX {
			return Err(Error::server(72, "cannot drop _id index"));
		}
		let before = coll.indexes.len();
		coll.indexes
			.retain(|index| index.key_name().ok().as_deref() != Some(name));
		if coll.indexes.len() == before {
			return Err(Error::server(27, format!("index not found with name [{}]", name)));
		}
		Ok(())
	}

	pub(crate) fn indexes(&self, ns: &Namespace) -> Result<Vec<Index>> {
		let coll = self.collections.get(ns).ok_or_else(|| ns_not_found(ns))?;
		let mut indexes = vec![Index::new(["_id"]).name(ID_INDEX)];
		indexes.extend(coll.indexes.iter().cloned());
		Ok(indexes)
	}

	/// Run the `$match`, `$sort`, `$skip`, `$limit`, `$project` and `$count`
	/// stages of a pipeline
	pub(crate) fn aggregate(
		&mut self,
		ns: &Namespace,
		pipeline: &[Document],
		options: &PipeOptions,
	) -> Result<Batch> {
		let mut docs: Vec<(u64, Document)> = self
			.collections
			.get(ns)
			.map(|coll| coll.docs.clone())
			.unwrap_or_default();

		for stage in pipeline {
			let Some((name, arg)) = stage.iter().next() else {
				return Err(Error::server(40323, "A pipeline stage specification object must contain exactly one field."));
			};
			match (name.as_str(), arg) {
				("$match", Bson::Document(filter)) => {
					let mut kept = Vec::with_capacity(docs.len());
					for (seq, doc) in docs {
						if matches(&doc, filter)? {
							kept.push((seq, doc));
						}
					}
					docs = kept;
				}
				("$sort", Bson::Document(sort)) => {
					docs.sort_by(|(a_seq, a), (b_seq, b)| sort_order(sort, (*a_seq, a), (*b_seq, b)));
				}
				("$skip", n) => {
					let n = n.as_i64().or_else(|| n.as_i32().map(i64::from)).unwrap_or(0);
					docs = docs.into_iter().skip(n.max(0) as usize).collect();
				}
				("$limit", n) => {
					let n = n.as_i64().or_else(|| n.as_i32().map(i64::from)).unwrap_or(0);
					if n <= 0 {
						return Err(Error::server(15958, "the limit must be positive"));
					}
					docs.truncate(n as usize);
				}
				("$project", Bson::Document(projection)) => {
					docs = docs
						.into_iter()
						.map(|(seq, doc)| (seq, project(&doc, projection)))
						.collect();
				}
				("$count", Bson::String(field)) => {
					let n = docs.len() as i64;
					docs = if n == 0 {
						Vec::new()
					} else {
						let mut counted = Document::new();
						counted.insert(field.clone(), n);
						vec![(0, counted)]
					};
				}
				(name, _) => {
					return Err(Error::server(
						40324,
						format!("Unrecognized pipeline stage name: '{}'", name),
					));
				}
			}
		}

		let docs: VecDeque<Document> = docs.into_iter().map(|(_, doc)| doc).collect();
		self.start_cursor(ns, docs, batch_size(options.batch_size), false, None)
	}

	pub(crate) fn bulk(&mut self, ns: &Namespace, ops: &[BulkOp], ordered: bool) -> Result<BulkResult> {
		let mut result = BulkResult::default();
		let mut first_error = None;

		for op in ops {
			let outcome = match op {
				BulkOp::Insert(doc) => self
					.insert(ns, std::slice::from_ref(doc))
					.map(|()| result.inserted += 1),
				BulkOp::Update {
					selector,
					update,
					multi,
					upsert,
				} => self
					.update(ns, selector, update, *multi, *upsert)
					.map(|info| {
						result.matched += info.matched;
						result.modified += info.updated;
						if info.upserted_id.is_some() {
							result.upserted += 1;
						}
					}),
				BulkOp::Remove { selector, multi } => self
					.remove(ns, selector, *multi)
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

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::{fixture, rstest};

	#[fixture]
	fn ns() -> Namespace {
		Namespace::new("app", "people")
	}

	#[fixture]
	fn store(ns: Namespace) -> Store {
		let mut store = Store::default();
		store
			.insert(
				&ns,
				&[
					doc! { "_id": 1, "name": "Ada", "age": 36 },
					doc! { "_id": 2, "name": "Alan", "age": 41 },
					doc! { "_id": 3, "name": "Grace", "age": 85 },
				],
			)
			.unwrap();
		store
	}

	#[rstest]
	fn test_insert_generates_leading_id(ns: Namespace) {
		let mut store = Store::default();
		store.insert(&ns, &[doc! { "name": "Ada" }]).unwrap();
		let docs = store.documents(&ns);
		assert_eq!(docs[0].keys().next().map(String::as_str), Some("_id"));
		assert!(matches!(docs[0].get("_id"), Some(Bson::ObjectId(_))));
	}

	#[rstest]
	fn test_duplicate_id_is_rejected(mut store: Store, ns: Namespace) {
		let err = store.insert(&ns, &[doc! { "_id": 2, "name": "Bob" }]).unwrap_err();
		assert!(err.is_duplicate_key());
		assert_eq!(store.documents(&ns).len(), 3);
	}

	#[rstest]
	fn test_unique_index(mut store: Store, ns: Namespace) {
		store
			.create_index(&ns, &Index::new(["name"]).unique(true))
			.unwrap();
		let err = store.insert(&ns, &[doc! { "name": "Ada" }]).unwrap_err();
		assert!(err.is_duplicate_key());
		assert!(err.to_string().contains("index: name_1"));
	}

	#[rstest]
	fn test_select_sorts_skips_and_limits(store: Store, ns: Namespace) {
		let spec = QuerySpec {
			sort: vec!["-age".to_string()],
			skip: 1,
			limit: 1,
			..QuerySpec::default()
		};
		let found = store.find_one(&ns, &spec).unwrap().unwrap();
		assert_eq!(found.get_str("name").unwrap(), "Alan");
		assert_eq!(store.count(&ns, &QuerySpec::default()).unwrap(), 3);
	}

	#[rstest]
	fn test_cursor_batches(mut store: Store, ns: Namespace) {
		let spec = QuerySpec {
			batch_size: 2,
			..QuerySpec::default()
		};
		let first = store.open(&ns, &spec).unwrap();
		assert_eq!(first.docs.len(), 2);
		assert_ne!(first.cursor_id, 0);
		assert_eq!(store.open_cursors(), 1);

		let second = store.get_more(first.cursor_id).unwrap().unwrap();
		assert_eq!(second.docs.len(), 1);
		assert_eq!(second.cursor_id, 0);
		assert_eq!(store.open_cursors(), 0);

		let err = store.get_more(first.cursor_id).unwrap_err();
		assert_eq!(err.code(), Some(43));
	}

	#[rstest]
	fn test_upsert_inserts_from_selector(mut store: Store, ns: Namespace) {
		let info = store
			.update(&ns, &doc! { "name": "Linus" }, &doc! { "$set": { "age": 54 } }, false, true)
			.unwrap();
		assert_eq!(info.matched, 0);
		assert!(info.upserted_id.is_some());

		let spec = QuerySpec::new(doc! { "name": "Linus" });
		let doc = store.find_one(&ns, &spec).unwrap().unwrap();
		assert_eq!(doc.get_i32("age").unwrap(), 54);
	}

	#[rstest]
	fn test_capped_collection_evicts_oldest(ns: Namespace) {
		let mut store = Store::default();
		store
			.create_collection(&ns, &CollectionInfo::capped(4096, 2))
			.unwrap();
		store
			.insert(&ns, &[doc! { "n": 1 }, doc! { "n": 2 }, doc! { "n": 3 }])
			.unwrap();
		let ns_docs = store.documents(&ns);
		let kept: Vec<i32> = ns_docs.iter().map(|d| d.get_i32("n").unwrap()).collect();
		assert_eq!(kept, vec![2, 3]);
	}

	#[rstest]
	fn test_unknown_hint_is_rejected(store: Store, ns: Namespace) {
		let spec = QuerySpec {
			hint: vec!["age".to_string()],
			..QuerySpec::default()
		};
		assert_eq!(store.count(&ns, &spec).unwrap_err().code(), Some(2));
	}

	#[rstest]
	fn test_aggregate_stages(mut store: Store, ns: Namespace) {
		let batch = store
			.aggregate(
				&ns,
				&[
					doc! { "$match": { "age": { "$gt": 40 } } },
					doc! { "$sort": { "age": -1 } },
					doc! { "$project": { "name": 1, "_id": 0 } },
				],
				&PipeOptions::default(),
			)
			.unwrap();
		assert_eq!(batch.docs, vec![doc! { "name": "Grace" }, doc! { "name": "Alan" }]);
		assert_eq!(batch.cursor_id, 0);

		let err = store
			.aggregate(&ns, &[doc! { "$lookup": {} }], &PipeOptions::default())
			.unwrap_err();
		assert_eq!(err.code(), Some(40324));
	}
}
