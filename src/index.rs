//! Index definitions and key specification parsing
//!
//! Index keys and sort fields share one textual format:
//!
//! ```text
//! [$<kind>:][-]<field name>
//! ```
//!
//! A leading `-` selects descending order, a `$<kind>:` prefix selects a
//! special index kind such as `$2d:loc` or `$text:summary`.

use bson::{Bson, Document, doc};
use std::time::Duration;

use crate::error::{Error, Result};

/// Index definition
///
/// # Example
///
/// ```rust
/// use mongo_resilient::Index;
///
/// let index = Index::new(["lastname", "firstname"]).unique(true).background(true);
/// assert_eq!(index.key_name().unwrap(), "lastname_1_firstname_1");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Index {
	/// Key fields in `[$<kind>:][-]<field>` form
	pub key: Vec<String>,
	/// Explicit index name; derived from the key when absent
	pub name: Option<String>,
	/// Only one document per key
	pub unique: bool,
	/// Drop documents duplicating an indexed key instead of failing
	pub drop_dups: bool,
	/// Build without blocking other operations on the collection
	pub background: bool,
	/// Only index documents containing the key fields
	pub sparse: bool,
	/// Remove documents whose indexed time is older than this
	pub expire_after: Option<Duration>,
	/// Precision of 2d geohash values
	pub bits: Option<u32>,
	/// Lower bound of 2d indexes
	pub min: Option<f64>,
	/// Upper bound of 2d indexes
	pub max: Option<f64>,
	/// Default language of text indexes
	pub default_language: Option<String>,
	/// Field holding the per-document language of text indexes
	pub language_override: Option<String>,
	/// Only index documents matching this filter
	pub partial_filter: Option<Document>,
}

impl Index {
	pub fn new<I, S>(key: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			key: key.into_iter().map(Into::into).collect(),
			..Default::default()
		}
	}

	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	pub fn unique(mut self, unique: bool) -> Self {
		self.unique = unique;
		self
	}

	pub fn background(mut self, background: bool) -> Self {
		self.background = background;
		self
	}

	pub fn sparse(mut self, sparse: bool) -> Self {
		self.sparse = sparse;
		self
	}

	pub fn expire_after(mut self, ttl: Duration) -> Self {
		self.expire_after = Some(ttl);
		self
	}

	/// Parsed key document and derived name
	pub fn parse_key(&self) -> Result<IndexKey> {
		parse_index_key(&self.key)
	}

	/// Name the index is stored under
	pub fn key_name(&self) -> Result<String> {
		match &self.name {
			Some(name) => Ok(name.clone()),
			None => Ok(self.parse_key()?.name),
		}
	}
}

/// Key document of an index together with its default name
#[derive(Debug, Clone, PartialEq)]
pub struct IndexKey {
	/// Name derived from the key, e.g. `lastname_1_age_-1`
	pub name: String,
	/// Key document, e.g. `{lastname: 1, age: -1}`
	pub key: Document,
}

struct KeyField<'a> {
	kind: Option<&'a str>,
	field: &'a str,
	descending: bool,
}

fn split_key_field(raw: &str) -> KeyField<'_> {
	let mut field = raw;
	let mut kind = None;
	if let Some(rest) = field.strip_prefix('$') {
		if let Some(colon) = rest.find(':') {
			// `$natural` and friends have no colon and stay field names
			if colon > 0 && colon < rest.len() - 1 {
				kind = Some(&rest[..colon]);
				field = &rest[colon + 1..];
			}
		}
	}
	let mut descending = false;
	if let Some(rest) = field.strip_prefix('-') {
		descending = true;
		field = rest;
	} else if let Some(rest) = field.strip_prefix('+') {
		field = rest;
	}
	KeyField {
		kind,
		field,
		descending,
	}
}

/// Parse index key fields into a key document and its default name
pub fn parse_index_key<S: AsRef<str>>(fields: &[S]) -> Result<IndexKey> {
	if fields.is_empty() {
		return Err(Error::InvalidArgument(
			"invalid index key: no fields provided".to_string(),
		));
	}

	let mut key = Document::new();
	let mut parts = Vec::with_capacity(fields.len());
	for raw in fields {
		let raw = raw.as_ref();
		let parsed = split_key_field(raw);
		if parsed.field.is_empty() {
			return Err(Error::InvalidArgument(format!(
				"invalid index key: {:?} has an empty field name",
				raw
			)));
		}
		match parsed.kind {
			Some(kind) => {
				key.insert(parsed.field, Bson::String(kind.to_string()));
				parts.push(format!("{}_{}", parsed.field, kind));
			}
			None => {
				let order = if parsed.descending { -1 } else { 1 };
				key.insert(parsed.field, Bson::Int32(order));
				parts.push(format!("{}_{}", parsed.field, order));
			}
		}
	}

	Ok(IndexKey {
		name: parts.join("_"),
		key,
	})
}

/// Parse sort fields into a sort document
///
/// `$textScore:<field>` sorts by the text search score projected into `field`.
pub fn parse_sort<S: AsRef<str>>(fields: &[S]) -> Result<Document> {
	let mut sort = Document::new();
	for raw in fields {
		let raw = raw.as_ref();
		let parsed = split_key_field(raw);
		if parsed.field.is_empty() {
			return Err(Error::InvalidArgument(format!(
				"sort: {:?} has an empty field name",
				raw
			)));
		}
		match parsed.kind {
			Some("textScore") => {
				sort.insert(parsed.field, doc! { "$meta": "textScore" });
			}
			Some(kind) => {
				return Err(Error::InvalidArgument(format!(
					"sort: unsupported sort kind {:?}",
					kind
				)));
			}
			None => {
				sort.insert(parsed.field, if parsed.descending { -1 } else { 1 });
			}
		}
	}
	Ok(sort)
}
