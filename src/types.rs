//! Value types shared by the handles and the driver seam

use bson::{Bson, Document};
use std::fmt;
use std::time::Duration;

/// Fully qualified collection name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
	/// Database name
	pub database: String,
	/// Collection name
	pub collection: String,
}

impl Namespace {
	pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
		Self {
			database: database.into(),
			collection: collection.into(),
		}
	}
}

impl fmt::Display for Namespace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.database, self.collection)
	}
}

/// Read consistency mode
///
/// See <https://www.mongodb.com/docs/manual/core/read-preference/>.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
	/// Same as `Nearest`, but may change servers between reads
	Eventual,
	/// Same as `SecondaryPreferred` before the first write, `Primary` after it
	Monotonic,
	/// All operations read from the current replica set primary
	#[default]
	Primary,
	/// Read from the primary if available, from a secondary otherwise
	PrimaryPreferred,
	/// Read from one of the nearest secondary members
	Secondary,
	/// Read from one of the nearest secondaries if available, primary otherwise
	SecondaryPreferred,
	/// Read from the nearest member, primary or secondary
	Nearest,
}

impl Mode {
	/// Same as `Primary`
	pub const STRONG: Mode = Mode::Primary;
}

/// Options for explicitly created collections
///
/// Mirrors the [`create`](https://www.mongodb.com/docs/manual/reference/command/create/)
/// command fields, including [capped collections](https://www.mongodb.com/docs/manual/core/capped-collections/).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionInfo {
	/// Prevent the automatic `_id` index
	pub disable_id_index: bool,
	/// Force an `_id` index even on capped collections
	pub force_id_index: bool,
	/// Fixed-size collection keeping insertion order
	pub capped: bool,
	/// Maximum size in bytes of a capped collection
	pub max_bytes: u64,
	/// Maximum number of documents of a capped collection (0 = unbounded)
	pub max_docs: u64,
	/// Document validation rules
	pub validator: Option<Document>,
	/// `off`, `strict` or `moderate`
	pub validation_level: Option<String>,
	/// `error` or `warn`
	pub validation_action: Option<String>,
	/// Storage engine specific options
	pub storage_engine: Option<Document>,
}

impl CollectionInfo {
	/// Capped collection limited to `max_bytes` and, when non-zero, `max_docs`
	pub fn capped(max_bytes: u64, max_docs: u64) -> Self {
		Self {
			capped: true,
			max_bytes,
			max_docs,
			..Default::default()
		}
	}
}

/// Summary of the effect of a mutation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeInfo {
	/// Number of documents updated
	pub updated: u64,
	/// Number of documents removed
	pub removed: u64,
	/// Number of documents matched by the selector
	pub matched: u64,
	/// `_id` of the document inserted by an upsert
	pub upserted_id: Option<Bson>,
}

/// Modification applied atomically by `Query::apply` (findAndModify)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Change {
	/// Update document; ignored when `remove` is set
	pub update: Option<Document>,
	/// Insert when nothing matches
	pub upsert: bool,
	/// Remove the matched document
	pub remove: bool,
	/// Return the modified document rather than the original
	pub return_new: bool,
}

impl Change {
	pub fn update(update: Document) -> Self {
		Self {
			update: Some(update),
			..Default::default()
		}
	}

	pub fn remove() -> Self {
		Self {
			remove: true,
			..Default::default()
		}
	}

	pub fn with_upsert(mut self, upsert: bool) -> Self {
		self.upsert = upsert;
		self
	}

	pub fn with_return_new(mut self, return_new: bool) -> Self {
		self.return_new = return_new;
		self
	}
}

/// Server build information
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildInfo {
	pub version: String,
	pub version_array: Vec<i32>,
	pub git_version: String,
	pub sys_info: String,
	pub bits: i32,
	pub debug: bool,
	pub max_object_size: i64,
}

impl BuildInfo {
	/// Whether the server version is at least `version` (e.g. `&[3, 6]`)
	pub fn version_at_least(&self, version: &[i32]) -> bool {
		for (i, want) in version.iter().enumerate() {
			let have = self.version_array.get(i).copied().unwrap_or(0);
			if have != *want {
				return have > *want;
			}
		}
		true
	}
}

/// Map/reduce job definition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapReduce {
	/// Map function source
	pub map: String,
	/// Reduce function source
	pub reduce: String,
	/// Optional finalize function source
	pub finalize: Option<String>,
	/// Output target; `None` returns results inline
	pub out: Option<Document>,
	/// Global variables for the map, reduce and finalize functions
	pub scope: Option<Document>,
	pub verbose: bool,
}

/// Statistics of a map/reduce job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapReduceInfo {
	/// Number of documents mapped
	pub input_count: u64,
	/// Number of times `emit` was called
	pub emit_count: u64,
	/// Number of documents in the output
	pub output_count: u64,
	/// Output collection name, when results were not inlined
	pub collection: Option<String>,
	/// Output database name, when results were not inlined
	pub database: Option<String>,
	/// Server-side running time
	pub time: Duration,
}

/// Accumulated state of a query
///
/// Built by [`Query`](crate::Query) and consumed by the driver. Sort and hint
/// keys are kept in their textual `[$<kind>:][-]<field>` form and parsed at
/// execution time, so building a query never fails.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
	pub filter: Document,
	pub projection: Option<Document>,
	pub sort: Vec<String>,
	pub skip: u64,
	/// Maximum number of documents; 0 means unbounded
	pub limit: i64,
	/// Documents per batch; 0 lets the server decide
	pub batch_size: u32,
	/// Fraction of the batch left unread when the next batch is requested
	pub prefetch: f64,
	pub hint: Vec<String>,
	pub max_scan: u64,
	pub max_time: Option<Duration>,
	pub snapshot: bool,
	pub comment: Option<String>,
	pub log_replay: bool,
	/// Keep the cursor open at the end of a capped collection
	pub tailable: bool,
	/// How long a tailable cursor waits for new data; `None` waits forever
	pub await_timeout: Option<Duration>,
}

impl Default for QuerySpec {
	fn default() -> Self {
		Self {
			filter: Document::new(),
			projection: None,
			sort: Vec::new(),
			skip: 0,
			limit: 0,
			batch_size: 0,
			prefetch: 0.25,
			hint: Vec::new(),
			max_scan: 0,
			max_time: None,
			snapshot: false,
			comment: None,
			log_replay: false,
			tailable: false,
			await_timeout: None,
		}
	}
}

impl QuerySpec {
	pub fn new(filter: Document) -> Self {
		Self {
			filter,
			..Default::default()
		}
	}
}

/// Options of an aggregation pipeline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipeOptions {
	pub allow_disk_use: bool,
	pub batch_size: u32,
	pub max_time: Option<Duration>,
}

/// Single operation of a bulk write
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOp {
	Insert(Document),
	Update {
		selector: Document,
		update: Document,
		multi: bool,
		upsert: bool,
	},
	Remove {
		selector: Document,
		multi: bool,
	},
}

/// Outcome of a bulk write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResult {
	pub inserted: u64,
	pub matched: u64,
	pub modified: u64,
	pub removed: u64,
	pub upserted: u64,
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	fn test_namespace_display() {
		assert_eq!(Namespace::new("app", "people").to_string(), "app.people");
	}

	#[rstest]
	fn test_strong_is_primary() {
		assert_eq!(Mode::STRONG, Mode::Primary);
		assert_eq!(Mode::default(), Mode::Primary);
	}

	#[rstest]
	#[case(&[3, 6], true)]
	#[case(&[4], true)]
	#[case(&[4, 4, 1], true)]
	#[case(&[4, 4, 2], false)]
	#[case(&[5], false)]
	fn test_version_at_least(#[case] wanted: &[i32], #[case] expected: bool) {
		let info = BuildInfo {
			version: "4.4.1".to_string(),
			version_array: vec![4, 4, 1, 0],
			..Default::default()
		};
		assert_eq!(info.version_at_least(wanted), expected);
	}

	#[rstest]
	fn test_query_spec_defaults() {
		let spec = QuerySpec::default();
		assert_eq!(spec.prefetch, 0.25);
		assert_eq!(spec.limit, 0);
		assert!(spec.filter.is_empty());
	}
}
