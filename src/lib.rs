//! # mongo-resilient
//!
//! Connection-resilient session handles for MongoDB.
//!
//! Pooled connections to a MongoDB cluster die silently: the server or a
//! load balancer closes idle sockets and the next operation fails with an
//! end-of-stream or socket error. The handles in this crate wrap every
//! operation in a bounded retry envelope. When an attempt fails with a
//! transient network error, the session refreshes its connections and tries
//! again, up to a per-session budget. Any other error is returned at once.
//!
//! ## Handles
//!
//! - [`Session`]: owns the shared [`Driver`], the database name and the retry
//!   budget. Clones and [`Session::db`] views share the connections.
//! - [`Collection`]: inserts, updates, removals, index management.
//! - [`Query`] and [`Cursor`]: fluent queries and result iteration.
//! - [`Pipe`] and [`Bulk`]: aggregation pipelines and batched writes.
//!
//! ## Drivers
//!
//! - `MemoryDriver` (feature `memory`): process-local driver with fault
//!   injection, used by the test suites.
//! - `MongoDriver` (feature `mongodb`): the official MongoDB client.
//!
//! ## Feature Flags
//!
//! - `memory` (default) - In-memory driver for tests
//! - `mongodb` - Real cluster driver and [`Session::connect`]
//!
//! ## Quick Example
//!
//! ```rust
//! use mongo_resilient::{MemoryDriver, Session};
//! use serde::{Deserialize, Serialize};
//! use bson::doc;
//!
//! #[derive(Debug, Serialize, Deserialize, PartialEq)]
//! struct Person {
//!     name: String,
//!     age: i32,
//! }
//!
//! # async fn example() -> mongo_resilient::Result<()> {
//! let session = Session::connect_with(&MemoryDriver::new(), "mem://localhost/app").await?;
//! let people = session.collection("people");
//!
//! people
//!     .insert(&[Person { name: "Ada".into(), age: 36 }])
//!     .await?;
//! let ada: Person = people.find(&doc! { "name": "Ada" }).one().await?;
//! assert_eq!(ada.age, 36);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod bulk;
pub mod classify;
pub mod collection;
pub mod config;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod index;
pub mod pipe;
pub mod query;
pub mod session;
pub mod target;
pub mod types;

#[cfg(feature = "memory")]
pub use backends::memory::{MemoryDriver, Op};
#[cfg(feature = "mongodb")]
pub use backends::mongodb::{MongoDialer, MongoDriver};
pub use bulk::Bulk;
pub use classify::{FailurePolicy, is_network_error};
pub use collection::Collection;
pub use config::SessionConfig;
pub use cursor::{Cursor, CursorState};
pub use driver::{Dialer, Driver, DriverCursor};
pub use error::{Error, Result};
pub use index::{Index, IndexKey, parse_index_key, parse_sort};
pub use pipe::Pipe;
pub use query::Query;
pub use session::Session;
pub use target::{ConnectTarget, DEFAULT_MAX_RETRIES, mask_url_password};
pub use types::{
	BuildInfo, BulkOp, BulkResult, Change, ChangeInfo, CollectionInfo, MapReduce, MapReduceInfo,
	Mode, Namespace, PipeOptions, QuerySpec,
};

/// Re-export of the BSON crate used in the public API
pub use bson;
