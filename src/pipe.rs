//! Aggregation pipeline handle

use bson::Document;
use serde::de::DeserializeOwned;

use crate::collection::Collection;
use crate::cursor::{Cursor, CursorOrigin};
use crate::error::{Error, Result};
use crate::types::PipeOptions;

/// Aggregation pipeline over a collection
///
/// Pipelines run as single attempts; only closing their cursor is retried.
#[derive(Debug, Clone)]
pub struct Pipe {
	collection: Collection,
	pipeline: Vec<Document>,
	options: PipeOptions,
	invalid: Option<Error>,
}

impl Pipe {
	pub(crate) fn new(collection: Collection, pipeline: Vec<Document>) -> Self {
		Self {
			collection,
			pipeline,
			options: PipeOptions::default(),
			invalid: None,
		}
	}

	pub(crate) fn failed(collection: Collection, err: Error) -> Self {
		Self {
			collection,
			pipeline: Vec::new(),
			options: PipeOptions::default(),
			invalid: Some(err),
		}
	}

	/// Let stages spill to temporary files on the server
	pub fn allow_disk_use(mut self) -> Self {
		self.options.allow_disk_use = true;
		self
	}

	/// Documents per batch
	pub fn batch(mut self, n: u32) -> Self {
		self.options.batch_size = n;
		self
	}

	pub fn pipeline(&self) -> &[Document] {
		&self.pipeline
	}

	/// Cursor over the pipeline output
	pub fn iter(self) -> Cursor {
		let Pipe {
			collection,
			pipeline,
			options,
			invalid,
		} = self;
		Cursor::lazy(
			collection.session,
			collection.ns,
			CursorOrigin::Aggregate { pipeline, options },
			invalid,
		)
	}

	/// Every output document
	pub async fn all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
		let mut iter = self.clone().iter();
		let mut out = Vec::new();
		while let Some(value) = iter.next().await {
			out.push(value);
		}
		if let Some(e) = iter.err() {
			let e = e.clone();
			let _ = iter.close().await;
			return Err(e);
		}
		iter.close().await?;
		Ok(out)
	}

	/// First output document
	///
	/// Fails with [`Error::NotFound`] when the pipeline outputs nothing.
	pub async fn one<T: DeserializeOwned>(&self) -> Result<T> {
		let mut iter = self.clone().batch(1).iter();
		let first = iter.next().await;
		let err = iter.err().cloned();
		let closed = iter.close().await;
		if let Some(e) = err {
			return Err(e);
		}
		closed?;
		first.ok_or(Error::NotFound)
	}
}
