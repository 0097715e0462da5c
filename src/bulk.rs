//! Batched writes

use serde::Serialize;

use crate::collection::{Collection, to_document};
use crate::error::{Error, Result};
use crate::types::{BulkOp, BulkResult};

/// Batch of writes sent together
///
/// Operations are queued locally and sent by [`Bulk::run`] in a single
/// attempt. Ordered batches stop at the first failing operation; call
/// [`Bulk::unordered`] to keep going past failures.
#[derive(Debug)]
pub struct Bulk {
	collection: Collection,
	ops: Vec<BulkOp>,
	ordered: bool,
	invalid: Option<Error>,
}

impl Bulk {
	pub(crate) fn new(collection: Collection) -> Self {
		Self {
			collection,
			ops: Vec::new(),
			ordered: true,
			invalid: None,
		}
	}

	fn push(&mut self, op: Result<BulkOp>) {
		match op {
			Ok(op) => self.ops.push(op),
			Err(e) => {
				if self.invalid.is_none() {
					self.invalid = Some(e);
				}
			}
		}
	}

	/// Keep executing after a failed operation
	pub fn unordered(&mut self) -> &mut Self {
		self.ordered = false;
		self
	}

	pub fn insert<D: Serialize>(&mut self, docs: &[D]) -> &mut Self {
		for doc in docs {
			self.push(to_document(doc).map(BulkOp::Insert));
		}
		self
	}

	fn push_update<S: Serialize, U: Serialize>(
		&mut self,
		selector: &S,
		update: &U,
		multi: bool,
		upsert: bool,
	) -> &mut Self {
		let op = to_document(selector).and_then(|selector| {
			Ok(BulkOp::Update {
				selector,
				update: to_document(update)?,
				multi,
				upsert,
			})
		});
		self.push(op);
		self
	}

	/// Queue an update of the first document matching `selector`
	pub fn update<S: Serialize, U: Serialize>(&mut self, selector: &S, update: &U) -> &mut Self {
		self.push_update(selector, update, false, false)
	}

	/// Queue an update of every document matching `selector`
	pub fn update_all<S: Serialize, U: Serialize>(&mut self, selector: &S, update: &U) -> &mut Self {
		self.push_update(selector, update, true, false)
	}

	pub fn upsert<S: Serialize, U: Serialize>(&mut self, selector: &S, update: &U) -> &mut Self {
		self.push_update(selector, update, false, true)
	}

	/// Queue removal of the first document matching `selector`
	pub fn remove<S: Serialize>(&mut self, selector: &S) -> &mut Self {
		let op = to_document(selector).map(|selector| BulkOp::Remove {
			selector,
			multi: false,
		});
		self.push(op);
		self
	}

	/// Queue removal of every document matching `selector`
	pub fn remove_all<S: Serialize>(&mut self, selector: &S) -> &mut Self {
		let op = to_document(selector).map(|selector| BulkOp::Remove {
			selector,
			multi: true,
		});
		self.push(op);
		self
	}

	/// Number of queued operations
	pub fn len(&self) -> usize {
		self.ops.len()
	}

	pub fn is_empty(&self) -> bool {
		self.ops.is_empty()
	}

	/// Send the queued operations
	pub async fn run(self) -> Result<BulkResult> {
		if let Some(e) = self.invalid {
			return Err(e);
		}
		let session = &self.collection.session;
		session.ensure_open()?;
		if self.ops.is_empty() {
			return Ok(BulkResult::default());
		}
		session
			.driver()
			.bulk(&self.collection.ns, &self.ops, self.ordered)
			.await
	}
}
