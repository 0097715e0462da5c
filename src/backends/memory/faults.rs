//! Fault injection for the in-memory driver

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::error::{Error, Result};

/// Driver operation a fault can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
	Refresh,
	Command,
	BuildInfo,
	Insert,
	Count,
	Create,
	Drop,
	CreateIndex,
	DropIndex,
	ListIndexes,
	Remove,
	Update,
	Find,
	Explain,
	FindAndModify,
	Distinct,
	MapReduce,
	Aggregate,
	GetMore,
	KillCursors,
	Bulk,
}

#[derive(Debug, Default)]
pub(crate) struct Faults {
	queued: HashMap<Op, VecDeque<Error>>,
	calls: HashMap<Op, usize>,
	/// Every operation fails with EOF until the next successful refresh
	severed: bool,
	refuse_dial: Option<String>,
	pub(crate) refresh_latency: Duration,
}

impl Faults {
	/// Record a call of `op` and return the fault it should fail with
	pub(crate) fn enter(&mut self, op: Op) -> Result<()> {
		*self.calls.entry(op).or_default() += 1;
		if self.severed && op != Op::Refresh {
			return Err(Error::EndOfStream);
		}
		match self.queued.get_mut(&op).and_then(VecDeque::pop_front) {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	pub(crate) fn queue(&mut self, op: Op, err: Error) {
		self.queued.entry(op).or_default().push_back(err);
	}

	pub(crate) fn clear_queue(&mut self) {
		self.queued.clear();
	}

	pub(crate) fn calls(&self, op: Op) -> usize {
		self.calls.get(&op).copied().unwrap_or(0)
	}

	pub(crate) fn reset_calls(&mut self) {
		self.calls.clear();
	}

	pub(crate) fn set_severed(&mut self, severed: bool) {
		self.severed = severed;
	}

	pub(crate) fn severed(&self) -> bool {
		self.severed
	}

	pub(crate) fn set_refuse_dial(&mut self, message: Option<String>) {
		self.refuse_dial = message;
	}

	pub(crate) fn refuse_dial(&self) -> Option<&str> {
		self.refuse_dial.as_deref()
	}
}
