//! Shared test fixtures.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::error::Result;
use crate::InternalIterator;

/// Iterator over an in-memory sorted entry list. Stands in for memtable and
/// table iterators in tests.
pub(crate) struct VecIter {
	cmp: Arc<dyn Comparator>,
	entries: Vec<(Vec<u8>, Vec<u8>)>,
	pos: Option<usize>,
}

impl VecIter {
	/// `entries` must already be sorted by `cmp`.
	pub(crate) fn new(cmp: Arc<dyn Comparator>, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
		for window in entries.windows(2) {
			debug_assert_eq!(cmp.compare(&window[0].0, &window[1].0), Ordering::Less);
		}
		Self {
			cmp,
			entries,
			pos: None,
		}
	}
}

impl InternalIterator for VecIter {
	fn valid(&self) -> bool {
		self.pos.is_some()
	}

	fn seek_to_first(&mut self) {
		self.pos = if self.entries.is_empty() {
			None
		} else {
			Some(0)
		};
	}

	fn seek_to_last(&mut self) {
		self.pos = self.entries.len().checked_sub(1);
	}

	fn seek(&mut self, target: &[u8]) {
		self.pos = self
			.entries
			.iter()
			.position(|(k, _)| self.cmp.compare(k, target) != Ordering::Less);
	}

	fn next(&mut self) {
		debug_assert!(self.valid());
		let next = self.pos.unwrap() + 1;
		self.pos = if next < self.entries.len() {
			Some(next)
		} else {
			None
		};
	}

	fn prev(&mut self) {
		debug_assert!(self.valid());
		self.pos = self.pos.unwrap().checked_sub(1);
	}

	fn key(&self) -> &[u8] {
		debug_assert!(self.valid());
		&self.entries[self.pos.unwrap()].0
	}

	fn value(&self) -> &[u8] {
		debug_assert!(self.valid());
		&self.entries[self.pos.unwrap()].1
	}

	fn status(&self) -> Result<()> {
		Ok(())
	}
}
