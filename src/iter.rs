use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::InternalIterator;

/// Iterator over nothing, optionally parked on an error. Stands in wherever
/// a real iterator could not be built so callers still get the uniform
/// valid/status protocol.
struct EmptyIterator {
	status: Result<()>,
}

impl InternalIterator for EmptyIterator {
	fn valid(&self) -> bool {
		false
	}

	fn seek_to_first(&mut self) {}

	fn seek_to_last(&mut self) {}

	fn seek(&mut self, _target: &[u8]) {}

	fn next(&mut self) {
		debug_assert!(false, "next() on an empty iterator");
	}

	fn prev(&mut self) {
		debug_assert!(false, "prev() on an empty iterator");
	}

	fn key(&self) -> &[u8] {
		debug_assert!(false, "key() on an empty iterator");
		&[]
	}

	fn value(&self) -> &[u8] {
		debug_assert!(false, "value() on an empty iterator");
		&[]
	}

	fn status(&self) -> Result<()> {
		self.status.clone()
	}
}

pub fn new_empty_iterator() -> Box<dyn InternalIterator> {
	Box::new(EmptyIterator {
		status: Ok(()),
	})
}

pub fn new_error_iterator(e: Error) -> Box<dyn InternalIterator> {
	Box::new(EmptyIterator {
		status: Err(e),
	})
}

#[derive(Clone, Copy, PartialEq)]
enum Direction {
	Forward,
	Reverse,
}

/// N-way merge over sorted child iterators, bidirectional.
///
/// `current` always names the child the cursor rests on. While moving
/// forward, every other child is already positioned at its first entry
/// strictly greater than `key()`; while moving in reverse, at its last entry
/// strictly less than `key()`. Direction switches restore that invariant by
/// re-seeking the non-current children before the cursor moves.
///
/// The number of children is expected to stay single-digit (memtables plus a
/// handful of level runs), so positioning scans the children linearly.
pub struct MergingIterator {
	cmp: Arc<dyn Comparator>,
	children: Vec<Box<dyn InternalIterator>>,
	current: Option<usize>,
	direction: Direction,
}

/// Merge `children` into one sorted stream. Zero children collapse to an
/// empty iterator and a single child is returned as-is.
pub fn new_merging_iterator(
	cmp: Arc<dyn Comparator>,
	mut children: Vec<Box<dyn InternalIterator>>,
) -> Box<dyn InternalIterator> {
	match children.len() {
		0 => new_empty_iterator(),
		1 => children.pop().unwrap(),
		_ => Box::new(MergingIterator::new(cmp, children)),
	}
}

impl MergingIterator {
	pub fn new(cmp: Arc<dyn Comparator>, children: Vec<Box<dyn InternalIterator>>) -> Self {
		Self {
			cmp,
			children,
			current: None,
			direction: Direction::Forward,
		}
	}

	fn find_smallest(&mut self) {
		let mut smallest: Option<usize> = None;
		for i in 0..self.children.len() {
			if !self.children[i].valid() {
				continue;
			}
			smallest = match smallest {
				None => Some(i),
				Some(s)
					if self.cmp.compare(self.children[i].key(), self.children[s].key())
						== Ordering::Less =>
				{
					Some(i)
				}
				s => s,
			};
		}
		self.current = smallest;
	}

	fn find_largest(&mut self) {
		let mut largest: Option<usize> = None;
		for i in (0..self.children.len()).rev() {
			if !self.children[i].valid() {
				continue;
			}
			largest = match largest {
				None => Some(i),
				Some(l)
					if self.cmp.compare(self.children[i].key(), self.children[l].key())
						== Ordering::Greater =>
				{
					Some(i)
				}
				l => l,
			};
		}
		self.current = largest;
	}
}

impl InternalIterator for MergingIterator {
	fn valid(&self) -> bool {
		self.current.is_some()
	}

	fn seek_to_first(&mut self) {
		for child in self.children.iter_mut() {
			child.seek_to_first();
		}
		self.find_smallest();
		self.direction = Direction::Forward;
	}

	fn seek_to_last(&mut self) {
		for child in self.children.iter_mut() {
			child.seek_to_last();
		}
		self.find_largest();
		self.direction = Direction::Reverse;
	}

	fn seek(&mut self, target: &[u8]) {
		for child in self.children.iter_mut() {
			child.seek(target);
		}
		self.find_smallest();
		self.direction = Direction::Forward;
	}

	fn next(&mut self) {
		debug_assert!(self.valid());

		// Ensure that all children are positioned after key(). If we are
		// moving in the forward direction, this is already true for all of
		// the non-current children since current is the smallest child and
		// key() == current.key(). Otherwise, we explicitly position the
		// non-current children.
		if self.direction != Direction::Forward {
			let current = self.current.unwrap();
			let target = self.children[current].key().to_vec();
			for i in 0..self.children.len() {
				if i == current {
					continue;
				}
				let child = &mut self.children[i];
				child.seek(&target);
				if child.valid() && self.cmp.compare(&target, child.key()) == Ordering::Equal {
					child.next();
				}
			}
			self.direction = Direction::Forward;
		}

		self.children[self.current.unwrap()].next();
		self.find_smallest();
	}

	fn prev(&mut self) {
		debug_assert!(self.valid());

		// Mirror image of next(): all children must end up positioned before
		// key() before the cursor itself steps back.
		if self.direction != Direction::Reverse {
			let current = self.current.unwrap();
			let target = self.children[current].key().to_vec();
			for i in 0..self.children.len() {
				if i == current {
					continue;
				}
				let child = &mut self.children[i];
				child.seek(&target);
				if child.valid() {
					// Child is at first entry >= key(); step back to be < key()
					child.prev();
				} else {
					// Child has no entries >= key(); position at its last entry
					child.seek_to_last();
				}
			}
			self.direction = Direction::Reverse;
		}

		self.children[self.current.unwrap()].prev();
		self.find_largest();
	}

	fn key(&self) -> &[u8] {
		debug_assert!(self.valid());
		self.children[self.current.unwrap()].key()
	}

	fn value(&self) -> &[u8] {
		debug_assert!(self.valid());
		self.children[self.current.unwrap()].value()
	}

	fn status(&self) -> Result<()> {
		for child in &self.children {
			child.status()?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;
	use crate::comparator::BytewiseComparator;
	use crate::testutil::VecIter;

	fn cmp() -> Arc<dyn Comparator> {
		Arc::new(BytewiseComparator::default())
	}

	fn child(entries: &[(&str, &str)]) -> Box<dyn InternalIterator> {
		Box::new(VecIter::new(
			cmp(),
			entries
				.iter()
				.map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
				.collect(),
		))
	}

	#[test]
	fn test_empty_iterator_reports_status() {
		let iter = new_empty_iterator();
		assert!(!iter.valid());
		assert!(iter.status().is_ok());

		let iter = new_error_iterator(Error::corruption("boom"));
		assert!(!iter.valid());
		assert!(matches!(iter.status(), Err(Error::Corruption(_))));
	}

	#[test]
	fn test_zero_and_one_child_shortcuts() {
		let mut iter = new_merging_iterator(cmp(), vec![]);
		iter.seek_to_first();
		assert!(!iter.valid());

		let mut iter = new_merging_iterator(cmp(), vec![child(&[("a", "1")])]);
		iter.seek_to_first();
		assert!(iter.valid());
		assert_eq!(iter.key(), b"a");
	}

	#[test]
	fn test_merge_forward() {
		let mut iter = MergingIterator::new(
			cmp(),
			vec![
				child(&[("a", "1"), ("d", "4"), ("g", "7")]),
				child(&[("b", "2"), ("e", "5")]),
				child(&[("c", "3"), ("f", "6")]),
			],
		);

		let mut keys = Vec::new();
		iter.seek_to_first();
		while iter.valid() {
			keys.push(String::from_utf8(iter.key().to_vec()).unwrap());
			iter.next();
		}
		assert_eq!(keys, vec!["a", "b", "c", "d", "e", "f", "g"]);
		assert!(iter.status().is_ok());
	}

	#[test]
	fn test_merge_reverse() {
		let mut iter = MergingIterator::new(
			cmp(),
			vec![child(&[("a", "1"), ("d", "4")]), child(&[("b", "2"), ("c", "3")])],
		);

		let mut keys = Vec::new();
		iter.seek_to_last();
		while iter.valid() {
			keys.push(String::from_utf8(iter.key().to_vec()).unwrap());
			iter.prev();
		}
		assert_eq!(keys, vec!["d", "c", "b", "a"]);
	}

	#[test]
	fn test_merge_seek() {
		let mut iter = MergingIterator::new(
			cmp(),
			vec![child(&[("a", "1"), ("e", "5")]), child(&[("c", "3"), ("g", "7")])],
		);

		iter.seek(b"d");
		assert!(iter.valid());
		assert_eq!(iter.key(), b"e");

		iter.seek(b"c");
		assert_eq!(iter.key(), b"c");

		iter.seek(b"z");
		assert!(!iter.valid());
	}

	#[test]
	fn test_direction_switch_no_duplicates() {
		// "b" lives in one child, its neighbors in the other; switching
		// direction on top of it must not replay or skip entries.
		let mut iter = MergingIterator::new(
			cmp(),
			vec![child(&[("a", "1"), ("c", "3")]), child(&[("b", "2"), ("d", "4")])],
		);

		iter.seek_to_first();
		iter.next(); // at "b"
		assert_eq!(iter.key(), b"b");

		iter.prev(); // reverse on top of "b"
		assert_eq!(iter.key(), b"a");

		iter.next(); // forward again
		assert_eq!(iter.key(), b"b");
		iter.next();
		assert_eq!(iter.key(), b"c");

		iter.prev();
		assert_eq!(iter.key(), b"b");
		iter.prev();
		assert_eq!(iter.key(), b"a");
		iter.prev();
		assert!(!iter.valid());
	}

	#[test]
	fn test_duplicate_keys_across_children_keep_child_order() {
		// Same key in two children: the earlier child wins going forward
		let mut iter = MergingIterator::new(
			cmp(),
			vec![child(&[("k", "first")]), child(&[("k", "second")])],
		);

		iter.seek_to_first();
		assert_eq!(iter.value(), b"first");
		iter.next();
		assert_eq!(iter.value(), b"second");
		iter.next();
		assert!(!iter.valid());
	}

	proptest! {
		/// Forward iteration over any set of children equals the sorted,
		/// merged entry list.
		#[test]
		fn prop_merge_equals_sorted_model(
			children_data in prop::collection::vec(
				prop::collection::btree_set(prop::collection::vec(prop::num::u8::ANY, 1..4), 0..12),
				1..5
			)
		) {
			// Tag values by child so duplicates across children stay distinct
			let children: Vec<Box<dyn InternalIterator>> = children_data
				.iter()
				.enumerate()
				.map(|(ci, keys)| {
					let entries: Vec<(Vec<u8>, Vec<u8>)> =
						keys.iter().map(|k| (k.clone(), vec![ci as u8])).collect();
					Box::new(VecIter::new(cmp(), entries)) as Box<dyn InternalIterator>
				})
				.collect();

			let mut model: Vec<(Vec<u8>, Vec<u8>)> = children_data
				.iter()
				.enumerate()
				.flat_map(|(ci, keys)| keys.iter().map(move |k| (k.clone(), vec![ci as u8])))
				.collect();
			// Stable sort keeps lower child index first on equal keys, which
			// matches find_smallest's tie break.
			model.sort_by(|a, b| a.0.cmp(&b.0));

			let mut iter = MergingIterator::new(cmp(), children);
			let mut merged = Vec::new();
			iter.seek_to_first();
			while iter.valid() {
				merged.push((iter.key().to_vec(), iter.value().to_vec()));
				iter.next();
			}

			prop_assert_eq!(&merged, &model);

			// And the reverse direction is its mirror
			let mut reversed = Vec::new();
			iter.seek_to_last();
			while iter.valid() {
				reversed.push((iter.key().to_vec(), iter.value().to_vec()));
				iter.prev();
			}
			reversed.reverse();
			prop_assert_eq!(&reversed, &model);
		}

		/// A random walk of next/prev calls matches the same walk over the
		/// materialized merged list. Keys are unique across children, as
		/// internal keys are in practice.
		#[test]
		fn prop_direction_switches_match_model(
			keys in prop::collection::btree_set(prop::collection::vec(prop::num::u8::ANY, 1..4), 1..24),
			num_children in 1usize..4,
			moves in prop::collection::vec(prop::bool::ANY, 1..40)
		) {
			// Deal the sorted keys round-robin onto the children
			let mut children_data: Vec<Vec<(Vec<u8>, Vec<u8>)>> = vec![Vec::new(); num_children];
			for (i, k) in keys.iter().enumerate() {
				children_data[i % num_children].push((k.clone(), vec![(i % num_children) as u8]));
			}

			let children: Vec<Box<dyn InternalIterator>> = children_data
				.iter()
				.map(|entries| {
					Box::new(VecIter::new(cmp(), entries.clone())) as Box<dyn InternalIterator>
				})
				.collect();

			let mut model: Vec<(Vec<u8>, Vec<u8>)> =
				children_data.iter().flat_map(|entries| entries.iter().cloned()).collect();
			model.sort_by(|a, b| a.0.cmp(&b.0));
			prop_assume!(!model.is_empty());

			let mut iter = MergingIterator::new(cmp(), children);
			iter.seek_to_first();
			let mut model_pos: usize = 0;

			for forward in moves {
				// Re-anchor whenever either side runs off an end
				if !iter.valid() {
					iter.seek_to_first();
					model_pos = 0;
				}
				prop_assert!(iter.valid());
				prop_assert_eq!(iter.key(), model[model_pos].0.as_slice());
				prop_assert_eq!(iter.value(), model[model_pos].1.as_slice());

				if forward {
					iter.next();
					model_pos += 1;
				} else if model_pos == 0 {
					iter.prev();
					prop_assert!(!iter.valid());
					iter.seek_to_first();
					model_pos = 0;
				} else {
					iter.prev();
					model_pos -= 1;
				}

				if model_pos >= model.len() {
					prop_assert!(!iter.valid());
				} else if model_pos > 0 || !forward {
					// Position must agree whenever the model is in range
					prop_assert!(iter.valid());
					prop_assert_eq!(iter.key(), model[model_pos].0.as_slice());
				}
			}
		}
	}
}
