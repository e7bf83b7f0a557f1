use std::sync::Arc;

use bytes::Bytes;
use integer_encoding::{FixedInt, FixedIntWriter};

use crate::FilterPolicy;

pub(crate) const FILTER_BASE_LOG2: u32 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LOG2; // one filter per 2 KiB of file offsets
const FILTER_META_LENGTH: usize = 5; // 4 bytes offset-array position + 1 byte base log

/// Builds the per-table filter block: one filter per 2 KiB window of data
/// block offsets, so the reader can locate the right filter from a block's
/// offset alone.
pub(crate) struct FilterBlockWriter {
	policy: Arc<dyn FilterPolicy>,
	// Keys accumulated since the last generated filter.
	keys: Vec<Vec<u8>>,
	// The generated filters, concatenated.
	filters: Vec<u8>,
	// Start offset of each filter within `filters`.
	filter_offsets: Vec<u32>,
}

impl FilterBlockWriter {
	pub(crate) fn new(policy: Arc<dyn FilterPolicy>) -> Self {
		Self {
			policy,
			keys: vec![],
			filter_offsets: vec![],
			filters: vec![],
		}
	}

	/// Adds a key to the set that will be folded into the next filter.
	pub(crate) fn add_key(&mut self, key: &[u8]) {
		self.keys.push(Vec::from(key));
	}

	/// Notes that a new data block starts at `block_offset`, emitting filters
	/// (possibly empty ones) until the window containing that offset is
	/// reached.
	pub(crate) fn start_block(&mut self, block_offset: u64) {
		let filter_index = block_offset / FILTER_BASE;
		assert!(filter_index >= self.filter_offsets.len() as u64);
		while filter_index > self.filter_offsets.len() as u64 {
			self.generate_filter();
		}
	}

	fn generate_filter(&mut self) {
		self.filter_offsets.push(self.filters.len() as u32);
		if self.keys.is_empty() {
			// An empty window produces an empty filter, which matches nothing.
			return;
		}

		let filter = self.policy.create_filter(&self.keys);
		self.filters.extend(filter);
		self.keys.clear();
	}

	pub(crate) fn filter_name(&self) -> &str {
		self.policy.name()
	}

	/// Finalizes the filter block: trailing filter, the offset array, a
	/// fixed32 pointing at the array start, and the base log byte.
	pub(crate) fn finish(mut self) -> Vec<u8> {
		if !self.keys.is_empty() {
			self.generate_filter();
		}

		let mut result = self.filters;
		let array_offset = result.len() as u32;
		for offset in self.filter_offsets {
			result.write_fixedint(offset).expect("filter write failed");
		}
		result.write_fixedint(array_offset).expect("filter write failed");
		result.push(FILTER_BASE_LOG2 as u8);

		result
	}
}

/// Reads a filter block. A structurally malformed block yields a reader that
/// answers "maybe" for every query, which keeps lookups correct at the cost
/// of the filter's selectivity.
#[derive(Clone)]
pub(crate) struct FilterBlockReader {
	policy: Arc<dyn FilterPolicy>,
	data: Bytes,
	// Start of the offset array within `data`; filters live below it.
	offsets_start: usize,
	num_filters: usize,
	base_lg: u32,
}

impl FilterBlockReader {
	pub(crate) fn new(data: Bytes, policy: Arc<dyn FilterPolicy>) -> Self {
		let mut reader = Self {
			policy,
			data,
			offsets_start: 0,
			num_filters: 0,
			base_lg: 0,
		};

		let n = reader.data.len();
		if n < FILTER_META_LENGTH {
			return reader;
		}
		let base_lg = reader.data[n - 1] as u32;
		let array_offset =
			u32::decode_fixed(&reader.data[n - FILTER_META_LENGTH..n - 1]).unwrap() as usize;
		if array_offset > n - FILTER_META_LENGTH {
			return reader;
		}

		reader.base_lg = base_lg;
		reader.offsets_start = array_offset;
		reader.num_filters = (n - FILTER_META_LENGTH - array_offset) / 4;
		reader
	}

	fn filter_offset(&self, index: usize) -> usize {
		let at = self.offsets_start + index * 4;
		u32::decode_fixed(&self.data[at..at + 4]).unwrap() as usize
	}

	/// Checks whether `key` may be present in the filter covering the data
	/// block that starts at `block_offset`.
	pub(crate) fn may_contain(&self, key: &[u8], block_offset: u64) -> bool {
		let index = (block_offset >> self.base_lg) as usize;
		if index >= self.num_filters {
			// Out of range or unparseable block; err on the side of a match.
			return true;
		}

		let start = self.filter_offset(index);
		let limit = if index + 1 < self.num_filters {
			self.filter_offset(index + 1)
		} else {
			self.offsets_start
		};

		if start == limit {
			// Empty filter: no keys were mapped to this window.
			return false;
		}
		if start < limit && limit <= self.offsets_start {
			return self.policy.may_contain(&self.data[start..limit], key);
		}
		true
	}
}

#[cfg(test)]
mod tests {
	use test_log::test;

	use super::*;
	use crate::sstable::bloom::BloomFilterPolicy;

	fn policy() -> Arc<dyn FilterPolicy> {
		Arc::new(BloomFilterPolicy::new(10))
	}

	fn reader(block: Vec<u8>) -> FilterBlockReader {
		FilterBlockReader::new(Bytes::from(block), policy())
	}

	#[test]
	fn test_empty() {
		let w = FilterBlockWriter::new(policy());
		let block = w.finish();
		assert_eq!(&[0, 0, 0, 0, FILTER_BASE_LOG2 as u8][..], &*block);

		let r = reader(block);
		assert!(r.may_contain("foo".as_bytes(), 0));
		assert!(r.may_contain("foo".as_bytes(), 10000));
	}

	#[test]
	fn test_single_filter() {
		let mut w = FilterBlockWriter::new(policy());
		w.start_block(100);
		w.add_key("foo".as_bytes());
		w.add_key("bar".as_bytes());
		w.add_key("box".as_bytes());

		w.start_block(200);
		w.add_key("box".as_bytes());
		w.start_block(300);
		w.add_key("hello".as_bytes());

		let r = reader(w.finish());
		assert!(r.may_contain("foo".as_bytes(), 100));
		assert!(r.may_contain("bar".as_bytes(), 100));
		assert!(r.may_contain("box".as_bytes(), 100));
		assert!(r.may_contain("hello".as_bytes(), 100));
		assert!(!r.may_contain("missing".as_bytes(), 100));
		assert!(!r.may_contain("other".as_bytes(), 100));
	}

	#[test]
	fn test_multiple_filters() {
		let mut w = FilterBlockWriter::new(policy());

		// First filter
		w.start_block(0);
		w.add_key("foo".as_bytes());
		w.start_block(2000);
		w.add_key("bar".as_bytes());

		// Second filter
		w.start_block(3100);
		w.add_key("box".as_bytes());

		// Third filter is empty

		// Last filter
		w.start_block(9000);
		w.add_key("box".as_bytes());
		w.add_key("hello".as_bytes());

		let r = reader(w.finish());

		// First filter
		assert!(r.may_contain("foo".as_bytes(), 0));
		assert!(r.may_contain("bar".as_bytes(), 2000));
		assert!(!r.may_contain("box".as_bytes(), 0));
		assert!(!r.may_contain("hello".as_bytes(), 0));

		// Second filter
		assert!(r.may_contain("box".as_bytes(), 3100));
		assert!(!r.may_contain("foo".as_bytes(), 3100));
		assert!(!r.may_contain("bar".as_bytes(), 3100));
		assert!(!r.may_contain("hello".as_bytes(), 3100));

		// Third (empty) filter is a definitive miss
		assert!(!r.may_contain("box".as_bytes(), 4100));
		assert!(!r.may_contain("foo".as_bytes(), 4100));

		// Last filter
		assert!(r.may_contain("box".as_bytes(), 9000));
		assert!(r.may_contain("hello".as_bytes(), 9000));
		assert!(!r.may_contain("foo".as_bytes(), 9000));
		assert!(!r.may_contain("bar".as_bytes(), 9000));
	}

	#[test]
	fn test_malformed_block_matches_everything() {
		// Too short to carry the trailing metadata
		let r = reader(vec![1, 2, 3]);
		assert!(r.may_contain("anything".as_bytes(), 0));

		// Offset array position points past the data
		let mut block = vec![0u8; 9];
		block[4..8].copy_from_slice(&100u32.to_le_bytes());
		block[8] = FILTER_BASE_LOG2 as u8;
		let r = reader(block);
		assert!(r.may_contain("anything".as_bytes(), 0));
		assert!(r.may_contain("anything".as_bytes(), 1 << 20));
	}

	#[test]
	fn test_filter_block_many_keys() {
		let mut w = FilterBlockWriter::new(policy());
		w.start_block(0);

		let num_items = 10001;
		let mut keys = Vec::with_capacity(num_items);
		for i in 0..num_items {
			let key = format!("key_{i:05}").into_bytes();
			w.add_key(&key);
			keys.push(key);
		}

		let r = reader(w.finish());

		// No false negatives
		for key in &keys {
			assert!(r.may_contain(key, 0), "key should be found in the filter");
		}

		// Bounded false positive rate for keys never added
		let num_samples = 1000;
		let mut false_positives = 0;
		for i in 0..num_samples {
			let key = format!("nonexistent_{:05}", i + num_items).into_bytes();
			if r.may_contain(&key, 0) {
				false_positives += 1;
			}
		}

		let rate = (false_positives as f64 / num_samples as f64) * 100.0;
		assert!(rate < 2.0, "false positive rate too high: {rate:.2}%");
	}
}
