use crate::error::Result;
use crate::{InternalIterator, ReadOptions};

/// Builds an iterator over one data block from the value of an index entry
/// (an encoded block handle).
pub type BlockIterBuilder = Box<dyn Fn(&ReadOptions, &[u8]) -> Box<dyn InternalIterator>>;

/// Composes an index iterator with lazily instantiated data-block iterators.
///
/// The index entry's value identifies a data block; blocks are only opened
/// when the cursor actually moves into them, and the current block is reused
/// as long as the index position keeps referencing the same handle. The skip
/// loops walk over empty or error blocks so block boundaries and anomalies
/// are handled in one place.
pub(crate) struct TwoLevelIterator {
	index_iter: Box<dyn InternalIterator>,
	block_fn: BlockIterBuilder,
	read_opts: ReadOptions,
	data_iter: Option<Box<dyn InternalIterator>>,
	// Handle bytes the current data_iter was built from.
	data_block_handle: Vec<u8>,
	status: Result<()>,
}

pub fn new_two_level_iterator(
	index_iter: Box<dyn InternalIterator>,
	block_fn: BlockIterBuilder,
	read_opts: ReadOptions,
) -> Box<dyn InternalIterator> {
	Box::new(TwoLevelIterator {
		index_iter,
		block_fn,
		read_opts,
		data_iter: None,
		data_block_handle: Vec::new(),
		status: Ok(()),
	})
}

impl TwoLevelIterator {
	fn set_data_iter(&mut self, iter: Option<Box<dyn InternalIterator>>) {
		// Keep the first error of a block we are about to drop.
		if let Some(old) = &self.data_iter {
			if self.status.is_ok() {
				if let Err(e) = old.status() {
					self.status = Err(e);
				}
			}
		}
		self.data_iter = iter;
	}

	fn init_data_block(&mut self) {
		if !self.index_iter.valid() {
			self.set_data_iter(None);
			self.data_block_handle.clear();
			return;
		}

		let handle = self.index_iter.value();
		if self.data_iter.is_some() && self.data_block_handle == handle {
			// The cursor is still inside the block we already opened.
			return;
		}

		let handle = handle.to_vec();
		let iter = (self.block_fn)(&self.read_opts, &handle);
		self.data_block_handle = handle;
		self.set_data_iter(Some(iter));
	}

	fn data_iter_valid(&self) -> bool {
		self.data_iter.as_ref().is_some_and(|iter| iter.valid())
	}

	fn skip_empty_data_blocks_forward(&mut self) {
		while !self.data_iter_valid() {
			if !self.index_iter.valid() {
				self.set_data_iter(None);
				return;
			}
			self.index_iter.next();
			self.init_data_block();
			if let Some(iter) = self.data_iter.as_mut() {
				iter.seek_to_first();
			}
		}
	}

	fn skip_empty_data_blocks_backward(&mut self) {
		while !self.data_iter_valid() {
			if !self.index_iter.valid() {
				self.set_data_iter(None);
				return;
			}
			self.index_iter.prev();
			self.init_data_block();
			if let Some(iter) = self.data_iter.as_mut() {
				iter.seek_to_last();
			}
		}
	}
}

impl InternalIterator for TwoLevelIterator {
	fn valid(&self) -> bool {
		self.data_iter_valid()
	}

	fn seek_to_first(&mut self) {
		self.index_iter.seek_to_first();
		self.init_data_block();
		if let Some(iter) = self.data_iter.as_mut() {
			iter.seek_to_first();
		}
		self.skip_empty_data_blocks_forward();
	}

	fn seek_to_last(&mut self) {
		self.index_iter.seek_to_last();
		self.init_data_block();
		if let Some(iter) = self.data_iter.as_mut() {
			iter.seek_to_last();
		}
		self.skip_empty_data_blocks_backward();
	}

	fn seek(&mut self, target: &[u8]) {
		self.index_iter.seek(target);
		self.init_data_block();
		if let Some(iter) = self.data_iter.as_mut() {
			iter.seek(target);
		}
		self.skip_empty_data_blocks_forward();
	}

	fn next(&mut self) {
		debug_assert!(self.valid());
		self.data_iter.as_mut().unwrap().next();
		self.skip_empty_data_blocks_forward();
	}

	fn prev(&mut self) {
		debug_assert!(self.valid());
		self.data_iter.as_mut().unwrap().prev();
		self.skip_empty_data_blocks_backward();
	}

	fn key(&self) -> &[u8] {
		debug_assert!(self.valid());
		self.data_iter.as_ref().unwrap().key()
	}

	fn value(&self) -> &[u8] {
		debug_assert!(self.valid());
		self.data_iter.as_ref().unwrap().value()
	}

	fn status(&self) -> Result<()> {
		self.index_iter.status()?;
		if let Some(iter) = &self.data_iter {
			iter.status()?;
		}
		self.status.clone()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use test_log::test;

	use super::*;
	use crate::comparator::BytewiseComparator;
	use crate::error::Error;
	use crate::iter::new_error_iterator;
	use crate::testutil::VecIter;

	// An "index" whose values name synthetic blocks; the block function
	// resolves them against a fixed set of entry lists.
	fn block(entries: &[(&str, &str)]) -> Vec<(Vec<u8>, Vec<u8>)> {
		entries.iter().map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec())).collect()
	}

	fn make_iter(blocks: Vec<Vec<(Vec<u8>, Vec<u8>)>>) -> Box<dyn InternalIterator> {
		let cmp: Arc<dyn crate::comparator::Comparator> = Arc::new(BytewiseComparator::default());

		// Index entry i: separator = last key of block i, value = block
		// number. An empty block gets a separator just above its
		// predecessor's so the index stays sorted.
		let mut last_separator = Vec::new();
		let index_entries: Vec<(Vec<u8>, Vec<u8>)> = blocks
			.iter()
			.enumerate()
			.map(|(i, entries)| {
				let separator = match entries.last() {
					Some((k, _)) => k.clone(),
					None => {
						let mut filler = last_separator.clone();
						filler.extend_from_slice(&[0x01, i as u8]);
						filler
					}
				};
				last_separator.clone_from(&separator);
				(separator, vec![i as u8])
			})
			.collect();

		let index_iter = Box::new(VecIter::new(Arc::clone(&cmp), index_entries));
		let block_fn: BlockIterBuilder = Box::new(move |_, handle| {
			let i = handle[0] as usize;
			Box::new(VecIter::new(Arc::new(BytewiseComparator::default()), blocks[i].clone()))
		});
		new_two_level_iterator(index_iter, block_fn, ReadOptions::default())
	}

	fn collect_forward(iter: &mut Box<dyn InternalIterator>) -> Vec<String> {
		let mut keys = Vec::new();
		iter.seek_to_first();
		while iter.valid() {
			keys.push(String::from_utf8(iter.key().to_vec()).unwrap());
			iter.next();
		}
		keys
	}

	#[test]
	fn test_walks_all_blocks() {
		let mut iter = make_iter(vec![
			block(&[("a", "1"), ("b", "2")]),
			block(&[("c", "3")]),
			block(&[("d", "4"), ("e", "5")]),
		]);

		assert_eq!(collect_forward(&mut iter), vec!["a", "b", "c", "d", "e"]);

		let mut backward = Vec::new();
		iter.seek_to_last();
		while iter.valid() {
			backward.push(String::from_utf8(iter.key().to_vec()).unwrap());
			iter.prev();
		}
		assert_eq!(backward, vec!["e", "d", "c", "b", "a"]);
		assert!(iter.status().is_ok());
	}

	#[test]
	fn test_skips_empty_blocks() {
		let mut iter = make_iter(vec![
			block(&[]),
			block(&[("b", "2")]),
			block(&[]),
			block(&[]),
			block(&[("e", "5")]),
			block(&[]),
		]);

		assert_eq!(collect_forward(&mut iter), vec!["b", "e"]);

		iter.seek_to_last();
		assert!(iter.valid());
		assert_eq!(iter.key(), b"e");
		iter.prev();
		assert!(iter.valid());
		assert_eq!(iter.key(), b"b");
		iter.prev();
		assert!(!iter.valid());
	}

	#[test]
	fn test_seek_crosses_block_boundary() {
		let mut iter = make_iter(vec![
			block(&[("a", "1"), ("c", "3")]),
			block(&[("e", "5"), ("g", "7")]),
		]);

		iter.seek(b"d");
		assert!(iter.valid());
		assert_eq!(iter.key(), b"e");

		iter.seek(b"c");
		assert!(iter.valid());
		assert_eq!(iter.key(), b"c");
		iter.next();
		assert_eq!(iter.key(), b"e");

		iter.seek(b"z");
		assert!(!iter.valid());
	}

	#[test]
	fn test_error_block_surfaces_in_status() {
		let cmp = Arc::new(BytewiseComparator::default());
		let index_iter = Box::new(VecIter::new(
			cmp,
			vec![(b"m".to_vec(), vec![0])],
		));
		let block_fn: BlockIterBuilder =
			Box::new(|_, _| new_error_iterator(Error::corruption("bad block")));
		let mut iter = new_two_level_iterator(index_iter, block_fn, ReadOptions::default());

		iter.seek_to_first();
		assert!(!iter.valid());
		assert!(matches!(iter.status(), Err(Error::Corruption(_))));
	}
}
