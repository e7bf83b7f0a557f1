//! Read path and sorted-table format core of an LSM key/value store.
//!
//! The crate covers the immutable half of the tree: building and reading
//! sorted-string tables (restart-compressed blocks, per-table filters,
//! metaindex, index, footer), composing sorted streams with merging and
//! two-level iterators, and collapsing multi-version internal entries into a
//! snapshot-consistent view of user keys. The write path (logs, memtables,
//! compaction scheduling, manifests) lives in the surrounding database.

mod cache;
mod comparator;
mod db_iter;
mod error;
mod iter;
mod sstable;
mod vfs;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

pub use crate::cache::BlockCache;
pub use crate::comparator::{BytewiseComparator, Comparator, InternalKeyComparator};
pub use crate::db_iter::{new_db_iterator, DbIterator, ReadSampler};
pub use crate::error::{Error, Result};
pub use crate::iter::{new_empty_iterator, new_error_iterator, new_merging_iterator, MergingIterator};
pub use crate::sstable::bloom::BloomFilterPolicy;
pub use crate::sstable::meta::FileMetaData;
pub use crate::sstable::table::{Table, TableWriter};
pub use crate::sstable::two_level_iter::{new_two_level_iterator, BlockIterBuilder};
pub use crate::sstable::{
	InternalKey,
	InternalKeyKind,
	INTERNAL_KEY_KIND_FOR_SEEK,
	INTERNAL_KEY_SEQ_NUM_MAX,
};
pub use crate::vfs::RandomAccessFile;

/// The Key type used throughout the crate
pub type Key = Vec<u8>;

/// The Value type used throughout the crate
pub type Value = Vec<u8>;

/// Cursor over a sorted stream of key/value entries.
///
/// Every iterator in the crate speaks this interface: block iterators,
/// two-level table iterators, the merging iterator, the snapshot-collapsing
/// DB iterator, and the empty/error placeholders. Movement methods do not
/// return errors; a failed iterator parks itself in the invalid state and
/// reports the first failure through `status()`.
pub trait InternalIterator {
	/// Check if positioned on a valid entry.
	fn valid(&self) -> bool;

	/// Position at the first entry. The iterator is valid afterwards iff the
	/// source is not empty.
	fn seek_to_first(&mut self);

	/// Position at the last entry.
	fn seek_to_last(&mut self);

	/// Position at the first entry whose key is >= `target`.
	fn seek(&mut self, target: &[u8]);

	/// Move to the next entry. Requires `valid()`.
	fn next(&mut self);

	/// Move to the previous entry. Requires `valid()`.
	fn prev(&mut self);

	/// Current key. Requires `valid()`.
	fn key(&self) -> &[u8];

	/// Current value. Requires `valid()`.
	fn value(&self) -> &[u8];

	/// First error this iterator (or any of its children) encountered.
	fn status(&self) -> Result<()>;
}

/// FilterPolicy is an algorithm for probabilistically encoding a set of keys.
/// It is used to create the per-table filter block consulted on point reads.
pub trait FilterPolicy: Send + Sync {
	/// Return the name of this policy. Note that if the filter encoding
	/// changes in an incompatible way, the name returned by this method
	/// must be changed. Otherwise, old incompatible filters may be
	/// passed to methods of this type.
	fn name(&self) -> &str;

	/// `may_contain` returns whether the encoded filter may contain given key.
	/// False positives are possible, where it returns true for keys not in the
	/// original set.
	fn may_contain(&self, filter: &[u8], key: &[u8]) -> bool;

	/// Creates a filter based on given keys
	fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8>;
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CompressionType {
	None = 0,
	SnappyCompression = 1,
}

impl CompressionType {
	pub const fn as_str(&self) -> &'static str {
		match *self {
			Self::None => "none",
			Self::SnappyCompression => "snappy",
		}
	}
}

impl TryFrom<u8> for CompressionType {
	type Error = Error;

	fn try_from(byte: u8) -> Result<Self> {
		match byte {
			0 => Ok(Self::None),
			1 => Ok(Self::SnappyCompression),
			_ => Err(Error::corruption(format!("unknown compression type: {byte}"))),
		}
	}
}

/// Table construction and read configuration.
#[derive(Clone)]
pub struct Options {
	/// Orders user keys. Every table read or written with these options must
	/// use the same comparator.
	pub comparator: Arc<dyn Comparator>,
	pub(crate) internal_comparator: Arc<InternalKeyComparator>,

	/// Approximate uncompressed size of a data block before it is cut.
	pub block_size: usize,
	/// Number of entries between restart points in a data block.
	pub block_restart_interval: usize,
	pub compression: CompressionType,
	pub filter_policy: Option<Arc<dyn FilterPolicy>>,
	/// Shared cache for uncompressed data blocks. `None` means every block
	/// read goes to the file and the iterator owns the block privately.
	pub block_cache: Option<Arc<BlockCache>>,
	/// Verify block checksums on every read, not just when a `ReadOptions`
	/// asks for it.
	pub paranoid_checks: bool,
}

impl Default for Options {
	fn default() -> Self {
		let comparator: Arc<dyn Comparator> = Arc::new(BytewiseComparator::default());
		let internal_comparator = Arc::new(InternalKeyComparator::new(Arc::clone(&comparator)));

		Self {
			comparator,
			internal_comparator,
			block_size: 4 * 1024,
			block_restart_interval: 16,
			compression: CompressionType::SnappyCompression,
			filter_policy: Some(Arc::new(BloomFilterPolicy::new(10))),
			block_cache: Some(Arc::new(BlockCache::with_capacity_bytes(8 << 20))),
			paranoid_checks: false,
		}
	}
}

impl Options {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_comparator(mut self, value: Arc<dyn Comparator>) -> Self {
		self.internal_comparator = Arc::new(InternalKeyComparator::new(Arc::clone(&value)));
		self.comparator = value;
		self
	}

	pub const fn with_block_size(mut self, value: usize) -> Self {
		self.block_size = value;
		self
	}

	pub const fn with_block_restart_interval(mut self, value: usize) -> Self {
		self.block_restart_interval = value;
		self
	}

	pub const fn with_compression(mut self, value: CompressionType) -> Self {
		self.compression = value;
		self
	}

	pub fn with_filter_policy(mut self, value: Option<Arc<dyn FilterPolicy>>) -> Self {
		self.filter_policy = value;
		self
	}

	pub fn with_block_cache(mut self, value: Option<Arc<BlockCache>>) -> Self {
		self.block_cache = value;
		self
	}

	pub const fn with_paranoid_checks(mut self, value: bool) -> Self {
		self.paranoid_checks = value;
		self
	}
}

/// Per-read knobs; cheap to clone into long-lived iterators.
#[derive(Clone, Debug)]
pub struct ReadOptions {
	/// Verify the masked CRC of every block read for this operation.
	pub verify_checksums: bool,
	/// Insert blocks read for this operation into the block cache.
	pub fill_cache: bool,
}

impl Default for ReadOptions {
	fn default() -> Self {
		Self {
			verify_checksums: false,
			fill_cache: true,
		}
	}
}
