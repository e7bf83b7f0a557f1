use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quick_cache::sync::Cache as QCache;
use quick_cache::{Equivalent, Weighter};

use crate::sstable::block::Block;

pub type CacheId = u64;

// (table cache id, block offset within the file)
#[derive(Eq, std::hash::Hash, PartialEq)]
pub(crate) struct CacheKey {
	cache_id: CacheId,
	offset: u64,
}

impl From<(CacheId, u64)> for CacheKey {
	fn from(value: (CacheId, u64)) -> Self {
		Self {
			cache_id: value.0,
			offset: value.1,
		}
	}
}

impl Equivalent<CacheKey> for (CacheId, &u64) {
	/// Checks if a tuple `(CacheId, &u64)` is equivalent to a `CacheKey`.
	fn equivalent(&self, key: &CacheKey) -> bool {
		self.0 == key.cache_id && *self.1 == key.offset
	}
}

#[derive(Clone)]
struct BlockWeighter;

impl Weighter<CacheKey, Arc<Block>> for BlockWeighter {
	fn weight(&self, _: &CacheKey, block: &Arc<Block>) -> u64 {
		block.size() as u64
	}
}

/// Shared cache of uncompressed data blocks, keyed by `(cache_id, offset)`.
/// Each open table draws a process-unique `cache_id`, so blocks of different
/// files never collide even when file numbers are reused. Eviction drops the
/// cache's `Arc` only; live iterators keep their block alive.
pub struct BlockCache {
	data: QCache<CacheKey, Arc<Block>, BlockWeighter>,
	id: AtomicU64,
}

impl BlockCache {
	pub fn with_capacity_bytes(bytes: u64) -> Self {
		Self {
			data: QCache::with_weighter(10_000, bytes, BlockWeighter),
			id: AtomicU64::new(0),
		}
	}

	pub(crate) fn insert(&self, cache_id: CacheId, offset: u64, block: Arc<Block>) {
		self.data.insert((cache_id, offset).into(), block);
	}

	pub(crate) fn get(&self, cache_id: CacheId, offset: u64) -> Option<Arc<Block>> {
		let key = (cache_id, &offset);
		self.data.get(&key)
	}

	pub(crate) fn new_id(&self) -> CacheId {
		self.id.fetch_add(1, Ordering::SeqCst) + 1
	}
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;

	use super::*;

	fn empty_block() -> Arc<Block> {
		// A block with a single zero restart point
		Arc::new(Block::new(Bytes::from_static(&[0, 0, 0, 0, 1, 0, 0, 0])).unwrap())
	}

	#[test]
	fn test_insert_and_get() {
		let cache = BlockCache::with_capacity_bytes(1 << 20);
		let id = cache.new_id();
		assert!(cache.get(id, 0).is_none());

		cache.insert(id, 0, empty_block());
		assert!(cache.get(id, 0).is_some());
		assert!(cache.get(id, 1).is_none());
	}

	#[test]
	fn test_ids_do_not_collide() {
		let cache = BlockCache::with_capacity_bytes(1 << 20);
		let a = cache.new_id();
		let b = cache.new_id();
		assert_ne!(a, b);

		cache.insert(a, 0, empty_block());
		assert!(cache.get(b, 0).is_none());
	}
}
