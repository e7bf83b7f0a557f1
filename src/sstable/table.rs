use std::cmp::Ordering;
use std::io::Write;
use std::mem;
use std::sync::Arc;

use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};
use integer_encoding::{FixedInt, FixedIntWriter};
use snap::raw::max_compress_len;

use crate::cache::CacheId;
use crate::comparator::{BytewiseComparator, Comparator};
use crate::error::{Error, Result};
use crate::iter::new_error_iterator;
use crate::sstable::block::{
	Block,
	BlockData,
	BlockHandle,
	BlockWriter,
	BLOCK_HANDLE_MAX_ENCODED_LENGTH,
};
use crate::sstable::filter_block::{FilterBlockReader, FilterBlockWriter};
use crate::sstable::meta::FileMetaData;
use crate::sstable::two_level_iter::{new_two_level_iterator, BlockIterBuilder};
use crate::sstable::InternalKey;
use crate::vfs::RandomAccessFile;
use crate::{CompressionType, FilterPolicy, InternalIterator, Options, ReadOptions};

/// Footer: metaindex handle, index handle, zero padding, magic number.
pub(crate) const FOOTER_ENCODED_LENGTH: usize = 2 * BLOCK_HANDLE_MAX_ENCODED_LENGTH + 8;
/// 0xdb4775248b80fb57, stored little-endian.
const FOOTER_MAGIC: [u8; 8] = [0x57, 0xfb, 0x80, 0x8b, 0x24, 0x75, 0x47, 0xdb];

/// Every physical block is followed by a one-byte compression type and a
/// masked fixed32 CRC over contents-plus-type.
pub(crate) const BLOCK_TRAILER_LENGTH: usize = 5;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const MASK_DELTA: u32 = 0xa282_ead8;

/// Masks a CRC so that storing a CRC of data that itself contains CRCs stays
/// well distributed.
pub(crate) fn mask(crc: u32) -> u32 {
	crc.rotate_right(15).wrapping_add(MASK_DELTA)
}

/// Return the crc whose masked representation is `masked`.
pub(crate) fn unmask(masked: u32) -> u32 {
	masked.wrapping_sub(MASK_DELTA).rotate_left(15)
}

fn trailer_checksum(contents: &[u8], compression: u8) -> u32 {
	let mut digest = CRC32C.digest();
	digest.update(contents);
	digest.update(&[compression]);
	digest.finalize()
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Footer {
	pub(crate) metaindex: BlockHandle,
	pub(crate) index: BlockHandle,
}

impl Footer {
	pub(crate) fn new(metaindex: BlockHandle, index: BlockHandle) -> Footer {
		Footer {
			metaindex,
			index,
		}
	}

	pub(crate) fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(FOOTER_ENCODED_LENGTH);
		buf.extend_from_slice(&self.metaindex.encode());
		buf.extend_from_slice(&self.index.encode());
		buf.resize(FOOTER_ENCODED_LENGTH - FOOTER_MAGIC.len(), 0);
		buf.extend_from_slice(&FOOTER_MAGIC);
		buf
	}

	pub(crate) fn decode(buf: &[u8]) -> Result<Footer> {
		if buf.len() < FOOTER_ENCODED_LENGTH {
			return Err(Error::corruption("footer too short"));
		}
		let magic = &buf[FOOTER_ENCODED_LENGTH - FOOTER_MAGIC.len()..FOOTER_ENCODED_LENGTH];
		if magic != FOOTER_MAGIC {
			return Err(Error::corruption("bad table magic number"));
		}

		let (metaindex, read) = BlockHandle::decode(buf)?;
		let (index, _) = BlockHandle::decode(&buf[read..])?;

		Ok(Footer {
			metaindex,
			index,
		})
	}
}

/// Reads one physical block: contents, compression byte, masked CRC. The
/// checksum is verified when the read options ask for it, and the contents
/// are decompressed according to the type byte.
pub(crate) fn read_block(
	file: &Arc<dyn RandomAccessFile>,
	ro: &ReadOptions,
	handle: &BlockHandle,
) -> Result<BlockData> {
	let n = handle.size() as usize;
	let mut buf = vec![0u8; n + BLOCK_TRAILER_LENGTH];
	file.read_at(handle.offset(), &mut buf)?;

	let compression = buf[n];
	if ro.verify_checksums {
		let stored = unmask(u32::decode_fixed(&buf[n + 1..n + 5]).unwrap());
		let actual = trailer_checksum(&buf[..n], compression);
		if stored != actual {
			log::error!(
				"table: block checksum mismatch at offset {} (stored {stored:#x}, computed {actual:#x})",
				handle.offset()
			);
			return Err(Error::corruption("block checksum mismatch"));
		}
	}

	match CompressionType::try_from(compression)? {
		CompressionType::None => {
			buf.truncate(n);
			Ok(Bytes::from(buf))
		}
		CompressionType::SnappyCompression => {
			let decoded = snap::raw::Decoder::new()
				.decompress_vec(&buf[..n])
				.map_err(|e| Error::corruption(format!("corrupted compressed block: {e}")))?;
			Ok(Bytes::from(decoded))
		}
	}
}

/// Builds one immutable table file: restart-compressed data blocks, an
/// optional filter block, a metaindex block naming the filter, an index block
/// of shortened separators, and the fixed footer.
///
/// Keys must be added in strictly ascending internal-key order. The first
/// write failure sticks; later `add`/`flush` calls become no-ops that
/// re-report it, and the caller must still call `finish` or `abandon`.
pub struct TableWriter<W: Write> {
	writer: W,
	opts: Arc<Options>,

	meta: FileMetaData,
	num_entries: u64,
	offset: u64,
	status: Result<()>,
	closed: bool,

	data_block: BlockWriter,
	index_block: BlockWriter,
	filter_block: Option<FilterBlockWriter>,

	// Last key added, encoded. Separators for the index entry of a finished
	// block are cut between this and the first key of the next block, so the
	// entry is emitted lazily on the next `add` (or from `finish`).
	last_key: Vec<u8>,
	pending_index_entry: bool,
	pending_handle: BlockHandle,
}

impl<W: Write> TableWriter<W> {
	pub fn new(writer: W, number: u64, opts: Arc<Options>) -> Self {
		let filter_block = opts.filter_policy.clone().map(|policy| {
			let mut fb = FilterBlockWriter::new(policy);
			fb.start_block(0);
			fb
		});

		TableWriter {
			writer,
			meta: FileMetaData::new(number),
			num_entries: 0,
			offset: 0,
			status: Ok(()),
			closed: false,
			data_block: BlockWriter::new(opts.block_restart_interval),
			// Every index entry is a restart point so the block seek's binary
			// search sees all of them.
			index_block: BlockWriter::new(1),
			filter_block,
			last_key: Vec::new(),
			pending_index_entry: false,
			pending_handle: BlockHandle::default(),
			opts,
		}
	}

	/// Swap in new options for the blocks still to be written. The comparator
	/// must stay the same; everything else only affects data that has not
	/// been emitted yet.
	pub fn change_options(&mut self, opts: Arc<Options>) -> Result<()> {
		if opts.comparator.name() != self.opts.comparator.name() {
			return Err(Error::InvalidArgument(
				"changing comparator while constructing a table".to_string(),
			));
		}
		self.opts = opts;
		Ok(())
	}

	fn record<T>(&mut self, r: Result<T>) -> Result<T> {
		if let Err(e) = &r {
			if self.status.is_ok() {
				self.status = Err(e.clone());
			}
		}
		r
	}

	pub fn add(&mut self, key: InternalKey, value: &[u8]) -> Result<()> {
		assert!(!self.closed);
		self.status.clone()?;

		let encoded = key.encode();
		if self.num_entries > 0 {
			let order = self.opts.internal_comparator.compare(&self.last_key, &encoded);
			if order != Ordering::Less {
				log::error!(
					"table writer: key ordering violation: {:?} added after {:?}",
					encoded,
					self.last_key
				);
			}
			assert_eq!(order, Ordering::Less, "keys must be added in strictly ascending order");
		}

		if self.pending_index_entry {
			debug_assert_eq!(self.data_block.entries(), 0);
			let separator = self.opts.internal_comparator.separator(&self.last_key, &encoded);
			let handle = self.pending_handle.encode();
			let r = self.index_block.add(&separator, &handle);
			self.record(r)?;
			self.pending_index_entry = false;
		}

		if let Some(fb) = self.filter_block.as_mut() {
			fb.add_key(&key.user_key);
		}

		if self.num_entries == 0 {
			self.meta.smallest = key.clone();
		}
		self.meta.largest = key;
		self.num_entries += 1;

		let r = self.data_block.add(&encoded, value);
		self.record(r)?;
		self.last_key = encoded;

		if self.data_block.size_estimate() >= self.opts.block_size {
			self.flush()?;
		}
		Ok(())
	}

	/// Cuts the current data block, writes it out and realigns the filter
	/// builder with the new file offset.
	pub fn flush(&mut self) -> Result<()> {
		assert!(!self.closed);
		self.status.clone()?;
		if self.data_block.entries() == 0 {
			return Ok(());
		}
		assert!(!self.pending_index_entry, "flush while an index entry is pending");

		let block =
			mem::replace(&mut self.data_block, BlockWriter::new(self.opts.block_restart_interval));
		let r = self.write_block(block.finish(), self.opts.compression);
		let handle = self.record(r)?;
		self.pending_handle = handle;
		self.pending_index_entry = true;

		let r = self.writer.flush().map_err(Error::from);
		self.record(r)?;

		if let Some(fb) = self.filter_block.as_mut() {
			fb.start_block(self.offset);
		}
		Ok(())
	}

	fn write_block(
		&mut self,
		raw: BlockData,
		compression: CompressionType,
	) -> Result<BlockHandle> {
		let (contents, compression) = match compression {
			CompressionType::None => (raw, CompressionType::None),
			CompressionType::SnappyCompression => {
				let mut encoder = snap::raw::Encoder::new();
				let mut buf = vec![0; max_compress_len(raw.len())];
				match encoder.compress(&raw, &mut buf) {
					// Store compressed only if it saves at least 1/8th;
					// otherwise the decompression cost isn't worth it.
					Ok(n) if n < raw.len() - raw.len() / 8 => {
						buf.truncate(n);
						(Bytes::from(buf), CompressionType::SnappyCompression)
					}
					_ => (raw, CompressionType::None),
				}
			}
		};
		self.write_raw_block(&contents, compression)
	}

	fn write_raw_block(
		&mut self,
		contents: &[u8],
		compression: CompressionType,
	) -> Result<BlockHandle> {
		let handle = BlockHandle::new(self.offset, contents.len() as u64);
		self.writer.write_all(contents)?;

		let crc = trailer_checksum(contents, compression as u8);
		self.writer.write_all(&[compression as u8])?;
		self.writer.write_fixedint(mask(crc))?;

		self.offset += (contents.len() + BLOCK_TRAILER_LENGTH) as u64;
		Ok(handle)
	}

	/// Writes everything that is still pending plus the footer. The writer
	/// accepts no further entries afterwards.
	pub fn finish(&mut self) -> Result<()> {
		let _ = self.flush();
		assert!(!self.closed);
		self.closed = true;

		// Filter block, always stored uncompressed
		let filter_name = self.filter_block.as_ref().map(|fb| fb.filter_name().to_string());
		let mut filter_handle = None;
		if let Some(fb) = self.filter_block.take() {
			if self.status.is_ok() {
				let contents = fb.finish();
				let r = self.write_raw_block(&contents, CompressionType::None);
				if let Ok(handle) = self.record(r) {
					filter_handle = Some(handle);
				}
			}
		}

		// Metaindex block mapping "filter.<name>" to the filter's handle
		let mut metaindex_handle = BlockHandle::default();
		if self.status.is_ok() {
			let mut metaindex_block = BlockWriter::new(self.opts.block_restart_interval);
			if let (Some(handle), Some(name)) = (&filter_handle, &filter_name) {
				let key = format!("filter.{name}");
				let r = metaindex_block.add(key.as_bytes(), &handle.encode());
				let _ = self.record(r);
			}
			if self.status.is_ok() {
				let r = self.write_block(metaindex_block.finish(), self.opts.compression);
				if let Ok(handle) = self.record(r) {
					metaindex_handle = handle;
				}
			}
		}

		// Index block; the final entry's key is a short successor of the last
		// key in the file.
		let mut index_handle = BlockHandle::default();
		if self.status.is_ok() {
			if self.pending_index_entry {
				let successor = self.opts.internal_comparator.successor(&self.last_key);
				let handle = self.pending_handle.encode();
				let r = self.index_block.add(&successor, &handle);
				let _ = self.record(r);
				self.pending_index_entry = false;
			}
			if self.status.is_ok() {
				let block = mem::replace(&mut self.index_block, BlockWriter::new(1));
				let r = self.write_block(block.finish(), self.opts.compression);
				if let Ok(handle) = self.record(r) {
					index_handle = handle;
				}
			}
		}

		// Footer
		if self.status.is_ok() {
			let footer = Footer::new(metaindex_handle, index_handle);
			let encoded = footer.encode();
			let mut r = self.writer.write_all(&encoded).map_err(Error::from);
			if r.is_ok() {
				r = self.writer.flush().map_err(Error::from);
			}
			if self.record(r).is_ok() {
				self.offset += encoded.len() as u64;
			}
		}

		self.meta.file_size = self.offset;
		self.status.clone()
	}

	/// Marks the writer closed without writing a footer. The caller discards
	/// the partial file.
	pub fn abandon(&mut self) {
		assert!(!self.closed);
		self.closed = true;
	}

	pub fn num_entries(&self) -> u64 {
		self.num_entries
	}

	/// Size of the file generated so far. Accurate after `finish`; during
	/// construction it trails the in-progress data block.
	pub fn file_size(&self) -> u64 {
		self.offset
	}

	/// Per-file bookkeeping (smallest/largest key, size) maintained while the
	/// table is built.
	pub fn meta(&self) -> &FileMetaData {
		&self.meta
	}
}

/// An open, immutable table file. Holds the decoded index block and filter;
/// data blocks are materialized on demand, through the shared block cache
/// when one is configured.
///
/// Safe to share by `Arc`; all reads are positional and the contained state
/// never changes after `open`.
pub struct Table {
	opts: Arc<Options>,
	file: Arc<dyn RandomAccessFile>,
	cache_id: CacheId,
	index_block: Block,
	filter: Option<FilterBlockReader>,
	metaindex_handle: BlockHandle,
}

impl Table {
	/// Opens a table. Reads the footer, index block and — when a filter
	/// policy is configured — the metaindex and filter blocks. A missing or
	/// unreadable filter demotes the table to filterless point reads instead
	/// of failing the open.
	pub fn open(opts: Arc<Options>, file: Arc<dyn RandomAccessFile>, file_size: u64) -> Result<Table> {
		if file_size < FOOTER_ENCODED_LENGTH as u64 {
			return Err(Error::corruption("file is too short to be a table"));
		}

		let mut buf = vec![0u8; FOOTER_ENCODED_LENGTH];
		file.read_at(file_size - FOOTER_ENCODED_LENGTH as u64, &mut buf)?;
		let footer = Footer::decode(&buf)?;

		let ro = ReadOptions {
			verify_checksums: opts.paranoid_checks,
			fill_cache: false,
		};
		let index_contents = read_block(&file, &ro, &footer.index)?;
		let index_block = Block::new(index_contents)?;

		let cache_id = opts.block_cache.as_ref().map_or(0, |cache| cache.new_id());

		let mut table = Table {
			opts,
			file,
			cache_id,
			index_block,
			filter: None,
			metaindex_handle: footer.metaindex,
		};
		table.read_meta(&ro);
		Ok(table)
	}

	fn read_meta(&mut self, ro: &ReadOptions) {
		let Some(policy) = self.opts.filter_policy.clone() else {
			return;
		};

		let contents = match read_block(&self.file, ro, &self.metaindex_handle) {
			Ok(contents) => contents,
			Err(e) => {
				log::warn!("table: unreadable metaindex block, continuing without filter: {e}");
				return;
			}
		};
		let metaindex = match Block::new(contents) {
			Ok(block) => block,
			Err(e) => {
				log::warn!("table: malformed metaindex block, continuing without filter: {e}");
				return;
			}
		};

		// Metaindex keys are raw strings, not internal keys.
		let mut iter = metaindex.iter(Arc::new(BytewiseComparator::default()));
		let filter_key = format!("filter.{}", policy.name());
		iter.seek(filter_key.as_bytes());
		if iter.valid() && iter.key() == filter_key.as_bytes() {
			let handle_encoded = iter.value().to_vec();
			self.read_filter(ro, &handle_encoded, policy);
		}
	}

	fn read_filter(&mut self, ro: &ReadOptions, handle_encoded: &[u8], policy: Arc<dyn FilterPolicy>) {
		let handle = match BlockHandle::decode(handle_encoded) {
			Ok((handle, _)) => handle,
			Err(e) => {
				log::warn!("table: undecodable filter block handle: {e}");
				return;
			}
		};
		if handle.size() == 0 {
			return;
		}
		match read_block(&self.file, ro, &handle) {
			Ok(data) => self.filter = Some(FilterBlockReader::new(data, policy)),
			Err(e) => {
				log::warn!("table: unreadable filter block, continuing without filter: {e}");
			}
		}
	}

	fn internal_cmp(&self) -> Arc<dyn Comparator> {
		self.opts.internal_comparator.clone()
	}

	/// Fetch the data block at `handle`, through the cache when one is
	/// configured. On a miss the block is read, verified and decompressed,
	/// then inserted when the read options allow it.
	fn read_data_block(&self, ro: &ReadOptions, handle: &BlockHandle) -> Result<Arc<Block>> {
		if let Some(cache) = &self.opts.block_cache {
			if let Some(block) = cache.get(self.cache_id, handle.offset()) {
				return Ok(block);
			}
			let contents = read_block(&self.file, ro, handle)?;
			let block = Arc::new(Block::new(contents)?);
			if ro.fill_cache {
				cache.insert(self.cache_id, handle.offset(), Arc::clone(&block));
			}
			Ok(block)
		} else {
			let contents = read_block(&self.file, ro, handle)?;
			Ok(Arc::new(Block::new(contents)?))
		}
	}

	/// Turn the value of an index entry into an iterator over the referenced
	/// data block. Decode or read failures surface as an error iterator so
	/// the two-level composition can report them through `status`.
	fn data_block_iter(&self, ro: &ReadOptions, index_value: &[u8]) -> Box<dyn InternalIterator> {
		match BlockHandle::decode(index_value) {
			Ok((handle, _)) => match self.read_data_block(ro, &handle) {
				Ok(block) => Box::new(block.iter(self.internal_cmp())),
				Err(e) => new_error_iterator(e),
			},
			Err(e) => {
				log::error!("table: undecodable block handle in index entry: {e}");
				new_error_iterator(e)
			}
		}
	}

	/// Returns an iterator over the table's internal entries. Blocks are
	/// opened lazily as the index is walked.
	pub fn iter(self: &Arc<Self>, ro: ReadOptions) -> Box<dyn InternalIterator> {
		let index_iter = Box::new(self.index_block.iter(self.internal_cmp()));
		let table = Arc::clone(self);
		let block_fn: BlockIterBuilder =
			Box::new(move |ro, index_value| table.data_block_iter(ro, index_value));
		new_two_level_iterator(index_iter, block_fn, ro)
	}

	/// Point lookup: positions at the first entry >= `key` (an encoded
	/// internal key) and invokes `found` on it if any. A negative filter
	/// answer skips the data block read entirely. A missing key is not an
	/// error; `found` is simply not called.
	pub fn internal_get(
		&self,
		ro: &ReadOptions,
		key: &[u8],
		mut found: impl FnMut(&[u8], &[u8]),
	) -> Result<()> {
		let mut index_iter = self.index_block.iter(self.internal_cmp());
		index_iter.seek(key);
		if index_iter.valid() {
			let handle_encoded = index_iter.value().to_vec();
			let may_contain = match (&self.filter, BlockHandle::decode(&handle_encoded)) {
				(Some(filter), Ok((handle, _))) => {
					filter.may_contain(InternalKey::user_key_from_encoded(key), handle.offset())
				}
				_ => true,
			};
			if may_contain {
				let mut block_iter = self.data_block_iter(ro, &handle_encoded);
				block_iter.seek(key);
				if block_iter.valid() {
					found(block_iter.key(), block_iter.value());
				}
				block_iter.status()?;
			}
		}
		index_iter.status()
	}

	/// Approximate file offset where the data for `key` begins. Used by the
	/// surrounding database to estimate sizes for compaction decisions.
	pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
		let mut index_iter = self.index_block.iter(self.internal_cmp());
		index_iter.seek(key);
		if index_iter.valid() {
			if let Ok((handle, _)) = BlockHandle::decode(index_iter.value()) {
				return handle.offset();
			}
		}
		// Key is past the last data block; the metaindex comes right after
		// the data section.
		self.metaindex_handle.offset()
	}
}
