use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use integer_encoding::{FixedInt, FixedIntWriter, VarInt, VarIntWriter};

use crate::comparator::Comparator;
use crate::error::{Error, Result};

pub(crate) type BlockData = Bytes;

/// Largest encoding of a block handle: two varint64s.
pub(crate) const BLOCK_HANDLE_MAX_ENCODED_LENGTH: usize = 20;

/// Location of a physical block inside a table file.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub(crate) struct BlockHandle {
	offset: u64,
	size: u64,
}

impl BlockHandle {
	pub(crate) fn new(offset: u64, size: u64) -> BlockHandle {
		BlockHandle {
			offset,
			size,
		}
	}

	pub(crate) fn offset(&self) -> u64 {
		self.offset
	}

	pub(crate) fn size(&self) -> u64 {
		self.size
	}

	/// Returns bytes for an encoded BlockHandle
	#[inline]
	pub(crate) fn encode(&self) -> Vec<u8> {
		let mut v = Vec::with_capacity(self.offset.required_space() + self.size.required_space());
		v.write_varint(self.offset).expect("handle encode failed");
		v.write_varint(self.size).expect("handle encode failed");
		v
	}

	/// Decodes a block handle from `src` and returns it together with how
	/// many bytes were read from the slice.
	pub(crate) fn decode(src: &[u8]) -> Result<(Self, usize)> {
		let (offset, offsize) =
			u64::decode_var(src).ok_or(Error::corruption("corrupted block handle"))?;
		let (size, szsize) =
			u64::decode_var(&src[offsize..]).ok_or(Error::corruption("corrupted block handle"))?;

		Ok((
			BlockHandle {
				offset,
				size,
			},
			offsize + szsize,
		))
	}
}

/// `Block` consists of one or more key/value entries followed by a restart
/// array. Each entry shares a key prefix with its predecessor until a restart
/// point is reached; keys at restart points are stored in full, which is what
/// makes binary search over the restarts possible. A well-formed block has at
/// least one restart point, and the first one is always zero.
///
/// Block key/value entry:
///
/// ```text
///
///     +-----------------+---------------------+--------------------+--------------+----------------+
///     | shared (varint) | not shared (varint) | value len (varint) | key (varlen) | value (varlen) |
///     +-----------------+---------------------+--------------------+--------------+----------------+
///
/// ```
#[derive(Clone)]
pub(crate) struct Block {
	data: BlockData,
	restart_offset: usize,
	num_restarts: usize,
}

impl Block {
	pub(crate) fn new(data: BlockData) -> Result<Block> {
		if data.len() < 4 {
			return Err(Error::corruption("block too small to hold restart count"));
		}
		let num_restarts = u32::decode_fixed(&data[data.len() - 4..]).unwrap() as usize;
		if num_restarts == 0 {
			return Err(Error::corruption("block has no restart points"));
		}
		let array_len = 4 * (num_restarts + 1);
		if array_len > data.len() {
			return Err(Error::corruption("restart array overflows block"));
		}

		Ok(Block {
			restart_offset: data.len() - array_len,
			num_restarts,
			data,
		})
	}

	pub(crate) fn size(&self) -> usize {
		self.data.len()
	}

	pub(crate) fn iter(&self, cmp: Arc<dyn Comparator>) -> BlockIterator {
		BlockIterator::new(self.data.clone(), self.restart_offset, self.num_restarts, cmp)
	}
}

pub(crate) struct BlockWriter {
	restart_interval: usize,
	// Destination buffer
	buffer: Vec<u8>,
	// Restart points
	restart_points: Vec<u32>,
	// Number of entries since last restart
	restart_counter: usize,
	pub(crate) last_key: Vec<u8>,
	num_entries: usize,
}

impl BlockWriter {
	pub(crate) fn new(restart_interval: usize) -> Self {
		assert!(restart_interval >= 1);
		BlockWriter {
			restart_interval,
			buffer: Vec::new(),
			restart_points: vec![0],
			restart_counter: 0,
			last_key: Vec::new(),
			num_entries: 0,
		}
	}

	/// Adds a key-value pair to the block. Keys must arrive in strictly
	/// ascending order; the table writer enforces that precondition.
	pub(crate) fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
		assert!(self.restart_counter <= self.restart_interval);

		let mut shared = 0;
		if self.restart_counter < self.restart_interval {
			shared = self
				.last_key
				.iter()
				.zip(key.iter())
				.take_while(|&(a, b)| a == b)
				.count();
		} else {
			// Create a new restart point
			self.restart_points.push(self.buffer.len() as u32);
			self.restart_counter = 0;
		}

		let non_shared = key.len() - shared;
		self.buffer.write_varint(shared as u64)?;
		self.buffer.write_varint(non_shared as u64)?;
		self.buffer.write_varint(value.len() as u64)?;
		self.buffer.extend_from_slice(&key[shared..]);
		self.buffer.extend_from_slice(value);

		self.last_key.clear();
		self.last_key.extend_from_slice(key);

		self.restart_counter += 1;
		self.num_entries += 1;

		Ok(())
	}

	/// Finalizes the block: appends the restart array and its length.
	pub(crate) fn finish(mut self) -> BlockData {
		for &r in self.restart_points.iter() {
			self.buffer.write_fixedint(r).expect("block write failed");
		}
		self.buffer
			.write_fixedint(self.restart_points.len() as u32)
			.expect("block write failed");

		Bytes::from(self.buffer)
	}

	/// Estimates the serialized size of the block as built so far.
	pub(crate) fn size_estimate(&self) -> usize {
		self.buffer.len() + self.restart_points.len() * 4 + 4
	}

	pub(crate) fn entries(&self) -> usize {
		self.num_entries
	}
}

/// Cursor over a single block. Seeks binary-search the restart points and
/// then decode forward; `prev` re-decodes from the preceding restart because
/// entries are forward-prefix-compressed.
///
/// A malformed entry (bad varint, shared prefix longer than the previous key,
/// entry running into the restart array) invalidates the iterator and leaves
/// a sticky `Corruption` status.
pub(crate) struct BlockIterator {
	data: BlockData,
	cmp: Arc<dyn Comparator>,
	restart_offset: usize,
	num_restarts: usize,
	/// Offset of the current entry; == restart_offset when not positioned.
	current: usize,
	/// Index of the restart block containing the current entry.
	restart_index: usize,
	key: Vec<u8>,
	value_start: usize,
	value_len: usize,
	status: Result<()>,
}

impl BlockIterator {
	fn new(
		data: BlockData,
		restart_offset: usize,
		num_restarts: usize,
		cmp: Arc<dyn Comparator>,
	) -> Self {
		BlockIterator {
			current: restart_offset,
			restart_index: num_restarts,
			data,
			cmp,
			restart_offset,
			num_restarts,
			key: Vec::new(),
			value_start: 0,
			value_len: 0,
			status: Ok(()),
		}
	}

	#[inline]
	fn restart_point(&self, index: usize) -> usize {
		let at = self.restart_offset + index * 4;
		u32::decode_fixed(&self.data[at..at + 4]).unwrap() as usize
	}

	/// Offset just past the current entry, where the next entry begins.
	#[inline]
	fn next_entry_offset(&self) -> usize {
		self.value_start + self.value_len
	}

	fn seek_to_restart_point(&mut self, restart_index: usize) {
		self.key.clear();
		self.restart_index = restart_index;
		// parse_next_key() starts decoding at next_entry_offset()
		self.value_start = self.restart_point(restart_index);
		self.value_len = 0;
	}

	/// Decodes the shared prefix length, non-shared key length and value
	/// length of the entry at `offset`. Returns the three lengths plus the
	/// header size, or None if the entry is malformed.
	fn decode_entry_lengths(&self, offset: usize) -> Option<(usize, usize, usize, usize)> {
		let limit = &self.data[..self.restart_offset];
		if offset >= limit.len() {
			// A restart point referencing past the entry area
			return None;
		}

		let (shared, n0) = usize::decode_var(&limit[offset..])?;
		let (non_shared, n1) = usize::decode_var(&limit[offset + n0..])?;
		let (value_len, n2) = usize::decode_var(&limit[offset + n0 + n1..])?;

		let header = n0 + n1 + n2;
		if offset + header + non_shared + value_len > self.restart_offset {
			return None;
		}
		Some((shared, non_shared, value_len, header))
	}

	fn corruption_error(&mut self) {
		self.current = self.restart_offset;
		self.restart_index = self.num_restarts;
		self.key.clear();
		self.value_len = 0;
		if self.status.is_ok() {
			self.status = Err(Error::corruption("bad entry in block"));
		}
	}

	/// Decode the entry at `next_entry_offset()` into `key`/value and make it
	/// current. Returns false at end-of-block or on corruption.
	fn parse_next_key(&mut self) -> bool {
		self.current = self.next_entry_offset();
		if self.current >= self.restart_offset {
			// No more entries; mark invalid without flagging an error.
			self.current = self.restart_offset;
			self.restart_index = self.num_restarts;
			return false;
		}

		match self.decode_entry_lengths(self.current) {
			Some((shared, non_shared, value_len, header)) if shared <= self.key.len() => {
				let key_start = self.current + header;
				self.key.truncate(shared);
				self.key.extend_from_slice(&self.data[key_start..key_start + non_shared]);
				self.value_start = key_start + non_shared;
				self.value_len = value_len;

				while self.restart_index + 1 < self.num_restarts
					&& self.restart_point(self.restart_index + 1) < self.current
				{
					self.restart_index += 1;
				}
				true
			}
			_ => {
				self.corruption_error();
				false
			}
		}
	}
}

impl crate::InternalIterator for BlockIterator {
	fn valid(&self) -> bool {
		self.status.is_ok() && self.current < self.restart_offset
	}

	fn seek_to_first(&mut self) {
		if self.status.is_err() {
			return;
		}
		self.seek_to_restart_point(0);
		self.parse_next_key();
	}

	fn seek_to_last(&mut self) {
		if self.status.is_err() {
			return;
		}
		self.seek_to_restart_point(self.num_restarts - 1);
		while self.parse_next_key() && self.next_entry_offset() < self.restart_offset {}
	}

	fn seek(&mut self, target: &[u8]) {
		if self.status.is_err() {
			return;
		}

		// Binary search over restart points for the last restart whose key is
		// < target. Keys at restart points carry no shared prefix.
		let mut left = 0;
		let mut right = self.num_restarts - 1;
		while left < right {
			let mid = (left + right + 1) / 2;
			let region_offset = self.restart_point(mid);
			match self.decode_entry_lengths(region_offset) {
				Some((0, non_shared, _, header)) => {
					let key_start = region_offset + header;
					let mid_key = &self.data[key_start..key_start + non_shared];
					if self.cmp.compare(mid_key, target) == Ordering::Less {
						left = mid;
					} else {
						right = mid - 1;
					}
				}
				_ => {
					self.corruption_error();
					return;
				}
			}
		}

		// Linear scan within the restart block for the first key >= target
		self.seek_to_restart_point(left);
		loop {
			if !self.parse_next_key() {
				return;
			}
			if self.cmp.compare(&self.key, target) != Ordering::Less {
				return;
			}
		}
	}

	fn next(&mut self) {
		debug_assert!(self.valid());
		self.parse_next_key();
	}

	fn prev(&mut self) {
		debug_assert!(self.valid());
		let original = self.current;

		// Back up to the restart point that precedes the current entry
		while self.restart_point(self.restart_index) >= original {
			if self.restart_index == 0 {
				// No entry before the first one
				self.current = self.restart_offset;
				self.restart_index = self.num_restarts;
				self.key.clear();
				self.value_len = 0;
				return;
			}
			self.restart_index -= 1;
		}

		// Decode forward until we land on the entry just before `original`
		self.seek_to_restart_point(self.restart_index);
		loop {
			if !self.parse_next_key() {
				return;
			}
			if self.next_entry_offset() >= original {
				return;
			}
		}
	}

	fn key(&self) -> &[u8] {
		debug_assert!(self.valid());
		&self.key
	}

	fn value(&self) -> &[u8] {
		debug_assert!(self.valid());
		&self.data[self.value_start..self.value_start + self.value_len]
	}

	fn status(&self) -> Result<()> {
		self.status.clone()
	}
}
