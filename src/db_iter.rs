use std::cmp::Ordering;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::comparator::Comparator;
use crate::error::Result;
use crate::sstable::{parse_internal_key, seek_key, InternalKey, InternalKeyKind};
use crate::InternalIterator;

/// Read traffic between two sampling callbacks averages one period; the
/// refill is drawn uniformly from [0, 2 * READ_BYTES_PERIOD).
const READ_BYTES_PERIOD: usize = 1 << 20;

/// Hook the DB iterator invokes with raw internal keys as reads accumulate.
/// The surrounding database uses it to spot files that absorb repeated seeks
/// and schedule them for compaction.
pub type ReadSampler = Box<dyn FnMut(&[u8])>;

#[derive(Clone, Copy, PartialEq)]
enum Direction {
	// The internal iterator is positioned at the exact entry that yields
	// key()/value().
	Forward,
	// The internal iterator is positioned just before all entries whose user
	// key == key(); saved_key/saved_value hold the current entry.
	Reverse,
}

/// Collapses multi-version internal entries into a single visible user entry
/// per key, as of the snapshot `sequence`.
///
/// The underlying iterator yields `(user_key, seq, kind) => value` entries,
/// newest first within a user key. Entries above the snapshot are invisible;
/// a deletion hides every older version of its user key.
pub struct DbIterator {
	user_cmp: Arc<dyn Comparator>,
	iter: Box<dyn InternalIterator>,
	sequence: u64,

	status: Result<()>,
	// Current user key when direction == Reverse; scratch otherwise.
	saved_key: Vec<u8>,
	// Current value when direction == Reverse.
	saved_value: Vec<u8>,
	direction: Direction,
	valid: bool,

	rng: StdRng,
	bytes_until_read_sampling: usize,
	sampler: Option<ReadSampler>,
}

/// Builds the user-facing iterator for a snapshot: `internal_iter` is the
/// merged view of memtables and table files, `sequence` the snapshot, and
/// `seed` randomizes the read-sampling cadence per iterator.
pub fn new_db_iterator(
	user_cmp: Arc<dyn Comparator>,
	internal_iter: Box<dyn InternalIterator>,
	sequence: u64,
	seed: u64,
	sampler: Option<ReadSampler>,
) -> DbIterator {
	DbIterator::new(user_cmp, internal_iter, sequence, seed, sampler)
}

impl DbIterator {
	pub fn new(
		user_cmp: Arc<dyn Comparator>,
		internal_iter: Box<dyn InternalIterator>,
		sequence: u64,
		seed: u64,
		sampler: Option<ReadSampler>,
	) -> Self {
		let mut rng = StdRng::seed_from_u64(seed);
		let bytes_until_read_sampling = random_read_period(&mut rng);
		Self {
			user_cmp,
			iter: internal_iter,
			sequence,
			status: Ok(()),
			saved_key: Vec::new(),
			saved_value: Vec::new(),
			direction: Direction::Forward,
			valid: false,
			rng,
			bytes_until_read_sampling,
			sampler,
		}
	}

	/// Parse the current internal entry, metering read bytes against the
	/// sampling budget. Returns None (with sticky Corruption status) for an
	/// unparseable key.
	fn parse_key(&mut self) -> Option<(u64, InternalKeyKind)> {
		let bytes_read = self.iter.key().len() + self.iter.value().len();
		while self.bytes_until_read_sampling < bytes_read {
			self.bytes_until_read_sampling += random_read_period(&mut self.rng);
			if let Some(sampler) = self.sampler.as_mut() {
				sampler(self.iter.key());
			}
		}
		self.bytes_until_read_sampling -= bytes_read;

		match parse_internal_key(self.iter.key()) {
			Ok(parsed) => Some(parsed),
			Err(e) => {
				if self.status.is_ok() {
					self.status = Err(e);
				}
				None
			}
		}
	}

	fn clear_saved_value(&mut self) {
		if self.saved_value.capacity() > 1 << 20 {
			self.saved_value = Vec::new();
		} else {
			self.saved_value.clear();
		}
	}

	/// Forward collapsing loop: advance until an entry visible at the
	/// snapshot is found. While `skipping`, entries whose user key is <=
	/// `saved_key` are hidden (they are older versions of a deleted or
	/// already-yielded key).
	fn find_next_user_entry(&mut self, mut skipping: bool) {
		debug_assert!(self.iter.valid());
		debug_assert!(self.direction == Direction::Forward);

		loop {
			if let Some((seq, kind)) = self.parse_key() {
				if seq <= self.sequence {
					match kind {
						InternalKeyKind::Deletion => {
							// Everything older under this user key is hidden.
							let user_key = InternalKey::user_key_from_encoded(self.iter.key());
							self.saved_key.clear();
							self.saved_key.extend_from_slice(user_key);
							skipping = true;
						}
						InternalKeyKind::Value => {
							let user_key = InternalKey::user_key_from_encoded(self.iter.key());
							if skipping
								&& self.user_cmp.compare(user_key, &self.saved_key)
									!= Ordering::Greater
							{
								// Hidden by a newer deletion or already yielded
							} else {
								self.valid = true;
								self.saved_key.clear();
								return;
							}
						}
					}
				}
			}
			self.iter.next();
			if !self.iter.valid() {
				break;
			}
		}
		self.saved_key.clear();
		self.valid = false;
	}

	/// Reverse collapsing loop: scan backwards collecting the newest visible
	/// version of the user key into saved_key/saved_value, stopping once the
	/// scan crosses into the previous user key.
	fn find_prev_user_entry(&mut self) {
		debug_assert!(self.direction == Direction::Reverse);

		let mut value_kind = InternalKeyKind::Deletion;
		if self.iter.valid() {
			loop {
				if let Some((seq, kind)) = self.parse_key() {
					if seq <= self.sequence {
						let user_key = InternalKey::user_key_from_encoded(self.iter.key());
						if value_kind != InternalKeyKind::Deletion
							&& self.user_cmp.compare(user_key, &self.saved_key) == Ordering::Less
						{
							// We encountered a non-deleted value in entries
							// for previous keys; saved_* hold the answer.
							break;
						}
						value_kind = kind;
						if value_kind == InternalKeyKind::Deletion {
							self.saved_key.clear();
							self.clear_saved_value();
						} else {
							let raw_value = self.iter.value();
							if self.saved_value.capacity() > raw_value.len() + (1 << 20) {
								self.saved_value = Vec::new();
							}
							self.saved_value.clear();
							self.saved_value.extend_from_slice(raw_value);

							let user_key = InternalKey::user_key_from_encoded(self.iter.key());
							self.saved_key.clear();
							self.saved_key.extend_from_slice(user_key);
						}
					}
				}
				self.iter.prev();
				if !self.iter.valid() {
					break;
				}
			}
		}

		if value_kind == InternalKeyKind::Deletion {
			// Ran off the start of the keyspace
			self.valid = false;
			self.saved_key.clear();
			self.clear_saved_value();
			self.direction = Direction::Forward;
		} else {
			self.valid = true;
		}
	}
}

impl InternalIterator for DbIterator {
	fn valid(&self) -> bool {
		self.valid
	}

	fn key(&self) -> &[u8] {
		debug_assert!(self.valid);
		match self.direction {
			Direction::Forward => InternalKey::user_key_from_encoded(self.iter.key()),
			Direction::Reverse => &self.saved_key,
		}
	}

	fn value(&self) -> &[u8] {
		debug_assert!(self.valid);
		match self.direction {
			Direction::Forward => self.iter.value(),
			Direction::Reverse => &self.saved_value,
		}
	}

	fn status(&self) -> Result<()> {
		self.status.clone()?;
		self.iter.status()
	}

	fn next(&mut self) {
		debug_assert!(self.valid);

		if self.direction == Direction::Reverse {
			self.direction = Direction::Forward;
			// The internal iterator is just before the entries for key(), so
			// advance into that range first; saved_key already holds the key
			// to skip past.
			if !self.iter.valid() {
				self.iter.seek_to_first();
			} else {
				self.iter.next();
			}
			if !self.iter.valid() {
				self.valid = false;
				self.saved_key.clear();
				return;
			}
		} else {
			// Store the current key in saved_key so the collapse skips its
			// remaining versions.
			let user_key = InternalKey::user_key_from_encoded(self.iter.key());
			self.saved_key.clear();
			self.saved_key.extend_from_slice(user_key);

			self.iter.next();
			if !self.iter.valid() {
				self.valid = false;
				self.saved_key.clear();
				return;
			}
		}

		self.find_next_user_entry(true);
	}

	fn prev(&mut self) {
		debug_assert!(self.valid);

		if self.direction == Direction::Forward {
			// The internal iterator points at the current entry. Scan
			// backwards until the user key changes, then the normal reverse
			// collapse applies.
			debug_assert!(self.iter.valid());
			let user_key = InternalKey::user_key_from_encoded(self.iter.key());
			self.saved_key.clear();
			self.saved_key.extend_from_slice(user_key);
			loop {
				self.iter.prev();
				if !self.iter.valid() {
					self.valid = false;
					self.saved_key.clear();
					self.clear_saved_value();
					return;
				}
				let user_key = InternalKey::user_key_from_encoded(self.iter.key());
				if self.user_cmp.compare(user_key, &self.saved_key) == Ordering::Less {
					break;
				}
			}
			self.direction = Direction::Reverse;
		}

		self.find_prev_user_entry();
	}

	fn seek(&mut self, target: &[u8]) {
		self.direction = Direction::Forward;
		self.clear_saved_value();
		self.saved_key = seek_key(target, self.sequence);

		self.iter.seek(&self.saved_key);
		if self.iter.valid() {
			self.find_next_user_entry(false);
		} else {
			self.valid = false;
		}
	}

	fn seek_to_first(&mut self) {
		self.direction = Direction::Forward;
		self.clear_saved_value();

		self.iter.seek_to_first();
		if self.iter.valid() {
			self.find_next_user_entry(false);
		} else {
			self.valid = false;
		}
	}

	fn seek_to_last(&mut self) {
		self.direction = Direction::Reverse;
		self.clear_saved_value();

		self.iter.seek_to_last();
		self.find_prev_user_entry();
	}
}

fn random_read_period(rng: &mut StdRng) -> usize {
	rng.random_range(0..2 * READ_BYTES_PERIOD)
}
