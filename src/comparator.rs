//! Comparator implementations for key ordering.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::sstable::{InternalKey, INTERNAL_KEY_KIND_FOR_SEEK, INTERNAL_KEY_SEQ_NUM_MAX};

/// A trait for comparing keys in a key-value store.
///
/// This trait defines methods for comparing keys, generating separator keys,
/// generating successor keys, and retrieving the name of the comparator.
pub trait Comparator: Send + Sync {
	/// Compares two keys `a` and `b`.
	fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

	/// Generates a separator key between two keys `from` and `to`.
	///
	/// This method should return a key that is greater than or equal to `from`
	/// and less than `to`. It is used to shorten index entries between data
	/// blocks.
	fn separator(&self, from: &[u8], to: &[u8]) -> Vec<u8>;

	/// Generates the successor key of a given key.
	///
	/// This method should return a shortest key that is greater than or equal
	/// to the given key. It is used for the final index entry of a table.
	fn successor(&self, key: &[u8]) -> Vec<u8>;

	/// Retrieves the name of the comparator.
	fn name(&self) -> &str;
}

/// A bytewise comparator that compares keys lexicographically.
#[derive(Default, Clone, Copy)]
pub struct BytewiseComparator {}

impl Comparator for BytewiseComparator {
	#[inline]
	fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
		a.cmp(b)
	}

	#[inline]
	fn name(&self) -> &'static str {
		"stratakv.BytewiseComparator"
	}

	#[inline]
	/// Generates a separator key between two byte slices `a` (start) and `b`
	/// (limit).
	///
	/// 1. Find the common prefix
	/// 2. If one string is a prefix of the other, return unchanged
	/// 3. At first differing byte, try to increment and truncate
	/// 4. If that would exceed limit, scan forward for a non-0xFF byte to increment
	/// 5. If no shortening possible, return unchanged
	fn separator(&self, a: &[u8], b: &[u8]) -> Vec<u8> {
		let min_length = std::cmp::min(a.len(), b.len());
		let mut diff_index = 0;

		// Find length of common prefix
		while diff_index < min_length && a[diff_index] == b[diff_index] {
			diff_index += 1;
		}

		if diff_index >= min_length {
			// Do not shorten if one string is a prefix of the other
			return a.to_vec();
		}

		let start_byte = a[diff_index];
		let limit_byte = b[diff_index];

		if start_byte >= limit_byte {
			// Cannot shorten since limit is smaller than start or start is
			// already the shortest possible.
			return a.to_vec();
		}

		// start_byte < limit_byte
		if diff_index < b.len() - 1 || start_byte + 1 < limit_byte {
			// Safe to increment and truncate
			let mut result = Vec::from(&a[..=diff_index]);
			result[diff_index] += 1;
			debug_assert!(self.compare(&result, b) == Ordering::Less);
			return result;
		}

		// Incrementing the current byte would make start >= limit.
		// Skip this byte and find the first non-0xFF byte in start to increment.
		diff_index += 1;

		while diff_index < a.len() {
			if a[diff_index] < 0xff {
				let mut result = Vec::from(&a[..=diff_index]);
				result[diff_index] += 1;
				debug_assert!(self.compare(&result, b) == Ordering::Less);
				return result;
			}
			diff_index += 1;
		}

		// Could not shorten, return original
		a.to_vec()
	}

	#[inline]
	/// Generates the successor key of a given byte slice `key`.
	///
	/// Find the first non-0xFF byte, increment it, and truncate.
	/// If all bytes are 0xFF, leave it unchanged.
	fn successor(&self, key: &[u8]) -> Vec<u8> {
		let mut result = key.to_vec();
		for i in 0..key.len() {
			if key[i] != 0xff {
				result[i] += 1;
				result.resize(i + 1, 0);
				return result;
			}
		}
		// All bytes are 0xFF - leave unchanged
		result
	}
}

/// Orders encoded internal keys: by user key ascending (per the wrapped user
/// comparator), then by trailer descending, which places newer sequence
/// numbers before older ones for the same user key.
#[derive(Clone)]
pub struct InternalKeyComparator {
	user_comparator: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
	pub fn new(user_comparator: Arc<dyn Comparator>) -> Self {
		Self {
			user_comparator,
		}
	}

	pub fn user_comparator(&self) -> Arc<dyn Comparator> {
		Arc::clone(&self.user_comparator)
	}
}

impl Comparator for InternalKeyComparator {
	fn name(&self) -> &'static str {
		"stratakv.InternalKeyComparator"
	}

	fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
		let user_key_a = InternalKey::user_key_from_encoded(a);
		let user_key_b = InternalKey::user_key_from_encoded(b);

		match self.user_comparator.compare(user_key_a, user_key_b) {
			Ordering::Equal => {
				// Compare trailers in descending order: higher sequence
				// numbers (and kinds) sort first.
				let trailer_a = InternalKey::trailer_from_encoded(a);
				let trailer_b = InternalKey::trailer_from_encoded(b);
				trailer_b.cmp(&trailer_a)
			}
			ord => ord,
		}
	}

	/// Generates a separator key between two internal keys.
	///
	/// 1. Extract user keys and compute a separator
	/// 2. If separator is same length or shorter AND logically larger, re-tag it with the maximum
	///    trailer so it sorts before every real entry of that user key
	/// 3. Otherwise return the original key unchanged
	fn separator(&self, a: &[u8], b: &[u8]) -> Vec<u8> {
		if a == b {
			return a.to_vec();
		}

		let user_a = InternalKey::user_key_from_encoded(a);
		let user_b = InternalKey::user_key_from_encoded(b);

		if self.user_comparator.compare(user_a, user_b) != Ordering::Equal {
			let sep = self.user_comparator.separator(user_a, user_b);

			if sep.len() <= user_a.len()
				&& self.user_comparator.compare(user_a, &sep) == Ordering::Less
			{
				let result = InternalKey::new(
					sep,
					INTERNAL_KEY_SEQ_NUM_MAX,
					INTERNAL_KEY_KIND_FOR_SEEK,
				);
				debug_assert!(self.compare(a, &result.encode()) == Ordering::Less);
				return result.encode();
			}
		}

		// Fallback: Return original key unchanged
		a.to_vec()
	}

	/// Generates a successor key for an internal key.
	fn successor(&self, key: &[u8]) -> Vec<u8> {
		let user_key = InternalKey::user_key_from_encoded(key);
		let user_key_succ = self.user_comparator.successor(user_key);

		// If successor is same length or shorter AND logically larger, use the
		// maximum trailer
		if user_key_succ.len() <= user_key.len()
			&& self.user_comparator.compare(user_key, &user_key_succ) == Ordering::Less
		{
			let result = InternalKey::new(
				user_key_succ,
				INTERNAL_KEY_SEQ_NUM_MAX,
				INTERNAL_KEY_KIND_FOR_SEEK,
			);
			return result.encode();
		}

		// Fallback: Return original key unchanged
		key.to_vec()
	}
}
