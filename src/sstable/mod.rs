pub(crate) mod block;
pub(crate) mod bloom;
pub(crate) mod filter_block;
pub(crate) mod meta;
pub(crate) mod table;
pub(crate) mod two_level_iter;

use crate::error::{Error, Result};
use crate::Key;

// This is the maximum valid sequence number that can be stored in the upper
// 56 bits of a 64-bit integer. 1 << 56 shifts the number 1 left by 56 bits,
// resulting in a binary number with a 1 followed by 56 zeros. Subtracting 1
// gives a binary number with 56 ones, which is the maximum value for 56 bits.
pub const INTERNAL_KEY_SEQ_NUM_MAX: u64 = (1 << 56) - 1;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum InternalKeyKind {
	Deletion = 0,
	#[default]
	Value = 1,
}

/// Kind used when building a key to seek with. It is the maximum
/// representable kind, so a seek key `(user_key, seq, KIND_FOR_SEEK)` sorts
/// before every real entry of `user_key` with sequence <= `seq`.
pub const INTERNAL_KEY_KIND_FOR_SEEK: InternalKeyKind = InternalKeyKind::Value;

const INTERNAL_KEY_TRAILER_LEN: usize = 8;

/// InternalKey is the on-disk representation of a key.
///
/// ```text
///     <user-key> <trailer: fixed64 little-endian>
/// ```
///
/// The trailer packs a uint56 sequence number above a one-byte kind:
/// `(seq_num << 8) | kind`. Entries for the same user key are ordered by
/// trailer descending, so newer versions come first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InternalKey {
	pub user_key: Key,
	pub(crate) trailer: u64,
}

impl InternalKey {
	pub fn new(user_key: Key, seq_num: u64, kind: InternalKeyKind) -> Self {
		debug_assert!(seq_num <= INTERNAL_KEY_SEQ_NUM_MAX);
		Self {
			user_key,
			trailer: (seq_num << 8) | kind as u64,
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut buf = self.user_key.clone();
		buf.extend_from_slice(&self.trailer.to_le_bytes());
		buf
	}

	pub fn decode(encoded_key: &[u8]) -> Result<Self> {
		let (seq_num, kind) = parse_internal_key(encoded_key)?;
		Ok(Self::new(
			encoded_key[..encoded_key.len() - INTERNAL_KEY_TRAILER_LEN].to_vec(),
			seq_num,
			kind,
		))
	}

	#[inline]
	pub fn seq_num(&self) -> u64 {
		self.trailer >> 8
	}

	#[inline]
	pub fn kind(&self) -> InternalKeyKind {
		if self.trailer as u8 == InternalKeyKind::Deletion as u8 {
			InternalKeyKind::Deletion
		} else {
			InternalKeyKind::Value
		}
	}

	#[inline]
	pub fn is_tombstone(&self) -> bool {
		self.kind() == InternalKeyKind::Deletion
	}

	/// Extract the user key slice from an encoded internal key without
	/// allocation. The key must be well formed.
	#[inline]
	pub(crate) fn user_key_from_encoded(encoded: &[u8]) -> &[u8] {
		debug_assert!(encoded.len() >= INTERNAL_KEY_TRAILER_LEN);
		&encoded[..encoded.len() - INTERNAL_KEY_TRAILER_LEN]
	}

	/// Extract the trailer from an encoded internal key without allocation.
	#[inline]
	pub(crate) fn trailer_from_encoded(encoded: &[u8]) -> u64 {
		let n = encoded.len() - INTERNAL_KEY_TRAILER_LEN;
		u64::from_le_bytes(encoded[n..].try_into().unwrap())
	}
}

/// Split an encoded internal key into its sequence number and kind, checking
/// structural validity. The user key portion is available through
/// [`InternalKey::user_key_from_encoded`].
pub(crate) fn parse_internal_key(encoded: &[u8]) -> Result<(u64, InternalKeyKind)> {
	if encoded.len() < INTERNAL_KEY_TRAILER_LEN {
		return Err(Error::corruption("internal key too short"));
	}
	let trailer = InternalKey::trailer_from_encoded(encoded);
	let kind = match trailer as u8 {
		0 => InternalKeyKind::Deletion,
		1 => InternalKeyKind::Value,
		k => return Err(Error::corruption(format!("unknown internal key kind: {k}"))),
	};
	Ok((trailer >> 8, kind))
}

/// Encode a key to seek with: positions at the newest entry for `user_key`
/// visible at `seq_num`.
pub(crate) fn seek_key(user_key: &[u8], seq_num: u64) -> Vec<u8> {
	InternalKey::new(user_key.to_vec(), seq_num, INTERNAL_KEY_KIND_FOR_SEEK).encode()
}
