use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Positional reads against an immutable file. Implementations must be safe
/// to share across threads; table readers hold them behind `Arc` for the
/// lifetime of the table.
pub trait RandomAccessFile: Send + Sync {
	/// Fill `buf` from the file starting at `offset`. Short reads are errors.
	fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

#[cfg(unix)]
impl RandomAccessFile for std::fs::File {
	fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
		use std::os::unix::fs::FileExt;
		self.read_exact_at(buf, offset)?;
		Ok(())
	}
}

/// In-memory tables: handy for tests and for tables small enough to pin.
impl RandomAccessFile for Bytes {
	fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
		let offset = offset as usize;
		let end = offset.checked_add(buf.len()).filter(|&end| end <= self.len()).ok_or_else(
			|| {
				Error::Io(Arc::new(std::io::Error::new(
					std::io::ErrorKind::UnexpectedEof,
					"read past end of file",
				)))
			},
		)?;
		buf.copy_from_slice(&self[offset..end]);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_bytes_read_at() {
		let file = Bytes::from_static(b"hello world");
		let mut buf = [0u8; 5];
		file.read_at(6, &mut buf).unwrap();
		assert_eq!(&buf, b"world");
	}

	#[test]
	fn test_bytes_read_past_end() {
		let file = Bytes::from_static(b"short");
		let mut buf = [0u8; 8];
		assert!(matches!(file.read_at(0, &mut buf), Err(Error::Io(_))));
		assert!(matches!(file.read_at(100, &mut buf), Err(Error::Io(_))));
	}

	#[test]
	fn test_file_read_at() {
		use std::io::Write;

		let mut tmp = tempfile::tempfile().unwrap();
		tmp.write_all(b"0123456789").unwrap();

		let mut buf = [0u8; 4];
		tmp.read_at(3, &mut buf).unwrap();
		assert_eq!(&buf, b"3456");
	}
}
