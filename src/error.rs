use std::{fmt, io, sync::Arc};

/// Result returning Error
pub type Result<T> = std::result::Result<T, Error>;

/// `Error` is the crate-wide error type. Iterators and builders keep the
/// first error they hit as sticky status, so the type is cheap to clone.
#[derive(Clone, Debug)]
pub enum Error {
	NotFound,
	Corruption(String),
	Io(Arc<io::Error>),
	NotSupported(String),
	InvalidArgument(String),
}

impl Error {
	pub(crate) fn corruption(msg: impl Into<String>) -> Error {
		Error::Corruption(msg.into())
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::NotFound => write!(f, "Not found"),
			Error::Corruption(err) => write!(f, "Corruption: {err}"),
			Error::Io(err) => write!(f, "IO error: {err}"),
			Error::NotSupported(err) => write!(f, "Not supported: {err}"),
			Error::InvalidArgument(err) => write!(f, "Invalid argument: {err}"),
		}
	}
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(Arc::new(e))
	}
}
