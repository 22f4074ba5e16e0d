use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised by a [`PersistentStore`](super::PersistentStore).
///
/// Every variant means delivery can no longer be guaranteed for the session,
/// so the engine surfaces them to the application instead of continuing
/// unpersisted.
#[derive(Error, Debug, Clone)]
pub enum PersistenceError {
	/// Store used before `open` or after `close`
	#[error("Persistence store is not open")]
	NotOpen,

	/// The backing directory could not be created
	#[error("Persistence directory {path:?} is unavailable: {source}")]
	Unavailable {
		/// Session directory
		path: PathBuf,
		/// Underlying I/O error
		#[source]
		source: Arc<io::Error>,
	},

	/// The backing directory exists but is read-only
	#[error("Persistence directory {path:?} is not writable")]
	NotWritable {
		/// Session directory
		path: PathBuf,
	},

	/// Read, write, rename or delete failed
	#[error("I/O failure on {path:?}: {source}")]
	Io {
		/// File or directory involved
		path: PathBuf,
		/// Underlying I/O error
		#[source]
		source: Arc<io::Error>,
	},

	/// A record exists but cannot be decoded
	#[error("Persisted record '{key}' is corrupt: {reason}")]
	Corrupt {
		/// Record key
		key: String,
		/// Why decoding failed
		reason: String,
	},
}

impl PersistenceError {
	/// Creates a new Io error
	pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
		Self::Io {
			path: path.into(),
			source: Arc::new(source),
		}
	}

	/// Creates a new Unavailable error
	pub fn unavailable(path: impl Into<PathBuf>, source: io::Error) -> Self {
		Self::Unavailable {
			path: path.into(),
			source: Arc::new(source),
		}
	}

	/// Creates a new Corrupt error
	pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
		Self::Corrupt {
			key: key.into(),
			reason: reason.into(),
		}
	}

	/// Returns the error type for categorization
	pub fn error_type(&self) -> &'static str {
		match self {
			| PersistenceError::NotOpen => "not_open",
			| PersistenceError::Unavailable { .. } => "unavailable",
			| PersistenceError::NotWritable { .. } => "not_writable",
			| PersistenceError::Io { .. } => "io",
			| PersistenceError::Corrupt { .. } => "corrupt",
		}
	}
}

/// Convenient Result type for persistence operations
pub type PersistenceResult<T> = Result<T, PersistenceError>;
