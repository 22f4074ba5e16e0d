//! Persistent storage of in-flight session records
//!
//! A store keeps opaque records (header bytes + payload bytes) keyed by a
//! string, and must survive a process restart when the session is durable.
//! [`FilePersistence`] writes one file per record with a backup-then-overwrite
//! protocol, so a crash while overwriting a record leaves the previous
//! version recoverable.
//! [`MemoryPersistence`] implements the same contract without durability.

/// Store error types
pub mod error;
/// File-backed store
pub mod file_store;
/// In-memory store
pub mod memory_store;

use std::collections::BTreeSet;

use bytes::Bytes;

pub use error::{PersistenceError, PersistenceResult};
pub use file_store::FilePersistence;
pub use memory_store::MemoryPersistence;

/// A record as stored by a [`PersistentStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
	/// Key the record is stored under
	pub key: String,
	/// Record header bytes
	pub header: Bytes,
	/// Record payload bytes
	pub payload: Bytes,
}

impl PersistedRecord {
	/// Creates a record from its parts
	pub fn new(
		key: impl Into<String>,
		header: impl Into<Bytes>,
		payload: impl Into<Bytes>,
	) -> Self {
		Self {
			key: key.into(),
			header: header.into(),
			payload: payload.into(),
		}
	}
}

/// Key/value store of persisted session records.
///
/// Calls are synchronous and may block on disk I/O. The delivery engine
/// serializes every call behind its session lock, so implementations need no
/// internal locking.
pub trait PersistentStore: Send {
	/// Opens the store for the given session key.
	///
	/// Must finish any crash recovery before returning.
	fn open(&mut self, session_key: &str) -> PersistenceResult<()>;

	/// Stores a record, replacing any existing record under `key`.
	fn put(
		&mut self,
		key: &str,
		header: &[u8],
		payload: &[u8],
	) -> PersistenceResult<()>;

	/// Fetches the record stored under `key`.
	fn get(&self, key: &str) -> PersistenceResult<Option<PersistedRecord>>;

	/// Removes the record stored under `key`. Missing keys are not an error.
	fn remove(&mut self, key: &str) -> PersistenceResult<()>;

	/// Returns every stored key.
	fn keys(&self) -> PersistenceResult<BTreeSet<String>>;

	/// Returns true if a record is stored under `key`.
	fn contains_key(&self, key: &str) -> PersistenceResult<bool> {
		Ok(self.keys()?.contains(key))
	}

	/// Removes every record.
	fn clear(&mut self) -> PersistenceResult<()>;

	/// Closes the store. Records are kept so a durable session can resume.
	fn close(&mut self) -> PersistenceResult<()>;
}
