use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;

use super::error::{PersistenceError, PersistenceResult};
use super::{PersistedRecord, PersistentStore};

/// In-memory [`PersistentStore`] for sessions that do not need to survive a
/// restart.
///
/// Records outlive `close` so reopening the same instance resumes the
/// session. There is no backup step because there is nothing to tear.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
	records: HashMap<String, PersistedRecord>,
	open: bool,
}

impl MemoryPersistence {
	/// Creates an empty, closed store
	pub fn new() -> Self {
		Self::default()
	}

	fn ensure_open(&self) -> PersistenceResult<()> {
		if self.open {
			Ok(())
		} else {
			Err(PersistenceError::NotOpen)
		}
	}
}

impl PersistentStore for MemoryPersistence {
	fn open(&mut self, _session_key: &str) -> PersistenceResult<()> {
		self.open = true;
		Ok(())
	}

	fn put(
		&mut self,
		key: &str,
		header: &[u8],
		payload: &[u8],
	) -> PersistenceResult<()> {
		self.ensure_open()?;
		let record = PersistedRecord::new(
			key,
			Bytes::copy_from_slice(header),
			Bytes::copy_from_slice(payload),
		);
		self.records.insert(key.to_string(), record);
		Ok(())
	}

	fn get(&self, key: &str) -> PersistenceResult<Option<PersistedRecord>> {
		self.ensure_open()?;
		Ok(self.records.get(key).cloned())
	}

	fn remove(&mut self, key: &str) -> PersistenceResult<()> {
		self.ensure_open()?;
		self.records.remove(key);
		Ok(())
	}

	fn keys(&self) -> PersistenceResult<BTreeSet<String>> {
		self.ensure_open()?;
		Ok(self.records.keys().cloned().collect())
	}

	fn contains_key(&self, key: &str) -> PersistenceResult<bool> {
		self.ensure_open()?;
		Ok(self.records.contains_key(key))
	}

	fn clear(&mut self) -> PersistenceResult<()> {
		self.ensure_open()?;
		self.records.clear();
		Ok(())
	}

	fn close(&mut self) -> PersistenceResult<()> {
		self.open = false;
		Ok(())
	}
}
