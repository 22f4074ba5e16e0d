use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, error, info, warn};

use super::error::{PersistenceError, PersistenceResult};
use super::{PersistedRecord, PersistentStore};

const MESSAGE_FILE_EXTENSION: &str = ".msg";
const BACKUP_FILE_EXTENSION: &str = ".bak";
const HEADER_LENGTH_SIZE: usize = 4;

/// File-backed [`PersistentStore`].
///
/// Each session gets its own directory under `base_dir`, named after the
/// sanitized session key. Each record is one `<key>.msg` file holding a
/// big-endian `u32` header length, the header, then the payload.
///
/// Overwrites move the live file to `<key>.msg.bak` first and delete the
/// backup only after the new file is synced. A `.bak` found by
/// [`open`](PersistentStore::open) is evidence of a crash mid-write and is
/// renamed back, restoring the pre-crash record.
#[derive(Debug)]
pub struct FilePersistence {
	base_dir: PathBuf,
	client_dir: Option<PathBuf>,
}

impl FilePersistence {
	/// Creates a store rooted at `base_dir`. Nothing touches the disk until
	/// `open`.
	pub fn new(base_dir: impl Into<PathBuf>) -> Self {
		Self {
			base_dir: base_dir.into(),
			client_dir: None,
		}
	}

	/// Directory of the open session, if any
	pub fn client_dir(&self) -> Option<&Path> {
		self.client_dir.as_deref()
	}

	fn dir(&self) -> PersistenceResult<&Path> {
		self.client_dir
			.as_deref()
			.ok_or(PersistenceError::NotOpen)
	}
}

/// Strips every character that is not alphanumeric, `_` or `-`.
pub fn sanitize_session_key(session_key: &str) -> String {
	session_key
		.chars()
		.filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-'))
		.collect()
}

fn record_path(dir: &Path, key: &str) -> PathBuf {
	dir.join(format!("{key}{MESSAGE_FILE_EXTENSION}"))
}

fn backup_path(dir: &Path, key: &str) -> PathBuf {
	dir.join(format!(
		"{key}{MESSAGE_FILE_EXTENSION}{BACKUP_FILE_EXTENSION}"
	))
}

/// Renames `from` onto `to`. If the rename fails, deletes `to` and retries
/// once, so a stale target never blocks the move.
fn rename_with_retry(from: &Path, to: &Path) -> PersistenceResult<()> {
	if fs::rename(from, to).is_ok() {
		return Ok(());
	}
	match fs::remove_file(to) {
		| Ok(()) => {}
		| Err(err) if err.kind() == io::ErrorKind::NotFound => {}
		| Err(err) => return Err(PersistenceError::io(to, err)),
	}
	fs::rename(from, to).map_err(|err| PersistenceError::io(from, err))
}

fn write_record(
	path: &Path,
	header: &[u8],
	payload: &[u8],
) -> PersistenceResult<()> {
	let header_len = u32::try_from(header.len()).map_err(|_| {
		PersistenceError::io(
			path,
			io::Error::new(io::ErrorKind::InvalidInput, "record header too large"),
		)
	})?;
	let mut frame =
		BytesMut::with_capacity(HEADER_LENGTH_SIZE + header.len() + payload.len());
	frame.put_u32(header_len);
	frame.put_slice(header);
	frame.put_slice(payload);

	let mut file = File::create(path).map_err(|err| PersistenceError::io(path, err))?;
	file.write_all(&frame)
		.and_then(|_| file.flush())
		.and_then(|_| file.sync_all())
		.map_err(|err| PersistenceError::io(path, err))
}

fn decode_record(key: &str, raw: Vec<u8>) -> PersistenceResult<PersistedRecord> {
	let mut raw = Bytes::from(raw);
	if raw.len() < HEADER_LENGTH_SIZE {
		return Err(PersistenceError::corrupt(key, "missing header length"));
	}
	let header_len = raw.get_u32() as usize;
	if raw.len() < header_len {
		return Err(PersistenceError::corrupt(
			key,
			format!("header length {header_len} exceeds {} bytes", raw.len()),
		));
	}
	let header = raw.split_to(header_len);
	Ok(PersistedRecord::new(key, header, raw))
}

/// Renames every orphan `*.bak` in `dir` back to its original name.
fn restore_backups(dir: &Path) -> PersistenceResult<usize> {
	let entries = fs::read_dir(dir).map_err(|err| PersistenceError::io(dir, err))?;
	let mut restored = 0;
	for entry in entries {
		let entry = entry.map_err(|err| PersistenceError::io(dir, err))?;
		let file_name = entry.file_name();
		let Some(name) = file_name.to_str() else {
			continue;
		};
		let Some(original) = name.strip_suffix(BACKUP_FILE_EXTENSION) else {
			continue;
		};
		let original_path = dir.join(original);
		rename_with_retry(&entry.path(), &original_path)?;
		warn!(
			record = %original,
			"Restored record from backup left by an interrupted write"
		);
		restored += 1;
	}
	Ok(restored)
}

impl PersistentStore for FilePersistence {
	fn open(&mut self, session_key: &str) -> PersistenceResult<()> {
		let dir = self.base_dir.join(sanitize_session_key(session_key));
		fs::create_dir_all(&dir)
			.map_err(|err| PersistenceError::unavailable(&dir, err))?;
		let metadata =
			fs::metadata(&dir).map_err(|err| PersistenceError::unavailable(&dir, err))?;
		if !metadata.is_dir() {
			return Err(PersistenceError::unavailable(
				&dir,
				io::Error::new(io::ErrorKind::Other, "not a directory"),
			));
		}
		if metadata.permissions().readonly() {
			return Err(PersistenceError::NotWritable { path: dir });
		}

		let restored = restore_backups(&dir)?;
		info!(directory = ?dir, restored, "Opened file persistence");
		self.client_dir = Some(dir);
		Ok(())
	}

	fn put(
		&mut self,
		key: &str,
		header: &[u8],
		payload: &[u8],
	) -> PersistenceResult<()> {
		let dir = self.dir()?;
		let path = record_path(dir, key);
		let backup = backup_path(dir, key);

		if path.exists() {
			rename_with_retry(&path, &backup)?;
		}

		match write_record(&path, header, payload) {
			| Ok(()) => {
				if backup.exists() {
					fs::remove_file(&backup)
						.map_err(|err| PersistenceError::io(&backup, err))?;
				}
				debug!(key, bytes = header.len() + payload.len(), "Persisted record");
				Ok(())
			}
			| Err(err) => {
				if backup.exists() {
					if let Err(restore_err) = rename_with_retry(&backup, &path) {
						error!(
							key,
							error = %restore_err,
							"Failed to restore record from backup after write failure"
						);
					}
				}
				Err(err)
			}
		}
	}

	fn get(&self, key: &str) -> PersistenceResult<Option<PersistedRecord>> {
		let path = record_path(self.dir()?, key);
		match fs::read(&path) {
			| Ok(raw) => decode_record(key, raw).map(Some),
			| Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
			| Err(err) => Err(PersistenceError::io(path, err)),
		}
	}

	fn remove(&mut self, key: &str) -> PersistenceResult<()> {
		let path = record_path(self.dir()?, key);
		match fs::remove_file(&path) {
			| Ok(()) => Ok(()),
			| Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
			| Err(err) => Err(PersistenceError::io(path, err)),
		}
	}

	fn keys(&self) -> PersistenceResult<BTreeSet<String>> {
		let dir = self.dir()?;
		let entries = fs::read_dir(dir).map_err(|err| PersistenceError::io(dir, err))?;
		let mut keys = BTreeSet::new();
		for entry in entries {
			let entry = entry.map_err(|err| PersistenceError::io(dir, err))?;
			if let Some(key) = entry
				.file_name()
				.to_str()
				.and_then(|name| name.strip_suffix(MESSAGE_FILE_EXTENSION))
			{
				keys.insert(key.to_string());
			}
		}
		Ok(keys)
	}

	fn contains_key(&self, key: &str) -> PersistenceResult<bool> {
		Ok(record_path(self.dir()?, key).is_file())
	}

	fn clear(&mut self) -> PersistenceResult<()> {
		let keys = self.keys()?;
		for key in &keys {
			self.remove(key)?;
		}
		debug!(removed = keys.len(), "Cleared persisted records");
		Ok(())
	}

	fn close(&mut self) -> PersistenceResult<()> {
		let Some(dir) = self.client_dir.take() else {
			return Ok(());
		};
		let is_empty = fs::read_dir(&dir)
			.map(|mut entries| entries.next().is_none())
			.unwrap_or(false);
		if is_empty {
			if let Err(err) = fs::remove_dir(&dir) {
				warn!(directory = ?dir, error = %err, "Failed to remove empty session directory");
			}
		}
		debug!(directory = ?dir, "Closed file persistence");
		Ok(())
	}
}
