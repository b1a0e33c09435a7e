//! Incremental cursor persistence
//!
//! One small JSON file per volume records how far the journal has been
//! applied *and persisted*. A crash resumes from here, never from the
//! volume's live USN, which would silently skip the interval in between.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{CoreError, Result};

const CHECKPOINT_NAME: &str = "checkpoint.json";

/// Durable journal cursor for one volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
	/// Journal identity the cursor belongs to; a recreated journal
	/// invalidates the cursor entirely
	pub journal_id: u64,
	/// Every record up to and including this USN is reflected in the
	/// persisted snapshot
	pub last_applied_usn: i64,
}

/// Load the checkpoint, if one exists. An unreadable checkpoint is treated
/// as absent (the caller then falls back to the snapshot cursor or a full
/// rescan), not as a hard failure.
pub fn load(dir: &Path) -> Result<Option<CheckpointRecord>> {
	let path = dir.join(CHECKPOINT_NAME);
	let raw = match fs::read_to_string(&path) {
		Ok(raw) => raw,
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(err) => return Err(err.into()),
	};
	match serde_json::from_str(&raw) {
		Ok(record) => Ok(Some(record)),
		Err(err) => {
			warn!("discarding unreadable checkpoint {}: {err}", path.display());
			Ok(None)
		}
	}
}

/// Persist the checkpoint atomically (temp file + rename).
pub fn save(dir: &Path, record: &CheckpointRecord) -> Result<()> {
	fs::create_dir_all(dir)?;
	let mut tmp = NamedTempFile::new_in(dir)?;
	tmp.write_all(&serde_json::to_vec_pretty(record)?)?;
	tmp.as_file().sync_all()?;
	tmp.persist(dir.join(CHECKPOINT_NAME))
		.map_err(|err| CoreError::Io(err.error))?;
	Ok(())
}

/// Drop the checkpoint; the next attach will require a full rescan.
pub fn reset(dir: &Path) -> Result<()> {
	match fs::remove_file(dir.join(CHECKPOINT_NAME)) {
		Ok(()) => Ok(()),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(err) => Err(err.into()),
	}
}
