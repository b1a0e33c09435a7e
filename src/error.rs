//! Core error taxonomy
//!
//! Per-record failures are recovered close to where they happen and logged;
//! per-volume failures abort only that volume. Only the variants below cross
//! module boundaries.

use thiserror::Error;

use crate::volume::DriveLetter;

/// Errors surfaced by the scan/index/update engine
#[derive(Error, Debug)]
pub enum CoreError {
	/// Volume cannot be indexed at all (not NTFS, journal disabled, gone)
	#[error("volume {drive} unavailable: {reason}")]
	VolumeUnavailable { drive: DriveLetter, reason: String },

	/// Raw volume handle refused; administrative rights are required
	#[error("access denied opening volume {drive}")]
	AccessDenied { drive: DriveLetter },

	/// Parent chain walk exhausted its depth guard (cyclic FRN graph)
	#[error("could not resolve a path for file reference {frn:#x}")]
	PathResolution { frn: u64 },

	/// Persisted index failed validation at load; caller rebuilds
	#[error("index corrupted: {0}")]
	IndexCorruption(String),

	/// Journal discarded entries past our checkpoint; incremental resume
	/// is untrustworthy and a full rescan is required
	#[error("change journal on volume {drive} wrapped past the last checkpoint")]
	JournalWrapped { drive: DriveLetter },

	/// Journal record that does not follow the USN_RECORD_V2 wire layout
	#[error("malformed journal record: {0}")]
	MalformedRecord(String),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("decode error: {0}")]
	Decode(#[from] postcard::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("configuration error: {0}")]
	Config(String),

	#[error("{0}")]
	Internal(String),
}

impl CoreError {
	/// Whether this error invalidates the incremental cursor and forces a
	/// full rescan of the volume.
	pub fn forces_rebuild(&self) -> bool {
		matches!(
			self,
			CoreError::JournalWrapped { .. } | CoreError::IndexCorruption(_)
		)
	}
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
