//! Per-platform journal session implementations

pub mod mock;

#[cfg(windows)]
pub mod windows;

use crate::error::Result;
use crate::volume::{DriveLetter, VolumeSession};

/// Open the production journal session for a volume.
#[cfg(windows)]
pub fn open_session(drive: DriveLetter) -> Result<Box<dyn VolumeSession>> {
	Ok(Box::new(windows::NtfsVolumeSession::open(drive)?))
}

/// Raw NTFS journal access only exists on Windows; elsewhere every volume
/// is unavailable and callers fall back accordingly.
#[cfg(not(windows))]
pub fn open_session(drive: DriveLetter) -> Result<Box<dyn VolumeSession>> {
	Err(crate::error::CoreError::VolumeUnavailable {
		drive,
		reason: "NTFS change journals require Windows".into(),
	})
}
