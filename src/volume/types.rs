//! Volume and journal value types

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// A validated drive letter (`A`..`Z`), the volume-scoped namespace root
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DriveLetter(char);

impl DriveLetter {
	/// Create from a letter, normalizing case. Returns `None` for anything
	/// outside `A`..`Z`.
	pub fn new(letter: char) -> Option<Self> {
		let upper = letter.to_ascii_uppercase();
		upper.is_ascii_uppercase().then_some(Self(upper))
	}

	pub fn as_char(&self) -> char {
		self.0
	}

	/// Filesystem root of the volume, e.g. `C:\`
	pub fn root_path(&self) -> String {
		format!("{}:\\", self.0)
	}

	/// Raw volume namespace path, e.g. `\\.\C:`
	pub fn device_path(&self) -> String {
		format!(r"\\.\{}:", self.0)
	}
}

impl fmt::Display for DriveLetter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:", self.0)
	}
}

impl std::str::FromStr for DriveLetter {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut chars = s.trim_end_matches(&[':', '\\', '/'][..]).chars();
		match (chars.next(), chars.next()) {
			(Some(c), None) => Self::new(c).ok_or_else(|| format!("invalid drive letter: {s}")),
			_ => Err(format!("invalid drive letter: {s}")),
		}
	}
}

bitflags! {
	/// NTFS file attribute flags carried on every journal record
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
	pub struct FileAttributes: u32 {
		const READONLY      = 0x0000_0001;
		const HIDDEN        = 0x0000_0002;
		const SYSTEM        = 0x0000_0004;
		const DIRECTORY     = 0x0000_0010;
		const ARCHIVE       = 0x0000_0020;
		const TEMPORARY     = 0x0000_0100;
		const SPARSE_FILE   = 0x0000_0200;
		const REPARSE_POINT = 0x0000_0400;
		const COMPRESSED    = 0x0000_0800;
		const OFFLINE       = 0x0000_1000;
	}
}

bitflags! {
	/// USN change reason flags (`USN_REASON_*`)
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
	pub struct ReasonFlags: u32 {
		const DATA_OVERWRITE        = 0x0000_0001;
		const DATA_EXTEND           = 0x0000_0002;
		const DATA_TRUNCATION       = 0x0000_0004;
		const FILE_CREATE           = 0x0000_0100;
		const FILE_DELETE           = 0x0000_0200;
		const EA_CHANGE             = 0x0000_0400;
		const SECURITY_CHANGE       = 0x0000_0800;
		const RENAME_OLD_NAME       = 0x0000_1000;
		const RENAME_NEW_NAME       = 0x0000_2000;
		const INDEXABLE_CHANGE      = 0x0000_4000;
		const BASIC_INFO_CHANGE     = 0x0000_8000;
		const HARD_LINK_CHANGE      = 0x0001_0000;
		const COMPRESSION_CHANGE    = 0x0002_0000;
		const ENCRYPTION_CHANGE     = 0x0004_0000;
		const OBJECT_ID_CHANGE      = 0x0008_0000;
		const REPARSE_POINT_CHANGE  = 0x0010_0000;
		const STREAM_CHANGE         = 0x0020_0000;
		const CLOSE                 = 0x8000_0000;
	}
}

/// State of a volume's change journal, from `FSCTL_QUERY_USN_JOURNAL`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalInfo {
	/// Identity of the journal; changes when the journal is recreated
	pub journal_id: u64,
	/// Oldest USN still present in the journal
	pub first_usn: i64,
	/// USN that the next change will be assigned
	pub next_usn: i64,
}

/// One file/directory metadata record, from MFT enumeration or the journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsnRecord {
	/// File Reference Number, unique within the volume
	pub frn: u64,
	/// FRN of the containing directory
	pub parent_frn: u64,
	/// Journal offset of this record (0 for MFT enumeration records)
	pub usn: i64,
	/// NTFS timestamp (100ns ticks since 1601) of the change
	pub timestamp: i64,
	pub reason: ReasonFlags,
	pub attributes: FileAttributes,
	pub name: String,
}

impl UsnRecord {
	pub fn is_directory(&self) -> bool {
		self.attributes.contains(FileAttributes::DIRECTORY)
	}
}

/// Physical storage class of a drive, driving the scan schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskKind {
	/// No seek penalty; scans run concurrently
	SolidState,
	/// Seek penalty; scans run strictly sequentially
	Rotational,
	/// Classification query unsupported; scheduled as rotational
	Unknown,
}

impl DiskKind {
	/// Whether scans of this kind may run in parallel with each other.
	pub fn supports_parallel_scan(&self) -> bool {
		matches!(self, DiskKind::SolidState)
	}
}

impl fmt::Display for DiskKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DiskKind::SolidState => write!(f, "SSD"),
			DiskKind::Rotational => write!(f, "HDD"),
			DiskKind::Unknown => write!(f, "Unknown"),
		}
	}
}

/// A discovered volume, as reported by [`crate::volume::detect`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDescriptor {
	pub drive: DriveLetter,
	/// Volume label, or the root path when unlabeled
	pub label: String,
	/// Filesystem name as reported by the OS (`NTFS`, `FAT32`, ...)
	pub filesystem: String,
	pub disk_kind: DiskKind,
	pub total_bytes: u64,
	pub available_bytes: u64,
}

impl VolumeDescriptor {
	/// Only NTFS volumes carry a change journal this engine can read.
	pub fn is_ntfs(&self) -> bool {
		self.filesystem.eq_ignore_ascii_case("NTFS")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn drive_letter_normalizes_and_formats() {
		let drive = DriveLetter::new('c').unwrap();
		assert_eq!(drive.as_char(), 'C');
		assert_eq!(drive.to_string(), "C:");
		assert_eq!(drive.root_path(), "C:\\");
		assert_eq!(drive.device_path(), r"\\.\C:");
	}

	#[test]
	fn drive_letter_rejects_non_letters() {
		assert!(DriveLetter::new('3').is_none());
		assert!(DriveLetter::new('\\').is_none());
	}

	#[test]
	fn drive_letter_parses_common_spellings() {
		for spelling in ["D", "d:", "D:\\", "d:/"] {
			let parsed: DriveLetter = spelling.parse().unwrap();
			assert_eq!(parsed.as_char(), 'D');
		}
		assert!("DE".parse::<DriveLetter>().is_err());
		assert!("".parse::<DriveLetter>().is_err());
	}

	#[test]
	fn directory_attribute_detection() {
		let record = UsnRecord {
			frn: 10,
			parent_frn: 5,
			usn: 0,
			timestamp: 0,
			reason: ReasonFlags::empty(),
			attributes: FileAttributes::DIRECTORY | FileAttributes::HIDDEN,
			name: "Windows".into(),
		};
		assert!(record.is_directory());
	}

	#[test]
	fn ntfs_filter_is_case_insensitive() {
		let volume = VolumeDescriptor {
			drive: DriveLetter::new('C').unwrap(),
			label: "System".into(),
			filesystem: "ntfs".into(),
			disk_kind: DiskKind::SolidState,
			total_bytes: 0,
			available_bytes: 0,
		};
		assert!(volume.is_ntfs());
	}
}
