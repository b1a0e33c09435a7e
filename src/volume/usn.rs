//! USN change journal wire records
//!
//! Both `FSCTL_ENUM_USN_DATA` and `FSCTL_READ_USN_JOURNAL` fill their output
//! buffer with a single 8-byte continuation value followed by a run of
//! `USN_RECORD_V2` structures. Parsing is pure and buffer-in/records-out so
//! it can be exercised without a volume handle.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::volume::types::{FileAttributes, ReasonFlags, UsnRecord};

/// Fixed-size prefix of a `USN_RECORD_V2` before the UTF-16 name
pub const RECORD_HEADER_LEN: usize = 60;

/// Only major version 2 records are decoded; v3/v4 are length-skipped
const SUPPORTED_MAJOR_VERSION: u16 = 2;

/// Split a raw FSCTL output buffer into its continuation value (next start
/// FRN for enumeration, next USN for journal reads) and the record run.
pub fn split_continuation(buf: &[u8]) -> Result<(u64, &[u8])> {
	if buf.len() < 8 {
		return Err(CoreError::MalformedRecord(format!(
			"buffer of {} bytes cannot hold a continuation value",
			buf.len()
		)));
	}
	let continuation = u64::from_le_bytes(buf[..8].try_into().expect("checked length"));
	Ok((continuation, &buf[8..]))
}

/// Decode the record at the head of `buf`.
///
/// Returns the record and the total wire length to advance by (the on-disk
/// `RecordLength`, which includes padding to 8-byte alignment).
pub fn parse_record(buf: &[u8]) -> Result<(UsnRecord, usize)> {
	if buf.len() < RECORD_HEADER_LEN {
		return Err(CoreError::MalformedRecord(format!(
			"{} bytes left, record header needs {RECORD_HEADER_LEN}",
			buf.len()
		)));
	}

	let mut cursor = Cursor::new(buf);
	let record_length = cursor.read_u32::<LittleEndian>()? as usize;
	let major_version = cursor.read_u16::<LittleEndian>()?;
	let _minor_version = cursor.read_u16::<LittleEndian>()?;

	if record_length < RECORD_HEADER_LEN || record_length > buf.len() {
		return Err(CoreError::MalformedRecord(format!(
			"record length {record_length} out of bounds for {}-byte buffer",
			buf.len()
		)));
	}
	if major_version != SUPPORTED_MAJOR_VERSION {
		return Err(CoreError::MalformedRecord(format!(
			"unsupported record version {major_version}"
		)));
	}

	let frn = cursor.read_u64::<LittleEndian>()?;
	let parent_frn = cursor.read_u64::<LittleEndian>()?;
	let usn = cursor.read_i64::<LittleEndian>()?;
	let timestamp = cursor.read_i64::<LittleEndian>()?;
	let reason = ReasonFlags::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
	let _source_info = cursor.read_u32::<LittleEndian>()?;
	let _security_id = cursor.read_u32::<LittleEndian>()?;
	let attributes = FileAttributes::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
	let name_length = cursor.read_u16::<LittleEndian>()? as usize;
	let name_offset = cursor.read_u16::<LittleEndian>()? as usize;

	if name_length % 2 != 0 || name_offset + name_length > record_length {
		return Err(CoreError::MalformedRecord(format!(
			"name span {name_offset}+{name_length} escapes record of {record_length} bytes"
		)));
	}

	let name_bytes = &buf[name_offset..name_offset + name_length];
	let name_units: Vec<u16> = name_bytes
		.chunks_exact(2)
		.map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
		.collect();
	let name = String::from_utf16_lossy(&name_units);

	Ok((
		UsnRecord {
			frn,
			parent_frn,
			usn,
			timestamp,
			reason,
			attributes,
			name,
		},
		record_length,
	))
}

/// Decode every record in a continuation-stripped buffer.
///
/// A record that fails to decode poisons the rest of the buffer (records are
/// length-prefixed, there is no way to re-synchronize), so decoding stops
/// there; the malformed tail is logged and skipped rather than failing the
/// whole batch.
pub fn parse_batch(mut buf: &[u8]) -> Vec<UsnRecord> {
	let mut records = Vec::new();
	while !buf.is_empty() {
		match parse_record(buf) {
			Ok((record, consumed)) => {
				records.push(record);
				buf = &buf[consumed..];
			}
			Err(err) => {
				warn!(remaining = buf.len(), "skipping malformed journal tail: {err}");
				break;
			}
		}
	}
	records
}

/// Net effect of a change record on the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
	Create,
	Delete,
	RenameOldName,
	RenameNewName,
	/// Content/metadata change that leaves the name and location intact
	Other,
}

impl ChangeKind {
	/// Classify a record's reason flags.
	///
	/// Rename halves are distinct records and their flags are checked first:
	/// a `FILE_CREATE | FILE_DELETE` combination (created and deleted before
	/// close) nets out as a delete, which removal idempotence makes safe.
	pub fn from_reason(reason: ReasonFlags) -> Self {
		if reason.contains(ReasonFlags::RENAME_OLD_NAME) {
			ChangeKind::RenameOldName
		} else if reason.contains(ReasonFlags::RENAME_NEW_NAME) {
			ChangeKind::RenameNewName
		} else if reason.contains(ReasonFlags::FILE_DELETE) {
			ChangeKind::Delete
		} else if reason.contains(ReasonFlags::FILE_CREATE) {
			ChangeKind::Create
		} else {
			ChangeKind::Other
		}
	}
}
