//! Volume access: discovery, journal sessions, wire records

pub mod detect;
pub mod platform;
pub mod types;
pub mod usn;

use std::collections::VecDeque;
use std::sync::Arc;

pub use types::{
	DiskKind, DriveLetter, FileAttributes, JournalInfo, ReasonFlags, UsnRecord, VolumeDescriptor,
};

use crate::error::Result;

/// One chunk of the MFT enumeration
#[derive(Debug)]
pub struct MftChunk {
	/// Reference point to resume the enumeration from
	pub next_frn: u64,
	pub records: Vec<UsnRecord>,
}

/// One drained run of journal records
#[derive(Debug)]
pub struct JournalDelta {
	/// Cursor to read the next delta from
	pub next_usn: i64,
	/// Strictly USN-ordered change records
	pub records: Vec<UsnRecord>,
}

/// Outcome of a blocking journal read
#[derive(Debug)]
pub enum DeltaRead {
	Records(JournalDelta),
	/// The wait was unblocked by [`SessionStopper::stop`]; clean shutdown
	Shutdown,
}

/// Unblocks a session's in-flight journal wait from another thread
pub trait SessionStopper: Send + Sync {
	fn stop(&self);
}

/// Raw journal access to one NTFS volume.
///
/// All methods block the calling thread (they wrap synchronous volume
/// ioctls) and are driven from dedicated blocking workers.
pub trait VolumeSession: Send {
	fn drive(&self) -> DriveLetter;

	/// Current journal identity and USN bounds.
	fn query_journal(&mut self) -> Result<JournalInfo>;

	/// Fetch the next buffer of MFT enumeration records starting at
	/// `start_frn`. `None` once the enumeration is exhausted.
	fn read_mft_chunk(&mut self, start_frn: u64) -> Result<Option<MftChunk>>;

	/// Read change records at or after `low_usn`, blocking at the OS level
	/// until at least one exists or [`SessionStopper::stop`] is called.
	fn read_journal_delta(&mut self, low_usn: i64) -> Result<DeltaRead>;

	/// Handle that cancels this session's blocking waits.
	fn stopper(&self) -> Arc<dyn SessionStopper>;
}

impl<S: VolumeSession + ?Sized> VolumeSession for Box<S> {
	fn drive(&self) -> DriveLetter {
		(**self).drive()
	}

	fn query_journal(&mut self) -> Result<JournalInfo> {
		(**self).query_journal()
	}

	fn read_mft_chunk(&mut self, start_frn: u64) -> Result<Option<MftChunk>> {
		(**self).read_mft_chunk(start_frn)
	}

	fn read_journal_delta(&mut self, low_usn: i64) -> Result<DeltaRead> {
		(**self).read_journal_delta(low_usn)
	}

	fn stopper(&self) -> Arc<dyn SessionStopper> {
		(**self).stopper()
	}
}

/// Lazy iterator over every record of a volume's MFT enumeration.
///
/// Restartable: construct with the last chunk's `next_frn` to resume.
pub struct EnumerateAll<'a, S: VolumeSession + ?Sized> {
	session: &'a mut S,
	next_frn: u64,
	pending: VecDeque<UsnRecord>,
	done: bool,
}

impl<'a, S: VolumeSession + ?Sized> EnumerateAll<'a, S> {
	pub fn new(session: &'a mut S, start_frn: u64) -> Self {
		Self {
			session,
			next_frn: start_frn,
			pending: VecDeque::new(),
			done: false,
		}
	}

	/// Reference point to hand back to [`EnumerateAll::new`] when resuming.
	pub fn position(&self) -> u64 {
		self.next_frn
	}
}

impl<S: VolumeSession + ?Sized> Iterator for EnumerateAll<'_, S> {
	type Item = Result<UsnRecord>;

	fn next(&mut self) -> Option<Self::Item> {
		loop {
			if let Some(record) = self.pending.pop_front() {
				return Some(Ok(record));
			}
			if self.done {
				return None;
			}
			match self.session.read_mft_chunk(self.next_frn) {
				Ok(Some(chunk)) => {
					self.next_frn = chunk.next_frn;
					self.pending.extend(chunk.records);
					// Empty chunks are legal; keep pulling until EOF.
				}
				Ok(None) => self.done = true,
				Err(err) => {
					self.done = true;
					return Some(Err(err));
				}
			}
		}
	}
}
