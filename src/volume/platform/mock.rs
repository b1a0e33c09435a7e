//! Scriptable in-memory volume session
//!
//! Backs the integration tests (and any non-Windows development) with the
//! exact `VolumeSession` semantics the production implementation has: finite
//! chunked MFT enumeration, a journal cursor, a genuinely blocking delta
//! wait, wrap simulation, and stop-unblocks-wait cancellation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{CoreError, Result};
use crate::volume::{
	DeltaRead, DriveLetter, JournalDelta, JournalInfo, MftChunk, SessionStopper, UsnRecord,
	VolumeSession,
};

const DEFAULT_CHUNK_SIZE: usize = 256;

struct State {
	journal: Mutex<JournalInfo>,
	/// Records returned by MFT enumeration, sorted by FRN on first read
	mft: Mutex<Vec<UsnRecord>>,
	pending: Mutex<VecDeque<UsnRecord>>,
	/// Signals new pending records or a stop
	wakeup: Condvar,
	stopped: AtomicBool,
	chunk_size: AtomicUsize,
}

/// Test-side controls for a [`MockVolumeSession`]
#[derive(Clone)]
pub struct MockVolumeHandle {
	state: Arc<State>,
}

impl MockVolumeHandle {
	/// Replace the volume's enumerable file population.
	pub fn set_mft(&self, mut records: Vec<UsnRecord>) {
		records.sort_by_key(|record| record.frn);
		*self.state.mft.lock() = records;
	}

	pub fn set_mft_chunk_size(&self, size: usize) {
		self.state.chunk_size.store(size.max(1), Ordering::Relaxed);
	}

	/// Append a change record to the journal and wake any blocked reader.
	pub fn push_change(&self, record: UsnRecord) {
		// Lock order: journal before pending is never held together; a
		// blocked reader holds `pending` while briefly taking `journal`.
		{
			let mut journal = self.state.journal.lock();
			journal.next_usn = journal.next_usn.max(record.usn + 1);
		}
		self.state.pending.lock().push_back(record);
		self.state.wakeup.notify_all();
	}

	/// Discard journal history before `first_usn`, as NTFS does when the
	/// journal wraps.
	pub fn wrap_journal_to(&self, first_usn: i64) {
		let mut journal = self.state.journal.lock();
		journal.first_usn = first_usn;
		journal.next_usn = journal.next_usn.max(first_usn);
		self.state.wakeup.notify_all();
	}

	pub fn journal(&self) -> JournalInfo {
		*self.state.journal.lock()
	}

	/// Open another session over the same scripted volume (a real volume
	/// hands out independent handles the same way).
	pub fn open_session(&self, drive: DriveLetter) -> MockVolumeSession {
		MockVolumeSession {
			drive,
			state: self.state.clone(),
			cancelled: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn stop(&self) {
		self.state.stopped.store(true, Ordering::SeqCst);
		self.state.wakeup.notify_all();
	}
}

impl SessionStopper for MockVolumeHandle {
	fn stop(&self) {
		MockVolumeHandle::stop(self);
	}
}

/// Unblocks one session's waits without touching the volume's other
/// sessions (CancelIoEx is handle-scoped the same way)
struct SessionCancel {
	state: Arc<State>,
	cancelled: Arc<AtomicBool>,
}

impl SessionStopper for SessionCancel {
	fn stop(&self) {
		self.cancelled.store(true, Ordering::SeqCst);
		self.state.wakeup.notify_all();
	}
}

/// Deterministic [`VolumeSession`] over in-memory records
pub struct MockVolumeSession {
	drive: DriveLetter,
	state: Arc<State>,
	cancelled: Arc<AtomicBool>,
}

impl MockVolumeSession {
	pub fn new(drive: DriveLetter) -> (Self, MockVolumeHandle) {
		let state = Arc::new(State {
			journal: Mutex::new(JournalInfo {
				journal_id: 0x51_5345_454B, // arbitrary non-zero identity
				first_usn: 0,
				next_usn: 1,
			}),
			mft: Mutex::new(Vec::new()),
			pending: Mutex::new(VecDeque::new()),
			wakeup: Condvar::new(),
			stopped: AtomicBool::new(false),
			chunk_size: AtomicUsize::new(DEFAULT_CHUNK_SIZE),
		});
		let handle = MockVolumeHandle {
			state: state.clone(),
		};
		(
			Self {
				drive,
				state,
				cancelled: Arc::new(AtomicBool::new(false)),
			},
			handle,
		)
	}

	fn is_stopped(&self) -> bool {
		self.state.stopped.load(Ordering::SeqCst) || self.cancelled.load(Ordering::SeqCst)
	}
}

impl VolumeSession for MockVolumeSession {
	fn drive(&self) -> DriveLetter {
		self.drive
	}

	fn query_journal(&mut self) -> Result<JournalInfo> {
		Ok(*self.state.journal.lock())
	}

	fn read_mft_chunk(&mut self, start_frn: u64) -> Result<Option<MftChunk>> {
		let chunk_size = self.state.chunk_size.load(Ordering::Relaxed);
		let mft = self.state.mft.lock();
		let records: Vec<UsnRecord> = mft
			.iter()
			.filter(|record| record.frn >= start_frn)
			.take(chunk_size)
			.cloned()
			.collect();
		Ok(records.last().map(|last| MftChunk {
			next_frn: last.frn + 1,
			records: records.clone(),
		}))
	}

	fn read_journal_delta(&mut self, low_usn: i64) -> Result<DeltaRead> {
		{
			let journal = self.state.journal.lock();
			if low_usn < journal.first_usn {
				return Err(CoreError::JournalWrapped { drive: self.drive });
			}
		}

		let mut pending = self.state.pending.lock();
		loop {
			if self.is_stopped() {
				return Ok(DeltaRead::Shutdown);
			}
			let has_new = pending.iter().any(|record| record.usn >= low_usn);
			if has_new {
				break;
			}
			// True blocking wait: no polling, woken by push/stop/wrap.
			self.state.wakeup.wait(&mut pending);
			let journal = self.state.journal.lock();
			if low_usn < journal.first_usn {
				return Err(CoreError::JournalWrapped { drive: self.drive });
			}
		}

		let mut records: Vec<UsnRecord> = pending
			.iter()
			.filter(|record| record.usn >= low_usn)
			.cloned()
			.collect();
		records.sort_by_key(|record| record.usn);
		// Consumed history ages out once read, like a real journal cursor
		// advancing; records stay until then so re-reads are possible.
		pending.retain(|record| record.usn < low_usn);

		let next_usn = records.last().map(|last| last.usn + 1).unwrap_or(low_usn);
		Ok(DeltaRead::Records(JournalDelta { next_usn, records }))
	}

	fn stopper(&self) -> Arc<dyn SessionStopper> {
		Arc::new(SessionCancel {
			state: self.state.clone(),
			cancelled: self.cancelled.clone(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::volume::types::{FileAttributes, ReasonFlags};
	use std::time::Duration;

	fn change(frn: u64, usn: i64, name: &str, reason: ReasonFlags) -> UsnRecord {
		UsnRecord {
			frn,
			parent_frn: 5,
			usn,
			timestamp: 0,
			reason,
			attributes: FileAttributes::empty(),
			name: name.into(),
		}
	}

	#[test]
	fn delta_read_blocks_until_a_change_arrives() {
		let (mut session, handle) = MockVolumeSession::new(DriveLetter::new('C').unwrap());

		let pusher = std::thread::spawn({
			let handle = handle.clone();
			move || {
				std::thread::sleep(Duration::from_millis(50));
				handle.push_change(change(9, 10, "new.txt", ReasonFlags::FILE_CREATE));
			}
		});

		match session.read_journal_delta(0).unwrap() {
			DeltaRead::Records(delta) => {
				assert_eq!(delta.records.len(), 1);
				assert_eq!(delta.records[0].name, "new.txt");
				assert_eq!(delta.next_usn, 11);
			}
			DeltaRead::Shutdown => panic!("unexpected shutdown"),
		}
		pusher.join().unwrap();
	}

	#[test]
	fn stop_unblocks_the_wait_as_clean_shutdown() {
		let (mut session, handle) = MockVolumeSession::new(DriveLetter::new('C').unwrap());

		let stopper = std::thread::spawn({
			let handle = handle.clone();
			move || {
				std::thread::sleep(Duration::from_millis(50));
				handle.stop();
			}
		});

		assert!(matches!(
			session.read_journal_delta(0).unwrap(),
			DeltaRead::Shutdown
		));
		stopper.join().unwrap();
	}

	#[test]
	fn reading_before_first_usn_reports_wrap() {
		let (mut session, handle) = MockVolumeSession::new(DriveLetter::new('C').unwrap());
		handle.wrap_journal_to(1000);

		assert!(matches!(
			session.read_journal_delta(10),
			Err(CoreError::JournalWrapped { .. })
		));
	}

	#[test]
	fn delta_records_arrive_in_usn_order() {
		let (mut session, handle) = MockVolumeSession::new(DriveLetter::new('C').unwrap());
		handle.push_change(change(2, 20, "b", ReasonFlags::FILE_CREATE));
		handle.push_change(change(1, 10, "a", ReasonFlags::FILE_CREATE));

		match session.read_journal_delta(0).unwrap() {
			DeltaRead::Records(delta) => {
				let usns: Vec<i64> = delta.records.iter().map(|r| r.usn).collect();
				assert_eq!(usns, [10, 20]);
			}
			DeltaRead::Shutdown => panic!("unexpected shutdown"),
		}
	}
}
