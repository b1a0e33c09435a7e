//! DeviceIoControl-backed journal session
//!
//! Wraps the three volume FSCTLs behind [`VolumeSession`]: journal query,
//! MFT enumeration and the blocking journal read. All calls are synchronous
//! and run on blocking workers; an in-flight journal wait is unblocked with
//! `CancelIoEx` from the stopper, which callers treat as clean shutdown.

use std::ffi::c_void;
use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};
use windows_sys::Win32::Foundation::{
	CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_HANDLE_EOF,
	ERROR_JOURNAL_DELETE_IN_PROGRESS, ERROR_JOURNAL_ENTRY_DELETED, ERROR_JOURNAL_NOT_ACTIVE,
	ERROR_OPERATION_ABORTED, ERROR_PATH_NOT_FOUND, GENERIC_READ, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
	CreateFileW, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Ioctl::{
	FSCTL_ENUM_USN_DATA, FSCTL_QUERY_USN_JOURNAL, FSCTL_READ_USN_JOURNAL, MFT_ENUM_DATA_V0,
	READ_USN_JOURNAL_DATA_V0, USN_JOURNAL_DATA_V0,
};
use windows_sys::Win32::System::IO::{CancelIoEx, DeviceIoControl};

use crate::error::{CoreError, Result};
use crate::volume::usn::{parse_batch, split_continuation};
use crate::volume::{
	DeltaRead, DriveLetter, JournalDelta, JournalInfo, MftChunk, SessionStopper, VolumeSession,
};

/// Fixed output buffer for enumeration and journal reads
const IO_BUFFER_SIZE: usize = 64 * 1024;

fn wide(path: &str) -> Vec<u16> {
	OsStr::new(path).encode_wide().chain(std::iter::once(0)).collect()
}

/// Owned raw volume handle, closed on drop. The handle is only ever used
/// for synchronous ioctls and `CancelIoEx`, both safe from any thread.
struct VolumeHandle(HANDLE);

unsafe impl Send for VolumeHandle {}
unsafe impl Sync for VolumeHandle {}

impl Drop for VolumeHandle {
	fn drop(&mut self) {
		unsafe { CloseHandle(self.0) };
	}
}

struct Stopper {
	handle: Arc<VolumeHandle>,
	stopped: AtomicBool,
}

impl SessionStopper for Stopper {
	fn stop(&self) {
		self.stopped.store(true, Ordering::SeqCst);
		// Aborts the blocked DeviceIoControl with ERROR_OPERATION_ABORTED.
		unsafe { CancelIoEx(self.handle.0, std::ptr::null()) };
	}
}

/// Production [`VolumeSession`] over a raw `\\.\X:` handle
pub struct NtfsVolumeSession {
	drive: DriveLetter,
	handle: Arc<VolumeHandle>,
	stopper: Arc<Stopper>,
	journal_id: u64,
	high_usn: i64,
	buffer: Vec<u8>,
}

impl NtfsVolumeSession {
	/// Open the raw volume and verify its journal is readable.
	pub fn open(drive: DriveLetter) -> Result<Self> {
		let device = wide(&drive.device_path());
		let raw = unsafe {
			CreateFileW(
				device.as_ptr(),
				GENERIC_READ,
				FILE_SHARE_READ | FILE_SHARE_WRITE,
				std::ptr::null(),
				OPEN_EXISTING,
				0,
				std::ptr::null_mut(),
			)
		};
		if raw == INVALID_HANDLE_VALUE {
			return Err(match unsafe { GetLastError() } {
				ERROR_ACCESS_DENIED => CoreError::AccessDenied { drive },
				code @ (ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND) => CoreError::VolumeUnavailable {
					drive,
					reason: format!("volume not present (error {code})"),
				},
				code => CoreError::VolumeUnavailable {
					drive,
					reason: format!("open failed (error {code})"),
				},
			});
		}

		let handle = Arc::new(VolumeHandle(raw));
		let stopper = Arc::new(Stopper {
			handle: handle.clone(),
			stopped: AtomicBool::new(false),
		});
		let mut session = Self {
			drive,
			handle,
			stopper,
			journal_id: 0,
			high_usn: 0,
			buffer: vec![0u8; IO_BUFFER_SIZE],
		};

		let journal = session.query_journal()?;
		session.journal_id = journal.journal_id;
		session.high_usn = journal.next_usn;
		debug!(
			drive = %drive,
			journal_id = format_args!("{:#x}", journal.journal_id),
			next_usn = journal.next_usn,
			"volume session opened"
		);
		Ok(session)
	}

	fn ioctl(
		&self,
		control_code: u32,
		input: *const c_void,
		input_len: usize,
		output: &mut [u8],
	) -> std::result::Result<usize, u32> {
		let mut returned = 0u32;
		let ok = unsafe {
			DeviceIoControl(
				self.handle.0,
				control_code,
				input,
				input_len as u32,
				output.as_mut_ptr().cast(),
				output.len() as u32,
				&mut returned,
				std::ptr::null_mut(),
			)
		};
		if ok == 0 {
			Err(unsafe { GetLastError() })
		} else {
			Ok(returned as usize)
		}
	}
}

impl VolumeSession for NtfsVolumeSession {
	fn drive(&self) -> DriveLetter {
		self.drive
	}

	fn query_journal(&mut self) -> Result<JournalInfo> {
		let mut data: USN_JOURNAL_DATA_V0 = unsafe { std::mem::zeroed() };
		let out = unsafe {
			std::slice::from_raw_parts_mut(
				(&mut data as *mut USN_JOURNAL_DATA_V0).cast::<u8>(),
				std::mem::size_of::<USN_JOURNAL_DATA_V0>(),
			)
		};
		match self.ioctl(FSCTL_QUERY_USN_JOURNAL, std::ptr::null(), 0, out) {
			Ok(_) => Ok(JournalInfo {
				journal_id: data.UsnJournalID,
				first_usn: data.FirstUsn,
				next_usn: data.NextUsn,
			}),
			Err(ERROR_JOURNAL_NOT_ACTIVE) => Err(CoreError::VolumeUnavailable {
				drive: self.drive,
				reason: "change journal disabled".into(),
			}),
			Err(ERROR_JOURNAL_DELETE_IN_PROGRESS) => Err(CoreError::VolumeUnavailable {
				drive: self.drive,
				reason: "change journal being deleted".into(),
			}),
			Err(ERROR_ACCESS_DENIED) => Err(CoreError::AccessDenied { drive: self.drive }),
			Err(code) => Err(CoreError::VolumeUnavailable {
				drive: self.drive,
				reason: format!("journal query failed (error {code})"),
			}),
		}
	}

	fn read_mft_chunk(&mut self, start_frn: u64) -> Result<Option<MftChunk>> {
		let input = MFT_ENUM_DATA_V0 {
			StartFileReferenceNumber: start_frn,
			LowUsn: 0,
			HighUsn: self.high_usn,
		};
		let mut buffer = std::mem::take(&mut self.buffer);
		let result = self.ioctl(
			FSCTL_ENUM_USN_DATA,
			(&input as *const MFT_ENUM_DATA_V0).cast(),
			std::mem::size_of::<MFT_ENUM_DATA_V0>(),
			&mut buffer,
		);
		self.buffer = buffer;

		match result {
			Ok(returned) => {
				let (next_frn, records_buf) = split_continuation(&self.buffer[..returned])?;
				let records = parse_batch(records_buf);
				trace!(drive = %self.drive, start_frn, count = records.len(), "mft chunk");
				Ok(Some(MftChunk { next_frn, records }))
			}
			// Enumeration past the last record returns EOF, not zero bytes
			Err(ERROR_HANDLE_EOF) => Ok(None),
			Err(ERROR_ACCESS_DENIED) => Err(CoreError::AccessDenied { drive: self.drive }),
			Err(code) => Err(CoreError::VolumeUnavailable {
				drive: self.drive,
				reason: format!("MFT enumeration failed (error {code})"),
			}),
		}
	}

	fn read_journal_delta(&mut self, low_usn: i64) -> Result<DeltaRead> {
		let mut cursor = low_usn;
		loop {
			if self.stopper.stopped.load(Ordering::SeqCst) {
				return Ok(DeltaRead::Shutdown);
			}
			let input = READ_USN_JOURNAL_DATA_V0 {
				StartUsn: cursor,
				ReasonMask: u32::MAX,
				ReturnOnlyOnClose: 0,
				Timeout: 0,
				// Non-zero makes the call block until records exist: the
				// engine's single suspension point.
				BytesToWaitFor: 1,
				UsnJournalID: self.journal_id,
			};
			let mut buffer = std::mem::take(&mut self.buffer);
			let result = self.ioctl(
				FSCTL_READ_USN_JOURNAL,
				(&input as *const READ_USN_JOURNAL_DATA_V0).cast(),
				std::mem::size_of::<READ_USN_JOURNAL_DATA_V0>(),
				&mut buffer,
			);
			self.buffer = buffer;

			match result {
				Ok(returned) => {
					let (next_usn, records_buf) = split_continuation(&self.buffer[..returned])?;
					let records = parse_batch(records_buf);
					if records.is_empty() {
						// The journal advanced without indexable records;
						// follow the cursor and block again.
						cursor = next_usn as i64;
						continue;
					}
					return Ok(DeltaRead::Records(JournalDelta {
						next_usn: next_usn as i64,
						records,
					}));
				}
				Err(ERROR_OPERATION_ABORTED) => return Ok(DeltaRead::Shutdown),
				Err(ERROR_JOURNAL_ENTRY_DELETED) => {
					return Err(CoreError::JournalWrapped { drive: self.drive })
				}
				Err(ERROR_JOURNAL_NOT_ACTIVE | ERROR_JOURNAL_DELETE_IN_PROGRESS) => {
					return Err(CoreError::VolumeUnavailable {
						drive: self.drive,
						reason: "change journal no longer active".into(),
					})
				}
				Err(code) => {
					return Err(CoreError::VolumeUnavailable {
						drive: self.drive,
						reason: format!("journal read failed (error {code})"),
					})
				}
			}
		}
	}

	fn stopper(&self) -> Arc<dyn SessionStopper> {
		self.stopper.clone()
	}
}
