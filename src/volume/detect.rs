//! Volume discovery, disk classification and the privilege probe

use tracing::debug;

use crate::volume::types::{DiskKind, DriveLetter, VolumeDescriptor};

/// Enumerate fixed/removable volumes on the system.
pub fn discover_volumes() -> Vec<VolumeDescriptor> {
	let volumes = imp::discover_volumes();
	debug!(count = volumes.len(), "volume discovery complete");
	volumes
}

/// Classify a drive's physical storage.
///
/// `Unknown` (query unsupported, e.g. some USB bridges and virtual disks)
/// is scheduled like a rotational disk; misclassifying an SSD as rotational
/// only costs parallelism, never correctness.
pub fn classify(drive: DriveLetter) -> DiskKind {
	imp::classify(drive)
}

/// Whether this process can open raw volume handles (requires membership in
/// the administrators group on Windows). The engine fails fast when this is
/// false; the surrounding application owns the elevation flow.
pub fn has_required_privilege() -> bool {
	imp::has_required_privilege()
}

#[cfg(windows)]
mod imp {
	use std::ffi::OsStr;
	use std::os::windows::ffi::OsStrExt;

	use tracing::trace;
	use windows_sys::Win32::Foundation::{CloseHandle, GENERIC_READ, INVALID_HANDLE_VALUE};
	use windows_sys::Win32::Storage::FileSystem::{
		CreateFileW, GetDiskFreeSpaceExW, GetDriveTypeW, GetLogicalDrives, GetVolumeInformationW,
		DRIVE_FIXED, DRIVE_REMOVABLE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
	};
	use windows_sys::Win32::System::Ioctl::{
		DEVICE_SEEK_PENALTY_DESCRIPTOR, IOCTL_STORAGE_QUERY_PROPERTY, PropertyStandardQuery,
		StorageDeviceSeekPenaltyProperty, STORAGE_PROPERTY_QUERY,
	};
	use windows_sys::Win32::System::IO::DeviceIoControl;

	use super::*;

	fn wide(path: &str) -> Vec<u16> {
		OsStr::new(path).encode_wide().chain(std::iter::once(0)).collect()
	}

	fn utf16_z(buf: &[u16]) -> String {
		let len = buf.iter().position(|&unit| unit == 0).unwrap_or(buf.len());
		String::from_utf16_lossy(&buf[..len])
	}

	pub fn discover_volumes() -> Vec<VolumeDescriptor> {
		let mut volumes = Vec::new();
		let mask = unsafe { GetLogicalDrives() };

		for bit in 0..26u8 {
			if mask & (1 << bit) == 0 {
				continue;
			}
			let Some(drive) = DriveLetter::new((b'A' + bit) as char) else {
				continue;
			};
			let root = wide(&drive.root_path());
			let drive_type = unsafe { GetDriveTypeW(root.as_ptr()) };
			if drive_type != DRIVE_FIXED && drive_type != DRIVE_REMOVABLE {
				continue;
			}
			if let Some(volume) = describe(drive, &root) {
				volumes.push(volume);
			}
		}
		volumes
	}

	fn describe(drive: DriveLetter, root: &[u16]) -> Option<VolumeDescriptor> {
		let mut label_buf = [0u16; 256];
		let mut fs_buf = [0u16; 256];
		let mut serial = 0u32;
		let mut component_len = 0u32;
		let mut fs_flags = 0u32;

		let ok = unsafe {
			GetVolumeInformationW(
				root.as_ptr(),
				label_buf.as_mut_ptr(),
				label_buf.len() as u32,
				&mut serial,
				&mut component_len,
				&mut fs_flags,
				fs_buf.as_mut_ptr(),
				fs_buf.len() as u32,
			)
		};
		if ok == 0 {
			trace!(%drive, "volume information query failed, skipping");
			return None;
		}

		let mut available = 0u64;
		let mut total = 0u64;
		let mut free = 0u64;
		unsafe {
			GetDiskFreeSpaceExW(root.as_ptr(), &mut available, &mut total, &mut free);
		}

		let label = utf16_z(&label_buf);
		Some(VolumeDescriptor {
			drive,
			label: if label.is_empty() { drive.root_path() } else { label },
			filesystem: utf16_z(&fs_buf),
			disk_kind: classify(drive),
			total_bytes: total,
			available_bytes: available,
		})
	}

	pub fn classify(drive: DriveLetter) -> DiskKind {
		// Seek-penalty queries work on an unprivileged volume handle
		// (desired access 0 still permits metadata ioctls).
		let device = wide(&drive.device_path());
		let handle = unsafe {
			CreateFileW(
				device.as_ptr(),
				0,
				FILE_SHARE_READ | FILE_SHARE_WRITE,
				std::ptr::null(),
				OPEN_EXISTING,
				0,
				std::ptr::null_mut(),
			)
		};
		if handle == INVALID_HANDLE_VALUE {
			return DiskKind::Unknown;
		}

		let query = STORAGE_PROPERTY_QUERY {
			PropertyId: StorageDeviceSeekPenaltyProperty,
			QueryType: PropertyStandardQuery,
			AdditionalParameters: [0],
		};
		let mut descriptor: DEVICE_SEEK_PENALTY_DESCRIPTOR = unsafe { std::mem::zeroed() };
		let mut returned = 0u32;
		let ok = unsafe {
			DeviceIoControl(
				handle,
				IOCTL_STORAGE_QUERY_PROPERTY,
				(&query as *const STORAGE_PROPERTY_QUERY).cast(),
				std::mem::size_of::<STORAGE_PROPERTY_QUERY>() as u32,
				(&mut descriptor as *mut DEVICE_SEEK_PENALTY_DESCRIPTOR).cast(),
				std::mem::size_of::<DEVICE_SEEK_PENALTY_DESCRIPTOR>() as u32,
				&mut returned,
				std::ptr::null_mut(),
			)
		};
		unsafe { CloseHandle(handle) };

		if ok == 0 {
			return DiskKind::Unknown;
		}
		if descriptor.IncursSeekPenalty == 0 {
			DiskKind::SolidState
		} else {
			DiskKind::Rotational
		}
	}

	pub fn has_required_privilege() -> bool {
		// Probe-open a raw volume handle; GENERIC_READ on \\.\X: is exactly
		// what scanning needs and is refused without administrative rights.
		let mask = unsafe { GetLogicalDrives() };
		let Some(bit) = (0..26u8).find(|bit| mask & (1 << bit) != 0) else {
			return false;
		};
		let drive = DriveLetter::new((b'A' + bit) as char).expect("bit maps to A..Z");
		let device = wide(&drive.device_path());
		let handle = unsafe {
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
		if handle == INVALID_HANDLE_VALUE {
			return false;
		}
		unsafe { CloseHandle(handle) };
		true
	}
}

#[cfg(not(windows))]
mod imp {
	use super::*;

	pub fn discover_volumes() -> Vec<VolumeDescriptor> {
		Vec::new()
	}

	pub fn classify(_drive: DriveLetter) -> DiskKind {
		DiskKind::Unknown
	}

	pub fn has_required_privilege() -> bool {
		false
	}
}
