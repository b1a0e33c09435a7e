//! Persistence lifecycle: warm restarts from published snapshots, live
//! updates after a warm start, and automatic rebuild of corrupt bundles.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use qseek_core::config::CoreConfig;
use qseek_core::events::CoreEvent;
use qseek_core::index::SnapshotReader;
use qseek_core::orchestrator::SessionFactory;
use qseek_core::volume::platform::mock::{MockVolumeHandle, MockVolumeSession};
use qseek_core::volume::types::{FileAttributes, ReasonFlags, UsnRecord};
use qseek_core::volume::{DriveLetter, VolumeSession};
use qseek_core::{DiskKind, SearchCore, VolumeDescriptor};

const ROOT: u64 = 5;

fn drive() -> DriveLetter {
	DriveLetter::new('C').unwrap()
}

fn record(frn: u64, parent: u64, name: &str, directory: bool) -> UsnRecord {
	UsnRecord {
		frn,
		parent_frn: parent,
		usn: 0,
		timestamp: 0,
		reason: ReasonFlags::empty(),
		attributes: if directory {
			FileAttributes::DIRECTORY
		} else {
			FileAttributes::ARCHIVE
		},
		name: name.into(),
	}
}

fn mock_factory(handle: MockVolumeHandle) -> Arc<SessionFactory> {
	Arc::new(
		move |letter: DriveLetter| -> qseek_core::Result<Box<dyn VolumeSession>> {
			Ok(Box::new(handle.open_session(letter)))
		},
	)
}

fn descriptor() -> VolumeDescriptor {
	VolumeDescriptor {
		drive: drive(),
		label: "test".into(),
		filesystem: "NTFS".into(),
		disk_kind: DiskKind::SolidState,
		total_bytes: 0,
		available_bytes: 0,
	}
}

fn populated_handle() -> MockVolumeHandle {
	let (_session, handle) = MockVolumeSession::new(drive());
	handle.set_mft(vec![
		record(ROOT, ROOT, ".", true),
		record(10, ROOT, "photos", true),
		record(20, 10, "sunset.jpg", false),
		record(21, 10, "beach.png", false),
	]);
	handle
}

fn generation(config: &CoreConfig) -> u64 {
	SnapshotReader::load(&config.volume_dir(drive()))
		.unwrap()
		.expect("snapshot published")
		.manifest()
		.generation
}

#[tokio::test(flavor = "multi_thread")]
async fn warm_start_skips_rescanning_and_stays_live() {
	let data = tempfile::tempdir().unwrap();
	let handle = populated_handle();

	// First run: cold scan, persist, shut down.
	{
		let config = CoreConfig::default_with_dir(data.path().to_path_buf());
		let core = SearchCore::with_session_factory(config, mock_factory(handle.clone()));
		core.bring_online(vec![descriptor()]).await.unwrap();
		assert_eq!(core.submit("sunset", 10).len(), 1);
		core.shutdown().await;
	}

	let config = CoreConfig::default_with_dir(data.path().to_path_buf());
	let cold_generation = generation(&config);

	// Second run: must come back from the snapshot without a rescan.
	let core = SearchCore::with_session_factory(config, mock_factory(handle.clone()));
	let mut events = core.events().subscribe();
	core.bring_online(vec![descriptor()]).await.unwrap();

	assert_eq!(core.watched_drives(), vec![drive()]);
	assert_eq!(core.submit("sunset", 10)[0].path, "C:\\photos\\sunset.jpg");
	let config = CoreConfig::default_with_dir(data.path().to_path_buf());
	assert_eq!(generation(&config), cold_generation, "warm start must not rescan");

	// The warm-started watcher still applies live changes.
	handle.push_change(UsnRecord {
		usn: 50,
		reason: ReasonFlags::FILE_CREATE | ReasonFlags::CLOSE,
		..record(22, 10, "dunes.raw", false)
	});
	loop {
		if let CoreEvent::IndexUpdated { .. } = events.recv().await.unwrap() {
			break;
		}
	}
	assert_eq!(core.submit("dunes", 10).len(), 1);
	assert!(generation(&config) > cold_generation);

	core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_snapshot_triggers_automatic_rebuild() {
	let data = tempfile::tempdir().unwrap();
	let handle = populated_handle();

	{
		let config = CoreConfig::default_with_dir(data.path().to_path_buf());
		let core = SearchCore::with_session_factory(config, mock_factory(handle.clone()));
		core.bring_online(vec![descriptor()]).await.unwrap();
		core.shutdown().await;
	}

	// Truncate the postings blob behind the manifest's back.
	let config = CoreConfig::default_with_dir(data.path().to_path_buf());
	let volume_dir = config.volume_dir(drive());
	let blob = std::fs::read_dir(&volume_dir)
		.unwrap()
		.flatten()
		.map(|entry| entry.path())
		.find(|path| path.extension().is_some_and(|ext| ext == "postings"))
		.expect("postings artifact exists");
	std::fs::write(&blob, b"QSK").unwrap();

	let core = SearchCore::with_session_factory(config, mock_factory(handle.clone()));
	let mut events = core.events().subscribe();
	core.bring_online(vec![descriptor()]).await.unwrap();

	// The load failure fell back to a full rescan, not a user-facing error.
	loop {
		if let CoreEvent::ScanCompleted { file_count, .. } = events.recv().await.unwrap() {
			assert_eq!(file_count, 3);
			break;
		}
	}
	assert_eq!(core.submit("beach", 10).len(), 1);

	core.shutdown().await;
}
