//! End-to-end engine behavior over scripted volumes: scan, watch, apply
//! journal deltas, and converge with a from-scratch rebuild.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use qseek_core::config::CoreConfig;
use qseek_core::events::{CoreEvent, EventBus};
use qseek_core::orchestrator::scan_volume;
use qseek_core::volume::platform::mock::{MockVolumeHandle, MockVolumeSession};
use qseek_core::volume::types::{FileAttributes, ReasonFlags, UsnRecord};
use qseek_core::orchestrator::SessionFactory;
use qseek_core::volume::{DriveLetter, VolumeSession};
use qseek_core::{DiskKind, SearchCore, VolumeDescriptor};

const ROOT: u64 = 5;

fn drive() -> DriveLetter {
	DriveLetter::new('C').unwrap()
}

fn dir(frn: u64, parent: u64, name: &str) -> UsnRecord {
	UsnRecord {
		frn,
		parent_frn: parent,
		usn: 0,
		timestamp: 0,
		reason: ReasonFlags::empty(),
		attributes: FileAttributes::DIRECTORY,
		name: name.into(),
	}
}

fn file(frn: u64, parent: u64, name: &str) -> UsnRecord {
	UsnRecord {
		attributes: FileAttributes::ARCHIVE,
		..dir(frn, parent, name)
	}
}

fn change(mut record: UsnRecord, usn: i64, reason: ReasonFlags) -> UsnRecord {
	record.usn = usn;
	record.reason = reason;
	record
}

/// The root record is its own parent; sessions learn the root FRN from it.
fn root_record() -> UsnRecord {
	dir(ROOT, ROOT, ".")
}

fn initial_mft() -> Vec<UsnRecord> {
	vec![
		root_record(),
		dir(10, ROOT, "Users"),
		dir(11, 10, "bob"),
		file(20, 11, "report.docx"),
		file(21, 11, "report_old.docx"),
		dir(12, ROOT, "projects"),
		file(22, 12, "notes.md"),
	]
}

fn config(dir: &std::path::Path) -> CoreConfig {
	let mut config = CoreConfig::default_with_dir(dir.to_path_buf());
	config.batch_size = 3; // exercise several flushes per scan
	config
}

fn mock_factory(handle: MockVolumeHandle) -> Arc<SessionFactory> {
	Arc::new(
		move |letter: DriveLetter| -> qseek_core::Result<Box<dyn VolumeSession>> {
			Ok(Box::new(handle.open_session(letter)))
		},
	)
}

fn scan_mock(
	handle: &MockVolumeHandle,
	config: &CoreConfig,
) -> qseek_core::index::FinishedScan {
	let events = EventBus::default();
	let session = Box::new(handle.open_session(drive()));
	scan_volume(session, config, &events, &CancellationToken::new())
		.unwrap()
		.expect("scan not cancelled")
}

fn paths_of(index: &qseek_core::index::VolumeIndex) -> Vec<(u64, String)> {
	let mut paths: Vec<(u64, String)> = index
		.iter_paths()
		.map(|(frn, path)| (frn, path.to_owned()))
		.collect();
	paths.sort();
	paths
}

#[test]
fn full_scan_indexes_every_record() {
	let data = tempfile::tempdir().unwrap();
	let (_session, handle) = MockVolumeSession::new(drive());
	handle.set_mft(initial_mft());

	let finished = scan_mock(&handle, &config(data.path()));
	assert_eq!(finished.records_scanned, 7);

	let paths = paths_of(&finished.index);
	assert!(paths.contains(&(20, "C:\\Users\\bob\\report.docx".into())));
	assert!(paths.contains(&(12, "C:\\projects".into())));

	let hits = qseek_core::search(&finished.index, "report", 100);
	assert_eq!(hits.len(), 2);
}

/// Applying a journal sequence incrementally must land on exactly the
/// {frn -> path} set a from-scratch rebuild of the final filesystem gives.
#[tokio::test(flavor = "multi_thread")]
async fn incremental_apply_converges_with_rebuild() {
	let data = tempfile::tempdir().unwrap();
	let (_session, handle) = MockVolumeSession::new(drive());
	handle.set_mft(initial_mft());

	let core = SearchCore::with_session_factory(config(data.path()), mock_factory(handle.clone()));
	let mut events = core.events().subscribe();

	let descriptor = VolumeDescriptor {
		drive: drive(),
		label: "test".into(),
		filesystem: "NTFS".into(),
		disk_kind: DiskKind::SolidState,
		total_bytes: 0,
		available_bytes: 0,
	};
	core.bring_online(vec![descriptor]).await.unwrap();
	assert_eq!(core.watched_drives(), vec![drive()]);

	// create projects\todo.txt, rename bob -> robert, delete notes.md,
	// rename report.docx -> summary.docx
	let batch = [
		change(file(30, 12, "todo.txt"), 100, ReasonFlags::FILE_CREATE | ReasonFlags::CLOSE),
		change(dir(11, 10, "bob"), 101, ReasonFlags::RENAME_OLD_NAME),
		change(dir(11, 10, "robert"), 102, ReasonFlags::RENAME_NEW_NAME | ReasonFlags::CLOSE),
		change(file(22, 12, "notes.md"), 103, ReasonFlags::FILE_DELETE | ReasonFlags::CLOSE),
		change(file(20, 11, "report.docx"), 104, ReasonFlags::RENAME_OLD_NAME),
		change(
			file(20, 11, "summary.docx"),
			105,
			ReasonFlags::RENAME_NEW_NAME | ReasonFlags::CLOSE,
		),
	];
	for record in batch {
		handle.push_change(record);
	}

	// Wait for the watcher to drain and checkpoint everything.
	loop {
		match events.recv().await.unwrap() {
			CoreEvent::IndexUpdated { last_usn, .. } if last_usn >= 106 => break,
			_ => {}
		}
	}

	let incremental: Vec<(u64, String)> = {
		let hits = core.submit("", usize::MAX); // empty query returns nothing
		assert!(hits.is_empty());
		let mut all: Vec<(u64, String)> = core
			.submit("c:\\", usize::MAX)
			.into_iter()
			.map(|hit| (hit.frn, hit.path))
			.collect();
		all.sort();
		all
	};

	// From-scratch rebuild of the final filesystem state.
	let rebuild_data = tempfile::tempdir().unwrap();
	let (_s2, handle2) = MockVolumeSession::new(drive());
	handle2.set_mft(vec![
		root_record(),
		dir(10, ROOT, "Users"),
		dir(11, 10, "robert"),
		file(20, 11, "summary.docx"),
		file(21, 11, "report_old.docx"),
		dir(12, ROOT, "projects"),
		file(30, 12, "todo.txt"),
	]);
	let rebuilt = scan_mock(&handle2, &config(rebuild_data.path()));

	assert_eq!(incremental, paths_of(&rebuilt.index));

	// Spot checks on the renamed and surviving entries.
	assert!(core.submit("summary", 10).iter().any(|hit| hit.frn == 20));
	assert!(core.submit("report", 10).iter().all(|hit| hit.frn == 21));
	assert!(core.submit("robert", 10).len() >= 3);

	core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn journal_wrap_forces_full_rebuild() {
	let data = tempfile::tempdir().unwrap();
	let (_session, handle) = MockVolumeSession::new(drive());
	handle.set_mft(initial_mft());

	let core = SearchCore::with_session_factory(config(data.path()), mock_factory(handle.clone()));
	let mut events = core.events().subscribe();

	let descriptor = VolumeDescriptor {
		drive: drive(),
		label: "test".into(),
		filesystem: "NTFS".into(),
		disk_kind: DiskKind::Rotational, // exercise the sequential queue
		total_bytes: 0,
		available_bytes: 0,
	};
	core.bring_online(vec![descriptor]).await.unwrap();

	// The volume changes shape, then the journal discards history past the
	// watcher's checkpoint.
	handle.set_mft(vec![root_record(), file(40, ROOT, "fresh_start.txt")]);
	handle.wrap_journal_to(1_000_000);

	let mut saw_wrap = false;
	loop {
		match events.recv().await.unwrap() {
			CoreEvent::JournalWrapped { drive: wrapped } => {
				assert_eq!(wrapped, drive());
				saw_wrap = true;
			}
			CoreEvent::ScanCompleted { file_count, .. } if saw_wrap => {
				assert_eq!(file_count, 1);
				break;
			}
			_ => {}
		}
	}

	// Queries now reflect the rebuilt volume only.
	assert!(core.submit("report", 10).is_empty());
	assert_eq!(core.submit("fresh_start", 10).len(), 1);

	core.shutdown().await;
}
