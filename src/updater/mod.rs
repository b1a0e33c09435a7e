//! Live incremental index maintenance
//!
//! One updater per watched volume, running on its own blocking worker for
//! the process lifetime. The journal wait is the only suspension point;
//! while idle the worker sits inside the OS call at near-zero cost.

pub mod checkpoint;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use checkpoint::CheckpointRecord;

use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::index::builder::VolumeIndex;
use crate::index::snapshot;
use crate::resolver::FrnPathResolver;
use crate::volume::usn::ChangeKind;
use crate::volume::{DeltaRead, DriveLetter, JournalInfo, UsnRecord, VolumeSession};

/// Updater lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterState {
	Attached,
	Waiting,
	Draining,
	Checkpointing,
	Detached,
}

/// Applies journal deltas to a volume's live index and keeps the persisted
/// snapshot and checkpoint current
pub struct IncrementalUpdater<S: VolumeSession> {
	drive: DriveLetter,
	session: S,
	resolver: FrnPathResolver,
	index: Arc<RwLock<VolumeIndex>>,
	volume_dir: PathBuf,
	events: Arc<EventBus>,
	journal: JournalInfo,
	state: UpdaterState,
	cursor: i64,
	/// Old paths of directory rename halves awaiting their new-name record
	pending_renames: HashMap<u64, String>,
}

impl<S: VolumeSession> IncrementalUpdater<S> {
	/// Attach at the last durable cursor.
	///
	/// The checkpoint (or, on first attach after a scan, the snapshot's
	/// `max_usn` passed as `snapshot_usn`) must still be inside the
	/// journal's retained range and belong to the same journal identity;
	/// anything else means the journal wrapped or was recreated, and only a
	/// full rebuild can be trusted.
	pub fn attach(
		mut session: S,
		resolver: FrnPathResolver,
		index: Arc<RwLock<VolumeIndex>>,
		volume_dir: PathBuf,
		snapshot_journal_id: u64,
		snapshot_usn: i64,
		events: Arc<EventBus>,
	) -> Result<Self> {
		let drive = session.drive();
		let journal = session.query_journal()?;

		let (cursor_journal_id, cursor) = match checkpoint::load(&volume_dir)? {
			Some(record) => (record.journal_id, record.last_applied_usn),
			None => (snapshot_journal_id, snapshot_usn),
		};
		if cursor_journal_id != journal.journal_id || cursor < journal.first_usn {
			return Err(CoreError::JournalWrapped { drive });
		}

		info!(drive = %drive, cursor, "incremental updater attached");
		Ok(Self {
			drive,
			session,
			resolver,
			index,
			volume_dir,
			events,
			journal,
			state: UpdaterState::Attached,
			cursor,
			pending_renames: HashMap::new(),
		})
	}

	pub fn state(&self) -> UpdaterState {
		self.state
	}

	/// Handle that unblocks an in-flight journal wait (clean shutdown).
	pub fn stopper(&self) -> Arc<dyn crate::volume::SessionStopper> {
		self.session.stopper()
	}

	pub fn cursor(&self) -> i64 {
		self.cursor
	}

	/// Block on the journal and apply deltas until stopped.
	///
	/// Runs on a dedicated blocking worker. Returns `Ok` on cooperative
	/// shutdown; a `JournalWrapped` error tells the caller to reset the
	/// checkpoint and rescan from scratch.
	pub fn run(mut self, cancel: CancellationToken) -> Result<()> {
		loop {
			if cancel.is_cancelled() {
				break;
			}
			self.state = UpdaterState::Waiting;
			let delta = match self.session.read_journal_delta(self.cursor)? {
				DeltaRead::Shutdown => break,
				DeltaRead::Records(delta) => delta,
			};

			self.state = UpdaterState::Draining;
			let applied = self.apply_batch(&delta.records);
			self.cursor = delta.next_usn;

			self.state = UpdaterState::Checkpointing;
			self.persist()?;

			self.events.emit(CoreEvent::IndexUpdated {
				drive: self.drive,
				applied,
				last_usn: self.cursor,
			});
		}

		self.state = UpdaterState::Detached;
		info!(drive = %self.drive, cursor = self.cursor, "incremental updater detached");
		Ok(())
	}

	/// Apply one drained batch in strict USN order.
	///
	/// Holds the index write lock for the whole batch, so readers observe
	/// the state before or after the batch, never a half-applied rename.
	fn apply_batch(&mut self, records: &[UsnRecord]) -> u64 {
		debug_assert!(
			records.windows(2).all(|pair| pair[0].usn <= pair[1].usn),
			"journal batch must be USN-ordered"
		);

		let index = self.index.clone();
		let mut index = index.write();
		let mut applied = 0u64;
		for record in records {
			self.apply_record(&mut index, record);
			applied += 1;
		}
		debug!(drive = %self.drive, applied, "journal batch applied");
		applied
	}

	fn apply_record(&mut self, index: &mut VolumeIndex, record: &UsnRecord) {
		if record.frn == record.parent_frn {
			// Volume root; never indexed.
			return;
		}
		match ChangeKind::from_reason(record.reason) {
			ChangeKind::Create => self.apply_upsert(index, record),
			ChangeKind::RenameNewName => {
				self.apply_upsert(index, record);
				// The journal names only the directory itself; descendants
				// indexed under the old prefix are rewritten here.
				if record.is_directory() {
					if let (Some(old), Some(new)) = (
						self.pending_renames.remove(&record.frn),
						index.path_of(record.frn).map(str::to_owned),
					) {
						if old != new {
							let moved = index.rename_subtree(&old, &new);
							debug!(
								drive = %self.drive,
								moved,
								"directory rename rewrote descendant paths"
							);
						}
					}
				}
			}
			ChangeKind::RenameOldName => {
				// Remove under the prior path, recomputing its grams from
				// the stored spelling; the new-name half follows in order.
				let old_path = index.remove_record(record.frn);
				if record.is_directory() {
					self.resolver.invalidate(record.frn);
					if let Some(old_path) = old_path {
						self.pending_renames.insert(record.frn, old_path);
					}
				}
			}
			ChangeKind::Delete => {
				if record.is_directory() {
					self.resolver.remove(record.frn);
				}
				// Removing an FRN that was never indexed is a no-op, which
				// makes replaying an already-applied delete safe.
				index.remove_record(record.frn);
			}
			ChangeKind::Other => {}
		}
	}

	fn apply_upsert(&mut self, index: &mut VolumeIndex, record: &UsnRecord) {
		if record.is_directory() {
			self.resolver
				.record_parent(record.frn, record.parent_frn, &record.name);
		}
		match self.resolver.resolve_path(record.parent_frn, &record.name) {
			Ok(path) => index.add_record(record.frn, &path),
			Err(err) => {
				warn!(
					drive = %self.drive,
					frn = format_args!("{:#x}", record.frn),
					"skipping unresolvable change record: {err}"
				);
			}
		}
	}

	/// Persist the snapshot generation and checkpoint for the applied
	/// cursor. Ordering matters: the snapshot publishes first, then the
	/// checkpoint claims the cursor, so a crash between the two replays the
	/// batch instead of losing it (idempotent application makes the replay
	/// harmless).
	fn persist(&mut self) -> Result<()> {
		let manifest = {
			let index = self.index.read();
			snapshot::write_snapshot(
				&self.volume_dir,
				&index,
				&self.resolver,
				self.journal.journal_id,
				self.cursor,
			)?
		};
		checkpoint::save(
			&self.volume_dir,
			&CheckpointRecord {
				journal_id: self.journal.journal_id,
				last_applied_usn: self.cursor,
			},
		)?;
		debug!(
			drive = %self.drive,
			generation = manifest.generation,
			cursor = self.cursor,
			"checkpointed"
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::volume::platform::mock::{MockVolumeHandle, MockVolumeSession};
	use crate::volume::types::{FileAttributes, ReasonFlags};
	use pretty_assertions::assert_eq;

	const ROOT: u64 = 5;

	fn drive() -> DriveLetter {
		DriveLetter::new('C').unwrap()
	}

	fn change(frn: u64, parent: u64, usn: i64, name: &str, reason: ReasonFlags, dir: bool) -> UsnRecord {
		UsnRecord {
			frn,
			parent_frn: parent,
			usn,
			timestamp: 0,
			reason,
			attributes: if dir {
				FileAttributes::DIRECTORY
			} else {
				FileAttributes::ARCHIVE
			},
			name: name.into(),
		}
	}

	struct Fixture {
		updater: IncrementalUpdater<MockVolumeSession>,
		index: Arc<RwLock<VolumeIndex>>,
		handle: MockVolumeHandle,
		dir: tempfile::TempDir,
	}

	fn fixture() -> Fixture {
		let dir = tempfile::tempdir().unwrap();
		let (session, handle) = MockVolumeSession::new(drive());

		let mut resolver = FrnPathResolver::new(drive(), 64);
		resolver.set_root(ROOT);
		resolver.record_parent(10, ROOT, "Users");
		resolver.record_parent(11, 10, "bob");

		let mut index = VolumeIndex::new(drive());
		index.add_record(20, "C:\\Users\\bob\\report.docx");
		index.add_record(21, "C:\\Users\\bob\\report_old.docx");
		let index = Arc::new(RwLock::new(index));

		let journal = handle.journal();
		let updater = IncrementalUpdater::attach(
			session,
			resolver,
			index.clone(),
			dir.path().to_path_buf(),
			journal.journal_id,
			0,
			Arc::new(EventBus::default()),
		)
		.unwrap();

		Fixture {
			updater,
			index,
			handle,
			dir,
		}
	}

	fn query(index: &Arc<RwLock<VolumeIndex>>, needle: &str) -> Vec<String> {
		let index = index.read();
		let mut paths: Vec<String> = crate::index::query::search(&*index, needle, 100)
			.into_iter()
			.map(|hit| hit.path)
			.collect();
		paths.sort();
		paths
	}

	#[test]
	fn delete_removes_membership_for_that_file_only() {
		let mut fx = fixture();
		fx.updater.apply_batch(&[change(
			20,
			11,
			100,
			"report.docx",
			ReasonFlags::FILE_DELETE | ReasonFlags::CLOSE,
			false,
		)]);

		assert_eq!(query(&fx.index, "report"), vec!["C:\\Users\\bob\\report_old.docx"]);
		assert_eq!(query(&fx.index, "bob"), vec!["C:\\Users\\bob\\report_old.docx"]);
	}

	#[test]
	fn reapplying_a_batch_is_idempotent() {
		let mut fx = fixture();
		let batch = [
			change(30, 11, 100, "new.txt", ReasonFlags::FILE_CREATE, false),
			change(
				20,
				11,
				110,
				"report.docx",
				ReasonFlags::FILE_DELETE | ReasonFlags::CLOSE,
				false,
			),
		];
		fx.updater.apply_batch(&batch);
		let first = query(&fx.index, "bob");
		fx.updater.apply_batch(&batch);
		assert_eq!(query(&fx.index, "bob"), first);
	}

	#[test]
	fn file_rename_moves_the_grams() {
		let mut fx = fixture();
		fx.updater.apply_batch(&[
			change(20, 11, 100, "report.docx", ReasonFlags::RENAME_OLD_NAME, false),
			change(
				20,
				11,
				101,
				"summary.docx",
				ReasonFlags::RENAME_NEW_NAME | ReasonFlags::CLOSE,
				false,
			),
		]);

		assert_eq!(query(&fx.index, "report"), vec!["C:\\Users\\bob\\report_old.docx"]);
		assert_eq!(query(&fx.index, "summary"), vec!["C:\\Users\\bob\\summary.docx"]);
	}

	#[test]
	fn directory_rename_rewrites_descendants() {
		let mut fx = fixture();
		fx.index.write().add_record(11, "C:\\Users\\bob");

		fx.updater.apply_batch(&[
			change(11, 10, 100, "bob", ReasonFlags::RENAME_OLD_NAME, true),
			change(
				11,
				10,
				101,
				"robert",
				ReasonFlags::RENAME_NEW_NAME | ReasonFlags::CLOSE,
				true,
			),
		]);

		assert_eq!(
			query(&fx.index, "robert"),
			vec![
				"C:\\Users\\robert",
				"C:\\Users\\robert\\report.docx",
				"C:\\Users\\robert\\report_old.docx",
			]
		);
		assert!(query(&fx.index, "bob").is_empty());
	}

	#[test]
	fn run_drains_checkpoints_and_shuts_down() {
		let fx = fixture();
		let handle = fx.handle.clone();
		let cancel = CancellationToken::new();
		let volume_dir = fx.dir.path().to_path_buf();

		let worker = std::thread::spawn({
			let cancel = cancel.clone();
			move || fx.updater.run(cancel)
		});

		handle.push_change(change(40, 11, 50, "draft.md", ReasonFlags::FILE_CREATE, false));
		// Wait for the checkpoint to land, then stop the wait.
		for _ in 0..100 {
			std::thread::sleep(std::time::Duration::from_millis(10));
			if checkpoint::load(&volume_dir).unwrap().is_some() {
				break;
			}
		}
		handle.stop();
		worker.join().unwrap().unwrap();

		let record = checkpoint::load(&volume_dir).unwrap().expect("checkpoint written");
		assert_eq!(record.last_applied_usn, 51);
		assert_eq!(query(&fx.index, "draft"), vec!["C:\\Users\\bob\\draft.md"]);

		// The persisted snapshot reflects the applied batch too.
		let reader = crate::index::snapshot::SnapshotReader::load(&volume_dir)
			.unwrap()
			.unwrap();
		assert_eq!(reader.manifest().max_usn, 51);
	}

	#[test]
	fn attach_rejects_wrapped_journal() {
		let dir = tempfile::tempdir().unwrap();
		let (session, handle) = MockVolumeSession::new(drive());
		handle.wrap_journal_to(1_000);

		let result = IncrementalUpdater::attach(
			session,
			FrnPathResolver::new(drive(), 64),
			Arc::new(RwLock::new(VolumeIndex::new(drive()))),
			dir.path().to_path_buf(),
			handle.journal().journal_id,
			10, // cursor predates first_usn after the wrap
			Arc::new(EventBus::default()),
		);
		assert!(matches!(result, Err(CoreError::JournalWrapped { .. })));
	}

	#[test]
	fn attach_rejects_recreated_journal() {
		let dir = tempfile::tempdir().unwrap();
		let (session, handle) = MockVolumeSession::new(drive());
		checkpoint::save(
			dir.path(),
			&CheckpointRecord {
				journal_id: handle.journal().journal_id ^ 1,
				last_applied_usn: 0,
			},
		)
		.unwrap();

		let result = IncrementalUpdater::attach(
			session,
			FrnPathResolver::new(drive(), 64),
			Arc::new(RwLock::new(VolumeIndex::new(drive()))),
			dir.path().to_path_buf(),
			0,
			0,
			Arc::new(EventBus::default()),
		);
		assert!(matches!(result, Err(CoreError::JournalWrapped { .. })));
	}
}
