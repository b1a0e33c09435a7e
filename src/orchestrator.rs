//! Multi-volume scan scheduling
//!
//! Solid-state volumes scan concurrently (bounded by the configured
//! parallelism); rotational volumes scan strictly one at a time so a single
//! spindle never seeks between two competing enumerations. Every volume gets
//! its own session, resolver and index; nothing is shared across drives, so
//! one volume failing leaves the others untouched.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::index::streaming::{FinishedScan, StreamingBuilder};
use crate::updater::checkpoint::{self, CheckpointRecord};
use crate::volume::{detect, platform, DriveLetter, EnumerateAll, VolumeDescriptor, VolumeSession};

/// How one volume's scan ended
pub enum ScanStatus {
	Completed(FinishedScan),
	Cancelled,
	Failed(CoreError),
}

pub struct DriveOutcome {
	pub drive: DriveLetter,
	pub status: ScanStatus,
}

/// Creates the journal session for a drive; injectable for tests
pub type SessionFactory =
	dyn Fn(DriveLetter) -> Result<Box<dyn VolumeSession>> + Send + Sync;

/// Schedules full scans across all indexable volumes
pub struct MultiDriveOrchestrator {
	config: Arc<CoreConfig>,
	events: Arc<EventBus>,
	factory: Arc<SessionFactory>,
}

impl MultiDriveOrchestrator {
	pub fn new(config: Arc<CoreConfig>, events: Arc<EventBus>) -> Self {
		Self::with_session_factory(config, events, Arc::new(platform::open_session))
	}

	pub fn with_session_factory(
		config: Arc<CoreConfig>,
		events: Arc<EventBus>,
		factory: Arc<SessionFactory>,
	) -> Self {
		Self {
			config,
			events,
			factory,
		}
	}

	/// Physical storage class of a drive (drives the scan schedule).
	pub fn classify(&self, drive: DriveLetter) -> crate::volume::DiskKind {
		detect::classify(drive)
	}

	/// Volumes eligible for indexing: NTFS, not excluded by config.
	pub fn discover(&self) -> Vec<VolumeDescriptor> {
		detect::discover_volumes()
			.into_iter()
			.filter(|volume| {
				if !volume.is_ntfs() {
					info!(drive = %volume.drive, fs = %volume.filesystem, "skipping non-NTFS volume");
					return false;
				}
				if self.config.excluded_drives.contains(&volume.drive.as_char()) {
					info!(drive = %volume.drive, "volume excluded by configuration");
					return false;
				}
				true
			})
			.collect()
	}

	/// Scan the given volumes to completion.
	///
	/// SSDs fan out onto blocking workers behind a semaphore; HDDs are
	/// drained in order by a single worker. Outcomes come back in no
	/// particular order.
	pub async fn scan_all(
		&self,
		volumes: Vec<VolumeDescriptor>,
		cancel: &CancellationToken,
	) -> Vec<DriveOutcome> {
		let (parallel, sequential): (Vec<_>, Vec<_>) = volumes
			.into_iter()
			.partition(|volume| volume.disk_kind.supports_parallel_scan());

		let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_scans));
		let mut handles = Vec::new();

		for volume in parallel {
			let semaphore = semaphore.clone();
			let cancel = cancel.clone();
			let config = self.config.clone();
			let events = self.events.clone();
			let factory = self.factory.clone();
			handles.push(task::spawn(async move {
				let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
				vec![run_one(volume.drive, factory, config, events, cancel).await]
			}));
		}

		if !sequential.is_empty() {
			let cancel = cancel.clone();
			let config = self.config.clone();
			let events = self.events.clone();
			let factory = self.factory.clone();
			handles.push(task::spawn(async move {
				let mut outcomes = Vec::with_capacity(sequential.len());
				for volume in sequential {
					outcomes.push(
						run_one(
							volume.drive,
							factory.clone(),
							config.clone(),
							events.clone(),
							cancel.clone(),
						)
						.await,
					);
				}
				outcomes
			}));
		}

		let mut outcomes = Vec::new();
		for handle in handles {
			match handle.await {
				Ok(mut batch) => outcomes.append(&mut batch),
				Err(err) => error!("scan worker panicked: {err}"),
			}
		}
		outcomes
	}
}

async fn run_one(
	drive: DriveLetter,
	factory: Arc<SessionFactory>,
	config: Arc<CoreConfig>,
	events: Arc<EventBus>,
	cancel: CancellationToken,
) -> DriveOutcome {
	let status = task::spawn_blocking(move || {
		let session = match factory(drive) {
			Ok(session) => session,
			Err(err) => return ScanStatus::Failed(err),
		};
		match scan_volume(session, &config, &events, &cancel) {
			Ok(Some(finished)) => ScanStatus::Completed(finished),
			Ok(None) => ScanStatus::Cancelled,
			Err(err) => ScanStatus::Failed(err),
		}
	})
	.await
	.unwrap_or_else(|err| ScanStatus::Failed(CoreError::Internal(format!("scan panicked: {err}"))));

	if let ScanStatus::Failed(err) = &status {
		warn!(drive = %drive, "scan failed: {err}");
	}
	DriveOutcome { drive, status }
}

/// Drive one volume's full enumeration into a finished, persisted index.
///
/// Blocking; runs on a dedicated worker. Returns `Ok(None)` when the
/// cancellation token fired mid-scan (checked at least once per flush
/// boundary), which is a clean abort, not a failure.
pub fn scan_volume(
	mut session: Box<dyn VolumeSession>,
	config: &CoreConfig,
	events: &EventBus,
	cancel: &CancellationToken,
) -> Result<Option<FinishedScan>> {
	let drive = session.drive();
	let journal = session.query_journal()?;
	events.emit(CoreEvent::ScanStarted { drive });
	info!(drive = %drive, "full volume scan started");

	let mut builder = StreamingBuilder::new(
		drive,
		config.batch_size,
		config.max_buffered_bytes,
		config.path_cache_capacity,
		events,
	);

	let mut records = EnumerateAll::new(&mut *session, 0);
	loop {
		if cancel.is_cancelled() {
			info!(drive = %drive, "scan cancelled");
			return Ok(None);
		}
		match records.next() {
			Some(Ok(record)) => builder.accept(&record)?,
			Some(Err(err)) => return Err(err),
			None => break,
		}
	}
	drop(records);

	let records_scanned = builder.records_scanned();
	let volume_dir = config.volume_dir(drive);
	let finished = builder.finalize(&volume_dir, &journal)?;

	// Durable cursor for the incremental updater to attach at; matches the
	// snapshot just published.
	checkpoint::save(
		&volume_dir,
		&CheckpointRecord {
			journal_id: journal.journal_id,
			last_applied_usn: finished.manifest.max_usn,
		},
	)?;

	events.emit(CoreEvent::ScanCompleted {
		drive,
		file_count: finished.manifest.file_count,
		generation: finished.manifest.generation,
	});
	info!(
		drive = %drive,
		records = records_scanned,
		files = finished.manifest.file_count,
		"full volume scan completed"
	);
	Ok(Some(finished))
}
