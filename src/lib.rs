//! qseek core — near-instant filename search for NTFS volumes
//!
//! Instead of walking directory trees, the engine reads each volume's USN
//! change journal: a full MFT enumeration builds a compressed trigram
//! postings index per volume, and a per-volume watcher applies journal
//! deltas live, checkpointing so restarts resume where they left off.
//!
//! [`SearchCore`] is the embedding surface: it discovers volumes, schedules
//! scans (SSDs in parallel, HDDs sequentially), publishes per-volume
//! indexes for querying and keeps them current until shutdown.

pub mod config;
pub mod error;
pub mod events;
pub mod index;
pub mod orchestrator;
pub mod resolver;
pub mod updater;
pub mod volume;

pub use config::CoreConfig;
pub use error::{CoreError, Result};
pub use events::{CoreEvent, EventBus, ScanPhase};
pub use index::{search, SearchHit};
pub use volume::{detect, DiskKind, DriveLetter, VolumeDescriptor};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::index::builder::VolumeIndex;
use crate::index::snapshot::{SnapshotManifest, SnapshotReader};
use crate::index::streaming::FinishedScan;
use crate::orchestrator::{scan_volume, MultiDriveOrchestrator, ScanStatus, SessionFactory};
use crate::resolver::FrnPathResolver;
use crate::updater::{checkpoint, IncrementalUpdater};
use crate::volume::{platform, SessionStopper};

struct WatchedVolume {
	index: Arc<RwLock<VolumeIndex>>,
	/// Set once the updater attaches; used to unblock its journal wait
	stopper: Arc<Mutex<Option<Arc<dyn SessionStopper>>>>,
	worker: JoinHandle<()>,
}

/// The engine handle an embedding application drives
pub struct SearchCore {
	config: Arc<CoreConfig>,
	events: Arc<EventBus>,
	factory: Arc<SessionFactory>,
	orchestrator: MultiDriveOrchestrator,
	watched: RwLock<HashMap<DriveLetter, WatchedVolume>>,
	cancel: CancellationToken,
}

impl SearchCore {
	pub fn new(config: CoreConfig) -> Self {
		Self::with_session_factory(config, Arc::new(platform::open_session))
	}

	/// Construct with an injected session factory (tests, alternative
	/// backends).
	pub fn with_session_factory(config: CoreConfig, factory: Arc<SessionFactory>) -> Self {
		let config = Arc::new(config);
		let events = Arc::new(EventBus::default());
		let orchestrator = MultiDriveOrchestrator::with_session_factory(
			config.clone(),
			events.clone(),
			factory.clone(),
		);
		Self {
			config,
			events,
			factory,
			orchestrator,
			watched: RwLock::new(HashMap::new()),
			cancel: CancellationToken::new(),
		}
	}

	pub fn config(&self) -> &CoreConfig {
		&self.config
	}

	pub fn events(&self) -> &EventBus {
		&self.events
	}

	/// Whether raw volume handles can be opened at all. When false the
	/// engine fails fast per volume; the surrounding application owns the
	/// elevation flow.
	pub fn has_required_privilege() -> bool {
		detect::has_required_privilege()
	}

	/// Volumes eligible for indexing on this machine.
	pub fn discover(&self) -> Vec<VolumeDescriptor> {
		self.orchestrator.discover()
	}

	/// Bring every eligible volume online: warm-start from its persisted
	/// snapshot when possible, otherwise scan from scratch; then watch.
	pub async fn initialize(&self) -> Result<()> {
		let volumes = self.orchestrator.discover();
		info!(count = volumes.len(), "initializing volumes");
		self.bring_online(volumes).await
	}

	/// Warm-start or scan the given volumes and attach their watchers.
	pub async fn bring_online(&self, volumes: Vec<VolumeDescriptor>) -> Result<()> {
		let mut to_scan = Vec::new();
		for volume in volumes {
			match self.try_warm_start(volume.drive) {
				Ok(true) => {}
				Ok(false) => to_scan.push(volume),
				Err(err) => {
					// Unloadable snapshots are rebuilt, never surfaced.
					warn!(drive = %volume.drive, "snapshot unusable, rebuilding: {err}");
					to_scan.push(volume);
				}
			}
		}

		if !to_scan.is_empty() {
			let outcomes = self.orchestrator.scan_all(to_scan, &self.cancel).await;
			for outcome in outcomes {
				match outcome.status {
					ScanStatus::Completed(finished) => self.watch(outcome.drive, finished),
					ScanStatus::Cancelled => {}
					ScanStatus::Failed(err) => {
						self.events.emit(CoreEvent::ScanFailed {
							drive: outcome.drive,
							error: err.to_string(),
						});
					}
				}
			}
		}
		Ok(())
	}

	fn try_warm_start(&self, drive: DriveLetter) -> Result<bool> {
		let dir = self.config.volume_dir(drive);
		let Some(reader) = SnapshotReader::load(&dir)? else {
			return Ok(false);
		};
		let index = reader.to_index()?;
		let resolver = reader.to_resolver(self.config.path_cache_capacity);
		let manifest = reader.manifest().clone();
		info!(
			drive = %drive,
			generation = manifest.generation,
			files = manifest.file_count,
			"warm start from snapshot"
		);
		self.watch(
			drive,
			FinishedScan {
				index,
				resolver,
				manifest,
				records_scanned: 0,
			},
		);
		Ok(true)
	}

	/// Publish the volume's index and spawn its long-lived watch worker.
	fn watch(&self, drive: DriveLetter, finished: FinishedScan) {
		let slot = Arc::new(RwLock::new(finished.index));
		let stopper: Arc<Mutex<Option<Arc<dyn SessionStopper>>>> = Arc::new(Mutex::new(None));
		let worker = task::spawn(watch_volume(
			drive,
			self.factory.clone(),
			self.config.clone(),
			self.events.clone(),
			slot.clone(),
			stopper.clone(),
			finished.resolver,
			finished.manifest,
			self.cancel.clone(),
		));
		self.watched.write().insert(
			drive,
			WatchedVolume {
				index: slot,
				stopper,
				worker,
			},
		);
	}

	/// Case-insensitive substring query across every online volume.
	pub fn submit(&self, query: &str, max_results: usize) -> Vec<SearchHit> {
		let watched = self.watched.read();
		let mut drives: Vec<DriveLetter> = watched.keys().copied().collect();
		drives.sort_unstable();

		let mut hits = Vec::new();
		for drive in drives {
			if hits.len() >= max_results {
				break;
			}
			let volume_index = watched[&drive].index.read();
			hits.extend(index::search(&*volume_index, query, max_results - hits.len()));
		}
		hits
	}

	pub fn watched_drives(&self) -> Vec<DriveLetter> {
		let mut drives: Vec<DriveLetter> = self.watched.read().keys().copied().collect();
		drives.sort_unstable();
		drives
	}

	/// Cooperative shutdown: cancel scans, unblock journal waits, await
	/// the workers.
	pub async fn shutdown(&self) {
		self.cancel.cancel();
		let workers: Vec<JoinHandle<()>> = {
			let mut watched = self.watched.write();
			watched
				.drain()
				.map(|(_, volume)| {
					if let Some(stopper) = volume.stopper.lock().as_ref() {
						stopper.stop();
					}
					volume.worker
				})
				.collect()
		};
		for worker in workers {
			if let Err(err) = worker.await {
				error!("watch worker failed to join: {err}");
			}
		}
		info!("core shut down");
	}
}

/// Long-lived per-volume watcher: attach the incremental updater, pump it
/// until shutdown, and fall back to a full rescan when the journal wraps or
/// the index proves corrupt.
#[allow(clippy::too_many_arguments)]
async fn watch_volume(
	drive: DriveLetter,
	factory: Arc<SessionFactory>,
	config: Arc<CoreConfig>,
	events: Arc<EventBus>,
	slot: Arc<RwLock<VolumeIndex>>,
	stopper_slot: Arc<Mutex<Option<Arc<dyn SessionStopper>>>>,
	resolver: FrnPathResolver,
	manifest: SnapshotManifest,
	cancel: CancellationToken,
) {
	let mut resolver = Some(resolver);
	let mut manifest = manifest;

	loop {
		if cancel.is_cancelled() {
			break;
		}
		let Some(current_resolver) = resolver.take() else {
			break;
		};

		let rebuild = match attach_and_run(
			drive,
			&factory,
			&config,
			&events,
			&slot,
			&stopper_slot,
			current_resolver,
			&manifest,
			&cancel,
		)
		.await
		{
			WatchExit::Shutdown => break,
			WatchExit::Rebuild(reason) => reason,
		};

		if let CoreError::JournalWrapped { .. } = rebuild {
			events.emit(CoreEvent::JournalWrapped { drive });
		}
		warn!(drive = %drive, "incremental watch invalid, rescanning: {rebuild}");
		if let Err(err) = checkpoint::reset(&config.volume_dir(drive)) {
			warn!(drive = %drive, "could not reset checkpoint: {err}");
		}

		// Full rescan, then loop back into a fresh attach.
		let scan = {
			let factory = factory.clone();
			let config = config.clone();
			let events = events.clone();
			let cancel = cancel.clone();
			task::spawn_blocking(move || {
				let session = factory(drive)?;
				scan_volume(session, &config, &events, &cancel)
			})
			.await
		};
		match scan {
			Ok(Ok(Some(finished))) => {
				*slot.write() = finished.index;
				resolver = Some(finished.resolver);
				manifest = finished.manifest;
			}
			Ok(Ok(None)) => break, // cancelled mid-rescan
			Ok(Err(err)) => {
				events.emit(CoreEvent::ScanFailed {
					drive,
					error: err.to_string(),
				});
				warn!(drive = %drive, "rescan failed, volume offline: {err}");
				break;
			}
			Err(err) => {
				error!(drive = %drive, "rescan worker panicked: {err}");
				break;
			}
		}
	}
}

enum WatchExit {
	/// Clean stop (cancellation or unrecoverable per-volume failure)
	Shutdown,
	/// The incremental path is untrustworthy; rebuild from scratch
	Rebuild(CoreError),
}

#[allow(clippy::too_many_arguments)]
async fn attach_and_run(
	drive: DriveLetter,
	factory: &Arc<SessionFactory>,
	config: &Arc<CoreConfig>,
	events: &Arc<EventBus>,
	slot: &Arc<RwLock<VolumeIndex>>,
	stopper_slot: &Arc<Mutex<Option<Arc<dyn SessionStopper>>>>,
	resolver: FrnPathResolver,
	manifest: &SnapshotManifest,
	cancel: &CancellationToken,
) -> WatchExit {
	let session = match factory(drive) {
		Ok(session) => session,
		Err(err) => {
			events.emit(CoreEvent::ScanFailed {
				drive,
				error: err.to_string(),
			});
			warn!(drive = %drive, "volume session unavailable, watch aborted: {err}");
			return WatchExit::Shutdown;
		}
	};

	let updater = match IncrementalUpdater::attach(
		session,
		resolver,
		slot.clone(),
		config.volume_dir(drive),
		manifest.journal_id,
		manifest.max_usn,
		events.clone(),
	) {
		Ok(updater) => updater,
		Err(err) if err.forces_rebuild() => return WatchExit::Rebuild(err),
		Err(err) => {
			events.emit(CoreEvent::ScanFailed {
				drive,
				error: err.to_string(),
			});
			warn!(drive = %drive, "updater attach failed: {err}");
			return WatchExit::Shutdown;
		}
	};

	*stopper_slot.lock() = Some(updater.stopper());
	events.emit(CoreEvent::ScanProgress {
		drive,
		phase: ScanPhase::Monitoring,
		records_scanned: manifest.file_count,
	});

	let run_cancel = cancel.clone();
	match task::spawn_blocking(move || updater.run(run_cancel)).await {
		Ok(Ok(())) => WatchExit::Shutdown,
		Ok(Err(err)) if err.forces_rebuild() => WatchExit::Rebuild(err),
		Ok(Err(err)) => {
			events.emit(CoreEvent::ScanFailed {
				drive,
				error: err.to_string(),
			});
			warn!(drive = %drive, "incremental updater stopped: {err}");
			WatchExit::Shutdown
		}
		Err(err) => {
			error!(drive = %drive, "updater worker panicked: {err}");
			WatchExit::Shutdown
		}
	}
}
