//! Streaming batch indexing
//!
//! Buffers raw enumeration records and resolves paths only at flush
//! boundaries, so repeated ancestor walks are amortized across a batch of
//! (usually clustered) siblings and peak memory stays bounded by the flush
//! thresholds instead of the volume size.

use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus, ScanPhase};
use crate::index::builder::VolumeIndex;
use crate::index::snapshot::{self, SnapshotManifest};
use crate::resolver::FrnPathResolver;
use crate::volume::{DriveLetter, JournalInfo, UsnRecord};
use std::path::Path;

/// Build lifecycle; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
	Idle,
	Scanning,
	Flushing,
	Finalizing,
	Done,
}

/// A record buffered for deferred path resolution
struct PendingRecord {
	frn: u64,
	parent_frn: u64,
	name: String,
}

/// Completed scan artifacts, handed onward to the incremental updater
pub struct FinishedScan {
	pub index: VolumeIndex,
	pub resolver: FrnPathResolver,
	pub manifest: SnapshotManifest,
	pub records_scanned: u64,
}

/// Batches raw records into the index through the resolver
pub struct StreamingBuilder<'a> {
	drive: DriveLetter,
	phase: BuildPhase,
	resolver: FrnPathResolver,
	index: VolumeIndex,
	pending: Vec<PendingRecord>,
	buffered_bytes: usize,
	batch_size: usize,
	max_buffered_bytes: usize,
	records_scanned: u64,
	skipped_records: u64,
	events: &'a EventBus,
}

impl<'a> StreamingBuilder<'a> {
	pub fn new(
		drive: DriveLetter,
		batch_size: usize,
		max_buffered_bytes: usize,
		path_cache_capacity: usize,
		events: &'a EventBus,
	) -> Self {
		Self {
			drive,
			phase: BuildPhase::Idle,
			resolver: FrnPathResolver::new(drive, path_cache_capacity),
			index: VolumeIndex::new(drive),
			pending: Vec::with_capacity(batch_size),
			buffered_bytes: 0,
			batch_size: batch_size.max(1),
			max_buffered_bytes,
			records_scanned: 0,
			skipped_records: 0,
			events,
		}
	}

	pub fn phase(&self) -> BuildPhase {
		self.phase
	}

	pub fn records_scanned(&self) -> u64 {
		self.records_scanned
	}

	/// Buffer one raw record. Directories feed the FRN map immediately so
	/// later flushes can resolve through them; path construction itself is
	/// deferred to the flush boundary.
	pub fn accept(&mut self, record: &UsnRecord) -> Result<()> {
		match self.phase {
			BuildPhase::Idle => self.phase = BuildPhase::Scanning,
			BuildPhase::Scanning => {}
			other => {
				return Err(CoreError::Internal(format!(
					"accept() in build phase {other:?}"
				)))
			}
		}

		if record.is_directory() {
			self.resolver.record_parent(record.frn, record.parent_frn, &record.name);
		}
		if record.frn == record.parent_frn {
			// The self-parenting volume root anchors the resolver but is
			// not itself a searchable path.
			self.records_scanned += 1;
			return Ok(());
		}
		self.buffered_bytes += record.name.len() + std::mem::size_of::<PendingRecord>();
		self.pending.push(PendingRecord {
			frn: record.frn,
			parent_frn: record.parent_frn,
			name: record.name.clone(),
		});
		self.records_scanned += 1;

		if self.pending.len() >= self.batch_size || self.buffered_bytes >= self.max_buffered_bytes {
			self.flush()?;
		}
		Ok(())
	}

	/// Resolve every buffered record into the index and reset the buffer.
	/// A record whose path cannot be resolved is logged and skipped; it
	/// never fails the scan.
	pub fn flush(&mut self) -> Result<()> {
		if self.pending.is_empty() {
			return Ok(());
		}
		let previous_phase = self.phase;
		self.phase = BuildPhase::Flushing;

		for pending in self.pending.drain(..) {
			match self.resolver.resolve_path(pending.parent_frn, &pending.name) {
				Ok(path) => self.index.add_record(pending.frn, &path),
				Err(err) => {
					self.skipped_records += 1;
					warn!(
						drive = %self.drive,
						frn = format_args!("{:#x}", pending.frn),
						"skipping unresolvable record: {err}"
					);
				}
			}
		}
		self.buffered_bytes = 0;

		self.events.emit(CoreEvent::ScanProgress {
			drive: self.drive,
			phase: ScanPhase::Flushing,
			records_scanned: self.records_scanned,
		});
		self.phase = match previous_phase {
			BuildPhase::Idle => BuildPhase::Scanning,
			other => other,
		};
		Ok(())
	}

	/// Flush the tail, persist the snapshot and hand the live state over.
	pub fn finalize(mut self, data_dir: &Path, journal: &JournalInfo) -> Result<FinishedScan> {
		self.flush()?;
		self.phase = BuildPhase::Finalizing;
		self.events.emit(CoreEvent::ScanProgress {
			drive: self.drive,
			phase: ScanPhase::Finalizing,
			records_scanned: self.records_scanned,
		});

		let manifest = snapshot::write_snapshot(
			data_dir,
			&self.index,
			&self.resolver,
			journal.journal_id,
			// The enumeration covered everything up to the journal cursor
			// captured at session open; deltas resume from there.
			journal.next_usn,
		)?;

		if self.skipped_records > 0 {
			debug!(
				drive = %self.drive,
				skipped = self.skipped_records,
				"scan finished with unresolvable records"
			);
		}
		self.phase = BuildPhase::Done;
		Ok(FinishedScan {
			index: self.index,
			resolver: self.resolver,
			manifest,
			records_scanned: self.records_scanned,
		})
	}
}
