//! Progress events for the surrounding application
//!
//! Coarse, UI-agnostic notifications broadcast while volumes are scanned and
//! watched. Consumers subscribe and render however they like; emitting with
//! no subscribers is fine.

use strum::Display;
use tokio::sync::broadcast;

use crate::volume::DriveLetter;

/// Phase a volume is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ScanPhase {
	/// Walking the MFT enumeration
	Enumerating,
	/// Resolving a buffered batch into the index
	Flushing,
	/// Writing the snapshot bundle
	Finalizing,
	/// Live journal watch
	Monitoring,
}

/// Events emitted by the engine
#[derive(Debug, Clone)]
pub enum CoreEvent {
	ScanStarted {
		drive: DriveLetter,
	},
	ScanProgress {
		drive: DriveLetter,
		phase: ScanPhase,
		records_scanned: u64,
	},
	ScanCompleted {
		drive: DriveLetter,
		file_count: u64,
		generation: u64,
	},
	ScanFailed {
		drive: DriveLetter,
		error: String,
	},
	/// A drained journal batch was applied and checkpointed
	IndexUpdated {
		drive: DriveLetter,
		applied: u64,
		last_usn: i64,
	},
	/// Incremental resume was invalid; a full rescan is being forced
	JournalWrapped {
		drive: DriveLetter,
	},
}

/// Broadcast bus for [`CoreEvent`]s
pub struct EventBus {
	sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	/// Emit an event. Send errors (no receivers) are ignored.
	pub fn emit(&self, event: CoreEvent) {
		let _ = self.sender.send(event);
	}

	pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
		self.sender.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(1024)
	}
}
