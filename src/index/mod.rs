//! Gram postings index: build, persist, query

pub mod builder;
pub mod gram;
pub mod query;
pub mod snapshot;
pub mod streaming;

pub use builder::VolumeIndex;
pub use query::{search, PostingsSource, SearchHit};
pub use snapshot::{write_snapshot, SnapshotManifest, SnapshotReader};
pub use streaming::{BuildPhase, FinishedScan, StreamingBuilder};
