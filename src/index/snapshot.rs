//! Persisted index snapshots
//!
//! A snapshot is an immutable per-volume bundle of artifacts in the
//! volume's data directory:
//!
//! - `NNNNNNNN.dict`     sorted gram → (offset, len) dictionary (postcard)
//! - `NNNNNNNN.postings` contiguous serialized bitmaps, read via mmap
//! - `NNNNNNNN.paths`    FRN → absolute path table (postcard)
//! - `NNNNNNNN.dirs`     directory FRN map, for warm-starting the updater
//! - `manifest.json`     generation, drive, journal cursor, counts
//!
//! `NNNNNNNN` is the zero-padded generation counter. Every artifact is
//! written to a temp file and renamed into place; the manifest rename is the
//! publish point, so readers observe either the previous generation or the
//! new one in full, never a mix. Published generations are never modified.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use memmap2::Mmap;
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::index::builder::VolumeIndex;
use crate::index::gram::Gram;
use crate::index::query::PostingsSource;
use crate::resolver::{FrnPathResolver, ParentInfo};
use crate::volume::DriveLetter;

const MANIFEST_NAME: &str = "manifest.json";
const POSTINGS_MAGIC: &[u8; 8] = b"QSKPOST1";
const DICT_MAGIC: u32 = 0x5153_4B44; // "QSKD"
const PATHS_MAGIC: u32 = 0x5153_4B50; // "QSKP"
const DIRS_MAGIC: u32 = 0x5153_4B52; // "QSKR"
const FORMAT_VERSION: u16 = 1;

/// Published snapshot metadata; the publish point of a generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
	pub version: u16,
	pub generation: u64,
	pub drive: DriveLetter,
	/// Journal identity the snapshot was built against
	pub journal_id: u64,
	/// Every change up to and including this USN is reflected in the bundle
	pub max_usn: i64,
	pub file_count: u64,
	pub gram_count: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct DictEntry {
	gram: Gram,
	offset: u64,
	len: u32,
}

#[derive(Serialize, Deserialize)]
struct DictFile {
	magic: u32,
	version: u16,
	entries: Vec<DictEntry>,
}

#[derive(Serialize, Deserialize)]
struct PathsFile {
	magic: u32,
	version: u16,
	entries: Vec<(u64, String)>,
}

#[derive(Serialize, Deserialize)]
struct DirsFile {
	magic: u32,
	version: u16,
	root_frn: Option<u64>,
	/// (frn, parent_frn, name) per known directory
	entries: Vec<(u64, u64, String)>,
}

fn corrupt(message: impl Into<String>) -> CoreError {
	CoreError::IndexCorruption(message.into())
}

fn artifact_name(generation: u64, extension: &str) -> String {
	format!("{generation:08}.{extension}")
}

/// Write `bytes` into `dir/name` via a temp file in the same directory, so
/// the rename is atomic on the same filesystem.
fn write_file_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
	let mut tmp = NamedTempFile::new_in(dir)?;
	tmp.write_all(bytes)?;
	tmp.as_file().sync_all()?;
	tmp.persist(dir.join(name)).map_err(|err| CoreError::Io(err.error))?;
	Ok(())
}

fn read_manifest(dir: &Path) -> Result<Option<SnapshotManifest>> {
	let path = dir.join(MANIFEST_NAME);
	let raw = match fs::read_to_string(&path) {
		Ok(raw) => raw,
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(err) => return Err(err.into()),
	};
	let manifest: SnapshotManifest =
		serde_json::from_str(&raw).map_err(|err| corrupt(format!("manifest unreadable: {err}")))?;
	Ok(Some(manifest))
}

/// Serialize `index` as the next snapshot generation under `dir`.
///
/// Artifacts land first, the manifest rename publishes them, and stale
/// generations are cleaned up afterwards (best effort).
pub fn write_snapshot(
	dir: &Path,
	index: &VolumeIndex,
	resolver: &FrnPathResolver,
	journal_id: u64,
	max_usn: i64,
) -> Result<SnapshotManifest> {
	fs::create_dir_all(dir)?;
	let generation = match read_manifest(dir) {
		Ok(Some(previous)) => previous.generation + 1,
		Ok(None) => 1,
		// A corrupt manifest forfeits the counter; restart it past anything
		// a directory listing still shows.
		Err(_) => highest_generation_on_disk(dir) + 1,
	};

	let mut blob: Vec<u8> = POSTINGS_MAGIC.to_vec();
	let mut entries = Vec::new();
	for (gram, bitmap) in index.sorted_postings() {
		let offset = blob.len() as u64;
		bitmap
			.serialize_into(&mut blob)
			.map_err(|err| CoreError::Internal(format!("bitmap serialization failed: {err}")))?;
		entries.push(DictEntry {
			gram,
			offset,
			len: (blob.len() as u64 - offset) as u32,
		});
	}
	write_file_atomic(dir, &artifact_name(generation, "postings"), &blob)?;

	let dict = DictFile {
		magic: DICT_MAGIC,
		version: FORMAT_VERSION,
		entries,
	};
	write_file_atomic(dir, &artifact_name(generation, "dict"), &postcard::to_stdvec(&dict)?)?;

	let mut path_entries: Vec<(u64, String)> = index
		.iter_paths()
		.map(|(frn, path)| (frn, path.to_owned()))
		.collect();
	path_entries.sort_unstable_by_key(|(frn, _)| *frn);
	let paths = PathsFile {
		magic: PATHS_MAGIC,
		version: FORMAT_VERSION,
		entries: path_entries,
	};
	write_file_atomic(dir, &artifact_name(generation, "paths"), &postcard::to_stdvec(&paths)?)?;

	let dirs = DirsFile {
		magic: DIRS_MAGIC,
		version: FORMAT_VERSION,
		root_frn: resolver.root_frn(),
		entries: resolver
			.iter()
			.map(|(frn, info)| (frn, info.parent_frn, info.name.clone()))
			.collect(),
	};
	write_file_atomic(dir, &artifact_name(generation, "dirs"), &postcard::to_stdvec(&dirs)?)?;

	let manifest = SnapshotManifest {
		version: FORMAT_VERSION,
		generation,
		drive: index.drive(),
		journal_id,
		max_usn,
		file_count: index.len() as u64,
		gram_count: index.gram_count() as u64,
	};
	write_file_atomic(dir, MANIFEST_NAME, &serde_json::to_vec_pretty(&manifest)?)?;

	remove_stale_generations(dir, generation);
	debug!(
		drive = %manifest.drive,
		generation,
		files = manifest.file_count,
		grams = manifest.gram_count,
		"snapshot published"
	);
	Ok(manifest)
}

fn highest_generation_on_disk(dir: &Path) -> u64 {
	let Ok(entries) = fs::read_dir(dir) else {
		return 0;
	};
	entries
		.flatten()
		.filter_map(|entry| parse_generation(&entry.path()))
		.max()
		.unwrap_or(0)
}

fn parse_generation(path: &Path) -> Option<u64> {
	let stem = path.file_stem()?.to_str()?;
	let extension = path.extension()?.to_str()?;
	matches!(extension, "dict" | "postings" | "paths" | "dirs")
		.then(|| stem.parse().ok())
		.flatten()
}

fn remove_stale_generations(dir: &Path, current: u64) {
	let Ok(entries) = fs::read_dir(dir) else {
		return;
	};
	for entry in entries.flatten() {
		let path = entry.path();
		if let Some(generation) = parse_generation(&path) {
			if generation != current {
				if let Err(err) = fs::remove_file(&path) {
					warn!("could not remove stale snapshot artifact {}: {err}", path.display());
				}
			}
		}
	}
}

/// Read side of a published snapshot.
///
/// The dictionary and path table are loaded up front; the postings blob is
/// memory-mapped and individual bitmaps deserialized only when a query
/// touches their gram.
pub struct SnapshotReader {
	manifest: SnapshotManifest,
	dict: Vec<DictEntry>,
	blob: Mmap,
	paths: HashMap<u64, String>,
	dir_root: Option<u64>,
	dir_entries: Vec<(u64, u64, String)>,
}

impl SnapshotReader {
	/// Open the published snapshot under `dir`.
	///
	/// `Ok(None)` means no snapshot was ever published there. Any
	/// inconsistency in a published bundle is reported as
	/// [`CoreError::IndexCorruption`] so the caller can fall back to a full
	/// rebuild.
	pub fn load(dir: &Path) -> Result<Option<Self>> {
		let Some(manifest) = read_manifest(dir)? else {
			return Ok(None);
		};
		if manifest.version != FORMAT_VERSION {
			return Err(corrupt(format!("unsupported snapshot version {}", manifest.version)));
		}
		let generation = manifest.generation;

		let dict_raw = fs::read(dir.join(artifact_name(generation, "dict")))
			.map_err(|err| corrupt(format!("dictionary missing: {err}")))?;
		let dict: DictFile = postcard::from_bytes(&dict_raw)
			.map_err(|err| corrupt(format!("dictionary undecodable: {err}")))?;
		if dict.magic != DICT_MAGIC || dict.version != FORMAT_VERSION {
			return Err(corrupt("dictionary header mismatch"));
		}
		if !dict.entries.windows(2).all(|pair| pair[0].gram < pair[1].gram) {
			return Err(corrupt("dictionary grams out of order"));
		}

		let blob_file = File::open(dir.join(artifact_name(generation, "postings")))
			.map_err(|err| corrupt(format!("postings blob missing: {err}")))?;
		// Safety: the blob is published via rename and never written again.
		let blob = unsafe { Mmap::map(&blob_file)? };
		if blob.len() < POSTINGS_MAGIC.len() || &blob[..POSTINGS_MAGIC.len()] != POSTINGS_MAGIC {
			return Err(corrupt("postings blob header mismatch"));
		}
		for entry in &dict.entries {
			let end = entry.offset + entry.len as u64;
			if entry.offset < POSTINGS_MAGIC.len() as u64 || end > blob.len() as u64 {
				return Err(corrupt(format!(
					"bitmap range {}..{end} escapes {}-byte blob",
					entry.offset,
					blob.len()
				)));
			}
		}

		let paths_raw = fs::read(dir.join(artifact_name(generation, "paths")))
			.map_err(|err| corrupt(format!("path table missing: {err}")))?;
		let paths: PathsFile = postcard::from_bytes(&paths_raw)
			.map_err(|err| corrupt(format!("path table undecodable: {err}")))?;
		if paths.magic != PATHS_MAGIC || paths.version != FORMAT_VERSION {
			return Err(corrupt("path table header mismatch"));
		}
		if paths.entries.len() as u64 != manifest.file_count {
			return Err(corrupt(format!(
				"manifest promises {} files, path table holds {}",
				manifest.file_count,
				paths.entries.len()
			)));
		}

		let dirs_raw = fs::read(dir.join(artifact_name(generation, "dirs")))
			.map_err(|err| corrupt(format!("directory map missing: {err}")))?;
		let dirs: DirsFile = postcard::from_bytes(&dirs_raw)
			.map_err(|err| corrupt(format!("directory map undecodable: {err}")))?;
		if dirs.magic != DIRS_MAGIC || dirs.version != FORMAT_VERSION {
			return Err(corrupt("directory map header mismatch"));
		}

		Ok(Some(Self {
			manifest,
			dict: dict.entries,
			blob,
			paths: paths.entries.into_iter().collect(),
			dir_root: dirs.root_frn,
			dir_entries: dirs.entries,
		}))
	}

	pub fn manifest(&self) -> &SnapshotManifest {
		&self.manifest
	}

	fn bitmap_at(&self, entry: &DictEntry) -> Option<RoaringTreemap> {
		let start = entry.offset as usize;
		let end = start + entry.len as usize;
		match RoaringTreemap::deserialize_from(&self.blob[start..end]) {
			Ok(bitmap) => Some(bitmap),
			Err(err) => {
				// Ranges were validated at load; a decode failure here means
				// on-disk damage after publish. Degrade to a miss.
				warn!(gram = entry.gram, "bitmap undecodable in published snapshot: {err}");
				None
			}
		}
	}

	/// Rebuild a mutable [`VolumeIndex`] from this snapshot (warm start for
	/// the incremental updater).
	pub fn to_index(&self) -> Result<VolumeIndex> {
		let mut postings = HashMap::with_capacity(self.dict.len());
		for entry in &self.dict {
			let bitmap = self
				.bitmap_at(entry)
				.ok_or_else(|| corrupt(format!("bitmap for gram {:#x} undecodable", entry.gram)))?;
			postings.insert(entry.gram, bitmap);
		}
		Ok(VolumeIndex::from_parts(
			self.manifest.drive,
			postings,
			self.paths.clone(),
		))
	}

	/// Rebuild the FRN map persisted with this snapshot.
	pub fn to_resolver(&self, cache_capacity: usize) -> FrnPathResolver {
		FrnPathResolver::from_entries(
			self.manifest.drive,
			cache_capacity,
			self.dir_root,
			self.dir_entries.iter().map(|(frn, parent_frn, name)| {
				(
					*frn,
					ParentInfo {
						parent_frn: *parent_frn,
						name: name.clone(),
					},
				)
			}),
		)
	}
}

impl PostingsSource for SnapshotReader {
	fn drive(&self) -> DriveLetter {
		self.manifest.drive
	}

	fn bitmap(&self, gram: Gram) -> Option<Cow<'_, RoaringTreemap>> {
		let position = self.dict.binary_search_by_key(&gram, |entry| entry.gram).ok()?;
		self.bitmap_at(&self.dict[position]).map(Cow::Owned)
	}

	fn path_of(&self, frn: u64) -> Option<Cow<'_, str>> {
		self.paths.get(&frn).map(|path| Cow::Borrowed(path.as_str()))
	}

	fn for_each_path(&self, visit: &mut dyn FnMut(u64, &str) -> bool) {
		for (frn, path) in &self.paths {
			if !visit(*frn, path) {
				break;
			}
		}
	}
}
