//! FRN parent-chain path reconstruction
//!
//! The resolver owns the per-volume FRN map: one [`ParentInfo`] per known
//! directory, written during enumeration and kept current by the incremental
//! updater. Files are never stored here; a file's path is its parent
//! directory's resolved path plus the record's own name, and the index keeps
//! the full path per file anyway.
//!
//! Each resolver instance belongs to exactly one volume scan/watch session.
//! It is created with the session and dropped with it; nothing here is
//! process-global.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::trace;

use crate::error::{CoreError, Result};
use crate::volume::DriveLetter;

/// Upper bound on ancestor hops before a chain is declared cyclic
const MAX_ANCESTOR_DEPTH: usize = 128;

/// Component substituted when an ancestor directory vanished mid-scan
pub const UNRESOLVED_COMPONENT: &str = "<unresolved>";

/// Minimal per-directory entry in the FRN map; last write wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentInfo {
	pub parent_frn: u64,
	pub name: String,
}

/// Reconstructs absolute paths from File Reference Numbers
pub struct FrnPathResolver {
	drive: DriveLetter,
	/// FRN of the volume root directory, once observed (self-parenting record)
	root_frn: Option<u64>,
	map: HashMap<u64, ParentInfo>,
	/// Resolved absolute paths of directories, keyed by FRN. Siblings share
	/// a parent, so batch resolution hits this cache on all but the first.
	dir_cache: LruCache<u64, String>,
}

impl FrnPathResolver {
	pub fn new(drive: DriveLetter, cache_capacity: usize) -> Self {
		let capacity = NonZeroUsize::new(cache_capacity.max(1)).expect("max(1) is non-zero");
		Self {
			drive,
			root_frn: None,
			map: HashMap::new(),
			dir_cache: LruCache::new(capacity),
		}
	}

	/// Record or overwrite a directory's parent link. Idempotent; a rename
	/// simply overwrites the previous entry.
	pub fn record_parent(&mut self, frn: u64, parent_frn: u64, name: &str) {
		if frn == parent_frn {
			// The volume root is its own parent; remember it as the walk
			// terminator instead of storing a self-loop.
			self.root_frn = Some(frn);
			return;
		}
		self.map.insert(
			frn,
			ParentInfo {
				parent_frn,
				name: name.to_owned(),
			},
		);
		// Any cached path for this FRN (including a placeholder cached while
		// the entry was missing) is stale now.
		self.dir_cache.pop(&frn);
	}

	/// Mark a known FRN as the volume root.
	pub fn set_root(&mut self, frn: u64) {
		self.root_frn = Some(frn);
		self.map.remove(&frn);
	}

	/// Forget a deleted directory and its cached path.
	pub fn remove(&mut self, frn: u64) -> Option<ParentInfo> {
		self.dir_cache.pop(&frn);
		self.map.remove(&frn)
	}

	/// Drop a directory's cached path. Descendant entries age out of the
	/// bounded cache on their own; their next resolution walks the corrected
	/// chain.
	pub fn invalidate(&mut self, frn: u64) {
		self.dir_cache.pop(&frn);
	}

	pub fn clear_cache(&mut self) {
		self.dir_cache.clear();
	}

	pub fn get(&self, frn: u64) -> Option<&ParentInfo> {
		self.map.get(&frn)
	}

	pub fn root_frn(&self) -> Option<u64> {
		self.root_frn
	}

	/// Iterate the directory entries in unspecified order.
	pub fn iter(&self) -> impl Iterator<Item = (u64, &ParentInfo)> {
		self.map.iter().map(|(frn, info)| (*frn, info))
	}

	/// Rebuild a resolver from persisted entries (snapshot warm start).
	pub fn from_entries(
		drive: DriveLetter,
		cache_capacity: usize,
		root_frn: Option<u64>,
		entries: impl IntoIterator<Item = (u64, ParentInfo)>,
	) -> Self {
		let mut resolver = Self::new(drive, cache_capacity);
		resolver.root_frn = root_frn;
		resolver.map = entries.into_iter().collect();
		resolver
	}

	pub fn len(&self) -> usize {
		self.map.len()
	}

	pub fn is_empty(&self) -> bool {
		self.map.is_empty()
	}

	/// Resolve the absolute path of the directory identified by `frn`.
	///
	/// The walk is iterative: look the FRN up, prepend its stored name, step
	/// to its parent, and stop at the root (or at any FRN with no entry — a
	/// directory deleted mid-scan terminates the chain early and contributes
	/// an [`UNRESOLVED_COMPONENT`] placeholder). A chain longer than
	/// [`MAX_ANCESTOR_DEPTH`] is treated as cyclic.
	pub fn resolve_dir(&mut self, frn: u64) -> Result<String> {
		if Some(frn) == self.root_frn || (self.root_frn.is_none() && !self.map.contains_key(&frn)) {
			return Ok(self.drive.root_path());
		}
		if let Some(path) = self.dir_cache.get(&frn) {
			return Ok(path.clone());
		}

		// Names collected leaf-first, plus the FRN owning each prefix so
		// every ancestor walked gets cached too.
		let mut components: Vec<(u64, &str)> = Vec::new();
		let mut cursor = frn;
		for _ in 0..=MAX_ANCESTOR_DEPTH {
			if Some(cursor) == self.root_frn {
				break;
			}
			match self.map.get(&cursor) {
				Some(info) => {
					components.push((cursor, info.name.as_str()));
					cursor = info.parent_frn;
				}
				None => {
					if self.root_frn.is_some() {
						// Chain broke below the root: an ancestor vanished.
						trace!(frn = format_args!("{cursor:#x}"), "ancestor missing from FRN map");
						components.push((cursor, UNRESOLVED_COMPONENT));
					}
					break;
				}
			}
			if components.len() > MAX_ANCESTOR_DEPTH {
				return Err(CoreError::PathResolution { frn });
			}
		}
		if components.len() > MAX_ANCESTOR_DEPTH {
			return Err(CoreError::PathResolution { frn });
		}

		// Build root-to-leaf, caching each intermediate directory's path.
		let mut path = self.drive.root_path();
		let mut cache_updates: Vec<(u64, String)> = Vec::with_capacity(components.len());
		for (component_frn, name) in components.iter().rev() {
			if !path.ends_with('\\') {
				path.push('\\');
			}
			path.push_str(name);
			cache_updates.push((*component_frn, path.clone()));
		}
		for (component_frn, component_path) in cache_updates {
			self.dir_cache.put(component_frn, component_path);
		}

		Ok(path)
	}

	/// Resolve the absolute path of a file or directory record given its
	/// parent FRN and name.
	pub fn resolve_path(&mut self, parent_frn: u64, name: &str) -> Result<String> {
		let dir = self.resolve_dir(parent_frn)?;
		let mut path = dir;
		if !path.ends_with('\\') {
			path.push('\\');
		}
		path.push_str(name);
		Ok(path)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	const ROOT: u64 = 5;

	fn resolver() -> FrnPathResolver {
		let mut r = FrnPathResolver::new(DriveLetter::new('C').unwrap(), 64);
		r.set_root(ROOT);
		r
	}

	#[test]
	fn resolves_nested_chain_root_to_leaf() {
		let mut r = resolver();
		r.record_parent(10, ROOT, "Users");
		r.record_parent(11, 10, "bob");
		r.record_parent(12, 11, "Documents");

		assert_eq!(r.resolve_dir(12).unwrap(), "C:\\Users\\bob\\Documents");
		assert_eq!(
			r.resolve_path(12, "report.docx").unwrap(),
			"C:\\Users\\bob\\Documents\\report.docx"
		);
	}

	#[test]
	fn root_resolves_to_drive_prefix() {
		let mut r = resolver();
		assert_eq!(r.resolve_dir(ROOT).unwrap(), "C:\\");
		assert_eq!(r.resolve_path(ROOT, "pagefile.sys").unwrap(), "C:\\pagefile.sys");
	}

	#[test]
	fn each_name_appears_exactly_once() {
		let mut r = resolver();
		r.record_parent(10, ROOT, "a");
		r.record_parent(11, 10, "a");
		r.record_parent(12, 11, "b");
		assert_eq!(r.resolve_dir(12).unwrap(), "C:\\a\\a\\b");
	}

	#[test]
	fn rename_overwrites_and_invalidates() {
		let mut r = resolver();
		r.record_parent(10, ROOT, "Users");
		r.record_parent(11, 10, "bob");
		assert_eq!(r.resolve_dir(11).unwrap(), "C:\\Users\\bob");

		// Last write wins; the cached path must not survive the rename.
		r.record_parent(11, 10, "robert");
		assert_eq!(r.resolve_dir(11).unwrap(), "C:\\Users\\robert");
	}

	#[test]
	fn missing_ancestor_yields_placeholder() {
		let mut r = resolver();
		r.record_parent(11, 999, "orphaned"); // parent 999 never recorded
		assert_eq!(
			r.resolve_dir(11).unwrap(),
			format!("C:\\{UNRESOLVED_COMPONENT}\\orphaned")
		);
	}

	#[test]
	fn cycle_fails_instead_of_looping() {
		let mut r = resolver();
		r.record_parent(10, 11, "ping");
		r.record_parent(11, 10, "pong");
		assert!(matches!(
			r.resolve_dir(10),
			Err(CoreError::PathResolution { frn: 10 })
		));
	}

	#[test]
	fn siblings_share_cached_parent_prefix() {
		let mut r = resolver();
		r.record_parent(10, ROOT, "Users");
		r.record_parent(11, 10, "bob");
		r.resolve_dir(11).unwrap();

		// The whole ancestor chain was cached by the first walk.
		assert_eq!(r.dir_cache.get(&10), Some(&"C:\\Users".to_string()));
		assert_eq!(r.resolve_path(11, "a.txt").unwrap(), "C:\\Users\\bob\\a.txt");
		assert_eq!(r.resolve_path(11, "b.txt").unwrap(), "C:\\Users\\bob\\b.txt");
	}

	#[test]
	fn deleted_directory_is_forgotten() {
		let mut r = resolver();
		r.record_parent(10, ROOT, "tmp");
		r.resolve_dir(10).unwrap();
		let removed = r.remove(10).unwrap();
		assert_eq!(removed.name, "tmp");
		assert!(r.get(10).is_none());
	}
}
