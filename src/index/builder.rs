//! In-memory gram postings index for one volume
//!
//! A [`VolumeIndex`] maps each gram to the compressed set of FRNs whose path
//! contains it, plus the FRN → path table needed to produce absolute paths
//! and to verify candidate matches. Membership cost scales with actual
//! postings sizes, not with the FRN universe.

use std::collections::HashMap;

use roaring::RoaringTreemap;

use crate::index::gram::{self, Gram};
use crate::volume::DriveLetter;

/// Mutable postings index owned by a single volume session
pub struct VolumeIndex {
	drive: DriveLetter,
	postings: HashMap<Gram, RoaringTreemap>,
	/// Original-case absolute path per indexed FRN
	paths: HashMap<u64, String>,
}

impl VolumeIndex {
	pub fn new(drive: DriveLetter) -> Self {
		Self {
			drive,
			postings: HashMap::new(),
			paths: HashMap::new(),
		}
	}

	/// Reassemble an index from deserialized snapshot parts.
	pub(crate) fn from_parts(
		drive: DriveLetter,
		postings: HashMap<Gram, RoaringTreemap>,
		paths: HashMap<u64, String>,
	) -> Self {
		Self {
			drive,
			postings,
			paths,
		}
	}

	pub fn drive(&self) -> DriveLetter {
		self.drive
	}

	/// Number of indexed files/directories
	pub fn len(&self) -> usize {
		self.paths.len()
	}

	pub fn is_empty(&self) -> bool {
		self.paths.is_empty()
	}

	pub fn gram_count(&self) -> usize {
		self.postings.len()
	}

	pub fn path_of(&self, frn: u64) -> Option<&str> {
		self.paths.get(&frn).map(String::as_str)
	}

	/// Index a record under its absolute path.
	///
	/// Upsert semantics: re-adding the same `(frn, path)` is a no-op, and a
	/// changed path (rename observed as an add) first unindexes the old one,
	/// so gram membership never duplicates.
	pub fn add_record(&mut self, frn: u64, path: &str) {
		if let Some(existing) = self.paths.get(&frn) {
			if existing == path {
				return;
			}
			self.remove_record(frn);
		}

		let normalized = gram::normalize(path);
		for g in gram::grams_of(&normalized) {
			self.postings.entry(g).or_default().insert(frn);
		}
		self.paths.insert(frn, path.to_owned());
	}

	/// Unindex a record, recomputing its grams from the stored path.
	/// Removing an FRN that was never indexed is a no-op.
	pub fn remove_record(&mut self, frn: u64) -> Option<String> {
		let path = self.paths.remove(&frn)?;
		let normalized = gram::normalize(&path);
		for g in gram::grams_of(&normalized) {
			if let Some(bitmap) = self.postings.get_mut(&g) {
				bitmap.remove(frn);
				if bitmap.is_empty() {
					self.postings.remove(&g);
				}
			}
		}
		Some(path)
	}

	/// Rewrite every indexed path under `old_prefix` to live under
	/// `new_prefix`. Called when a directory rename is observed, since the
	/// journal reports only the directory itself, not its descendants.
	pub fn rename_subtree(&mut self, old_prefix: &str, new_prefix: &str) -> usize {
		let affected: Vec<(u64, String)> = self
			.paths
			.iter()
			.filter(|(_, path)| {
				path.len() > old_prefix.len()
					&& path.starts_with(old_prefix)
					&& path.as_bytes()[old_prefix.len()] == b'\\'
			})
			.map(|(frn, path)| {
				let mut rewritten = String::with_capacity(new_prefix.len() + path.len() - old_prefix.len());
				rewritten.push_str(new_prefix);
				rewritten.push_str(&path[old_prefix.len()..]);
				(*frn, rewritten)
			})
			.collect();

		let count = affected.len();
		for (frn, path) in affected {
			self.add_record(frn, &path);
		}
		count
	}

	pub fn bitmap(&self, gram: Gram) -> Option<&RoaringTreemap> {
		self.postings.get(&gram)
	}

	/// Iterate `(frn, path)` pairs in unspecified order.
	pub fn iter_paths(&self) -> impl Iterator<Item = (u64, &str)> {
		self.paths.iter().map(|(frn, path)| (*frn, path.as_str()))
	}

	/// Postings entries sorted by gram, for snapshot serialization.
	pub fn sorted_postings(&self) -> Vec<(Gram, &RoaringTreemap)> {
		let mut entries: Vec<_> = self.postings.iter().map(|(g, b)| (*g, b)).collect();
		entries.sort_unstable_by_key(|(g, _)| *g);
		entries
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::index::gram::pack;

	fn drive() -> DriveLetter {
		DriveLetter::new('C').unwrap()
	}

	#[test]
	fn add_then_remove_leaves_no_residue() {
		let mut index = VolumeIndex::new(drive());
		index.add_record(1, "C:\\Users\\bob\\report.docx");
		assert_eq!(index.len(), 1);
		assert!(index.bitmap(pack(b"rep")).is_some());

		index.remove_record(1);
		assert!(index.is_empty());
		assert_eq!(index.gram_count(), 0);
	}

	#[test]
	fn re_adding_same_path_is_idempotent() {
		let mut index = VolumeIndex::new(drive());
		index.add_record(1, "C:\\a\\file.txt");
		let grams_before = index.gram_count();
		index.add_record(1, "C:\\a\\file.txt");
		assert_eq!(index.len(), 1);
		assert_eq!(index.gram_count(), grams_before);

		// One removal fully clears the membership
		index.remove_record(1);
		assert!(index.bitmap(pack(b"fil")).is_none());
	}

	#[test]
	fn removing_absent_frn_is_a_noop() {
		let mut index = VolumeIndex::new(drive());
		assert_eq!(index.remove_record(42), None);
	}

	#[test]
	fn changed_path_unindexes_the_old_spelling() {
		let mut index = VolumeIndex::new(drive());
		index.add_record(1, "C:\\old_name.txt");
		index.add_record(1, "C:\\new_name.txt");

		assert_eq!(index.len(), 1);
		assert!(index.bitmap(pack(b"old")).is_none());
		assert!(index.bitmap(pack(b"new")).is_some());
	}

	#[test]
	fn subtree_rename_rewrites_descendants_only() {
		let mut index = VolumeIndex::new(drive());
		index.add_record(1, "C:\\projects");
		index.add_record(2, "C:\\projects\\app\\main.rs");
		index.add_record(3, "C:\\projects_backup\\misc.txt");

		index.add_record(1, "C:\\archive");
		let moved = index.rename_subtree("C:\\projects", "C:\\archive");

		assert_eq!(moved, 1);
		assert_eq!(index.path_of(2), Some("C:\\archive\\app\\main.rs"));
		// The similarly-prefixed sibling must not be touched
		assert_eq!(index.path_of(3), Some("C:\\projects_backup\\misc.txt"));
	}
}
