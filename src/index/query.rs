//! Substring search over gram postings
//!
//! The same search runs against the live [`VolumeIndex`] and against a
//! memory-mapped snapshot; [`PostingsSource`] is the seam between them.

use std::borrow::Cow;

use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};

use crate::index::builder::VolumeIndex;
use crate::index::gram::{self, GRAM_LEN};
use crate::volume::DriveLetter;

/// One search result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
	pub frn: u64,
	pub drive: DriveLetter,
	pub path: String,
}

/// Read access to one volume's postings and path table
pub trait PostingsSource {
	fn drive(&self) -> DriveLetter;

	/// Postings for a gram, or `None` when no indexed path contains it
	fn bitmap(&self, gram: gram::Gram) -> Option<Cow<'_, RoaringTreemap>>;

	fn path_of(&self, frn: u64) -> Option<Cow<'_, str>>;

	/// Visit `(frn, path)` pairs until the callback returns `false`.
	fn for_each_path(&self, visit: &mut dyn FnMut(u64, &str) -> bool);
}

/// Case-insensitive substring search, capped at `max_results`.
///
/// The query is split into grams and the postings intersected smallest
/// first, so the intermediate set never grows past the rarest gram.
/// Candidates are then verified by actual substring containment, since gram
/// co-occurrence alone can be a false positive. Queries shorter than one
/// gram cannot be prefiltered and fall back to a path-table scan.
pub fn search(source: &dyn PostingsSource, query: &str, max_results: usize) -> Vec<SearchHit> {
	let needle = gram::normalize(query);
	if needle.is_empty() || max_results == 0 {
		return Vec::new();
	}
	if needle.len() < GRAM_LEN {
		return scan_paths(source, &needle, max_results);
	}

	let grams = gram::grams_of(&needle);
	let mut bitmaps: Vec<Cow<'_, RoaringTreemap>> = Vec::with_capacity(grams.len());
	for g in grams {
		match source.bitmap(g) {
			Some(bitmap) => bitmaps.push(bitmap),
			// A gram absent from the dictionary proves no path contains it
			None => return Vec::new(),
		}
	}

	bitmaps.sort_by_key(|bitmap| bitmap.len());
	let mut candidates = bitmaps[0].clone().into_owned();
	for bitmap in &bitmaps[1..] {
		candidates &= bitmap.as_ref();
		if candidates.is_empty() {
			return Vec::new();
		}
	}

	let drive = source.drive();
	let mut hits = Vec::new();
	for frn in candidates.iter() {
		let Some(path) = source.path_of(frn) else {
			continue;
		};
		if gram::normalize(&path).contains(&needle) {
			hits.push(SearchHit {
				frn,
				drive,
				path: path.into_owned(),
			});
			if hits.len() >= max_results {
				break;
			}
		}
	}
	hits
}

fn scan_paths(source: &dyn PostingsSource, needle: &str, max_results: usize) -> Vec<SearchHit> {
	let drive = source.drive();
	let mut hits = Vec::new();
	source.for_each_path(&mut |frn, path| {
		if gram::normalize(path).contains(needle) {
			hits.push(SearchHit {
				frn,
				drive,
				path: path.to_owned(),
			});
		}
		hits.len() < max_results
	});
	hits
}

impl PostingsSource for VolumeIndex {
	fn drive(&self) -> DriveLetter {
		VolumeIndex::drive(self)
	}

	fn bitmap(&self, gram: gram::Gram) -> Option<Cow<'_, RoaringTreemap>> {
		VolumeIndex::bitmap(self, gram).map(Cow::Borrowed)
	}

	fn path_of(&self, frn: u64) -> Option<Cow<'_, str>> {
		VolumeIndex::path_of(self, frn).map(Cow::Borrowed)
	}

	fn for_each_path(&self, visit: &mut dyn FnMut(u64, &str) -> bool) {
		for (frn, path) in self.iter_paths() {
			if !visit(frn, path) {
				break;
			}
		}
	}
}
