//! Path normalization and trigram extraction
//!
//! Grams are 3-byte windows over the lowercased UTF-8 path, packed into a
//! `u32` key. Byte windows (rather than char windows) keep the gram space
//! bounded and agree with the byte-level substring verification applied to
//! candidates, so multi-byte characters never cause a gram/verify mismatch.

use smallvec::SmallVec;

/// Window width in bytes
pub const GRAM_LEN: usize = 3;

/// A packed 3-byte gram key
pub type Gram = u32;

/// Scratch list of a path's distinct grams; most paths fit inline
pub type GramSet = SmallVec<[Gram; 64]>;

/// Lowercase a path for indexing and matching. Unicode-aware, so `README`
/// and `réSUMÉ` both match their lowercase spellings.
pub fn normalize(path: &str) -> String {
	path.to_lowercase()
}

#[inline]
pub fn pack(window: &[u8]) -> Gram {
	debug_assert_eq!(window.len(), GRAM_LEN);
	(window[0] as u32) << 16 | (window[1] as u32) << 8 | window[2] as u32
}

#[inline]
pub fn unpack(gram: Gram) -> [u8; GRAM_LEN] {
	[(gram >> 16) as u8, (gram >> 8) as u8, gram as u8]
}

/// Distinct grams of an already-normalized string, sorted ascending.
pub fn grams_of(normalized: &str) -> GramSet {
	let bytes = normalized.as_bytes();
	let mut grams: GramSet = bytes.windows(GRAM_LEN).map(pack).collect();
	grams.sort_unstable();
	grams.dedup();
	grams
}
