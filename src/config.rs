//! Engine configuration

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CoreError, Result};

const CONFIG_FILE: &str = "qseek.json";
const CURRENT_VERSION: u32 = 1;

/// Tunables for scanning, indexing and watching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
	/// Config schema version
	pub version: u32,

	/// Directory holding per-volume index artifacts and this file
	pub data_dir: PathBuf,

	/// Records buffered before a streaming flush
	#[serde(default = "default_batch_size")]
	pub batch_size: usize,

	/// Buffered name bytes that force a flush before `batch_size` is reached
	#[serde(default = "default_max_buffered_bytes")]
	pub max_buffered_bytes: usize,

	/// Concurrent scans across solid-state volumes
	#[serde(default = "default_max_parallel_scans")]
	pub max_parallel_scans: usize,

	/// Entries kept in each volume's directory-path LRU
	#[serde(default = "default_path_cache_capacity")]
	pub path_cache_capacity: usize,

	/// Result cap applied to queries
	#[serde(default = "default_max_results")]
	pub max_results: usize,

	/// Drive letters never scanned or watched
	#[serde(default)]
	pub excluded_drives: Vec<char>,
}

fn default_batch_size() -> usize {
	10_000
}

fn default_max_buffered_bytes() -> usize {
	8 * 1024 * 1024
}

fn default_max_parallel_scans() -> usize {
	4
}

fn default_path_cache_capacity() -> usize {
	16_384
}

fn default_max_results() -> usize {
	100
}

impl CoreConfig {
	/// Load the config from `data_dir`, creating the default one on first
	/// run. An older on-disk version is upgraded in place: unknown fields
	/// take their defaults and the bumped file is saved back.
	pub fn load_or_create(data_dir: &Path) -> Result<Self> {
		let path = data_dir.join(CONFIG_FILE);
		if path.exists() {
			let raw = fs::read_to_string(&path)?;
			let mut config: CoreConfig = serde_json::from_str(&raw)
				.map_err(|err| CoreError::Config(format!("{}: {err}", path.display())))?;
			config.data_dir = data_dir.to_path_buf();
			if config.version < CURRENT_VERSION {
				info!(
					from = config.version,
					to = CURRENT_VERSION,
					"upgrading config schema"
				);
				config.version = CURRENT_VERSION;
				config.save()?;
			}
			config.validate()?;
			Ok(config)
		} else {
			warn!("no config at {}, creating defaults", path.display());
			let config = Self::default_with_dir(data_dir.to_path_buf());
			config.save()?;
			Ok(config)
		}
	}

	pub fn default_with_dir(data_dir: PathBuf) -> Self {
		Self {
			version: CURRENT_VERSION,
			data_dir,
			batch_size: default_batch_size(),
			max_buffered_bytes: default_max_buffered_bytes(),
			max_parallel_scans: default_max_parallel_scans(),
			path_cache_capacity: default_path_cache_capacity(),
			max_results: default_max_results(),
			excluded_drives: Vec::new(),
		}
	}

	pub fn save(&self) -> Result<()> {
		fs::create_dir_all(&self.data_dir)?;
		let path = self.data_dir.join(CONFIG_FILE);
		fs::write(&path, serde_json::to_vec_pretty(self)?)?;
		Ok(())
	}

	/// Directory holding one volume's artifacts, e.g. `<data_dir>/C`
	pub fn volume_dir(&self, drive: crate::volume::DriveLetter) -> PathBuf {
		self.data_dir.join(drive.as_char().to_string())
	}

	fn validate(&self) -> Result<()> {
		if self.batch_size == 0 || self.max_parallel_scans == 0 {
			return Err(CoreError::Config(
				"batch_size and max_parallel_scans must be positive".into(),
			));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_run_creates_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let config = CoreConfig::load_or_create(dir.path()).unwrap();
		assert_eq!(config.version, CURRENT_VERSION);
		assert_eq!(config.batch_size, 10_000);
		assert!(dir.path().join(CONFIG_FILE).exists());
	}

	#[test]
	fn reload_round_trips_custom_values() {
		let dir = tempfile::tempdir().unwrap();
		let mut config = CoreConfig::load_or_create(dir.path()).unwrap();
		config.max_parallel_scans = 2;
		config.excluded_drives = vec!['X'];
		config.save().unwrap();

		let reloaded = CoreConfig::load_or_create(dir.path()).unwrap();
		assert_eq!(reloaded.max_parallel_scans, 2);
		assert_eq!(reloaded.excluded_drives, vec!['X']);
	}

	#[test]
	fn older_version_is_upgraded_with_defaults() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(
			dir.path().join(CONFIG_FILE),
			format!(r#"{{"version":0,"data_dir":{:?}}}"#, dir.path()),
		)
		.unwrap();

		let config = CoreConfig::load_or_create(dir.path()).unwrap();
		assert_eq!(config.version, CURRENT_VERSION);
		assert_eq!(config.max_results, 100);
	}

	#[test]
	fn garbage_config_is_a_config_error() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join(CONFIG_FILE), b"]]").unwrap();
		assert!(matches!(
			CoreConfig::load_or_create(dir.path()),
			Err(CoreError::Config(_))
		));
	}
}
