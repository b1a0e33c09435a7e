//! qseek command line

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use qseek_core::index::SnapshotReader;
use qseek_core::orchestrator::{MultiDriveOrchestrator, ScanStatus};
use qseek_core::updater::checkpoint;
use qseek_core::{CoreConfig, CoreEvent, DriveLetter, EventBus, SearchCore, SearchHit};

#[derive(Parser)]
#[command(name = "qseek", version, about = "Instant filename search for NTFS volumes")]
struct Cli {
	/// Directory for index artifacts and configuration
	#[arg(long, env = "QSEEK_DATA_DIR")]
	data_dir: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Fully scan volumes and persist their indexes
	Scan {
		/// Drives to scan, e.g. `C D:`; defaults to every NTFS volume
		drives: Vec<String>,
	},
	/// Search the persisted indexes
	Query {
		text: String,
		/// Result cap (defaults to the configured maximum)
		#[arg(short = 'n', long)]
		max: Option<usize>,
	},
	/// Bring volumes online and keep their indexes live until interrupted
	Watch,
	/// Show indexed volumes and their snapshot state
	Status,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let cli = Cli::parse();
	let data_dir = cli
		.data_dir
		.or_else(|| dirs::data_local_dir().map(|dir| dir.join("qseek")))
		.context("no data directory available; pass --data-dir")?;
	let config = CoreConfig::load_or_create(&data_dir)?;

	match cli.command {
		Command::Scan { drives } => scan(config, drives).await,
		Command::Query { text, max } => query(&config, &text, max),
		Command::Watch => watch(config).await,
		Command::Status => status(&config),
	}
}

async fn scan(config: CoreConfig, drives: Vec<String>) -> Result<()> {
	if !SearchCore::has_required_privilege() {
		bail!("scanning reads raw volume handles; run elevated (administrator) and retry");
	}

	let events = Arc::new(EventBus::default());
	let orchestrator = MultiDriveOrchestrator::new(Arc::new(config), events.clone());

	let mut volumes = orchestrator.discover();
	if !drives.is_empty() {
		let requested = parse_drives(&drives)?;
		volumes.retain(|volume| requested.contains(&volume.drive));
		for drive in &requested {
			if !volumes.iter().any(|volume| volume.drive == *drive) {
				bail!("{drive} is not an indexable NTFS volume");
			}
		}
	}
	if volumes.is_empty() {
		bail!("no indexable NTFS volumes found");
	}

	let printer = tokio::spawn(print_events(events.subscribe()));
	let outcomes = orchestrator.scan_all(volumes, &CancellationToken::new()).await;
	drop(printer);

	let mut failed = 0;
	for outcome in outcomes {
		match outcome.status {
			ScanStatus::Completed(finished) => println!(
				"{}  {} records indexed (generation {})",
				outcome.drive, finished.records_scanned, finished.manifest.generation
			),
			ScanStatus::Cancelled => println!("{}  cancelled", outcome.drive),
			ScanStatus::Failed(err) => {
				failed += 1;
				eprintln!("{}  failed: {err}", outcome.drive);
			}
		}
	}
	if failed > 0 {
		bail!("{failed} volume(s) failed to scan");
	}
	Ok(())
}

fn query(config: &CoreConfig, text: &str, max: Option<usize>) -> Result<()> {
	let max = max.unwrap_or(config.max_results);
	let mut hits: Vec<SearchHit> = Vec::new();

	for dir in volume_dirs(&config.data_dir)? {
		if hits.len() >= max {
			break;
		}
		match SnapshotReader::load(&dir) {
			Ok(Some(reader)) => {
				hits.extend(qseek_core::search(&reader, text, max - hits.len()));
			}
			Ok(None) => {}
			Err(err) => eprintln!("warning: {}: {err}", dir.display()),
		}
	}

	for hit in &hits {
		println!("{}", hit.path);
	}
	if hits.is_empty() {
		eprintln!("no matches");
	}
	Ok(())
}

async fn watch(config: CoreConfig) -> Result<()> {
	if !SearchCore::has_required_privilege() {
		bail!("watching reads raw volume handles; run elevated (administrator) and retry");
	}

	let core = SearchCore::new(config);
	let printer = tokio::spawn(print_events(core.events().subscribe()));
	core.initialize().await?;
	println!("watching {:?}; press Ctrl-C to stop", core.watched_drives());

	tokio::signal::ctrl_c().await?;
	println!("shutting down");
	core.shutdown().await;
	drop(printer);
	Ok(())
}

fn status(config: &CoreConfig) -> Result<()> {
	let mut any = false;
	for dir in volume_dirs(&config.data_dir)? {
		match SnapshotReader::load(&dir) {
			Ok(Some(reader)) => {
				any = true;
				let manifest = reader.manifest();
				let cursor = checkpoint::load(&dir)?
					.map(|record| record.last_applied_usn.to_string())
					.unwrap_or_else(|| "-".into());
				println!(
					"{}  generation {}  files {}  grams {}  checkpoint {}",
					manifest.drive, manifest.generation, manifest.file_count, manifest.gram_count, cursor
				);
			}
			Ok(None) => {}
			Err(err) => {
				any = true;
				println!("{}  unreadable: {err}", dir.display());
			}
		}
	}
	if !any {
		println!("no indexes in {}; run `qseek scan` first", config.data_dir.display());
	}
	Ok(())
}

/// Per-volume artifact directories under the data dir (single-letter names).
fn volume_dirs(data_dir: &Path) -> Result<Vec<PathBuf>> {
	let mut dirs = Vec::new();
	let entries = match std::fs::read_dir(data_dir) {
		Ok(entries) => entries,
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
		Err(err) => return Err(err.into()),
	};
	for entry in entries {
		let entry = entry?;
		let name = entry.file_name();
		let is_drive = name
			.to_str()
			.map(|name| name.len() == 1 && name.chars().all(|c| c.is_ascii_alphabetic()))
			.unwrap_or(false);
		if is_drive && entry.file_type()?.is_dir() {
			dirs.push(entry.path());
		}
	}
	dirs.sort();
	Ok(dirs)
}

fn parse_drives(raw: &[String]) -> Result<Vec<DriveLetter>> {
	raw.iter()
		.map(|spelling| {
			spelling
				.parse::<DriveLetter>()
				.map_err(|err| anyhow::anyhow!(err))
		})
		.collect()
}

async fn print_events(mut receiver: tokio::sync::broadcast::Receiver<CoreEvent>) {
	loop {
		let event = match receiver.recv().await {
			Ok(event) => event,
			// Dropped events only cost progress lines
			Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
			Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
		};
		match event {
			CoreEvent::ScanStarted { drive } => println!("{drive}  scan started"),
			CoreEvent::ScanProgress {
				drive,
				phase,
				records_scanned,
			} => println!("{drive}  {phase}: {records_scanned} records"),
			CoreEvent::ScanCompleted {
				drive, file_count, ..
			} => println!("{drive}  scan complete: {file_count} files"),
			CoreEvent::ScanFailed { drive, error } => eprintln!("{drive}  scan failed: {error}"),
			CoreEvent::IndexUpdated {
				drive,
				applied,
				last_usn,
			} => println!("{drive}  applied {applied} change(s), cursor {last_usn}"),
			CoreEvent::JournalWrapped { drive } => {
				eprintln!("{drive}  journal wrapped; rebuilding index")
			}
		}
	}
}
