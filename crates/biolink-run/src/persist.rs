//! Persistence writer: turns what a run recorded into the archive and its
//! metadata document.

use biolink_lib::io::archive::{write_archive, ArchiveError, RunArchive};
use biolink_lib::io::metadata::{write_metadata, RunMetadata};
use biolink_lib::io::run_file;
use biolink_lib::signal::{sort_events_by_frame, EventRecord, SampleBuffer};
use chrono::{DateTime, Local};
use log::{error, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Subject id that records without writing anything.
pub const NOLOG_SUBJECT: &str = "nolog";
/// Name suffix of files written by a forced finalize.
pub const FORCED_SUFFIX: &str = "_forcedsave";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("creating log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writing archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: ArchiveError,
    },
    #[error("writing metadata {path}: {reason}")]
    Metadata { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Written { archive: PathBuf, metadata: PathBuf },
    /// Do-not-persist run; nothing was written.
    Skipped,
    /// The write failed; the run's data is lost.
    Failed(String),
}

/// `<log_dir>/<experiment>_<subject>_<YYYYmmdd_HHMM>`, without suffix.
pub fn file_base(
    log_dir: &Path,
    experiment_id: &str,
    subject_id: &str,
    started: DateTime<Local>,
) -> PathBuf {
    log_dir.join(format!(
        "{}_{}_{}",
        experiment_id,
        subject_id,
        started.format("%Y%m%d_%H%M")
    ))
}

pub fn is_no_log(subject_id: &str) -> bool {
    subject_id == NOLOG_SUBJECT
}

/// Truncate the buffer to what was recorded and put extension events into
/// frame order. Serial events arrive in frame order already.
pub fn seal_recording(
    channel_header: Vec<String>,
    mut samples: SampleBuffer,
    serial_events: Vec<EventRecord>,
    mut extension_events: Vec<EventRecord>,
) -> RunArchive {
    samples.truncate();
    sort_events_by_frame(&mut extension_events);
    RunArchive {
        channel_header,
        samples,
        serial_events,
        extension_events,
    }
}

/// Write `<base><suffix>.npz` and `<base><suffix>.json`.
pub fn write_run(
    base: &Path,
    suffix: &str,
    run: &RunArchive,
    metadata: &RunMetadata,
) -> Result<(PathBuf, PathBuf), PersistenceError> {
    if let Some(dir) = base.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|source| PersistenceError::LogDir {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let archive = run_file(base, suffix, "npz");
    write_archive(&archive, run).map_err(|source| PersistenceError::Archive {
        path: archive.clone(),
        source,
    })?;
    let meta = run_file(base, suffix, "json");
    write_metadata(&meta, metadata).map_err(|err| PersistenceError::Metadata {
        path: meta.clone(),
        reason: format!("{:#}", err),
    })?;
    Ok((archive, meta))
}

/// Persist unless the run is do-not-persist. A failure is logged and
/// reported in the outcome, never raised.
pub fn persist(
    base: &Path,
    suffix: &str,
    no_log: bool,
    run: &RunArchive,
    metadata: &RunMetadata,
) -> PersistOutcome {
    if no_log {
        info!(
            "no-log run: {} frames kept in memory only",
            run.samples.len()
        );
        return PersistOutcome::Skipped;
    }
    match write_run(base, suffix, run, metadata) {
        Ok((archive, metadata)) => {
            info!(
                "saved {} frames, {} serial and {} extension events to {}",
                run.samples.len(),
                run.serial_events.len(),
                run.extension_events.len(),
                archive.display()
            );
            PersistOutcome::Written { archive, metadata }
        }
        Err(err) => {
            error!("run data lost: {}", err);
            PersistOutcome::Failed(err.to_string())
        }
    }
}
