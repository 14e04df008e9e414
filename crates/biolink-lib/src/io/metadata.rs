use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const SCHEMA_VERSION: u32 = 1;

/// Sibling JSON document describing one persisted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub schema_version: u32,
    pub software_version: String,
    pub date_str: String,
    /// ISO 8601 start of acquisition, local time with offset.
    pub start_time: String,
    pub experiment_id: String,
    pub subject_id: String,
    pub fs: u32,
    pub frame_cnt: u64,
    pub duration_sec: f64,
    pub channels: Vec<String>,
    pub device: String,
    pub extension: String,
}

impl RunMetadata {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        software_version: &str,
        started: DateTime<Local>,
        experiment_id: &str,
        subject_id: &str,
        fs: u32,
        frame_cnt: u64,
        channels: &[String],
        device: &str,
        extension: &str,
    ) -> Self {
        let duration_sec = if fs == 0 {
            0.0
        } else {
            frame_cnt as f64 / fs as f64
        };
        Self {
            schema_version: SCHEMA_VERSION,
            software_version: software_version.to_string(),
            date_str: started.format("%Y-%m-%d %H:%M:%S").to_string(),
            start_time: started.to_rfc3339(),
            experiment_id: experiment_id.to_string(),
            subject_id: subject_id.to_string(),
            fs,
            frame_cnt,
            duration_sec,
            channels: channels.to_vec(),
            device: device.to_string(),
            extension: extension.to_string(),
        }
    }

    /// `(label, value)` pairs in document order, for commented text headers.
    pub fn header_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("schema_version", self.schema_version.to_string()),
            ("software_version", self.software_version.clone()),
            ("date", self.date_str.clone()),
            ("start_time", self.start_time.clone()),
            ("experiment_id", self.experiment_id.clone()),
            ("subject_id", self.subject_id.clone()),
            ("fs", self.fs.to_string()),
            ("frame_cnt", self.frame_cnt.to_string()),
            ("duration_sec", format!("{:.3}", self.duration_sec)),
            ("channels", self.channels.join(",")),
            ("device", self.device.clone()),
            ("extension", self.extension.clone()),
        ]
    }
}

pub fn write_metadata(path: &Path, metadata: &RunMetadata) -> Result<()> {
    let file = fs::File::create(path)
        .with_context(|| format!("creating metadata {}", path.display()))?;
    serde_json::to_writer_pretty(&file, metadata)?;
    file.sync_all()?;
    Ok(())
}

pub fn read_metadata(path: &Path) -> Result<RunMetadata> {
    let file =
        fs::File::open(path).with_context(|| format!("opening metadata {}", path.display()))?;
    let metadata = serde_json::from_reader::<_, RunMetadata>(file)
        .with_context(|| format!("parsing metadata {}", path.display()))?;
    Ok(metadata)
}
