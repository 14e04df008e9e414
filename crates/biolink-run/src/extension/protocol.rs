//! Newline-delimited JSON messages between the frontend and a worker process.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message '{line}': {source}")]
    Malformed {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("pipe failed: {0}")]
    Io(#[from] io::Error),
    #[error("pipe closed")]
    Closed,
    #[error("unexpected message: {0}")]
    Unexpected(String),
    #[error("no reply to request {0}")]
    NoReply(u64),
}

/// Run facts handed to the worker once, at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConstants {
    pub extension_name: String,
    pub subject_id: String,
    pub experiment_id: String,
    pub log_dir: PathBuf,
    /// Run file path without suffix or extension.
    pub file_base: PathBuf,
    pub start_time: String,
    pub channel_header: Vec<String>,
    pub sample_rate: u32,
    pub no_log: bool,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToWorker {
    Start { constants: ExperimentConstants },
    Reply { seq: u64, value: i64 },
    BioData { frame: u64, values: Vec<u16> },
    EndRequested,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FromWorker {
    /// Reply carries the resolved frame, or -1 when the event was dropped.
    Emit {
        seq: u64,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frame: Option<i64>,
    },
    /// Reply carries the frame counter.
    CurrentFrame { seq: u64 },
    RequestBioData { on: bool },
    Console { text: String },
    Finished,
}

pub fn write_message<W: Write + ?Sized, M: Serialize>(
    writer: &mut W,
    message: &M,
) -> Result<(), ProtocolError> {
    let serialized = serde_json::to_string(message)?;
    writer.write_all(serialized.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

pub struct MessageReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: Read> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Next message; `Ok(None)` once the pipe is closed. A malformed line is
    /// consumed and reported, so the caller may keep reading.
    pub fn next_message<M: DeserializeOwned>(&mut self) -> Result<Option<M>, ProtocolError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .map(Some)
                .map_err(|source| ProtocolError::Malformed {
                    line: trimmed.to_string(),
                    source,
                });
        }
    }
}
