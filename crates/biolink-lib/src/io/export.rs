//! Plain-text rendition of a persisted run: one tab-delimited row per frame.

use super::archive::RunArchive;
use super::metadata::RunMetadata;
use crate::signal::{sort_events_by_frame, EventRecord};
use anyhow::{Context, Result};
use csv::{QuoteStyle, WriterBuilder};
use log::warn;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

const NO_EVENT: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportSummary {
    pub rows: usize,
    /// Events attributed to frames past the last recorded sample.
    pub orphaned_events: usize,
}

fn cell(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Walks a frame-sorted event list alongside the rows.
struct EventCursor<'a> {
    events: &'a [EventRecord],
    next: usize,
}

impl<'a> EventCursor<'a> {
    fn new(events: &'a [EventRecord]) -> Self {
        Self { events, next: 0 }
    }

    fn column_for(&mut self, frame: u64) -> String {
        let mut texts = Vec::new();
        while let Some(event) = self.events.get(self.next) {
            if event.frame != frame {
                break;
            }
            texts.push(cell(&event.text));
            self.next += 1;
        }
        if texts.is_empty() {
            NO_EVENT.to_string()
        } else {
            texts.join(";")
        }
    }

    fn remaining(&self) -> &'a [EventRecord] {
        &self.events[self.next..]
    }
}

pub fn export_txt(path: &Path, run: &RunArchive, metadata: &RunMetadata) -> Result<ExportSummary> {
    let file =
        fs::File::create(path).with_context(|| format!("creating export {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for (label, value) in metadata.header_fields() {
        writeln!(out, "# {}: {}", label, value)?;
    }
    let mut columns = vec!["frame".to_string()];
    columns.extend(run.channel_header.iter().cloned());
    columns.push("serial_events".into());
    columns.push("extension_events".into());
    writeln!(out, "# Columns: {}", columns.join("\t"))?;

    let mut serial = run.serial_events.clone();
    let mut extension = run.extension_events.clone();
    sort_events_by_frame(&mut serial);
    sort_events_by_frame(&mut extension);
    let mut serial_cursor = EventCursor::new(&serial);
    let mut extension_cursor = EventCursor::new(&extension);

    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(QuoteStyle::Never)
        .has_headers(false)
        .flexible(true)
        .from_writer(out);
    let mut rows = 0;
    for (frame, values) in run.samples.rows().enumerate() {
        let frame = frame as u64;
        let mut record = Vec::with_capacity(values.len() + 3);
        record.push(frame.to_string());
        record.extend(values.iter().map(|v| v.to_string()));
        record.push(serial_cursor.column_for(frame));
        record.push(extension_cursor.column_for(frame));
        writer.write_record(&record)?;
        rows += 1;
    }
    writer.flush()?;

    let orphaned: Vec<&EventRecord> = serial_cursor
        .remaining()
        .iter()
        .chain(extension_cursor.remaining())
        .collect();
    for event in &orphaned {
        warn!(
            "event '{}' at frame {} lies after the last sample (frame count {})",
            event.text,
            event.frame,
            run.samples.len()
        );
    }
    Ok(ExportSummary {
        rows,
        orphaned_events: orphaned.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{EventSource, SampleBuffer};
    use chrono::Local;
    use tempfile::tempdir;

    fn run() -> RunArchive {
        let samples = SampleBuffer::from_rows(2, vec![10, 20, 11, 21, 12, 22]).unwrap();
        RunArchive {
            channel_header: vec!["ecg".into(), "eda".into()],
            samples,
            serial_events: vec![
                EventRecord::new(0, "s", EventSource::Serial),
                EventRecord::new(0, "k", EventSource::Serial),
            ],
            extension_events: vec![
                EventRecord::new(2, "trial end", EventSource::Extension),
                EventRecord::new(1, "trial start", EventSource::Extension),
                EventRecord::new(7, "late", EventSource::Extension),
            ],
        }
    }

    #[test]
    fn writes_header_and_one_row_per_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.txt");
        let run = run();
        let meta = RunMetadata::new(
            "0.2.0",
            Local::now(),
            "exp",
            "s01",
            1000,
            3,
            &run.channel_header,
            "synthetic",
            "None",
        );
        let summary = export_txt(&path, &run, &meta).unwrap();
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.orphaned_events, 1);

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines.contains(&"# subject_id: s01"));
        assert!(lines.contains(&"# Columns: frame\tecg\teda\tserial_events\textension_events"));
        let rows: Vec<&str> = lines.into_iter().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(
            rows,
            vec![
                "0\t10\t20\ts;k\t-",
                "1\t11\t21\t-\ttrial_start",
                "2\t12\t22\t-\ttrial_end",
            ]
        );
    }
}
