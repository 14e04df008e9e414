//! Run archive: a numpy-compatible `.npz` container holding the channel
//! header, the sample table and both event tables.

use super::npy::{self, NpyError};
use crate::signal::{
    EventRecord, FrameError, SampleBuffer, MAX_EXTENSION_EVENT_LEN, MAX_SERIAL_EVENT_LEN,
};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const CHANNEL_HEADER: &str = "channelHeader";
pub const BIO_DATA: &str = "bioData";
pub const SERIAL_EVENTS: &str = "serialEventData";
pub const EXTENSION_EVENTS: &str = "extensionEventData";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive container error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("array '{name}': {source}")]
    Array {
        name: &'static str,
        #[source]
        source: NpyError,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("channel header names {header} channels but bioData has {table}")]
    ChannelCount { header: usize, table: usize },
}

/// Everything a run persists besides its metadata document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArchive {
    pub channel_header: Vec<String>,
    pub samples: SampleBuffer,
    pub serial_events: Vec<EventRecord>,
    pub extension_events: Vec<EventRecord>,
}

fn array_err(name: &'static str) -> impl Fn(NpyError) -> ArchiveError {
    move |source| ArchiveError::Array { name, source }
}

pub fn write_archive(path: &Path, archive: &RunArchive) -> Result<(), ArchiveError> {
    let samples = &archive.samples;
    let arrays = [
        (CHANNEL_HEADER, npy::encode_strings(&archive.channel_header)),
        (
            BIO_DATA,
            npy::encode_u16_table(samples.len(), samples.channels(), samples.as_slice()),
        ),
        (
            SERIAL_EVENTS,
            npy::encode_events(&archive.serial_events, MAX_SERIAL_EVENT_LEN)
                .map_err(array_err(SERIAL_EVENTS))?,
        ),
        (
            EXTENSION_EVENTS,
            npy::encode_events(&archive.extension_events, MAX_EXTENSION_EVENT_LEN)
                .map_err(array_err(EXTENSION_EVENTS))?,
        ),
    ];

    let file = File::create(path)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in &arrays {
        zip.start_file(format!("{}.npy", name), options)?;
        zip.write_all(bytes)?;
    }
    let writer = zip.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn read_member<R: Read + std::io::Seek>(
    zip: &mut ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, ArchiveError> {
    let mut member = zip.by_name(&format!("{}.npy", name))?;
    let mut bytes = Vec::with_capacity(member.size() as usize);
    member.read_to_end(&mut bytes)?;
    Ok(bytes)
}

pub fn read_archive(path: &Path) -> Result<RunArchive, ArchiveError> {
    let mut zip = ZipArchive::new(File::open(path)?)?;

    let channel_header = npy::decode_strings(&read_member(&mut zip, CHANNEL_HEADER)?)
        .map_err(array_err(CHANNEL_HEADER))?;
    let (_, channels, values) = npy::decode_u16_table(&read_member(&mut zip, BIO_DATA)?)
        .map_err(array_err(BIO_DATA))?;
    if channels != channel_header.len() {
        return Err(ArchiveError::ChannelCount {
            header: channel_header.len(),
            table: channels,
        });
    }
    let samples = SampleBuffer::from_rows(channels, values)?;
    let (serial_events, _) = npy::decode_events(&read_member(&mut zip, SERIAL_EVENTS)?)
        .map_err(array_err(SERIAL_EVENTS))?;
    let (extension_events, _) = npy::decode_events(&read_member(&mut zip, EXTENSION_EVENTS)?)
        .map_err(array_err(EXTENSION_EVENTS))?;

    Ok(RunArchive {
        channel_header,
        samples,
        serial_events,
        extension_events,
    })
}
