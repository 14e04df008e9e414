use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest serial event text kept, in bytes (fixed archive column width).
pub const MAX_SERIAL_EVENT_LEN: usize = 16;
/// Longest extension event text kept, in bytes (fixed archive column width).
pub const MAX_EXTENSION_EVENT_LEN: usize = 32;
/// Frame index an extension uses to request the end of the run.
pub const END_OF_RUN_FRAME: i64 = -1;
/// Resolution of every sample value.
pub const BITS_RESOLUTION: u8 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame gap: expected frame {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
    #[error("sample carries {got} values, expected {expected} channels")]
    ChannelMismatch { expected: usize, got: usize },
    #[error("frame {frame} exceeds buffer capacity of {capacity} frames")]
    Capacity { frame: u64, capacity: usize },
}

/// Where an event entered the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    Serial,
    Extension,
}

impl EventSource {
    pub fn max_len(&self) -> usize {
        match self {
            EventSource::Serial => MAX_SERIAL_EVENT_LEN,
            EventSource::Extension => MAX_EXTENSION_EVENT_LEN,
        }
    }
}

/// Cut `text` to at most `max_len` bytes without splitting a character.
pub fn truncate_event_text(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// A text event attributed to one frame of the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub frame: u64,
    pub text: String,
}

impl EventRecord {
    /// Build a record, truncating the text to the column width of `source`.
    pub fn new(frame: u64, text: &str, source: EventSource) -> Self {
        Self {
            frame,
            text: truncate_event_text(text, source.max_len()),
        }
    }
}

/// Stable sort by frame index; events sharing a frame keep their arrival order.
pub fn sort_events_by_frame(events: &mut [EventRecord]) {
    events.sort_by_key(|event| event.frame);
}

/// Checks that frame indices arrive as 0, 1, 2, ... without gaps.
#[derive(Debug, Default, Clone)]
pub struct FrameClock {
    next: u64,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, frame: u64) -> Result<(), FrameError> {
        if frame != self.next {
            return Err(FrameError::Gap {
                expected: self.next,
                got: frame,
            });
        }
        self.next += 1;
        Ok(())
    }

    /// Number of frames accepted so far.
    pub fn count(&self) -> u64 {
        self.next
    }
}

/// Preallocated frames x channels table of raw sample values.
///
/// Rows are written in place by frame index; `truncate` drops the unused
/// tail once the run has ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuffer {
    channels: usize,
    capacity: usize,
    len: usize,
    data: Vec<u16>,
}

impl SampleBuffer {
    pub fn with_capacity(capacity: usize, channels: usize) -> Self {
        Self {
            channels,
            capacity,
            len: 0,
            data: vec![0; capacity * channels],
        }
    }

    /// Build a buffer that is already full, e.g. when reading an archive.
    pub fn from_rows(channels: usize, data: Vec<u16>) -> Result<Self, FrameError> {
        if channels == 0 || data.len() % channels != 0 {
            return Err(FrameError::ChannelMismatch {
                expected: channels,
                got: data.len(),
            });
        }
        let frames = data.len() / channels;
        Ok(Self {
            channels,
            capacity: frames,
            len: frames,
            data,
        })
    }

    pub fn write(&mut self, frame: u64, values: &[u16]) -> Result<(), FrameError> {
        if values.len() != self.channels {
            return Err(FrameError::ChannelMismatch {
                expected: self.channels,
                got: values.len(),
            });
        }
        let row = frame as usize;
        if row >= self.capacity {
            return Err(FrameError::Capacity {
                frame,
                capacity: self.capacity,
            });
        }
        let start = row * self.channels;
        self.data[start..start + self.channels].copy_from_slice(values);
        self.len = self.len.max(row + 1);
        Ok(())
    }

    pub fn row(&self, frame: usize) -> Option<&[u16]> {
        if frame >= self.len {
            return None;
        }
        let start = frame * self.channels;
        Some(&self.data[start..start + self.channels])
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u16]> {
        self.data[..self.len * self.channels].chunks(self.channels.max(1))
    }

    /// Release everything past the last recorded frame.
    pub fn truncate(&mut self) {
        self.data.truncate(self.len * self.channels);
        self.data.shrink_to_fit();
        self.capacity = self.len;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Recorded values in row-major order.
    pub fn as_slice(&self) -> &[u16] {
        &self.data[..self.len * self.channels]
    }
}
