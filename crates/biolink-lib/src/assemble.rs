//! Reassembly of delimited text events from a byte stream that may arrive in
//! arbitrary pieces.

use crate::signal::truncate_event_text;
use log::debug;

/// Carry-over is capped at this many times the longest possible event.
pub const CARRY_OVER_FACTOR: usize = 4;

/// Accumulates received bytes and cuts `<start><text><terminator>` events out
/// of them. Text without a terminator yet is carried over to the next push;
/// past [`EventAssembler::carry_over_limit`] its oldest bytes are dropped.
#[derive(Debug, Clone)]
pub struct EventAssembler {
    start: Option<Vec<u8>>,
    terminator: Vec<u8>,
    max_len: usize,
    pending: Vec<u8>,
}

impl EventAssembler {
    pub fn new(start: Option<&str>, terminator: &str, max_len: usize) -> Self {
        let terminator = if terminator.is_empty() {
            b"\n".to_vec()
        } else {
            terminator.as_bytes().to_vec()
        };
        Self {
            start: start.filter(|s| !s.is_empty()).map(|s| s.as_bytes().to_vec()),
            terminator,
            max_len,
            pending: Vec::new(),
        }
    }

    /// Newline terminated events without a start marker.
    pub fn lines(max_len: usize) -> Self {
        Self::new(None, "\n", max_len)
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete event, if the carried-over bytes contain one.
    pub fn next_event(&mut self) -> Option<String> {
        let (text_start, marker_len) = match &self.start {
            Some(marker) => (find(&self.pending, marker, 0)?, marker.len()),
            None => (0, 0),
        };
        let body = text_start + marker_len;
        let end = find(&self.pending, &self.terminator, body)?;
        let text = String::from_utf8_lossy(&self.pending[body..end]).into_owned();
        self.pending.drain(..end + self.terminator.len());
        Some(truncate_event_text(&text, self.max_len))
    }

    /// Push `bytes` and collect every event that became complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.push(bytes);
        let mut events = Vec::new();
        while let Some(event) = self.next_event() {
            events.push(event);
        }
        self.cap_carry_over();
        events
    }

    pub fn carry_over_limit(&self) -> usize {
        let marker = self.start.as_ref().map_or(0, Vec::len);
        CARRY_OVER_FACTOR * (self.max_len + marker + self.terminator.len())
    }

    fn cap_carry_over(&mut self) {
        let limit = self.carry_over_limit();
        if self.pending.len() > limit {
            let excess = self.pending.len() - limit;
            debug!("no terminator within {} bytes, dropped {} oldest bytes", limit, excess);
            self.pending.drain(..excess);
        }
    }

    /// Drop partial text, e.g. after the line was lost.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}
