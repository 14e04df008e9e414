//! Serial event channel: a line that may come and go, read in small
//! non-blocking chunks and cut into frame-tagged events.

use crate::queue::join_with_timeout;
use anyhow::{Context, Result};
use biolink_lib::assemble::EventAssembler;
use biolink_lib::signal::{EventRecord, EventSource, MAX_SERIAL_EVENT_LEN};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, info, warn};
use std::io::{self, Read};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Most bytes taken from the line per frame.
pub const SERIAL_READ_CHUNK: usize = 50;
pub const SUBJECT_ID_READ_CHUNK: usize = 20;
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
/// Longest wait for the reconnect loop at shutdown; a driver stuck in
/// `open` is left behind.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DISCONNECTED_EVENT: &str = "#noconn";
pub const RECONNECTED_EVENT: &str = "#reconn";
pub const SUBJECT_ID_MARKER: &str = "#ID:";

#[derive(Debug, Error)]
#[error("serial line {port}: {source}")]
pub struct SerialTransientError {
    pub port: String,
    #[source]
    pub source: io::Error,
}

pub trait SerialLine: Send {
    /// Bytes already received, at most `max_bytes`; never waits for more.
    fn read_available(&mut self, max_bytes: usize) -> io::Result<Vec<u8>>;

    fn close(&mut self) {}
}

/// Opens (and reopens) the line for the reconnect loop.
pub trait SerialOpener: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn SerialLine>>;

    fn describe(&self) -> String;
}

pub struct PortOpener {
    port: String,
    baud: u32,
}

impl PortOpener {
    pub fn new(port: &str, baud: u32) -> Self {
        Self {
            port: port.to_string(),
            baud,
        }
    }
}

impl SerialOpener for PortOpener {
    fn open(&self) -> io::Result<Box<dyn SerialLine>> {
        let port = tokio_serial::new(&self.port, self.baud)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(io::Error::from)?;
        Ok(Box::new(PortLine { port }))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port, self.baud)
    }
}

struct PortLine {
    port: Box<dyn tokio_serial::SerialPort>,
}

impl SerialLine for PortLine {
    fn read_available(&mut self, max_bytes: usize) -> io::Result<Vec<u8>> {
        let waiting = self.port.bytes_to_read().map_err(io::Error::from)? as usize;
        if waiting == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; waiting.min(max_bytes)];
        match self.port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}

/// Names of the serial ports present on this machine, sorted.
pub fn enumerate_ports() -> Result<Vec<String>> {
    let mut ports: Vec<String> = tokio_serial::available_ports()
        .context("listing serial ports")?
        .into_iter()
        .map(|info| info.port_name)
        .collect();
    ports.sort();
    Ok(ports)
}

/// Wait up to `timeout` for a `#ID:<id>\n` message on a freshly opened line.
pub fn receive_subject_id(opener: &dyn SerialOpener, timeout: Duration) -> Result<Option<String>> {
    let mut line = opener
        .open()
        .with_context(|| format!("opening serial line {}", opener.describe()))?;
    let mut assembler = EventAssembler::new(Some(SUBJECT_ID_MARKER), "\n", 64);
    let deadline = Instant::now() + timeout;
    let received = loop {
        let bytes = line
            .read_available(SUBJECT_ID_READ_CHUNK)
            .with_context(|| format!("reading serial line {}", opener.describe()))?;
        if let Some(id) = assembler
            .feed(&bytes)
            .into_iter()
            .map(|id| id.trim().to_string())
            .find(|id| !id.is_empty())
        {
            break Some(id);
        }
        if Instant::now() >= deadline {
            break None;
        }
        thread::sleep(Duration::from_millis(10));
    };
    line.close();
    Ok(received)
}

struct LineState {
    line: Option<Box<dyn SerialLine>>,
    assembler: EventAssembler,
    reopened: bool,
}

fn lock(state: &Mutex<LineState>) -> MutexGuard<'_, LineState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What one poll produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SerialPoll {
    pub events: Vec<EventRecord>,
    pub stop_requested: bool,
}

/// Line plus background reconnect loop. The line and its carry-over text
/// share one lock, so a reconnect never sees half-read state.
pub struct SerialChannel {
    state: Arc<Mutex<LineState>>,
    name: String,
    stop_token: String,
    stop_tx: Option<Sender<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl SerialChannel {
    pub fn start(opener: Arc<dyn SerialOpener>, stop_token: &str) -> Self {
        Self::start_with_interval(opener, stop_token, RECONNECT_INTERVAL)
    }

    pub fn start_with_interval(
        opener: Arc<dyn SerialOpener>,
        stop_token: &str,
        interval: Duration,
    ) -> Self {
        let line = match opener.open() {
            Ok(line) => {
                info!("serial line {} open", opener.describe());
                Some(line)
            }
            Err(err) => {
                warn!(
                    "serial line {} unavailable, retrying in the background: {}",
                    opener.describe(),
                    err
                );
                None
            }
        };
        let state = Arc::new(Mutex::new(LineState {
            line,
            assembler: EventAssembler::lines(MAX_SERIAL_EVENT_LEN),
            reopened: false,
        }));
        let name = opener.describe();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let loop_state = Arc::clone(&state);
        let reconnect = thread::Builder::new()
            .name("serial-reconnect".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                if lock(&loop_state).line.is_some() {
                    continue;
                }
                // open outside the lock so polling never waits on the driver
                match opener.open() {
                    Ok(mut line)
                        if matches!(stop_rx.try_recv(), Err(TryRecvError::Disconnected)) =>
                    {
                        line.close();
                        break;
                    }
                    Ok(line) => {
                        let mut state = lock(&loop_state);
                        state.assembler.reset();
                        state.line = Some(line);
                        state.reopened = true;
                        info!("serial line {} reconnected", opener.describe());
                    }
                    Err(err) => debug!("serial line {} still closed: {}", opener.describe(), err),
                }
            });
        let reconnect = match reconnect {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("serial reconnect loop not started: {}", err);
                None
            }
        };
        Self {
            state,
            name,
            stop_token: stop_token.to_string(),
            stop_tx: Some(stop_tx),
            reconnect,
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).line.is_some()
    }

    /// Read what the line has and attribute every completed event to `frame`.
    pub fn poll(&self, frame: u64) -> SerialPoll {
        let mut poll = SerialPoll::default();
        let mut state = lock(&self.state);
        if state.reopened {
            state.reopened = false;
            poll.events
                .push(EventRecord::new(frame, RECONNECTED_EVENT, EventSource::Serial));
        }
        let Some(line) = state.line.as_mut() else {
            return poll;
        };
        match line.read_available(SERIAL_READ_CHUNK) {
            Ok(bytes) if bytes.is_empty() => {}
            Ok(bytes) => {
                for text in state.assembler.feed(&bytes) {
                    if !self.stop_token.is_empty() && text == self.stop_token {
                        info!("serial stop token received at frame {}", frame);
                        poll.stop_requested = true;
                    }
                    poll.events
                        .push(EventRecord::new(frame, &text, EventSource::Serial));
                }
            }
            Err(source) => {
                let err = SerialTransientError {
                    port: self.name.clone(),
                    source,
                };
                warn!("{}; line closed at frame {}", err, frame);
                if let Some(mut line) = state.line.take() {
                    line.close();
                }
                state.assembler.reset();
                poll.events
                    .push(EventRecord::new(frame, DISCONNECTED_EVENT, EventSource::Serial));
            }
        }
        poll
    }

    /// Tell the reconnect loop to stop without waiting for it.
    pub fn signal_stop(&mut self) {
        self.stop_tx.take();
    }

    /// Stop the reconnect loop and close the line. Waits at most
    /// [`SHUTDOWN_TIMEOUT`] for the loop.
    pub fn shutdown(&mut self) {
        self.signal_stop();
        {
            let mut state = lock(&self.state);
            if let Some(mut line) = state.line.take() {
                line.close();
            }
            state.assembler.reset();
        }
        if let Some(handle) = self.reconnect.take() {
            join_with_timeout(handle, SHUTDOWN_TIMEOUT, "serial reconnect loop");
        }
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Line fed from a shared script; each read pops one chunk.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedLink {
        pub chunks: Arc<Mutex<VecDeque<io::Result<Vec<u8>>>>>,
        pub available: Arc<AtomicBool>,
        pub opens: Arc<AtomicUsize>,
    }

    impl ScriptedLink {
        pub fn new() -> Self {
            let link = Self::default();
            link.available.store(true, Ordering::SeqCst);
            link
        }

        pub fn push(&self, bytes: &[u8]) {
            self.chunks.lock().unwrap().push_back(Ok(bytes.to_vec()));
        }

        pub fn fail(&self) {
            self.chunks
                .lock()
                .unwrap()
                .push_back(Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")));
        }
    }

    struct ScriptedLine(ScriptedLink);

    impl SerialLine for ScriptedLine {
        fn read_available(&mut self, max_bytes: usize) -> io::Result<Vec<u8>> {
            let mut chunks = self.0.chunks.lock().unwrap();
            match chunks.pop_front() {
                Some(Ok(mut bytes)) => {
                    if bytes.len() > max_bytes {
                        let rest = bytes.split_off(max_bytes);
                        chunks.push_front(Ok(rest));
                    }
                    Ok(bytes)
                }
                Some(Err(err)) => Err(err),
                None => Ok(Vec::new()),
            }
        }
    }

    impl SerialOpener for ScriptedLink {
        fn open(&self) -> io::Result<Box<dyn SerialLine>> {
            if !self.available.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no device"));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedLine(self.clone())))
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    /// Opens once; every later open blocks in the "driver" for `hang`.
    #[derive(Clone)]
    pub(crate) struct HangingOpener {
        pub link: ScriptedLink,
        pub hang: Duration,
    }

    impl SerialOpener for HangingOpener {
        fn open(&self) -> io::Result<Box<dyn SerialLine>> {
            if self.link.opens.load(Ordering::SeqCst) > 0 {
                thread::sleep(self.hang);
            }
            self.link.open()
        }

        fn describe(&self) -> String {
            "hanging".into()
        }
    }

    fn texts(poll: &SerialPoll) -> Vec<(u64, &str)> {
        poll.events
            .iter()
            .map(|e| (e.frame, e.text.as_str()))
            .collect()
    }

    #[test]
    fn partial_chunks_become_events_on_the_completing_frame() {
        let link = ScriptedLink::new();
        let channel = SerialChannel::start(Arc::new(link.clone()), "#END");
        link.push(b"ab");
        link.push(b"c\n");
        link.push(b"de\n");
        assert!(channel.poll(0).events.is_empty());
        assert_eq!(texts(&channel.poll(1)), vec![(1, "abc")]);
        assert_eq!(texts(&channel.poll(2)), vec![(2, "de")]);
        assert!(channel.poll(3).events.is_empty());
    }

    #[test]
    fn reads_at_most_one_chunk_per_poll() {
        let link = ScriptedLink::new();
        let channel = SerialChannel::start(Arc::new(link.clone()), "#END");
        let mut long = vec![b'x'; 60];
        long.push(b'\n');
        link.push(&long);
        assert!(channel.poll(0).events.is_empty());
        let poll = channel.poll(1);
        assert_eq!(poll.events.len(), 1);
        assert_eq!(poll.events[0].text.len(), MAX_SERIAL_EVENT_LEN);
    }

    #[test]
    fn stop_token_requests_the_end_of_the_run() {
        let link = ScriptedLink::new();
        let channel = SerialChannel::start(Arc::new(link.clone()), "#END");
        link.push(b"k\n#END\n");
        let poll = channel.poll(7);
        assert!(poll.stop_requested);
        assert_eq!(texts(&poll), vec![(7, "k"), (7, "#END")]);
    }

    #[test]
    fn lost_line_is_reported_and_reopened() {
        let link = ScriptedLink::new();
        let channel = SerialChannel::start_with_interval(
            Arc::new(link.clone()),
            "#END",
            Duration::from_millis(20),
        );
        link.push(b"hal");
        link.fail();
        assert!(channel.poll(0).events.is_empty());
        assert_eq!(texts(&channel.poll(1)), vec![(1, DISCONNECTED_EVENT)]);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !channel.is_open() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(channel.is_open());
        assert_eq!(link.opens.load(Ordering::SeqCst), 2);
        // the partial "hal" was dropped with the old line
        link.push(b"lo\n");
        assert_eq!(
            texts(&channel.poll(2)),
            vec![(2, RECONNECTED_EVENT), (2, "lo")]
        );
    }

    #[test]
    fn unavailable_line_keeps_the_run_going() {
        let link = ScriptedLink::default();
        let mut channel = SerialChannel::start_with_interval(
            Arc::new(link.clone()),
            "#END",
            Duration::from_millis(10),
        );
        assert!(!channel.is_open());
        assert_eq!(channel.poll(0), SerialPoll::default());
        channel.shutdown();
        assert!(!channel.is_open());
    }

    #[test]
    fn shutdown_leaves_a_hanging_reopen_behind() {
        let link = ScriptedLink::new();
        let opener = HangingOpener {
            link: link.clone(),
            hang: Duration::from_secs(10),
        };
        let mut channel = SerialChannel::start_with_interval(
            Arc::new(opener),
            "#END",
            Duration::from_millis(10),
        );
        link.fail();
        assert_eq!(texts(&channel.poll(0)), vec![(0, DISCONNECTED_EVENT)]);
        // let the reconnect loop get stuck in the second open
        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        channel.shutdown();
        assert!(started.elapsed() < SHUTDOWN_TIMEOUT + Duration::from_secs(1));
        assert!(!channel.is_open());
        assert_eq!(link.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subject_id_arrives_after_noise() {
        let link = ScriptedLink::new();
        link.push(b"xx#ID:s0");
        link.push(b"42\n");
        let id = receive_subject_id(&link, Duration::from_secs(1)).unwrap();
        assert_eq!(id.as_deref(), Some("s042"));
    }

    #[test]
    fn subject_id_times_out_quietly() {
        let link = ScriptedLink::new();
        let id = receive_subject_id(&link, Duration::from_millis(30)).unwrap();
        assert_eq!(id, None);
    }
}
