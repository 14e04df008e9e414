//! Frontend half of the extension channel, living in the recording process.
//!
//! The frame counter and the inbound event queue sit under one lock: the
//! control loop advances the counter and drains events in one step, and a
//! worker's emit resolves its frame inside the same lock.

use super::protocol::{
    write_message, ExperimentConstants, FromWorker, MessageReader, ProtocolError, ToWorker,
};
use crate::queue::{join_with_timeout, offer, QueueOverflow, QUEUE_BOUND};
use anyhow::{Context, Result};
use biolink_lib::signal::{EventRecord, EventSource, END_OF_RUN_FRAME};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Reply value for an emit that was dropped.
pub const EMIT_REJECTED: i64 = -1;

struct CursorState {
    counter: i64,
    queue: VecDeque<(i64, String)>,
}

/// Frame counter paired with the extension's inbound event queue.
pub struct SharedFrameCursor {
    state: Mutex<CursorState>,
    bound: usize,
}

impl SharedFrameCursor {
    pub fn new() -> Self {
        Self::with_bound(QUEUE_BOUND)
    }

    pub fn with_bound(bound: usize) -> Self {
        Self {
            state: Mutex::new(CursorState {
                counter: -1,
                queue: VecDeque::new(),
            }),
            bound,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CursorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an event. Without an explicit frame it lands on the first frame
    /// not processed yet. Returns the resolved frame, or [`EMIT_REJECTED`]
    /// when the queue is full.
    pub fn emit(&self, text: &str, frame: Option<i64>) -> i64 {
        let mut state = self.lock();
        let resolved = frame.unwrap_or(state.counter + 1);
        if state.queue.len() >= self.bound {
            warn!(
                "{}; extension event '{}' for frame {}",
                QueueOverflow {
                    queue: "extension event",
                    bound: self.bound,
                },
                text,
                resolved
            );
            return EMIT_REJECTED;
        }
        state.queue.push_back((resolved, text.to_string()));
        resolved
    }

    pub fn current(&self) -> i64 {
        self.lock().counter
    }

    /// Move the counter to `frame` and take everything queued so far.
    pub fn advance(&self, frame: u64) -> Vec<(i64, String)> {
        let mut state = self.lock();
        state.counter = frame as i64;
        state.queue.drain(..).collect()
    }
}

impl Default for SharedFrameCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// Events drained for one frame.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtensionPoll {
    pub events: Vec<EventRecord>,
    pub end_requested: bool,
}

/// Split drained `(frame, text)` pairs into records and the end request.
/// The end-of-run sentinel is never turned into a record.
pub fn sort_out_drained(drained: Vec<(i64, String)>) -> ExtensionPoll {
    let mut poll = ExtensionPoll::default();
    for (frame, text) in drained {
        if frame == END_OF_RUN_FRAME {
            info!("extension requested the end of the run ('{}')", text);
            poll.end_requested = true;
            continue;
        }
        match u64::try_from(frame) {
            Ok(frame) => poll
                .events
                .push(EventRecord::new(frame, &text, EventSource::Extension)),
            Err(_) => warn!(
                "extension event '{}' targets invalid frame {}, dropped",
                text, frame
            ),
        }
    }
    poll
}

type SharedWriter = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

fn send(writer: &SharedWriter, message: &ToWorker) -> Result<(), ProtocolError> {
    let mut guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
    match guard.as_mut() {
        Some(out) => write_message(out.as_mut(), message),
        None => Err(ProtocolError::Closed),
    }
}

pub struct ExtensionFrontend {
    name: String,
    cursor: Arc<SharedFrameCursor>,
    bio_requested: Arc<AtomicBool>,
    bio_tx: Option<Sender<(u64, Vec<u16>)>>,
    writer: SharedWriter,
    finished_rx: Receiver<()>,
    finished: bool,
    end_sent: bool,
    reader: Option<JoinHandle<()>>,
    feeder: Option<JoinHandle<()>>,
    relay: Option<JoinHandle<()>>,
    child: Option<Child>,
}

impl ExtensionFrontend {
    /// Attach to a worker over `input`/`output` and send it the run constants.
    pub fn connect<R, W>(
        constants: &ExperimentConstants,
        input: R,
        output: W,
        child: Option<Child>,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let name = constants.extension_name.clone();
        let output: Box<dyn Write + Send> = Box::new(output);
        let writer: SharedWriter = Arc::new(Mutex::new(Some(output)));
        send(
            &writer,
            &ToWorker::Start {
                constants: constants.clone(),
            },
        )
        .with_context(|| format!("starting extension '{}'", name))?;

        let cursor = Arc::new(SharedFrameCursor::new());
        let bio_requested = Arc::new(AtomicBool::new(false));
        let (bio_tx, bio_rx) = bounded::<(u64, Vec<u16>)>(QUEUE_BOUND);
        let (console_tx, console_rx) = bounded::<String>(QUEUE_BOUND);
        let (finished_tx, finished_rx) = bounded::<()>(1);

        let reader = {
            let cursor = Arc::clone(&cursor);
            let bio_requested = Arc::clone(&bio_requested);
            let writer = Arc::clone(&writer);
            let name = name.clone();
            thread::Builder::new()
                .name(format!("ext-{}-reader", name))
                .spawn(move || {
                    read_worker(
                        &name,
                        input,
                        &cursor,
                        &bio_requested,
                        &writer,
                        &console_tx,
                        finished_tx,
                    )
                })
                .context("spawning extension reader")?
        };
        let feeder = {
            let writer = Arc::clone(&writer);
            thread::Builder::new()
                .name(format!("ext-{}-feeder", name))
                .spawn(move || {
                    for (frame, values) in bio_rx {
                        if let Err(err) = send(&writer, &ToWorker::BioData { frame, values }) {
                            debug!("bio data not delivered: {}", err);
                        }
                    }
                })
                .context("spawning extension bio feeder")?
        };
        let relay = {
            let name = name.clone();
            thread::Builder::new()
                .name(format!("ext-{}-console", name))
                .spawn(move || {
                    for line in console_rx {
                        info!("[{}] {}", name, line);
                    }
                })
                .context("spawning extension console relay")?
        };

        info!("extension '{}' started", name);
        Ok(Self {
            name,
            cursor,
            bio_requested,
            bio_tx: Some(bio_tx),
            writer,
            finished_rx,
            finished: false,
            end_sent: false,
            reader: Some(reader),
            feeder: Some(feeder),
            relay: Some(relay),
            child,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cursor(&self) -> &Arc<SharedFrameCursor> {
        &self.cursor
    }

    /// Advance the shared counter to `frame` and collect due events.
    pub fn poll(&self, frame: u64) -> ExtensionPoll {
        sort_out_drained(self.cursor.advance(frame))
    }

    /// Forward a sample to the worker while it asked for bio data.
    pub fn push_bio_data(&self, frame: u64, values: &[u16]) {
        if !self.bio_requested.load(Ordering::Acquire) {
            return;
        }
        if let Some(tx) = &self.bio_tx {
            offer(tx, (frame, values.to_vec()), "extension bio data");
        }
    }

    pub fn bio_data_requested(&self) -> bool {
        self.bio_requested.load(Ordering::Acquire)
    }

    /// Ask the worker to end and wait up to `timeout` for it to finish.
    /// The worker is never killed; returns whether it finished in time.
    pub fn end(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if !self.end_sent {
            self.end_sent = true;
            if let Err(err) = send(&self.writer, &ToWorker::EndRequested) {
                debug!("end request not delivered to '{}': {}", self.name, err);
            }
        }
        if !self.finished {
            self.finished = match self
                .finished_rx
                .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                Err(RecvTimeoutError::Timeout) => false,
            };
        }
        if !self.finished {
            warn!(
                "extension '{}' did not finish within {:?}; leaving it running",
                self.name, timeout
            );
            return false;
        }

        // closing the worker's input ends its reader; its output then closes
        self.bio_tx.take();
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let remaining = || deadline.saturating_duration_since(Instant::now());
        if let Some(feeder) = self.feeder.take() {
            join_with_timeout(feeder, remaining(), "extension bio feeder");
        }
        if let Some(child) = self.child.as_mut() {
            reap(child, remaining(), &self.name);
        }
        if let Some(reader) = self.reader.take() {
            join_with_timeout(reader, remaining(), "extension reader");
        }
        if let Some(relay) = self.relay.take() {
            join_with_timeout(relay, remaining(), "extension console relay");
        }
        info!("extension '{}' ended", self.name);
        true
    }
}

fn reap(child: &mut Child, timeout: Duration, name: &str) {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    warn!("extension '{}' worker exited with {}", name, status);
                }
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Ok(None) => {
                warn!("extension '{}' worker still running after {:?}", name, timeout);
                return;
            }
            Err(err) => {
                warn!("waiting for extension '{}' worker: {}", name, err);
                return;
            }
        }
    }
}

fn read_worker<R: Read>(
    name: &str,
    input: R,
    cursor: &SharedFrameCursor,
    bio_requested: &AtomicBool,
    writer: &SharedWriter,
    console_tx: &Sender<String>,
    finished_tx: Sender<()>,
) {
    let mut reader = MessageReader::new(input);
    loop {
        let message = match reader.next_message::<FromWorker>() {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(err @ ProtocolError::Malformed { .. }) => {
                warn!("extension '{}': {}", name, err);
                continue;
            }
            Err(err) => {
                warn!("extension '{}' pipe failed: {}", name, err);
                break;
            }
        };
        match message {
            FromWorker::Emit { seq, text, frame } => {
                let value = cursor.emit(&text, frame);
                if let Err(err) = send(writer, &ToWorker::Reply { seq, value }) {
                    debug!("reply {} not delivered: {}", seq, err);
                }
            }
            FromWorker::CurrentFrame { seq } => {
                let value = cursor.current();
                if let Err(err) = send(writer, &ToWorker::Reply { seq, value }) {
                    debug!("reply {} not delivered: {}", seq, err);
                }
            }
            FromWorker::RequestBioData { on } => {
                debug!("extension '{}' bio data feed {}", name, if on { "on" } else { "off" });
                bio_requested.store(on, Ordering::Release);
            }
            FromWorker::Console { text } => {
                offer(console_tx, text, "extension console");
            }
            FromWorker::Finished => {
                let _ = finished_tx.try_send(());
            }
        }
    }
    debug!("extension '{}' output closed", name);
}

#[cfg(test)]
mod tests {
    use super::super::testing::{pipe, PipeReader, PipeWriter};
    use super::*;
    use std::collections::BTreeMap;
    use std::io;
    use std::path::PathBuf;

    fn constants() -> ExperimentConstants {
        ExperimentConstants {
            extension_name: "feed".into(),
            subject_id: "s01".into(),
            experiment_id: "exp".into(),
            log_dir: PathBuf::from("logs"),
            file_base: PathBuf::from("logs/exp_s01_20240101_1200"),
            start_time: "2024-01-01T12:00:00+00:00".into(),
            channel_header: vec!["ecg".into()],
            sample_rate: 100,
            no_log: true,
            options: BTreeMap::new(),
        }
    }

    fn wait_until(what: &str, done: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Frontend wired to in-memory pipes; returns the worker's output end and
    /// a reader of everything sent to the worker, past the start message.
    fn connect_over<W: Write + Send + 'static>(
        output: W,
        worker_in: PipeReader,
    ) -> (ExtensionFrontend, PipeWriter, MessageReader<PipeReader>) {
        let (worker_out, frontend_in) = pipe();
        let frontend = ExtensionFrontend::connect(&constants(), frontend_in, output, None).unwrap();
        let mut worker_in = MessageReader::new(worker_in);
        assert!(matches!(
            worker_in.next_message::<ToWorker>().unwrap(),
            Some(ToWorker::Start { .. })
        ));
        (frontend, worker_out, worker_in)
    }

    fn finish(
        mut frontend: ExtensionFrontend,
        mut worker_out: PipeWriter,
        worker_in: &mut MessageReader<PipeReader>,
    ) {
        write_message(&mut worker_out, &FromWorker::Finished).unwrap();
        drop(worker_out);
        assert!(frontend.end(Duration::from_secs(5)));
        while let Some(message) = worker_in.next_message::<ToWorker>().unwrap() {
            assert!(
                !matches!(message, ToWorker::BioData { .. }),
                "unexpected {:?}",
                message
            );
        }
    }

    #[test]
    fn samples_are_forwarded_only_while_requested() {
        let (output, worker_in) = pipe();
        let (frontend, mut worker_out, mut worker_in) = connect_over(output, worker_in);

        frontend.push_bio_data(0, &[10]);
        write_message(&mut worker_out, &FromWorker::RequestBioData { on: true }).unwrap();
        wait_until("feed on", || frontend.bio_data_requested());
        frontend.push_bio_data(1, &[11]);
        frontend.push_bio_data(2, &[12]);
        assert_eq!(
            worker_in.next_message::<ToWorker>().unwrap(),
            Some(ToWorker::BioData {
                frame: 1,
                values: vec![11]
            })
        );
        assert_eq!(
            worker_in.next_message::<ToWorker>().unwrap(),
            Some(ToWorker::BioData {
                frame: 2,
                values: vec![12]
            })
        );

        write_message(&mut worker_out, &FromWorker::RequestBioData { on: false }).unwrap();
        wait_until("feed off", || !frontend.bio_data_requested());
        frontend.push_bio_data(3, &[13]);
        finish(frontend, worker_out, &mut worker_in);
    }

    /// Holds the first bio data write until `gate` is dropped.
    struct GatedWriter {
        inner: PipeWriter,
        entered: Sender<()>,
        gate: Receiver<()>,
    }

    impl Write for GatedWriter {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if data.windows(10).any(|w| w == b"\"bio_data\"") {
                let _ = self.entered.try_send(());
                let _ = self.gate.recv();
            }
            self.inner.write(data)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    #[test]
    fn full_bio_queue_drops_the_newest_samples() {
        let (inner, worker_in) = pipe();
        let (entered_tx, entered_rx) = bounded(1);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let output = GatedWriter {
            inner,
            entered: entered_tx,
            gate: gate_rx,
        };
        let (frontend, mut worker_out, mut worker_in) = connect_over(output, worker_in);

        write_message(&mut worker_out, &FromWorker::RequestBioData { on: true }).unwrap();
        wait_until("feed on", || frontend.bio_data_requested());
        frontend.push_bio_data(0, &[0]);
        // the feeder now holds frame 0 and the queue is empty
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let last = QUEUE_BOUND as u64;
        for frame in 1..=last + 5 {
            frontend.push_bio_data(frame, &[frame as u16]);
        }
        drop(gate_tx);

        let mut delivered = Vec::new();
        while delivered.last() != Some(&last) {
            match worker_in.next_message::<ToWorker>().unwrap() {
                Some(ToWorker::BioData { frame, .. }) => delivered.push(frame),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(delivered, (0..=last).collect::<Vec<_>>());

        write_message(&mut worker_out, &FromWorker::RequestBioData { on: false }).unwrap();
        wait_until("feed off", || !frontend.bio_data_requested());
        finish(frontend, worker_out, &mut worker_in);
    }

    #[test]
    fn unspecified_frame_resolves_to_the_next_unprocessed_frame() {
        let cursor = SharedFrameCursor::new();
        assert_eq!(cursor.emit("early", None), 0);
        cursor.advance(0);
        cursor.advance(41);
        assert_eq!(cursor.current(), 41);
        assert_eq!(cursor.emit("go", None), 42);
        assert_eq!(cursor.emit("pinned", Some(7)), 7);
        assert_eq!(
            cursor.advance(42),
            vec![(42, "go".to_string()), (7, "pinned".to_string())]
        );
    }

    #[test]
    fn full_event_queue_rejects_only_the_newest() {
        let cursor = SharedFrameCursor::with_bound(2);
        assert_eq!(cursor.emit("a", Some(1)), 1);
        assert_eq!(cursor.emit("b", Some(2)), 2);
        assert_eq!(cursor.emit("c", Some(3)), EMIT_REJECTED);
        let drained = cursor.advance(0);
        assert_eq!(drained, vec![(1, "a".into()), (2, "b".into())]);
        assert_eq!(cursor.emit("d", None), 1);
    }

    #[test]
    fn sentinel_ends_the_run_and_is_never_recorded() {
        let poll = sort_out_drained(vec![
            (5, "a".into()),
            (END_OF_RUN_FRAME, "end".into()),
            (-7, "bogus".into()),
            (2, "b".into()),
        ]);
        assert!(poll.end_requested);
        let frames: Vec<u64> = poll.events.iter().map(|e| e.frame).collect();
        assert_eq!(frames, vec![5, 2]);
    }

    #[test]
    fn counter_and_queue_stay_consistent_across_threads() {
        let cursor = Arc::new(SharedFrameCursor::with_bound(100_000));
        let emitter = {
            let cursor = Arc::clone(&cursor);
            thread::spawn(move || {
                (0..5_000)
                    .map(|i| (cursor.emit(&i.to_string(), None), cursor.current()))
                    .collect::<Vec<_>>()
            })
        };
        let mut drained = Vec::new();
        for frame in 0..2_000u64 {
            for (resolved, _) in cursor.advance(frame) {
                // an event drained at `frame` was resolved before the counter reached it
                assert!(resolved <= frame as i64);
                drained.push(resolved);
            }
        }
        let emitted = emitter.join().unwrap();
        drained.extend(cursor.advance(2_000).into_iter().map(|(f, _)| f));
        assert_eq!(drained.len(), emitted.len());
        for (resolved, seen_after) in emitted {
            assert!(resolved <= seen_after + 1);
        }
    }
}
