//! Worker half of the extension channel: reads the frontend's messages,
//! hosts one [`Extension`] and gives it a context to talk back through.

use super::protocol::{
    write_message, ExperimentConstants, FromWorker, MessageReader, ProtocolError, ToWorker,
};
use super::registry::ExtensionRegistry;
use super::{Extension, ExtensionLogHeader};
use crate::queue::{join_with_timeout, offer, QUEUE_BOUND};
use anyhow::{anyhow, bail, Context, Result};
use biolink_lib::io::run_file;
use biolink_lib::signal::{truncate_event_text, END_OF_RUN_FRAME, MAX_EXTENSION_EVENT_LEN};
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use csv::{QuoteStyle, WriterBuilder};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default wait of a bio data pull.
pub const BIO_DATA_TIMEOUT: Duration = Duration::from_secs(10);
/// Latency bound of the end-request watcher.
pub const END_WATCH_INTERVAL: Duration = Duration::from_secs(1);
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
pub const WATCHER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

struct WorkerLink {
    writer: Mutex<Box<dyn Write + Send>>,
    next_seq: Mutex<u64>,
    replies: Receiver<(u64, i64)>,
}

/// Cloneable handle for talking to the frontend, usable from helper threads.
#[derive(Clone)]
pub struct Emitter {
    link: Arc<WorkerLink>,
}

impl Emitter {
    fn send(&self, message: &FromWorker) -> Result<(), ProtocolError> {
        let mut writer = self
            .link
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        write_message(writer.as_mut(), message)
    }

    /// One request in flight at a time; the lock is held until its reply.
    fn request(&self, build: impl FnOnce(u64) -> FromWorker) -> Result<i64, ProtocolError> {
        let mut next_seq = self
            .link
            .next_seq
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let seq = *next_seq;
        *next_seq += 1;
        self.send(&build(seq))?;
        let deadline = Instant::now() + REPLY_TIMEOUT;
        loop {
            match self
                .link
                .replies
                .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            {
                Ok((got, value)) if got == seq => return Ok(value),
                Ok((stale, _)) => debug!("discarding stale reply {}", stale),
                Err(RecvTimeoutError::Timeout) => return Err(ProtocolError::NoReply(seq)),
                Err(RecvTimeoutError::Disconnected) => return Err(ProtocolError::Closed),
            }
        }
    }

    /// Emit an event; without `frame` it lands on the first frame the
    /// recorder has not processed yet. Returns the resolved frame, or -1 when
    /// the frontend dropped the event.
    pub fn emit_event(&self, text: &str, frame: Option<i64>) -> Result<i64, ProtocolError> {
        let text = truncate_event_text(text, MAX_EXTENSION_EVENT_LEN);
        self.request(|seq| FromWorker::Emit { seq, text, frame })
    }

    pub fn request_end_of_run(&self, reason: &str) -> Result<(), ProtocolError> {
        self.emit_event(reason, Some(END_OF_RUN_FRAME)).map(|_| ())
    }

    /// Last frame the recorder processed, -1 before the first.
    pub fn current_frame(&self) -> Result<i64, ProtocolError> {
        self.request(|seq| FromWorker::CurrentFrame { seq })
    }

    /// Line for the recorder's message log.
    pub fn console(&self, text: impl Into<String>) {
        if let Err(err) = self.send(&FromWorker::Console { text: text.into() }) {
            debug!("console line not delivered: {}", err);
        }
    }

    fn request_bio_data(&self, on: bool) -> Result<(), ProtocolError> {
        self.send(&FromWorker::RequestBioData { on })
    }
}

/// Tab-delimited log file owned by one extension.
#[derive(Clone)]
pub struct ExtensionLog {
    writer: Arc<Mutex<Option<csv::Writer<BufWriter<File>>>>>,
    columns: usize,
    path: PathBuf,
}

impl ExtensionLog {
    pub fn create(
        path: &Path,
        constants: &ExperimentConstants,
        header: &ExtensionLogHeader,
    ) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("creating extension log {}", path.display()))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "# extension: {}", constants.extension_name)?;
        writeln!(out, "# date: {}", constants.start_time)?;
        writeln!(out, "# experiment_id: {}", constants.experiment_id)?;
        writeln!(out, "# subject_id: {}", constants.subject_id)?;
        for line in &header.lines {
            writeln!(out, "# {}", line)?;
        }
        let mut writer = WriterBuilder::new()
            .delimiter(b'\t')
            .quote_style(QuoteStyle::Never)
            .flexible(true)
            .from_writer(out);
        if !header.columns.is_empty() {
            writer.write_record(&header.columns)?;
        }
        writer.flush()?;
        Ok(Self {
            writer: Arc::new(Mutex::new(Some(writer))),
            columns: header.columns.len(),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row; values past the column header are cut off.
    pub fn append_line<S: AsRef<str>>(&self, values: &[S]) -> Result<()> {
        let keep = if self.columns == 0 {
            values.len()
        } else {
            values.len().min(self.columns)
        };
        if keep < values.len() {
            debug!(
                "extension log row has {} values for {} columns, truncated",
                values.len(),
                self.columns
            );
        }
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow!("extension log {} is closed", self.path.display()))?;
        writer.write_record(values[..keep].iter().map(|v| v.as_ref()))?;
        writer.flush()?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut writer) = guard.take() {
            writer
                .flush()
                .with_context(|| format!("closing extension log {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// Background pull of bio data into a per-frame handler; stops on drop.
pub struct BioProcessing {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    emitter: Emitter,
}

impl BioProcessing {
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        if let Err(err) = self.emitter.request_bio_data(false) {
            debug!("bio data feed not switched off: {}", err);
        }
        drop(stop_tx);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                self.emitter.console("bio data handler panicked");
            }
        }
    }
}

impl Drop for BioProcessing {
    fn drop(&mut self) {
        self.halt();
    }
}

type EndHandler = Box<dyn FnOnce() + Send>;

/// End-of-run flag plus the handler to run once when it is raised. Both sit
/// behind the handler lock, so a handler is never registered too late to run.
#[derive(Default)]
struct EndSignal {
    raised: AtomicBool,
    handler: Mutex<Option<EndHandler>>,
}

impl EndSignal {
    fn raise(&self) {
        let handler = {
            let mut handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
            self.raised.store(true, Ordering::Release);
            handler.take()
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    fn set_handler(&self, handler: EndHandler) {
        let mut slot = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_raised() {
            drop(slot);
            handler();
        } else {
            *slot = Some(handler);
        }
    }
}

/// What an extension sees of the run.
pub struct ExtensionContext {
    constants: ExperimentConstants,
    emitter: Emitter,
    bio_rx: Receiver<(u64, Vec<u16>)>,
    end: Arc<EndSignal>,
    log: Option<ExtensionLog>,
}

impl ExtensionContext {
    pub fn constants(&self) -> &ExperimentConstants {
        &self.constants
    }

    /// Value of an `[extension_options]` entry.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.constants.options.get(key).map(String::as_str)
    }

    pub fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }

    pub fn emit_event(&self, text: &str, frame: Option<i64>) -> Result<i64, ProtocolError> {
        self.emitter.emit_event(text, frame)
    }

    pub fn request_end_of_run(&self, reason: &str) -> Result<(), ProtocolError> {
        self.emitter.request_end_of_run(reason)
    }

    pub fn current_frame(&self) -> Result<i64, ProtocolError> {
        self.emitter.current_frame()
    }

    pub fn console(&self, text: impl Into<String>) {
        self.emitter.console(text);
    }

    pub fn request_bio_data(&self, on: bool) -> Result<(), ProtocolError> {
        self.emitter.request_bio_data(on)
    }

    /// Next `(frame, values)` sample, or `None` after `timeout`.
    pub fn get_bio_data(&self, timeout: Duration) -> Option<(u64, Vec<u16>)> {
        self.bio_rx.recv_timeout(timeout).ok()
    }

    pub fn end_requested(&self) -> bool {
        self.end.is_raised()
    }

    /// Run `handler` once, on the watcher thread, when the end of the run is
    /// requested. Runs it right away if that already happened.
    pub fn on_end_request<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.end.set_handler(Box::new(handler));
    }

    /// Block until the end of the run was requested or `timeout` passed.
    pub fn wait_for_end(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.end_requested() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(20)));
        }
        true
    }

    pub fn log(&self) -> Option<&ExtensionLog> {
        self.log.as_ref()
    }

    /// Append a row to the extension log, if the run keeps one.
    pub fn log_append_line<S: AsRef<str>>(&self, values: &[S]) -> Result<()> {
        match &self.log {
            Some(log) => log.append_line(values),
            None => Ok(()),
        }
    }

    /// Turn the bio data feed on and run `handler` for every sample on a
    /// helper thread until the returned handle is stopped.
    pub fn start_bio_data_processing<F>(&self, mut handler: F) -> Result<BioProcessing>
    where
        F: FnMut(u64, &[u16]) + Send + 'static,
    {
        self.request_bio_data(true)?;
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let bio_rx = self.bio_rx.clone();
        let handle = thread::Builder::new()
            .name("ext-bio-processing".into())
            .spawn(move || loop {
                select! {
                    recv(bio_rx) -> sample => match sample {
                        Ok((frame, values)) => handler(frame, &values),
                        Err(_) => break,
                    },
                    recv(stop_rx) -> _ => break,
                    default(BIO_DATA_TIMEOUT) => debug!("no bio data within {:?}", BIO_DATA_TIMEOUT),
                }
            })
            .context("spawning bio data processing")?;
        Ok(BioProcessing {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            emitter: self.emitter.clone(),
        })
    }
}

fn read_frontend<R: Read>(
    mut reader: MessageReader<R>,
    reply_tx: Sender<(u64, i64)>,
    bio_tx: Sender<(u64, Vec<u16>)>,
    end_tx: Sender<()>,
) {
    loop {
        match reader.next_message::<ToWorker>() {
            Ok(Some(ToWorker::Reply { seq, value })) => {
                offer(&reply_tx, (seq, value), "worker reply");
            }
            Ok(Some(ToWorker::BioData { frame, values })) => {
                offer(&bio_tx, (frame, values), "worker bio data");
            }
            Ok(Some(ToWorker::EndRequested)) => {
                let _ = end_tx.try_send(());
            }
            Ok(Some(ToWorker::Start { .. })) => warn!("repeated start message ignored"),
            Ok(None) => break,
            Err(err @ ProtocolError::Malformed { .. }) => warn!("{}", err),
            Err(err) => {
                warn!("frontend pipe failed: {}", err);
                break;
            }
        }
    }
    debug!("frontend input closed");
}

/// Sets the end flag once the frontend asks for it (or goes away). Checks
/// at least every [`END_WATCH_INTERVAL`].
fn watch_for_end(end_rx: Receiver<()>, done_rx: Receiver<()>, end: Arc<EndSignal>) {
    loop {
        select! {
            recv(end_rx) -> _ => {
                info!("end of run requested");
                end.raise();
                return;
            },
            recv(done_rx) -> _ => return,
            default(END_WATCH_INTERVAL) => {},
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".into()
    }
}

/// Host extension `name` for one run, speaking the protocol over
/// `input`/`output`. Returns when the extension is done.
pub fn run_worker<R, W>(
    name: &str,
    registry: &ExtensionRegistry,
    input: R,
    output: W,
) -> Result<()>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let mut reader = MessageReader::new(input);
    let constants = match reader.next_message::<ToWorker>()? {
        Some(ToWorker::Start { constants }) => constants,
        Some(other) => bail!(ProtocolError::Unexpected(format!("{:?}", other))),
        None => bail!("frontend closed before the run started"),
    };

    let (reply_tx, reply_rx) = bounded(QUEUE_BOUND);
    let output: Box<dyn Write + Send> = Box::new(output);
    let emitter = Emitter {
        link: Arc::new(WorkerLink {
            writer: Mutex::new(output),
            next_seq: Mutex::new(0),
            replies: reply_rx,
        }),
    };

    let mut extension: Box<dyn Extension> = match registry.create(name) {
        Ok(extension) => extension,
        Err(err) => {
            emitter.console(err.to_string());
            emitter.send(&FromWorker::Finished)?;
            return Err(err.into());
        }
    };

    let (bio_tx, bio_rx) = bounded(QUEUE_BOUND);
    let (end_tx, end_rx) = bounded::<()>(1);
    thread::Builder::new()
        .name("worker-reader".into())
        .spawn(move || read_frontend(reader, reply_tx, bio_tx, end_tx))
        .context("spawning worker reader")?;

    let end = Arc::new(EndSignal::default());
    let (done_tx, done_rx) = bounded::<()>(1);
    let watcher = {
        let end = Arc::clone(&end);
        thread::Builder::new()
            .name("worker-end-watch".into())
            .spawn(move || watch_for_end(end_rx, done_rx, end))
            .context("spawning end watcher")?
    };

    let log = if constants.no_log {
        None
    } else {
        match extension.log_header(&constants) {
            Some(header) => {
                let path = run_file(&constants.file_base, &format!("_{}", name), "txt");
                match ExtensionLog::create(&path, &constants, &header) {
                    Ok(log) => Some(log),
                    Err(err) => {
                        emitter.console(format!("extension log unavailable: {:#}", err));
                        None
                    }
                }
            }
            None => None,
        }
    };

    let mut ctx = ExtensionContext {
        constants,
        emitter: emitter.clone(),
        bio_rx,
        end,
        log,
    };
    info!("extension '{}' running", name);
    match panic::catch_unwind(AssertUnwindSafe(|| extension.run(&mut ctx))) {
        Ok(Ok(())) => debug!("extension '{}' returned", name),
        Ok(Err(err)) => ctx.console(format!("extension '{}' failed: {:#}", name, err)),
        Err(payload) => ctx.console(format!(
            "extension '{}' panicked: {}",
            name,
            panic_message(payload.as_ref())
        )),
    }
    if let Some(log) = ctx.log() {
        if let Err(err) = log.close() {
            ctx.console(format!("{:#}", err));
        }
    }

    drop(done_tx);
    join_with_timeout(watcher, WATCHER_JOIN_TIMEOUT, "end watcher");
    emitter.send(&FromWorker::Finished)?;
    Ok(())
}
