//! Experiment session: the frame-indexed control loop and the single
//! finalize path every way of ending a run converges on.

use crate::config::RunConfig;
use crate::extension::{
    ExperimentConstants, ExtensionFrontend, ExtensionRegistry, ProcessLauncher, WorkerLauncher,
    END_JOIN_TIMEOUT,
};
use crate::live::LiveFeed;
use crate::persist::{file_base, is_no_log, persist, seal_recording, PersistOutcome, FORCED_SUFFIX};
use crate::queue::join_with_timeout;
use crate::serial::{PortOpener, SerialChannel, SerialOpener, RECONNECT_INTERVAL, SHUTDOWN_TIMEOUT};
use anyhow::{anyhow, Context, Result};
use biolink_lib::device::{AcquisitionDevice, ReleaseHandle};
use biolink_lib::io::archive::RunArchive;
use biolink_lib::io::metadata::RunMetadata;
use biolink_lib::signal::{EventRecord, FrameClock, FrameError, SampleBuffer, BITS_RESOLUTION};
use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest wait for the acquisition thread at finalize.
pub const DEVICE_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// A forced finalize is only accepted this long after the stop request.
pub const FORCE_GUARD: Duration = RECONNECT_INTERVAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no sample within {0:?}, acquisition source lost")]
pub struct SourceTimeout(pub Duration);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForceStopError {
    #[error("no stop was requested; request an orderly stop first")]
    NoStopRequested,
    #[error("forced stop {elapsed:?} after the stop request; wait at least {required:?}")]
    TooEarly {
        elapsed: Duration,
        required: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationCause {
    MaxDuration,
    StopRequested,
    SourceTimeout,
    SerialStopToken,
    ExtensionEndRequest,
    Failed(String),
    Forced,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationCause::MaxDuration => write!(f, "maximum duration reached"),
            TerminationCause::StopRequested => write!(f, "stop requested"),
            TerminationCause::SourceTimeout => write!(f, "acquisition source lost"),
            TerminationCause::SerialStopToken => write!(f, "serial stop token"),
            TerminationCause::ExtensionEndRequest => write!(f, "extension requested the end"),
            TerminationCause::Failed(reason) => write!(f, "run failed: {}", reason),
            TerminationCause::Forced => write!(f, "forced stop"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub cause: TerminationCause,
    pub frames: u64,
    pub forced: bool,
    pub persisted: PersistOutcome,
    pub run: RunArchive,
}

pub type CompletionCallback = Box<dyn FnOnce(&SessionOutcome) + Send>;

/// Collaborators a session is wired to besides the device.
pub struct SessionParts {
    pub serial: Option<Arc<dyn SerialOpener>>,
    pub launcher: Option<Box<dyn WorkerLauncher>>,
    pub registry: ExtensionRegistry,
    pub live: Option<LiveFeed>,
}

impl SessionParts {
    /// No serial line, no extension worker, no live feed.
    pub fn detached() -> Self {
        Self {
            serial: None,
            launcher: None,
            registry: ExtensionRegistry::builtin(),
            live: None,
        }
    }

    /// Serial port and worker process as configured.
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let serial: Option<Arc<dyn SerialOpener>> = if config.serial.enabled {
            Some(Arc::new(PortOpener::new(&config.serial.port, config.serial.baud)))
        } else {
            None
        };
        Ok(Self {
            serial,
            launcher: Some(Box::new(ProcessLauncher::current_exe()?)),
            registry: ExtensionRegistry::builtin(),
            live: None,
        })
    }
}

struct Recording {
    clock: FrameClock,
    samples: SampleBuffer,
    serial_events: Vec<EventRecord>,
    extension_events: Vec<EventRecord>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State of one run, created at start and torn down exactly once.
pub struct ExperimentSession {
    subject_id: String,
    experiment_id: String,
    software_version: String,
    sample_rate: u32,
    max_frames: u64,
    channel_header: Vec<String>,
    device_address: String,
    extension_name: String,
    started: DateTime<Local>,
    file_base: PathBuf,
    no_log: bool,
    recording: Mutex<Option<Recording>>,
    serial: Mutex<Option<SerialChannel>>,
    extension: Mutex<Option<ExtensionFrontend>>,
    live: Option<LiveFeed>,
    device_stop: Arc<AtomicBool>,
    device_release: ReleaseHandle,
    device_thread: Mutex<Option<JoinHandle<()>>>,
    stop_requested_at: Mutex<Option<Instant>>,
    finalizing: AtomicBool,
    on_complete: Mutex<Option<CompletionCallback>>,
    outcome: Mutex<Option<SessionOutcome>>,
    done_tx: Mutex<Option<Sender<()>>>,
}

impl ExperimentSession {
    /// Start a run with the serial line and extension worker from `config`.
    pub fn start(
        config: RunConfig,
        device: Box<dyn AcquisitionDevice>,
        subject_id: &str,
        on_complete: Option<CompletionCallback>,
    ) -> Result<SessionHandle> {
        let parts = SessionParts::from_config(&config)?;
        Self::start_with(config, device, subject_id, parts, on_complete)
    }

    /// Start a run. Configuration and device errors surface here, before any
    /// thread is started.
    pub fn start_with(
        config: RunConfig,
        mut device: Box<dyn AcquisitionDevice>,
        subject_id: &str,
        parts: SessionParts,
        on_complete: Option<CompletionCallback>,
    ) -> Result<SessionHandle> {
        config.validate().context("invalid run configuration")?;
        let layout = config.layout();
        let channel_header = layout.header();
        let max_frames = config.max_duration_frames();
        let no_log = is_no_log(subject_id);
        let started = Local::now();
        let base = file_base(&config.log_dir, &config.experiment_id, subject_id, started);

        device
            .start(config.sample_rate, layout.mask(), BITS_RESOLUTION)
            .with_context(|| format!("starting device {}", device.address()))?;
        info!(
            "device {} started: {} at {} Hz, channels {}",
            device.address(),
            device.properties(),
            config.sample_rate,
            channel_header.join(",")
        );

        let (extension, extension_name) = match parts.registry.select(&config.extension) {
            Ok(None) => (None, config.extension.clone()),
            Ok(Some(name)) => {
                let constants = ExperimentConstants {
                    extension_name: name.to_string(),
                    subject_id: subject_id.to_string(),
                    experiment_id: config.experiment_id.clone(),
                    log_dir: config.log_dir.clone(),
                    file_base: base.clone(),
                    start_time: started.to_rfc3339(),
                    channel_header: channel_header.clone(),
                    sample_rate: config.sample_rate,
                    no_log,
                    options: config.extension_options.clone(),
                };
                let launched = match &parts.launcher {
                    Some(launcher) => launcher.launch(&constants),
                    None => Err(anyhow!("no worker launcher available")),
                };
                match launched {
                    Ok(frontend) => (Some(frontend), name.to_string()),
                    Err(err) => {
                        error!("extension '{}' not started, running without it: {:#}", name, err);
                        (None, config.extension.clone())
                    }
                }
            }
            Err(err) => {
                warn!("{}; running without extension", err);
                (None, config.extension.clone())
            }
        };

        let serial = parts
            .serial
            .map(|opener| SerialChannel::start(opener, &config.serial.stop_token));

        let (done_tx, done_rx) = bounded::<()>(1);
        let session = Arc::new(ExperimentSession {
            subject_id: subject_id.to_string(),
            experiment_id: config.experiment_id.clone(),
            software_version: config.software_version.clone(),
            sample_rate: config.sample_rate,
            max_frames,
            channel_header,
            device_address: device.address().to_string(),
            extension_name,
            started,
            file_base: base,
            no_log,
            recording: Mutex::new(Some(Recording {
                clock: FrameClock::new(),
                samples: SampleBuffer::with_capacity(max_frames as usize, layout.count()),
                serial_events: Vec::new(),
                extension_events: Vec::new(),
            })),
            serial: Mutex::new(serial),
            extension: Mutex::new(extension),
            live: parts.live,
            device_stop: Arc::new(AtomicBool::new(false)),
            device_release: device.release_handle(),
            device_thread: Mutex::new(None),
            stop_requested_at: Mutex::new(None),
            finalizing: AtomicBool::new(false),
            on_complete: Mutex::new(on_complete),
            outcome: Mutex::new(None),
            done_tx: Mutex::new(Some(done_tx)),
        });

        // samples are never dropped between driver and control loop
        let (sample_tx, sample_rx) = unbounded::<(u64, Vec<u16>)>();
        let device_stop = Arc::clone(&session.device_stop);
        let acquisition = thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || acquire(device, sample_tx, device_stop))
            .context("spawning acquisition thread")?;
        *lock(&session.device_thread) = Some(acquisition);

        let timeout = config.sample_timeout();
        let control = Arc::clone(&session);
        if let Err(err) = thread::Builder::new()
            .name("control-loop".into())
            .spawn(move || control.control_loop(sample_rx, timeout))
        {
            session.finalize(TerminationCause::Failed(err.to_string()), false);
            return Err(anyhow!("spawning control loop: {}", err));
        }
        info!(
            "run started: experiment {}, subject {}{}",
            session.experiment_id,
            session.subject_id,
            if no_log { " (no-log)" } else { "" }
        );
        Ok(SessionHandle { session, done_rx })
    }

    fn control_loop(&self, samples: Receiver<(u64, Vec<u16>)>, timeout: Duration) {
        let cause = match panic::catch_unwind(AssertUnwindSafe(|| self.run_frames(&samples, timeout)))
        {
            Ok(Ok(cause)) => cause,
            Ok(Err(err)) => {
                error!("run aborted: {:#}", err);
                TerminationCause::Failed(format!("{:#}", err))
            }
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".into());
                error!("control loop panicked: {}", reason);
                TerminationCause::Failed(reason)
            }
        };
        self.finalize(cause, false);
    }

    fn stop_requested(&self) -> bool {
        lock(&self.stop_requested_at).is_some()
    }

    fn run_frames(
        &self,
        samples: &Receiver<(u64, Vec<u16>)>,
        timeout: Duration,
    ) -> Result<TerminationCause> {
        loop {
            if self.finalizing.load(Ordering::Acquire) {
                return Ok(TerminationCause::Forced);
            }
            if self.stop_requested() {
                return Ok(TerminationCause::StopRequested);
            }
            let (frame, values) = match samples.recv_timeout(timeout) {
                Ok(sample) => sample,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("{}", SourceTimeout(timeout));
                    return Ok(TerminationCause::SourceTimeout);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    if self.stop_requested() {
                        return Ok(TerminationCause::StopRequested);
                    }
                    warn!("acquisition ended without a stop request");
                    return Ok(TerminationCause::SourceTimeout);
                }
            };
            if let Some(cause) = self.process_frame(frame, &values)? {
                return Ok(cause);
            }
        }
    }

    /// One step of the timeline. Returns the cause when this frame ends the run.
    fn process_frame(&self, frame: u64, values: &[u16]) -> Result<Option<TerminationCause>> {
        if frame >= self.max_frames {
            info!("maximum duration of {} frames reached", self.max_frames);
            return Ok(Some(TerminationCause::MaxDuration));
        }
        let mut ends = None;
        {
            let mut guard = lock(&self.recording);
            let recording = guard
                .as_mut()
                .ok_or_else(|| anyhow!("recording already finalized"))?;
            let channels = recording.samples.channels();
            if values.len() != channels {
                return Err(FrameError::ChannelMismatch {
                    expected: channels,
                    got: values.len(),
                }
                .into());
            }
            recording.clock.accept(frame)?;

            if let Some(serial) = lock(&self.serial).as_ref() {
                let poll = serial.poll(frame);
                recording.serial_events.extend(poll.events);
                if poll.stop_requested {
                    ends = Some(TerminationCause::SerialStopToken);
                }
            }
            if let Some(extension) = lock(&self.extension).as_ref() {
                let poll = extension.poll(frame);
                recording.extension_events.extend(poll.events);
                if poll.end_requested && ends.is_none() {
                    ends = Some(TerminationCause::ExtensionEndRequest);
                }
            }
            recording.samples.write(frame, values)?;
        }
        if let Some(extension) = lock(&self.extension).as_ref() {
            extension.push_bio_data(frame, values);
        }
        if let Some(live) = &self.live {
            live.push(frame, values);
        }
        Ok(ends)
    }

    /// Writes the run once. The orderly path enters once; the forced path
    /// may overtake an orderly finalize that has not claimed the recording
    /// yet. Whoever claims it persists, every other caller gets `None`.
    fn finalize(&self, cause: TerminationCause, forced: bool) -> Option<SessionOutcome> {
        if self.finalizing.swap(true, Ordering::AcqRel) && !forced {
            return None;
        }
        self.device_stop.store(true, Ordering::Release);
        let recording = lock(&self.recording).take()?;
        info!("finalizing run: {}", cause);
        if forced {
            (self.device_release)();
            warn!("acquisition device {} force-released", self.device_address);
        }
        // the reconnect loop may be stuck in the driver; only signal it here
        let mut serial = lock(&self.serial).take();
        if let Some(serial) = serial.as_mut() {
            serial.signal_stop();
        }

        let run = seal_recording(
            self.channel_header.clone(),
            recording.samples,
            recording.serial_events,
            recording.extension_events,
        );
        let frames = run.samples.len() as u64;
        let metadata = RunMetadata::new(
            &self.software_version,
            self.started,
            &self.experiment_id,
            &self.subject_id,
            self.sample_rate,
            frames,
            &self.channel_header,
            &self.device_address,
            &self.extension_name,
        );
        let suffix = if forced { FORCED_SUFFIX } else { "" };
        let persisted = persist(&self.file_base, suffix, self.no_log, &run, &metadata);

        let extension = lock(&self.extension).take();
        if let Some(mut extension) = extension {
            extension.end(END_JOIN_TIMEOUT);
        }
        if let Some(mut serial) = serial {
            serial.shutdown();
        }
        let acquisition = lock(&self.device_thread).take();
        if let Some(handle) = acquisition {
            if !forced {
                join_with_timeout(handle, DEVICE_JOIN_TIMEOUT, "acquisition thread");
            }
        }

        let outcome = SessionOutcome {
            cause,
            frames,
            forced,
            persisted,
            run,
        };
        info!("run finished after {} frames ({})", frames, outcome.cause);
        let callback = lock(&self.on_complete).take();
        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&outcome))).is_err() {
                error!("completion callback panicked");
            }
        }
        *lock(&self.outcome) = Some(outcome.clone());
        lock(&self.done_tx).take();
        Some(outcome)
    }
}

fn acquire(
    mut device: Box<dyn AcquisitionDevice>,
    samples: Sender<(u64, Vec<u16>)>,
    stop: Arc<AtomicBool>,
) {
    let result = device.run(&mut |frame: u64, values: &[u16]| {
        if stop.load(Ordering::Acquire) {
            return true;
        }
        samples.send((frame, values.to_vec())).is_err()
    });
    if let Err(err) = result {
        error!("acquisition failed: {}", err);
    }
    if let Err(err) = device.stop() {
        warn!("stopping device {}: {}", device.address(), err);
    }
    device.close();
    info!("device {} released", device.address());
}

/// Caller's grip on a running session.
pub struct SessionHandle {
    session: Arc<ExperimentSession>,
    done_rx: Receiver<()>,
}

impl SessionHandle {
    /// Ask the run to end; repeated calls are ignored.
    pub fn request_stop(&self) {
        let mut requested = lock(&self.session.stop_requested_at);
        if requested.is_none() {
            info!("stop requested");
            *requested = Some(Instant::now());
            self.session.device_stop.store(true, Ordering::Release);
        }
    }

    /// Finalize now under the forced name and release the device without
    /// waiting for its thread. Only accepted once the orderly path had a
    /// full reconnect cycle; `Ok(None)` when the orderly finalize already
    /// claimed the recording.
    pub fn force_stop(&self) -> Result<Option<SessionOutcome>, ForceStopError> {
        let requested = (*lock(&self.session.stop_requested_at))
            .ok_or(ForceStopError::NoStopRequested)?;
        let elapsed = requested.elapsed();
        if elapsed < FORCE_GUARD {
            return Err(ForceStopError::TooEarly {
                elapsed,
                required: FORCE_GUARD,
            });
        }
        warn!("forcing the end of the run");
        Ok(self.session.finalize(TerminationCause::Forced, true))
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.session.outcome).is_some()
    }

    /// Wait up to `timeout` for the run to be finalized.
    pub fn wait(&self, timeout: Duration) -> Option<SessionOutcome> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => lock(&self.session.outcome).clone(),
            Err(RecvTimeoutError::Timeout) => None,
        }
    }

    /// Watchdog: request a stop, give the orderly path `grace`, then force.
    pub fn supervise(&self, grace: Duration) -> Result<SessionOutcome> {
        self.request_stop();
        if let Some(outcome) = self.wait(grace) {
            return Ok(outcome);
        }
        let since = (*lock(&self.session.stop_requested_at))
            .map(|at| at.elapsed())
            .unwrap_or_default();
        if since < FORCE_GUARD {
            thread::sleep(FORCE_GUARD - since);
        }
        warn!("orderly stop stalled for {:?}", grace);
        if let Some(outcome) = self.force_stop()? {
            return Ok(outcome);
        }
        // the orderly finalize is underway; it bounds its own waits
        self.wait(END_JOIN_TIMEOUT + SHUTDOWN_TIMEOUT + DEVICE_JOIN_TIMEOUT + FORCE_GUARD)
            .ok_or_else(|| anyhow!("run did not finalize"))
    }
}
