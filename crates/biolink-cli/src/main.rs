use anyhow::{anyhow, bail, Context, Result};
use biolink_lib::device;
use biolink_lib::io::{archive::read_archive, export::export_txt, metadata::read_metadata};
use biolink_run::extension::{run_worker, ExtensionRegistry};
use biolink_run::live::{LiveFeed, LIVE_FEED_BOUND};
use biolink_run::persist::PersistOutcome;
use biolink_run::serial::{enumerate_ports, receive_subject_id, PortOpener};
use biolink_run::{
    read_config, ExperimentSession, RunConfig, SessionHandle, SessionOutcome, SessionParts,
    TerminationCause,
};
use chrono::Local;
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver, TryRecvError};
use env_logger::{Env, Target};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "biolink",
    version,
    about = "BioLink: frame-synchronous biosignal recording with serial and extension events"
)]
struct Cli {
    /// Default log filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one run; type `stop` or `force` on stdin to end it early
    Record(RecordArgs),
    /// Write a recorded run as tab-delimited text
    Export {
        #[arg(long)]
        archive: PathBuf,
        /// Defaults to the archive path with a .json extension
        #[arg(long)]
        metadata: Option<PathBuf>,
        /// Defaults to the archive path with a .txt extension
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List the extensions this build can host
    Extensions,
    /// List serial ports
    Ports,
    /// Query the battery level of a device
    Battery {
        #[arg(long, default_value = device::SYNTHETIC_ADDRESS)]
        device: String,
    },
    /// Wait for a subject id sent over the serial line
    SubjectId {
        #[arg(long)]
        port: String,
        #[arg(long, default_value_t = 115_200)]
        baud: u32,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    #[command(hide = true)]
    ExtensionWorker {
        #[arg(long)]
        name: String,
    },
}

#[derive(clap::Args)]
struct RecordArgs {
    /// TOML run configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    /// Subject id, `nolog` records without writing files
    #[arg(long)]
    subject: String,
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    experiment: Option<String>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[arg(long)]
    sample_rate: Option<u32>,
    #[arg(long)]
    max_duration_min: Option<u32>,
    /// Comma-separated channel names for the input slots
    #[arg(long, value_delimiter = ',')]
    channels: Option<Vec<String>>,
    #[arg(long)]
    extension: Option<String>,
    /// Extension option as key=value, repeatable
    #[arg(long = "option", value_parser = parse_option)]
    options: Vec<(String, String)>,
    #[arg(long)]
    port: Option<String>,
    #[arg(long)]
    no_serial: bool,
    #[arg(long)]
    no_live_feed: bool,
    /// Seconds an orderly stop may take before the run is forced
    #[arg(long, default_value_t = 10)]
    grace_secs: u64,
}

fn parse_option(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

impl RecordArgs {
    fn resolve(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => read_config(path)?,
            None => RunConfig::default(),
        };
        if let Some(device) = &self.device {
            config.device_address = device.clone();
        }
        if let Some(experiment) = &self.experiment {
            config.experiment_id = experiment.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = dir.clone();
        }
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(minutes) = self.max_duration_min {
            config.max_duration_min = minutes;
        }
        if let Some(channels) = &self.channels {
            config.channels = channels.clone();
        }
        if let Some(extension) = &self.extension {
            config.extension = extension.clone();
        }
        config.extension_options.extend(self.options.iter().cloned());
        if let Some(port) = &self.port {
            config.serial.port = port.clone();
        }
        if self.no_serial {
            config.serial.enabled = false;
        }
        if self.no_live_feed {
            config.live_feed = false;
        }
        Ok(config)
    }
}

/// Copies every log record to stderr and the session message log.
struct TeeWriter {
    file: Option<File>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            if file.write_all(buf).and_then(|_| file.flush()).is_err() {
                // keep logging to stderr once the file is gone
                self.file = None;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

fn init_logging(level: &str, message_log: Option<&Path>) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level));
    if let Some(path) = message_log {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening message log {}", path.display()))?;
        builder.target(Target::Pipe(Box::new(TeeWriter { file: Some(file) })));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Record(args) => cmd_record(&cli.log_level, &args),
        Commands::Export {
            archive,
            metadata,
            out,
        } => {
            init_logging(&cli.log_level, None)?;
            cmd_export(&archive, metadata.as_deref(), out.as_deref())
        }
        Commands::Extensions => {
            for name in ExtensionRegistry::builtin().names() {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Ports => {
            init_logging(&cli.log_level, None)?;
            for port in enumerate_ports()? {
                println!("{}", port);
            }
            Ok(())
        }
        Commands::Battery { device } => {
            init_logging(&cli.log_level, None)?;
            cmd_battery(&device)
        }
        Commands::SubjectId {
            port,
            baud,
            timeout_secs,
        } => {
            init_logging(&cli.log_level, None)?;
            let opener = PortOpener::new(&port, baud);
            match receive_subject_id(&opener, Duration::from_secs(timeout_secs))? {
                Some(id) => {
                    println!("{}", id);
                    Ok(())
                }
                None => bail!("no subject id received on {} within {}s", port, timeout_secs),
            }
        }
        Commands::ExtensionWorker { name } => {
            // stdout carries the protocol; logs stay on stderr
            init_logging(&cli.log_level, None)?;
            run_worker(&name, &ExtensionRegistry::builtin(), io::stdin(), io::stdout())
        }
    }
}

#[derive(Serialize)]
struct RunSummary {
    cause: String,
    frames: u64,
    forced: bool,
    serial_events: usize,
    extension_events: usize,
    archive: Option<PathBuf>,
    metadata: Option<PathBuf>,
}

impl RunSummary {
    fn from_outcome(outcome: &SessionOutcome) -> Self {
        let (archive, metadata) = match &outcome.persisted {
            PersistOutcome::Written { archive, metadata } => {
                (Some(archive.clone()), Some(metadata.clone()))
            }
            _ => (None, None),
        };
        Self {
            cause: outcome.cause.to_string(),
            frames: outcome.frames,
            forced: outcome.forced,
            serial_events: outcome.run.serial_events.len(),
            extension_events: outcome.run.extension_events.len(),
            archive,
            metadata,
        }
    }
}

enum Console {
    Stop,
    Force,
}

/// Forward `stop`/`force` typed on stdin. End of input is not a stop.
fn read_console() -> Receiver<Console> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let command = match line.trim() {
                "stop" => Console::Stop,
                "force" => Console::Force,
                "" => continue,
                other => {
                    warn!("unknown command '{}', expected stop or force", other);
                    continue;
                }
            };
            if tx.send(command).is_err() {
                break;
            }
        }
    });
    rx
}

fn spawn_live_view(config: &RunConfig) -> Option<LiveFeed> {
    if !config.live_feed {
        return None;
    }
    let (feed, samples) = LiveFeed::channel(LIVE_FEED_BOUND);
    let every = u64::from(config.sample_rate.max(1));
    thread::spawn(move || {
        for sample in samples {
            if sample.frame % every == 0 {
                debug!("live frame {}: {:?}", sample.frame, sample.values);
            }
        }
    });
    Some(feed)
}

fn cmd_record(log_level: &str, args: &RecordArgs) -> Result<()> {
    let config = args.resolve()?;
    let message_log = config.log_dir.join(format!(
        "BioLink_MsgLog_{}.txt",
        Local::now().format("%Y%m%d_%H%M")
    ));
    init_logging(log_level, Some(&message_log))?;
    info!("message log at {}", message_log.display());

    let device = device::open(&config.device_address)?;
    let mut parts = SessionParts::from_config(&config)?;
    parts.live = spawn_live_view(&config);
    let grace = Duration::from_secs(args.grace_secs);
    let handle = ExperimentSession::start_with(config, device, &args.subject, parts, None)?;
    let outcome = watch(&handle, &read_console(), grace)?;

    println!("{}", serde_json::to_string(&RunSummary::from_outcome(&outcome))?);
    if let PersistOutcome::Failed(reason) = &outcome.persisted {
        bail!("run data could not be saved: {}", reason);
    }
    if let TerminationCause::Failed(reason) = &outcome.cause {
        bail!("run failed: {}", reason);
    }
    Ok(())
}

fn watch(
    handle: &SessionHandle,
    console: &Receiver<Console>,
    grace: Duration,
) -> Result<SessionOutcome> {
    let mut console_open = true;
    loop {
        if let Some(outcome) = handle.wait(Duration::from_millis(200)) {
            return Ok(outcome);
        }
        if !console_open {
            continue;
        }
        match console.try_recv() {
            Ok(Console::Stop) => return handle.supervise(grace),
            Ok(Console::Force) => match handle.force_stop() {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {}
                Err(err) => error!("{}", err),
            },
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => console_open = false,
        }
    }
}

fn cmd_export(archive: &Path, metadata: Option<&Path>, out: Option<&Path>) -> Result<()> {
    let metadata = metadata
        .map(Path::to_path_buf)
        .unwrap_or_else(|| archive.with_extension("json"));
    let out = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| archive.with_extension("txt"));
    let run = read_archive(archive).with_context(|| format!("reading {}", archive.display()))?;
    let meta = read_metadata(&metadata)?;
    let summary = export_txt(&out, &run, &meta)?;
    info!(
        "exported {} rows to {} ({} events past the last sample)",
        summary.rows,
        out.display(),
        summary.orphaned_events
    );
    println!("{}", out.display());
    Ok(())
}

fn cmd_battery(address: &str) -> Result<()> {
    let mut device = device::open(address)?;
    let level = device.battery();
    device.close();
    let level = level.map_err(|err| anyhow!("{}: {}", address, err))?;
    println!("{}", level);
    Ok(())
}
