//! Extension channel: third-party code running in a separate worker process,
//! fed with frame progress and bio data, emitting frame-tagged events.

pub mod builtin;
pub mod frontend;
pub mod host;
pub mod protocol;
pub mod registry;

pub use frontend::{ExtensionFrontend, ExtensionPoll, SharedFrameCursor};
pub use host::{run_worker, BioProcessing, Emitter, ExtensionContext, ExtensionLog};
pub use protocol::{ExperimentConstants, ProtocolError};
pub use registry::{ExtensionRegistry, ExtensionSelectionError};

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

/// How long the frontend waits for a worker after asking it to end.
pub const END_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Optional per-extension log file layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionLogHeader {
    /// Extra `# ` lines after the standard ones.
    pub lines: Vec<String>,
    pub columns: Vec<String>,
}

/// Code hosted by a worker process.
pub trait Extension: Send {
    /// Layout of the extension's own log file; `None` writes no file.
    fn log_header(&self, _constants: &ExperimentConstants) -> Option<ExtensionLogHeader> {
        None
    }

    /// Main body. Returns once the run is over or the extension is done.
    fn run(&mut self, ctx: &mut ExtensionContext) -> Result<()>;
}

/// Starts the worker for a selected extension and hands back its frontend.
pub trait WorkerLauncher: Send {
    fn launch(&self, constants: &ExperimentConstants) -> Result<ExtensionFrontend>;
}

/// Runs the worker as `<program> extension-worker --name <name>`, talking
/// over the child's stdin and stdout.
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    /// Relaunch the running executable.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("locating the running executable")?;
        Ok(Self::new(program))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, constants: &ExperimentConstants) -> Result<ExtensionFrontend> {
        let mut child = Command::new(&self.program)
            .arg("extension-worker")
            .arg("--name")
            .arg(&constants.extension_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| {
                format!(
                    "spawning worker {} for extension '{}'",
                    self.program.display(),
                    constants.extension_name
                )
            })?;
        let stdin = child
            .stdin
            .take()
            .context("worker stdin was not captured")?;
        let stdout = child
            .stdout
            .take()
            .context("worker stdout was not captured")?;
        ExtensionFrontend::connect(constants, stdout, stdin, Some(child))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory pipes and a thread-hosted worker, so the frontend and the
    //! worker host can be exercised together without spawning a process.

    use super::*;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::io::{self, Read, Write};

    pub struct PipeWriter(Sender<Vec<u8>>);
    pub struct PipeReader {
        rx: Receiver<Vec<u8>>,
        buf: Vec<u8>,
        pos: usize,
    }

    pub fn pipe() -> (PipeWriter, PipeReader) {
        let (tx, rx) = unbounded();
        (
            PipeWriter(tx),
            PipeReader {
                rx,
                buf: Vec::new(),
                pos: 0,
            },
        )
    }

    impl Write for PipeWriter {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0
                .send(data.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reader gone"))?;
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for PipeReader {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.buf.len() {
                match self.rx.recv() {
                    Ok(chunk) => {
                        self.buf = chunk;
                        self.pos = 0;
                    }
                    Err(_) => return Ok(0),
                }
            }
            let n = out.len().min(self.buf.len() - self.pos);
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Hosts the worker on a thread of the test process.
    pub struct ThreadLauncher {
        pub registry: ExtensionRegistry,
    }

    impl WorkerLauncher for ThreadLauncher {
        fn launch(&self, constants: &ExperimentConstants) -> Result<ExtensionFrontend> {
            let (to_worker_tx, to_worker_rx) = pipe();
            let (from_worker_tx, from_worker_rx) = pipe();
            let registry = self.registry.clone();
            let name = constants.extension_name.clone();
            std::thread::spawn(move || {
                let _ = run_worker(&name, &registry, to_worker_rx, from_worker_tx);
            });
            ExtensionFrontend::connect(constants, from_worker_rx, to_worker_tx, None)
        }
    }
}
